use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

/// A file replacement that becomes visible only on [`AtomicFile::commit`].
///
/// Content is written to a temporary file in the target's directory and then
/// renamed over the target, so readers see either the old or the new file.
/// Dropping an uncommitted `AtomicFile` discards the temporary file.
pub struct AtomicFile {
    target: PathBuf,
    temp: NamedTempFile,
}

impl AtomicFile {
    pub fn begin(target: &Path) -> Result<Self> {
        let dir = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        let temp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        Ok(Self {
            target: target.to_path_buf(),
            temp,
        })
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.temp
            .write_all(bytes)
            .with_context(|| format!("Failed to write {}", self.target.display()))?;
        self.temp.flush()?;
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.temp.as_file().sync_all()?;
        self.temp
            .persist(&self.target)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace {}", self.target.display()))?;
        Ok(())
    }
}

/// Replace `path` with `bytes` atomically.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = AtomicFile::begin(path)?;
    file.write_all(bytes)?;
    file.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/conf.json");
        write_atomic(&path, b"{\"v\":1}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":1}");
        write_atomic(&path, b"{\"v\":2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":2}");
    }

    #[test]
    fn test_interrupted_writer_leaves_old_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf.json");
        write_atomic(&path, b"old document").unwrap();

        let mut writer = AtomicFile::begin(&path).unwrap();
        writer.write_all(b"new docu").unwrap();
        // A concurrent reader mid-write still sees the complete old file.
        assert_eq!(fs::read_to_string(&path).unwrap(), "old document");
        drop(writer);
        assert_eq!(fs::read_to_string(&path).unwrap(), "old document");

        let mut writer = AtomicFile::begin(&path).unwrap();
        writer.write_all(b"new document").unwrap();
        writer.commit().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new document");

        // No temporary files are left behind.
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
