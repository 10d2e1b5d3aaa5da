use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use w3tcm_context::site::Site;
use w3tcm_lexer::{sanitize as strip_source, var_statistics};

pub fn classify(site: &Site, files: &[PathBuf]) -> Result<()> {
    let thresholds = site.config.thresholds;
    for path in files {
        let source = read(path)?;
        let stats = var_statistics(&source);
        let verdict = thresholds.classify(&stats);
        println!(
            "{}: {} ({} vars, max {}, avg {:.2})",
            path.display(),
            serde_json::to_string(&verdict)?.trim_matches('"'),
            stats.count,
            stats.max,
            stats.average()
        );
    }
    Ok(())
}

pub fn sanitize(file: &Path) -> Result<()> {
    print!("{}", strip_source(&read(file)?));
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}
