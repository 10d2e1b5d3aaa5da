use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use w3tcm_context::site::Site;
use w3tcm_monitor::{replay_trace, unix_now, MemorySink, RequestTrace, ScriptSink, Store};

pub fn run(site: &Site, traces: &[PathBuf], dry_run: bool) -> Result<()> {
    let mut options = site.session_options()?;
    // Generated documents and buffer dumps of a dry run go to a scratch dir.
    let scratch = tempfile::tempdir()?;
    let mut store = if dry_run {
        options.output_dir = scratch.path().to_path_buf();
        Store::in_memory()
    } else {
        site.open_store()?
    };

    for path in traces {
        let trace = load_trace(path)?;
        let sink: Box<dyn ScriptSink> = if dry_run {
            Box::new(MemorySink::default())
        } else {
            Box::new(site.sink())
        };
        let (responses, outcome) = replay_trace(&options, store, unix_now(), trace, sink)?;
        store = outcome.store;

        println!("{}:", path.display());
        for response in &responses {
            println!("  {}", serde_json::to_string(response)?);
        }
        for diagnostic in &outcome.diagnostics {
            eprintln!(
                "  {}: {}",
                serde_json::to_string(&diagnostic.code)?,
                diagnostic.message
            );
        }
    }

    Ok(())
}

fn load_trace(path: &Path) -> Result<RequestTrace> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse trace {}", path.display()))
}
