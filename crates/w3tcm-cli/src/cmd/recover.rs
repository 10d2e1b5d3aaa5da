use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use w3tcm_context::site::Site;
use w3tcm_monitor::recovery::{MinifyResponse, Recovery, Source};
use w3tcm_monitor::recover_failed_request;

pub fn run(
    site: &Site,
    status: u16,
    uri: String,
    ext: Option<String>,
    sources: &[PathBuf],
) -> Result<()> {
    let sources = sources
        .iter()
        .map(|path| {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(Source {
                path: path.to_string_lossy().into_owned(),
                content,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let response = MinifyResponse {
        status,
        request_uri: uri,
        ext,
    };
    let minifier = site.minifier();
    let mut store = site.open_store()?;
    let recovery = recover_failed_request(
        &response,
        &site.config.minify_cache_prefix,
        &sources,
        minifier.as_deref(),
        &site.config.thresholds,
        store.db_mut(),
    );
    store.save()?;

    match recovery {
        Recovery::Replaced {
            status,
            content_type,
            body,
        } => {
            eprintln!("{status} {content_type}");
            print!("{body}");
        }
        Recovery::Unchanged => eprintln!("Response left unchanged."),
    }
    Ok(())
}
