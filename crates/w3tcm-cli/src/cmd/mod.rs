pub mod admin;
pub mod analyze;
pub mod recover;
pub mod replay;

use anyhow::Result;
use std::path::Path;
use w3tcm_context::site::Site;

pub fn load_site(dir: Option<&Path>) -> Result<Site> {
    match dir {
        Some(dir) => Site::load(dir),
        None => Site::load_cwd(),
    }
}
