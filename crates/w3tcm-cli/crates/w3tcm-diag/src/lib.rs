pub mod pages;
mod server;

use w3tcm_context::site::Site;

pub async fn start(site: Site, port: u16) -> anyhow::Result<()> {
    server::run(site, port).await
}
