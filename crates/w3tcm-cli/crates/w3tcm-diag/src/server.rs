use crate::pages::{authorized, escape_html, Page, PAGE_NAMES};
use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::warn;
use std::collections::HashMap;
use w3tcm_context::site::Site;

#[derive(Clone)]
struct AppState {
    site: Site,
}

pub async fn run(site: Site, port: u16) -> Result<()> {
    let state = AppState { site };

    let app = Router::new()
        .route("/__w3tcm", get(index_handler))
        .route("/__w3tcm/{page}", get(page_handler))
        .with_state(state);

    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    eprintln!("  Diagnostics at http://localhost:{port}/__w3tcm");
    eprintln!();

    axum::serve(listener, app).await?;

    Ok(())
}

async fn index_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let token = state.site.config.diagnostics_token.as_deref();
    if !authorized(token, &query) {
        return forbidden();
    }
    let suffix = token
        .map(|t| format!("?_wpnonce={}", escape_html(t)))
        .unwrap_or_default();
    let links: String = PAGE_NAMES
        .iter()
        .map(|name| format!("<li><a href=\"/__w3tcm/{name}{suffix}\">{name}</a></li>\n"))
        .collect();
    Html(format!(
        "<!DOCTYPE html><html><body>\n<h1>Minify Helper Diagnostics</h1>\n<ul>\n{links}</ul>\n</body></html>"
    ))
    .into_response()
}

async fn page_handler(
    State(state): State<AppState>,
    Path(page): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(state.site.config.diagnostics_token.as_deref(), &query) {
        return forbidden();
    }
    let Some(page) = Page::parse(&page, &query) else {
        return (StatusCode::NOT_FOUND, Html(error_html("Unknown page or missing parameters.")))
            .into_response();
    };
    // Reopened per request so the page shows what is on disk now.
    let rendered = state
        .site
        .open_store()
        .and_then(|store| page.render(store.db()));
    match rendered {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            warn!("diagnostics page {} failed: {e:#}", page.title());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(error_html(&format!("{e:#}"))),
            )
                .into_response()
        }
    }
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, Html(error_html("Invalid nonce."))).into_response()
}

fn error_html(message: &str) -> String {
    format!(
        r#"<!DOCTYPE html><html><body>
        <h1>Error</h1>
        <pre>{}</pre>
        </body></html>"#,
        escape_html(message)
    )
}
