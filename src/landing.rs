//! 首页：附带新分配的上传路径。

use axum::extract::{Extension, OriginalUri};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::ApiError;
use crate::http::forwarded_base_path;
use crate::ids::IdAllocator;

const RANDOM_PATH_PLACEHOLDER: &str = "$__RANDOM_PATH";
const SERVER_PATH_PLACEHOLDER: &str = "$__SERVER_PATH";

#[derive(RustEmbed)]
#[folder = "assets"]
struct Assets;

/// 首页模板，含 `$__RANDOM_PATH` / `$__SERVER_PATH` 占位符。
#[derive(Debug, Clone)]
pub struct LandingPage {
    template: String,
}

impl LandingPage {
    pub fn new(template: String) -> Self {
        Self { template }
    }

    pub fn embedded() -> io::Result<Self> {
        let asset = Assets::get("index.html")
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "embedded index.html"))?;
        let template = String::from_utf8(asset.data.into_owned())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Self::new(template))
    }

    pub async fn from_file(path: &Path) -> io::Result<Self> {
        Ok(Self::new(tokio::fs::read_to_string(path).await?))
    }

    pub fn render(&self, random_path: &str, server_path: &str) -> String {
        self.template
            .replace(RANDOM_PATH_PLACEHOLDER, random_path)
            .replace(SERVER_PATH_PLACEHOLDER, server_path)
    }
}

pub async fn landing_page(
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Extension(ids): Extension<Arc<IdAllocator>>,
    Extension(page): Extension<Arc<LandingPage>>,
) -> Result<Response, ApiError> {
    let random_id = ids.allocate().map_err(|err| {
        error!(error = %err, "identifier allocation failed");
        ApiError::Internal("error: Internal error.\n".into())
    })?;
    debug!(id = random_id, issued = ids.issued_count(), "landing page");

    let server_path = forwarded_base_path(&headers, uri.path());
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=UTF-8"),
        )],
        page.render(&random_id, &server_path),
    )
        .into_response())
}
