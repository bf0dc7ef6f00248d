//! `POST`/`PUT /<path>` 上传处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, OriginalUri, Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::ingest::ingest;
use crate::quota::QuotaGate;
use crate::storage::Storage;

#[derive(Deserialize)]
pub(crate) struct UploadQuery {
    redirect: Option<String>,
}

pub async fn upload_file(
    Path(path): Path<String>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(quota): Extension<Arc<QuotaGate>>,
    body: AxumBody,
) -> Result<Response, ApiError> {
    store(&path, uri.path(), query, &headers, &storage, &quota, body).await
}

/// 指向 `/` 的上传总是落在根目录上，直接拒绝。
pub async fn upload_root(
    OriginalUri(uri): OriginalUri,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(quota): Extension<Arc<QuotaGate>>,
    body: AxumBody,
) -> Result<Response, ApiError> {
    store("", uri.path(), query, &headers, &storage, &quota, body).await
}

async fn store(
    path: &str,
    raw_path: &str,
    query: UploadQuery,
    headers: &HeaderMap,
    storage: &Storage,
    quota: &QuotaGate,
    body: AxumBody,
) -> Result<Response, ApiError> {
    let target = storage.resolve(path).map_err(|_| {
        warn!(path = raw_path, "jailbreak attempt");
        ApiError::jailbreak(raw_path)
    })?;
    info!(path = ?target, "stash upload");

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    ingest(storage, quota, content_type, body, &target)
        .await
        .map_err(|err| {
            warn!(path = ?target, error = %err, "upload failed");
            ApiError::write_failed()
        })?;

    if query.redirect.is_some() {
        let file_name = raw_path.rsplit('/').next().unwrap_or_default();
        let location = HeaderValue::from_str(&format!("./{file_name}"))
            .map_err(|_| ApiError::Internal("invalid redirect location".into()))?;
        return Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response());
    }
    Ok((StatusCode::OK, "ok\n").into_response())
}
