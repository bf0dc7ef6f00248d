//! 已存对象的下载处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, OriginalUri, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::ApiError;
use crate::etag::{etag_from_metadata, none_match};
use crate::storage::Storage;

/// 流式返回 `path` 处的已存对象；目录、符号链接、缺失对象与根目录外路径
/// 一律视为 "no such file"。
pub async fn serve_file(
    Path(path): Path<String>,
    OriginalUri(uri): OriginalUri,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let not_found = || ApiError::no_such_file(uri.path());

    let target = storage.resolve(&path).map_err(|_| not_found())?;
    let metadata = storage.stored_file(&target).await.ok_or_else(not_found)?;

    let etag = etag_from_metadata(&metadata);
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag).map_err(|_| ApiError::Internal("invalid etag".into()))?,
    );
    if let Ok(modified) = metadata.modified() {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("invalid last-modified".into()))?,
        );
    }

    if request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| none_match(value, &etag))
    {
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    let mime = mime_guess::from_path(&target).first_or_octet_stream();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));

    let file = File::open(&target).await.map_err(|_| not_found())?;
    debug!(path = ?target, size = metadata.len(), "serving stored file");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

pub async fn not_found(OriginalUri(uri): OriginalUri) -> ApiError {
    ApiError::no_such_file(uri.path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Uri;
    use http_body_util::BodyExt;
    use tempfile::tempdir;

    async fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::open(temp.path().join("stash"))
            .await
            .expect("open storage");
        (temp, Arc::new(storage))
    }

    async fn get(storage: &Arc<Storage>, path: &str, headers: HeaderMap) -> Response {
        let uri: Uri = format!("/{path}").parse().expect("uri");
        match serve_file(
            Path(path.to_string()),
            OriginalUri(uri),
            headers,
            Extension(storage.clone()),
        )
        .await
        {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    #[tokio::test]
    async fn serves_stored_bytes_with_type() {
        let (_temp, storage) = make_storage().await;
        std::fs::write(storage.root_path().join("hello.txt"), b"hi there").expect("write");

        let response = get(&storage, "hello.txt", HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("type"),
            "text/plain"
        );
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], b"hi there");
    }

    #[tokio::test]
    async fn missing_directory_and_escape_are_not_found() {
        let (_temp, storage) = make_storage().await;
        std::fs::create_dir_all(storage.root_path().join("dir")).expect("mkdir");

        for path in ["nope", "dir", "../etc/passwd"] {
            let response = get(&storage, path, HeaderMap::new()).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }

        let response = get(&storage, "nope", HeaderMap::new()).await;
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], b"error: No such file or directory (/nope).");
    }

    #[tokio::test]
    async fn matching_etag_is_not_modified() {
        let (_temp, storage) = make_storage().await;
        std::fs::write(storage.root_path().join("x"), b"x").expect("write");

        let first = get(&storage, "x", HeaderMap::new()).await;
        let etag = first.headers().get(header::ETAG).expect("etag").clone();
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, etag);

        let second = get(&storage, "x", headers).await;
        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_objects_are_not_served() {
        use std::os::unix::fs::symlink;

        let (temp, storage) = make_storage().await;
        let secret = temp.path().join("secret.txt");
        std::fs::write(&secret, b"secret").expect("write secret");
        symlink(&secret, storage.root_path().join("leaf")).expect("symlink leaf");
        symlink(temp.path(), storage.root_path().join("up")).expect("symlink dir");

        for path in ["leaf", "up/secret.txt"] {
            let response = get(&storage, path, HeaderMap::new()).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }
    }
}
