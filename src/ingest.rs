//! 上传写入流程：识别请求体格式，经额度闸门把载荷流式写入 [`Storage`] 准备的文件。

use axum::body::Body as AxumBody;
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use http_body_util::BodyExt;
use multer::{Field, Multipart};
use std::fmt;
use std::io;
use std::path::Path;
use std::pin::pin;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::{FIELD_SIZE_LIMIT, PAYLOAD_FIELD};
use crate::quota::{QuotaExceeded, QuotaGate};
use crate::storage::{Storage, StorageError};

/// 单个上传请求的生命周期。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPhase {
    AwaitingData,
    Writing,
    Done,
    Failed,
}

type Outcome = Result<u64, IngestError>;

/// 请求结果只结算一次：第一个终态结果生效，之后上报的一律丢弃。
struct Settlement {
    phase: IngestPhase,
    sender: Option<oneshot::Sender<Outcome>>,
}

impl Settlement {
    fn new() -> (Self, oneshot::Receiver<Outcome>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                phase: IngestPhase::AwaitingData,
                sender: Some(sender),
            },
            receiver,
        )
    }

    fn phase(&self) -> IngestPhase {
        self.phase
    }

    /// 占用载荷槽位，只有第一次调用返回 `true`。
    fn begin_writing(&mut self) -> bool {
        if self.phase != IngestPhase::AwaitingData {
            return false;
        }
        self.phase = IngestPhase::Writing;
        true
    }

    fn settle(&mut self, outcome: Outcome) -> bool {
        let Some(sender) = self.sender.take() else {
            if let Err(err) = &outcome {
                debug!(error = %err, phase = ?self.phase, "ignoring event after settlement");
            }
            return false;
        };
        self.phase = match outcome {
            Ok(_) => IngestPhase::Done,
            Err(_) => IngestPhase::Failed,
        };
        let _ = sender.send(outcome);
        true
    }
}

/// 把 `body` 携带的载荷写入 `target`，返回写入的字节数。
///
/// `multipart/form-data` 取第一个名为 `data` 的分段，其他类型原样保存。
pub async fn ingest(
    storage: &Storage,
    quota: &QuotaGate,
    content_type: Option<&str>,
    body: AxumBody,
    target: &Path,
) -> Outcome {
    let (mut settlement, outcome) = Settlement::new();

    match content_type.filter(|value| is_multipart(value)) {
        Some(content_type) => match multer::parse_boundary(content_type) {
            Ok(boundary) => {
                debug!(path = ?target, "ingesting multipart body");
                ingest_multipart(storage, quota, body, boundary, target, &mut settlement).await;
            }
            Err(err) => {
                settlement.settle(Err(IngestError::Multipart(err)));
            }
        },
        None => {
            debug!(path = ?target, "ingesting raw body");
            settlement.begin_writing();
            let result =
                write_payload(storage, quota, BodyExt::into_data_stream(body), target).await;
            settlement.settle(result);
        }
    }

    drop(settlement);
    outcome.await.unwrap_or(Err(IngestError::NoData))
}

fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .get(..19)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("multipart/form-data"))
}

async fn ingest_multipart(
    storage: &Storage,
    quota: &QuotaGate,
    body: AxumBody,
    boundary: String,
    target: &Path,
    settlement: &mut Settlement,
) {
    let mut multipart = Multipart::new(BodyExt::into_data_stream(body), boundary);

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                settlement.settle(Err(IngestError::Multipart(err)));
                return;
            }
        };

        if field.name() == Some(PAYLOAD_FIELD) && settlement.begin_writing() {
            let result = write_payload(storage, quota, field, target).await;
            if !settlement.settle(result) || settlement.phase() == IngestPhase::Failed {
                return;
            }
            continue;
        }

        if let Err(err) = discard_part(field).await {
            settlement.settle(Err(err));
            return;
        }
    }

    if settlement.phase() == IngestPhase::AwaitingData {
        settlement.settle(Err(IngestError::NoData));
    }
}

/// 读完一个非载荷分段但不保留内容；文本字段超过上限的部分只计数丢弃。
async fn discard_part(mut field: Field<'static>) -> Result<(), IngestError> {
    let name = field.name().unwrap_or_default().to_string();
    let is_text = field.file_name().is_none();
    let mut seen: u64 = 0;

    while let Some(chunk) = field.chunk().await? {
        seen += chunk.len() as u64;
    }

    if is_text && seen > FIELD_SIZE_LIMIT {
        debug!(part = name, bytes = seen, limit = FIELD_SIZE_LIMIT, "text field truncated");
    } else {
        debug!(part = name, bytes = seen, "discarded multipart part");
    }
    Ok(())
}

async fn write_payload<S, E>(
    storage: &Storage,
    quota: &QuotaGate,
    payload: S,
    target: &Path,
) -> Outcome
where
    S: Stream<Item = Result<Bytes, E>>,
    IngestError: From<E>,
{
    let mut file = storage.prepare(target).await?;

    let write_result: Outcome = async {
        let mut payload = pin!(payload);
        let mut written: u64 = 0;
        while let Some(chunk) = payload.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            quota.admit(chunk.len() as u64)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
    .await;
    drop(file);

    match write_result {
        Ok(written) => {
            info!(
                path = ?target,
                bytes = written,
                cycle_bytes = quota.used(),
                "upload stored"
            );
            Ok(written)
        }
        Err(err) => {
            if let IngestError::Quota(exceeded) = &err {
                warn!(
                    max_bytes = exceeded.max,
                    used = exceeded.used,
                    "write budget exhausted until next sweep"
                );
            }
            if let Err(remove_err) = fs::remove_file(target).await {
                warn!(path = ?target, error = %remove_err, "failed to remove partial upload");
            }
            Err(err)
        }
    }
}

#[derive(Debug)]
pub enum IngestError {
    NoData,
    Quota(QuotaExceeded),
    Multipart(multer::Error),
    Body(axum::Error),
    Storage(StorageError),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::NoData => write!(f, "no `{PAYLOAD_FIELD}` part in multipart body"),
            IngestError::Quota(err) => write!(f, "{err}"),
            IngestError::Multipart(err) => write!(f, "multipart error: {err}"),
            IngestError::Body(err) => write!(f, "request body error: {err}"),
            IngestError::Storage(err) => write!(f, "{err}"),
        }
    }
}

impl From<QuotaExceeded> for IngestError {
    fn from(err: QuotaExceeded) -> Self {
        IngestError::Quota(err)
    }
}

impl From<multer::Error> for IngestError {
    fn from(err: multer::Error) -> Self {
        IngestError::Multipart(err)
    }
}

impl From<axum::Error> for IngestError {
    fn from(err: axum::Error) -> Self {
        IngestError::Body(err)
    }
}

impl From<StorageError> for IngestError {
    fn from(err: StorageError) -> Self {
        IngestError::Storage(err)
    }
}

impl From<io::Error> for IngestError {
    fn from(err: io::Error) -> Self {
        IngestError::Storage(StorageError::Io(err))
    }
}
