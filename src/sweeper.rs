//! 定期保留期清理：删除过期文件并开启新的额度周期。

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::config::SweepBackend;
use crate::quota::QuotaGate;
use crate::storage::Storage;

#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicy {
    pub interval: Duration,
    pub max_age: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: u64,
    pub failed: u64,
}

/// 批量删除 `root` 下早于 `max_age` 的普通文件。
#[async_trait]
pub trait FilesystemSweep: Send + Sync {
    async fn sweep(&self, root: &Path, max_age: Duration) -> io::Result<SweepReport>;
}

/// 在阻塞任务中遍历目录树，不跟随符号链接。
#[derive(Debug, Default)]
pub struct WalkSweep;

#[async_trait]
impl FilesystemSweep for WalkSweep {
    async fn sweep(&self, root: &Path, max_age: Duration) -> io::Result<SweepReport> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || walk_and_delete(&root, max_age))
            .await
            .map_err(|err| io::Error::other(err.to_string()))
    }
}

fn walk_and_delete(root: &Path, max_age: Duration) -> SweepReport {
    let now = SystemTime::now();
    let mut report = SweepReport::default();

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "sweep walk error");
                report.failed += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let expired = entry
            .metadata()
            .ok()
            .and_then(|metadata| metadata.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);
        if !expired {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => report.removed += 1,
            Err(err) => {
                warn!(path = ?entry.path(), error = %err, "failed to remove aged file");
                report.failed += 1;
            }
        }
    }

    report
}

/// 委托给 `find <root> -type f -mmin +<minutes> -delete`。
#[derive(Debug)]
pub struct FindSweep {
    program: PathBuf,
}

impl Default for FindSweep {
    fn default() -> Self {
        Self {
            program: PathBuf::from("find"),
        }
    }
}

#[async_trait]
impl FilesystemSweep for FindSweep {
    async fn sweep(&self, root: &Path, max_age: Duration) -> io::Result<SweepReport> {
        let minutes = max_age.as_secs() / 60;
        let mut child = Command::new(&self.program)
            .arg(root)
            .args(["-type", "f", "-mmin"])
            .arg(format!("+{minutes}"))
            .args(["-print", "-delete"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut failed: u64 = 0;
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(output = line, "find");
                    failed += 1;
                }
                failed
            })
        });

        let mut report = SweepReport::default();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(_path) = lines.next_line().await? {
                report.removed += 1;
            }
        }

        let status = child.wait().await?;
        if let Some(handle) = stderr {
            report.failed = handle.await.unwrap_or_default();
        }
        if !status.success() {
            warn!(%status, "find exited unsuccessfully");
        }
        Ok(report)
    }
}

pub fn backend(kind: SweepBackend) -> Arc<dyn FilesystemSweep> {
    match kind {
        SweepBackend::Walk => Arc::new(WalkSweep),
        SweepBackend::Find => Arc::new(FindSweep::default()),
    }
}

pub struct RetentionSweeper {
    storage: Arc<Storage>,
    quota: Arc<QuotaGate>,
    backend: Arc<dyn FilesystemSweep>,
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    pub fn new(
        storage: Arc<Storage>,
        quota: Arc<QuotaGate>,
        backend: Arc<dyn FilesystemSweep>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            storage,
            quota,
            backend,
            policy,
        }
    }

    /// 执行一次清理；无论结果如何都重置额度。
    pub async fn sweep_once(&self) -> Option<SweepReport> {
        let root = self.storage.root_path();
        info!(root = ?root, max_age = ?self.policy.max_age, "sweep started");

        let report = match self.backend.sweep(root, self.policy.max_age).await {
            Ok(report) => Some(report),
            Err(err) => {
                error!(error = %err, "sweep failed, retrying next interval");
                None
            }
        };

        let cycle_bytes = self.quota.reset();
        info!(
            removed = report.map(|r| r.removed),
            failed = report.map(|r| r.failed),
            cycle_bytes,
            "sweep completed"
        );
        report
    }

    /// 启动即清理一次，此后每次清理结束后等待 `interval` 再清理。
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.sweep_once().await;
                tokio::time::sleep(self.policy.interval).await;
            }
        })
    }
}
