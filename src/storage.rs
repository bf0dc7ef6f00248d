use std::fmt;
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::ErrorKind;
use tracing::{debug, info};

/// 受限的存储根目录，所有对象都严格位于 `root` 之下。
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// 按需创建根目录，并固定为规范化的绝对路径。
    pub async fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        fs::create_dir_all(root.as_ref()).await?;
        let root = fs::canonicalize(root.as_ref()).await?;
        Ok(Self::new(root))
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 将请求路径映射为根目录下的绝对路径。
    ///
    /// `.`/`..` 按字面折叠；越出根目录或落在根目录本身均为
    /// [`StorageError::PathEscape`]。
    pub fn resolve(&self, request_path: &str) -> Result<PathBuf, StorageError> {
        let trimmed = request_path.trim_start_matches('/');
        let mut normalized = PathBuf::new();

        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(StorageError::PathEscape);
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::PathEscape);
                }
            }
        }

        let target = self.root.join(normalized);
        if !self.is_jailed(&target) {
            return Err(StorageError::PathEscape);
        }
        Ok(target)
    }

    /// `path` 严格位于根目录之下时返回 true。
    pub fn is_jailed(&self, path: &Path) -> bool {
        path != self.root && path.starts_with(&self.root)
    }

    /// 在 `target` 处返回一个空的可写文件。
    ///
    /// 缺失的上级目录会被创建；占据上级路径段的普通文件或符号链接会被删除后
    /// 重试一次；占据 `target` 本身的目录会被递归删除，符号链接只解除链接。
    pub async fn prepare(&self, target: &Path) -> Result<File, StorageError> {
        if !self.is_jailed(target) {
            return Err(StorageError::PathEscape);
        }

        if let Some(parent) = target.parent() {
            // 符号链接上级会把 create_dir_all 带出根目录。
            if let Some(conflict) = self.find_file_conflict(parent).await {
                self.unlink_conflict(&conflict).await?;
            }
            if let Err(err) = fs::create_dir_all(parent).await {
                let Some(conflict) = self.find_file_conflict(parent).await else {
                    return Err(StorageError::Io(err));
                };
                self.unlink_conflict(&conflict).await?;
                fs::create_dir_all(parent).await?;
            }
        }

        match fs::symlink_metadata(target).await {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                info!(path = ?target, "unlinking symlink at upload target");
                fs::remove_file(target).await?;
            }
            Ok(metadata) if metadata.is_dir() => {
                info!(path = ?target, "replacing existing directory with file");
                fs::remove_dir_all(target).await?;
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }

        debug!(path = ?target, "opening upload target");
        Ok(File::create(target).await?)
    }

    async fn unlink_conflict(&self, conflict: &Path) -> Result<(), StorageError> {
        info!(path = ?conflict, "removing entry in the way of directory");
        fs::remove_file(conflict).await?;
        Ok(())
    }

    /// 找出 `dir` 在根目录之下第一个存在但不是真实目录的路径段
    /// （普通文件或符号链接）。
    async fn find_file_conflict(&self, dir: &Path) -> Option<PathBuf> {
        let relative = dir.strip_prefix(&self.root).ok()?;
        let mut current = self.root.clone();

        for component in relative.components() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) if metadata.is_dir() => continue,
                Ok(_) if self.is_jailed(&current) => return Some(current),
                _ => return None,
            }
        }

        None
    }

    /// 读取已存对象的元数据；符号链接与非普通文件都视为不存在。
    pub async fn stored_file(&self, target: &Path) -> Option<Metadata> {
        let relative = target.strip_prefix(&self.root).ok()?;
        let mut current = self.root.clone();

        for component in relative.components() {
            current.push(component.as_os_str());
            let metadata = fs::symlink_metadata(&current).await.ok()?;
            if metadata.file_type().is_symlink() {
                return None;
            }
        }

        let metadata = fs::symlink_metadata(target).await.ok()?;
        metadata.is_file().then_some(metadata)
    }
}

#[derive(Debug)]
pub enum StorageError {
    PathEscape,
    Io(io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::PathEscape => f.write_str("path escapes storage root"),
            StorageError::Io(err) => write!(f, "storage io error: {err}"),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
