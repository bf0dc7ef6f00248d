//! 两次清理之间所有上传共享的全局写入额度。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 统计自上次清理以来已放行的字节数，上限固定。
#[derive(Debug)]
pub struct QuotaGate {
    used: AtomicU64,
    max_bytes: u64,
}

impl QuotaGate {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            max_bytes,
        }
    }

    /// 计入 `len` 字节；若会超出上限则拒绝，计数保持不变。
    pub fn admit(&self, len: u64) -> Result<(), QuotaExceeded> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|total| *total <= self.max_bytes)
            })
            .map(|_| ())
            .map_err(|used| QuotaExceeded {
                requested: len,
                used,
                max: self.max_bytes,
            })
    }

    /// 开启新的额度周期，返回上一周期累计的字节数。
    pub fn reset(&self) -> u64 {
        self.used.swap(0, Ordering::AcqRel)
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub requested: u64,
    pub used: u64,
    pub max: u64,
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no space left: {} bytes requested, {} of {} bytes used this cycle",
            self.requested, self.used, self.max
        )
    }
}
