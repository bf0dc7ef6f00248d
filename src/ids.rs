//! 首页推荐的短上传标识。

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::config::{ID_MIN_LEN, ID_RANDOM_BYTES};

/// 分配本进程内尚未发放过的最短随机前缀。
#[derive(Debug, Default)]
pub struct IdAllocator {
    issued: Mutex<HashSet<String>>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> Result<String, rand::Error> {
        loop {
            let mut block = [0u8; ID_RANDOM_BYTES];
            OsRng.try_fill_bytes(&mut block)?;
            let encoded = URL_SAFE_NO_PAD.encode(block);

            let mut issued = self.issued.lock().unwrap_or_else(|poison| poison.into_inner());
            if let Some(id) = shortest_unused_prefix(&encoded, &issued).map(str::to_owned) {
                issued.insert(id.clone());
                return Ok(id);
            }
        }
    }

    pub fn issued_count(&self) -> usize {
        self.issued
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }
}

fn shortest_unused_prefix<'a>(encoded: &'a str, issued: &HashSet<String>) -> Option<&'a str> {
    (ID_MIN_LEN..=encoded.len())
        .map(|len| &encoded[..len])
        .find(|candidate| !issued.contains(*candidate))
}
