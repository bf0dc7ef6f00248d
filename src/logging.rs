//! 日志初始化：`RUST_LOG` 优先，其次 `STASH_LOG`，都未设置时使用默认过滤规则。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "STASH_LOG";

/// 初始化 tracing 日志订阅。
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(LOG_ENV))
        .unwrap_or_else(|_| EnvFilter::new(default_directives()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// 本服务按 `info` 输出，multipart 解析库只保留告警。
fn default_directives() -> String {
    format!("info,{}=info,multer=warn", env!("CARGO_CRATE_NAME"))
}
