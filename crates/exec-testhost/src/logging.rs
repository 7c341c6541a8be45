//! 基于 `tracing` + `tracing-subscriber` 的测试日志初始化。
//!
//! 过滤指令的优先级：
//! 1. 环境变量 `EXEC_TESTHOST_LOG`（`EnvFilter` 语法，例如 `exec_testhost=debug`）；
//! 2. 默认 `info`。
//!
//! 输出经由 libtest 的捕获写入器，只在失败用例中显示。

use tracing_subscriber::{EnvFilter, fmt};

/// 读取过滤指令的环境变量。
pub const LOG_ENV: &str = "EXEC_TESTHOST_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// 安装全局日志订阅者。
///
/// 可在每个测试开头调用：订阅者已存在时返回 `false`，不会覆盖已有配置。
pub fn init_test_logging() -> bool {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_harmless() {
        init_test_logging();
        assert!(!init_test_logging());
    }
}
