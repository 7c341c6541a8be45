use std::{borrow::Cow, time::Duration};

use serde::Deserialize;

use crate::error::SettingsError;

/// 默认停机钩子超时时间。
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// 默认宿主名称，出现在日志字段与 [`HostEnvironment`](crate::HostEnvironment) 中。
pub const DEFAULT_HOST_NAME: &str = "exec-testhost";

/// `HostSettings` 描述测试宿主的运行参数。
///
/// # 教案级注释
/// - **意图 (Why)**：让测试以声明式方式调整宿主行为（停机超时、事件日志容量），
///   既可直接构造结构体，也可从 TOML 片段加载，便于多个测试共享同一份夹具配置；
/// - **契约 (What)**：
///   - `host_name` 不可为空；
///   - `shutdown_timeout` 必须大于零，单个停机钩子超过该时长即记为超时；
///   - `event_log_capacity` 为 `None` 时不限容量，否则必须大于零；
/// - **风险提示 (Trade-offs)**：TOML 中超时以毫秒整数表示（`shutdown_timeout_ms`），
///   不支持 `"5s"` 之类的人类可读格式，避免额外引入解析依赖。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostSettings {
    pub host_name: String,
    pub shutdown_timeout: Duration,
    pub event_log_capacity: Option<usize>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            host_name: DEFAULT_HOST_NAME.to_owned(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            event_log_capacity: None,
        }
    }
}

/// TOML 文件中的原始形态。缺省字段回落到 [`HostSettings::default`]。
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawSettings {
    host_name: Option<String>,
    shutdown_timeout_ms: Option<u64>,
    event_log_capacity: Option<usize>,
}

impl HostSettings {
    /// 从 TOML 文本解析配置，并执行与 [`validate`](Self::validate) 相同的校验。
    ///
    /// ```toml
    /// host_name = "orders"
    /// shutdown_timeout_ms = 250
    /// event_log_capacity = 1024
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let raw: RawSettings = toml::from_str(text)?;
        let defaults = Self::default();
        let settings = Self {
            host_name: raw.host_name.unwrap_or(defaults.host_name),
            shutdown_timeout: raw
                .shutdown_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
            event_log_capacity: raw.event_log_capacity,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// 校验字段取值。
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.host_name.trim().is_empty() {
            return Err(SettingsError::Invalid {
                field: "host_name",
                reason: Cow::Borrowed("must not be empty"),
            });
        }
        if self.shutdown_timeout.is_zero() {
            return Err(SettingsError::Invalid {
                field: "shutdown_timeout",
                reason: Cow::Borrowed("must be greater than zero"),
            });
        }
        if self.event_log_capacity == Some(0) {
            return Err(SettingsError::Invalid {
                field: "event_log_capacity",
                reason: Cow::Borrowed("must be greater than zero when set"),
            });
        }
        Ok(())
    }
}
