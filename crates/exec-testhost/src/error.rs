//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义测试宿主在装配、解析与停机阶段暴露的错误语义；
//! - 装配错误统一收敛为 [`ConfigurationError`]，保证测试在准备阶段即失败，而非在断言中途失败。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，可直接交给 `anyhow` 或测试框架打印错误链；
//! - 不提供重试或恢复路径：误用宿主属于测试编排问题，应快速失败。

use std::borrow::Cow;

use thiserror::Error;

/// 注册服务时可能遇到的错误。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ServiceRegistrationError {
    /// 同一能力类型已被登记，禁止重复注册。
    #[error("service `{type_name}` already registered")]
    Duplicate { type_name: &'static str },
}

/// 宿主配置（[`HostSettings`](crate::HostSettings)）无法解析或未通过校验。
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SettingsError {
    /// TOML 文本解析失败，`reason` 保留解析器给出的定位信息。
    #[error("host settings could not be parsed: {reason}")]
    Parse { reason: String },

    /// 字段取值不合法。
    #[error("host setting `{field}` is invalid: {reason}")]
    Invalid {
        field: &'static str,
        reason: Cow<'static, str>,
    },
}

impl From<toml::de::Error> for SettingsError {
    fn from(value: toml::de::Error) -> Self {
        Self::Parse {
            reason: value.to_string(),
        }
    }
}

/// `build` 无法构造有效宿主时返回的错误。
///
/// # 教案式说明
/// - **意图 (Why)**：把“注册冲突”与“配置非法”两类装配失败归并到同一入口，测试只需处理一种错误类型；
/// - **契约 (What)**：只会由 [`TestServiceHostBuilder::build`](crate::TestServiceHostBuilder::build) 产生，
///   宿主一旦进入 `Running` 状态便不会再返回该错误；
/// - **风险提示 (Trade-offs)**：Builder 只保留首个失败原因，后续错误会被忽略，以免错误链冗长难读。
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigurationError {
    /// 服务注册冲突。
    #[error("service registration failed: {0}")]
    Registration(#[from] ServiceRegistrationError),

    /// 配置解析或校验失败。
    #[error("host settings rejected: {0}")]
    Settings(#[from] SettingsError),
}

/// 宿主释放后仍被访问。
///
/// `operation` 记录被拒绝的操作名称，便于在失败信息中定位误用点。
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("test host already disposed; `{operation}` is not permitted")]
pub struct DisposedStateError {
    pub operation: &'static str,
}

impl DisposedStateError {
    pub(crate) const fn new(operation: &'static str) -> Self {
        Self { operation }
    }
}

/// 通过 [`ServiceProvider`](crate::ServiceProvider) 解析服务失败。
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ResolveError {
    /// 能力类型从未登记。
    #[error("service `{type_name}` is not registered")]
    NotRegistered { type_name: &'static str },

    /// 工厂在创建实例时失败。
    #[error("factory for `{type_name}` failed: {reason}")]
    Factory {
        type_name: &'static str,
        reason: String,
    },

    /// 宿主已释放所有注册项。
    #[error(transparent)]
    Disposed(#[from] DisposedStateError),
}

/// 停机钩子执行失败。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("shutdown hook failed: {message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 内存事件日志的写入/解码错误。
#[derive(Debug, Error)]
pub enum EventLogError {
    /// 已达到配置的容量上限。
    #[error("event log capacity of {capacity} records exhausted")]
    CapacityExceeded { capacity: usize },

    /// 事件负载序列化或反序列化失败。
    #[error("event payload codec failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Mock 适配器调用失败。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MockAdapterError {
    /// 第 `call_index` 次调用既没有脚本化响应，也没有兜底响应器。
    #[error("mock adapter `{adapter}` has no response scripted for call #{call_index}")]
    Unscripted {
        adapter: Cow<'static, str>,
        call_index: usize,
    },

    /// 测试脚本显式要求本次调用失败。
    #[error("mock adapter `{adapter}` returned scripted failure: {message}")]
    Scripted {
        adapter: Cow<'static, str>,
        message: String,
    },
}
