use std::{borrow::Cow, fmt, sync::Arc};

use crate::{
    clock::{Clock, FakeClock},
    error::{ConfigurationError, ServiceRegistrationError},
    event_log::{EventLog, InMemoryEventLog},
    host::{HostEnvironment, TestServiceHost},
    lifetime::{HostLifetime, ShutdownHook},
    service::{ServiceProvider, ServiceRegistry},
    settings::HostSettings,
};

/// 时钟来源：默认构造独立的虚拟时钟，也允许测试注入自己的实现。
enum ClockChoice {
    Fake(FakeClock),
    Custom(Arc<dyn Clock>),
}

/// `TestServiceHostBuilder` 聚合测试宿主的装配步骤。
///
/// # 教案级注释
/// - **设计目标 (Why)**
///   - 为执行服务的测试提供统一装配入口：真实基础设施在这里被替换为虚拟时钟、
///     内存事件日志与 Mock 适配器；
///   - 借鉴 Generic Host 的 Builder 形态，但宿主状态完全由调用方持有，同一进程内可并存多个宿主。
/// - **关键流程 (How)**
///   1. `with_settings*`：设定宿主参数；
///   2. `with_clock` / `with_fake_clock` / `with_event_log`：替换内置协作者；
///   3. `configure_services`：登记被测组件与 Mock 适配器；
///   4. `add_shutdown_hook`：登记停机钩子；
///   5. `build`：校验配置、安装内置服务并产出 `Running` 状态的 [`TestServiceHost`]。
/// - **契约说明 (What)**
///   - 配置步骤不会立即失败，首个错误被保留并由 `build` 以 [`ConfigurationError`] 返回，
///     保证失败归因于测试装配阶段；
///   - `build` 消费 Builder，一个 Builder 只能产出一个宿主；
///   - 空 Builder 的 `build` 必然成功。
/// - **风险提示 (Trade-offs)**
///   - 用户直接登记 `dyn Clock`、`dyn EventLog` 等内置能力会与内置注册冲突；替换内置协作者请使用对应的 `with_*` 方法。
pub struct TestServiceHostBuilder {
    settings: HostSettings,
    services: ServiceRegistry,
    hooks: Vec<(Cow<'static, str>, Arc<dyn ShutdownHook>)>,
    clock: ClockChoice,
    event_log: Option<Arc<dyn EventLog>>,
    first_error: Option<ConfigurationError>,
}

impl fmt::Debug for TestServiceHostBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestServiceHostBuilder")
            .field("settings", &self.settings)
            .field("service_count", &self.services.len())
            .field("hook_count", &self.hooks.len())
            .field("custom_clock", &matches!(self.clock, ClockChoice::Custom(_)))
            .field("custom_event_log", &self.event_log.is_some())
            .field("first_error", &self.first_error)
            .finish()
    }
}

impl Default for TestServiceHostBuilder {
    fn default() -> Self {
        Self {
            settings: HostSettings::default(),
            services: ServiceRegistry::new(),
            hooks: Vec::new(),
            clock: ClockChoice::Fake(FakeClock::new()),
            event_log: None,
            first_error: None,
        }
    }
}

impl TestServiceHostBuilder {
    /// 空 Builder：默认配置，没有任何用户注册。
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(mut self, settings: HostSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 从 TOML 文本加载配置；解析失败在 `build` 时报告。
    pub fn with_settings_toml(mut self, text: &str) -> Self {
        match HostSettings::from_toml_str(text) {
            Ok(settings) => self.settings = settings,
            Err(error) => self.record_error(error.into()),
        }
        self
    }

    /// 使用给定的虚拟时钟；宿主同时以 `FakeClock` 与 `dyn Clock` 两种能力登记它。
    pub fn with_fake_clock(mut self, clock: FakeClock) -> Self {
        self.clock = ClockChoice::Fake(clock);
        self
    }

    /// 使用任意时钟实现；宿主只以 `dyn Clock` 登记它。
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = ClockChoice::Custom(clock);
        self
    }

    /// 替换默认的 [`InMemoryEventLog`]。
    pub fn with_event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    /// 登记服务；闭包返回的首个错误会让 `build` 失败。
    pub fn configure_services<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(&mut ServiceRegistry) -> Result<(), ServiceRegistrationError>,
    {
        if let Err(error) = configure(&mut self.services) {
            self.record_error(error.into());
        }
        self
    }

    pub fn add_shutdown_hook(
        mut self,
        label: impl Into<Cow<'static, str>>,
        hook: Arc<dyn ShutdownHook>,
    ) -> Self {
        self.hooks.push((label.into(), hook));
        self
    }

    /// 构建宿主。
    ///
    /// - **执行步骤**
    ///   1. 返回装配阶段保留的首个错误；
    ///   2. 校验 [`HostSettings`]；
    ///   3. 安装内置服务：[`HostEnvironment`]、[`HostLifetime`]、时钟与事件日志；
    ///   4. 把注册表移入新的 [`ServiceProvider`]，宿主进入 `Running`。
    /// - **错误**：注册冲突与非法配置均返回 [`ConfigurationError`]。
    pub fn build(self) -> Result<TestServiceHost, ConfigurationError> {
        let TestServiceHostBuilder {
            settings,
            mut services,
            hooks,
            clock,
            event_log,
            first_error,
        } = self;

        if let Some(error) = first_error {
            tracing::warn!(%error, "test host configuration rejected");
            return Err(error);
        }
        settings.validate()?;

        let lifetime = HostLifetime::new();
        let hook_count = hooks.len();
        for (label, hook) in hooks {
            // 新建的生命周期处于 Running，登记不会被拒绝。
            if let Err(error) = lifetime.register_on_stop(label, hook) {
                tracing::error!(%error, "shutdown hook rejected by fresh lifetime");
            }
        }

        let clock: Arc<dyn Clock> = match clock {
            ClockChoice::Fake(fake) => {
                services.register_instance(Arc::new(fake.clone()))?;
                Arc::new(fake)
            }
            ClockChoice::Custom(custom) => custom,
        };
        let event_log: Arc<dyn EventLog> = match event_log {
            Some(custom) => custom,
            None => {
                let log = Arc::new(match settings.event_log_capacity {
                    Some(capacity) => {
                        InMemoryEventLog::with_capacity_limit(Arc::clone(&clock), capacity)
                    }
                    None => InMemoryEventLog::new(Arc::clone(&clock)),
                });
                services.register_instance(Arc::clone(&log))?;
                log
            }
        };

        services.register_instance::<dyn Clock>(clock)?;
        services.register_instance::<dyn EventLog>(event_log)?;
        services.register_instance(Arc::new(lifetime.clone()))?;
        services.register_instance(Arc::new(HostEnvironment::new(settings.clone())))?;

        tracing::info!(
            host = %settings.host_name,
            services = services.len(),
            hooks = hook_count,
            "test host built"
        );
        Ok(TestServiceHost::new(
            ServiceProvider::new(services),
            lifetime,
            settings,
        ))
    }

    fn record_error(&mut self, error: ConfigurationError) {
        if self.first_error.is_none() {
            self.first_error = Some(error);
        } else {
            tracing::debug!(%error, "additional configuration error ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SettingsError;

    #[test]
    fn empty_builder_builds() {
        let host = TestServiceHostBuilder::new().build().expect("empty builder");
        let services = host.services().unwrap();
        assert!(services.contains::<dyn Clock>());
        assert!(services.contains::<FakeClock>());
        assert!(services.contains::<dyn EventLog>());
        assert!(services.contains::<InMemoryEventLog>());
        assert!(services.contains::<HostLifetime>());
        assert!(services.contains::<HostEnvironment>());
    }

    #[test]
    fn first_configuration_error_wins() {
        let error = TestServiceHostBuilder::new()
            .with_settings_toml("shutdown_timeout_ms = \"soon\"")
            .configure_services(|services| {
                services.register_instance(Arc::new(1_u8))?;
                services.register_instance(Arc::new(2_u8))
            })
            .build()
            .unwrap_err();
        assert!(
            matches!(error, ConfigurationError::Settings(SettingsError::Parse { .. })),
            "{error:?}"
        );
    }

    #[test]
    fn registering_a_builtin_capability_conflicts() {
        let error = TestServiceHostBuilder::new()
            .configure_services(|services| {
                services.register_instance::<dyn Clock>(Arc::new(FakeClock::new()))
            })
            .build()
            .unwrap_err();
        assert!(matches!(
            error,
            ConfigurationError::Registration(ServiceRegistrationError::Duplicate { .. })
        ));
    }

    #[test]
    fn custom_clock_is_not_exposed_as_fake_clock() {
        let host = TestServiceHostBuilder::new()
            .with_clock(Arc::new(crate::clock::SystemClock))
            .build()
            .unwrap();
        let services = host.services().unwrap();
        assert!(services.contains::<dyn Clock>());
        assert!(!services.contains::<FakeClock>());
    }

    #[test]
    fn injected_event_log_replaces_default() {
        let custom: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new(Arc::new(FakeClock::new())));
        custom
            .append("seed", "preloaded", serde_json::Value::Null)
            .unwrap();
        let host = TestServiceHostBuilder::new()
            .with_event_log(Arc::clone(&custom))
            .build()
            .unwrap();
        let services = host.services().unwrap();
        assert!(!services.contains::<InMemoryEventLog>());
        assert_eq!(services.get::<dyn EventLog>().unwrap().len(), 1);
    }

    #[test]
    fn event_log_capacity_comes_from_settings() {
        let host = TestServiceHostBuilder::new()
            .with_settings_toml("event_log_capacity = 4")
            .build()
            .unwrap();
        let log = host.services().unwrap().get::<InMemoryEventLog>().unwrap();
        assert_eq!(log.capacity(), Some(4));
    }
}
