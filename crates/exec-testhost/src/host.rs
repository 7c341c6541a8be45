use std::{fmt, time::Duration};

use crate::{
    builder::TestServiceHostBuilder,
    error::{ConfigurationError, DisposedStateError},
    lifetime::HostLifetime,
    service::ServiceProvider,
    settings::HostSettings,
    shutdown::{ShutdownReport, run_shutdown},
};

/// 宿主生命周期状态：`Created → Running → Stopped`，不可回退。
///
/// `Created` 对应尚未 `build` 的 [`TestServiceHostBuilder`]，宿主实例本身只会处于后两种状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HostState::Created => "created",
            HostState::Running => "running",
            HostState::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

/// 内置服务：暴露宿主名称与生效的配置。
#[derive(Clone, Debug)]
pub struct HostEnvironment {
    settings: HostSettings,
}

impl HostEnvironment {
    pub(crate) fn new(settings: HostSettings) -> Self {
        Self { settings }
    }

    pub fn host_name(&self) -> &str {
        &self.settings.host_name
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.settings.shutdown_timeout
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }
}

/// `TestServiceHost` 独占一个进程内宿主，负责解析面暴露与有序停机。
///
/// # 教案级注释
/// - **设计目的 (Why)**
///   - 让执行服务的逻辑在无容器、无真实网络的条件下被测试：所有依赖由
///     [`TestServiceHostBuilder`] 替换为测试替身，测试通过 [`services`](Self::services) 取得被测组件；
///   - 宿主状态显式归调用方所有，不存在进程级单例，多个宿主可在同一测试进程内并存。
/// - **关键流程 (How)**
///   - [`dispose`](Self::dispose) 先发出停机信号并执行钩子，再释放全部注册项（先停止、后释放）；
///   - `Drop` 作为兜底：未调用 `dispose` 的宿主在析构时同步释放注册项并输出 WARN 日志，但不会执行钩子。
/// - **契约说明 (What)**
///   - 释放后任何访问都返回 [`DisposedStateError`]；
///   - 重复 `dispose` 不做任何工作，直接返回首次停机的报告。
/// - **风险提示 (Trade-offs)**
///   - 钩子超时依赖 Tokio 计时器，`dispose` 必须在启用 `time` 的 Tokio 运行时内等待。
pub struct TestServiceHost {
    state: HostState,
    provider: ServiceProvider,
    lifetime: HostLifetime,
    settings: HostSettings,
    report: Option<ShutdownReport>,
}

impl fmt::Debug for TestServiceHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestServiceHost")
            .field("host_name", &self.settings.host_name)
            .field("state", &self.state)
            .field("provider", &self.provider)
            .finish()
    }
}

impl TestServiceHost {
    pub(crate) fn new(
        provider: ServiceProvider,
        lifetime: HostLifetime,
        settings: HostSettings,
    ) -> Self {
        Self {
            state: HostState::Running,
            provider,
            lifetime,
            settings,
            report: None,
        }
    }

    /// 返回尚未登记任何服务的 Builder。
    pub fn create() -> TestServiceHostBuilder {
        TestServiceHostBuilder::new()
    }

    /// 构建宿主、执行 `body`，并在 `body` 结束后释放宿主。
    ///
    /// `body` 发生 panic 时由 `Drop` 兜底释放注册项。
    pub async fn scoped<F, R>(
        builder: TestServiceHostBuilder,
        body: F,
    ) -> Result<(R, ShutdownReport), ConfigurationError>
    where
        F: AsyncFnOnce(&TestServiceHost) -> R,
    {
        let mut host = builder.build()?;
        let output = body(&host).await;
        let report = host.dispose().await;
        Ok((output, report))
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn host_name(&self) -> &str {
        &self.settings.host_name
    }

    /// 服务解析面。
    pub fn services(&self) -> Result<&ServiceProvider, DisposedStateError> {
        self.ensure_running("services")?;
        Ok(&self.provider)
    }

    /// 停机信号与钩子登记入口。
    pub fn lifetime(&self) -> Result<&HostLifetime, DisposedStateError> {
        self.ensure_running("lifetime")?;
        Ok(&self.lifetime)
    }

    /// 停止宿主并释放资源。
    ///
    /// - **执行步骤**
    ///   1. 生命周期进入 `Stopping`，按登记顺序执行停机钩子（各自受超时约束）；
    ///   2. 生命周期进入 `Stopped`；
    ///   3. 释放全部注册项与单例缓存，宿主进入 [`HostState::Stopped`]。
    /// - **幂等性**：再次调用直接返回首次的报告。
    pub async fn dispose(&mut self) -> ShutdownReport {
        if let Some(report) = &self.report {
            tracing::debug!(host = %self.settings.host_name, "test host already disposed");
            return report.clone();
        }

        let report = run_shutdown(
            &self.settings.host_name,
            &self.lifetime,
            self.settings.shutdown_timeout,
        )
        .await;
        let released = self.provider.release();
        self.state = HostState::Stopped;

        let report = report.with_released_services(released);
        tracing::info!(
            host = %self.settings.host_name,
            released,
            clean = report.is_clean(),
            "test host disposed"
        );
        self.report = Some(report.clone());
        report
    }

    fn ensure_running(&self, operation: &'static str) -> Result<(), DisposedStateError> {
        match self.state {
            HostState::Stopped => Err(DisposedStateError::new(operation)),
            HostState::Created | HostState::Running => Ok(()),
        }
    }
}

impl Drop for TestServiceHost {
    fn drop(&mut self) {
        if self.state == HostState::Stopped {
            return;
        }
        tracing::warn!(
            host = %self.settings.host_name,
            "test host dropped without dispose; releasing services without running shutdown hooks"
        );
        self.lifetime.mark_stopped();
        self.provider.release();
        self.state = HostState::Stopped;
    }
}
