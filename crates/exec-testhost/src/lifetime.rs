use std::{borrow::Cow, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{DisposedStateError, HookError};

/// 宿主所处的停机阶段。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifetimePhase {
    Running,
    /// 停机信号已发出，钩子正在执行。
    Stopping,
    /// 钩子执行完毕，资源即将或已经释放。
    Stopped,
}

/// 被测组件在宿主停机时执行的清理逻辑。
///
/// 闭包 `Fn() -> impl Future<Output = Result<(), HookError>>` 自动实现该 trait。
#[async_trait]
pub trait ShutdownHook: Send + Sync + 'static {
    async fn on_stop(&self) -> Result<(), HookError>;
}

#[async_trait]
impl<F, Fut> ShutdownHook for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HookError>> + Send + 'static,
{
    async fn on_stop(&self) -> Result<(), HookError> {
        (self)().await
    }
}

pub(crate) struct RegisteredHook {
    pub(crate) label: Cow<'static, str>,
    pub(crate) hook: Arc<dyn ShutdownHook>,
}

/// `HostLifetime` 向被测组件广播停机信号并收集停机钩子。
///
/// # 教案级注释
/// - **意图 (Why)**：后台循环需要感知“宿主即将停止”以便收尾；需要释放外部资源的组件
///   则登记钩子，保证在宿主释放注册项之前得到执行机会；
/// - **体系位置 (Where)**：作为内置服务登记在每个宿主中，可通过
///   `host.services()?.get::<HostLifetime>()` 或 [`TestServiceHost::lifetime`](crate::TestServiceHost::lifetime) 获取；
/// - **实现策略 (How)**：阶段以 `tokio::sync::watch` 广播，等待方订阅后用 `wait_for` 挂起；
///   钩子按登记顺序保存在互斥向量中，停机时一次性取出；
/// - **契约 (What)**：停机开始后拒绝登记新钩子，返回 [`DisposedStateError`]。
#[derive(Clone)]
pub struct HostLifetime {
    inner: Arc<LifetimeInner>,
}

struct LifetimeInner {
    phase: watch::Sender<LifetimePhase>,
    hooks: Mutex<Vec<RegisteredHook>>,
}

impl fmt::Debug for HostLifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLifetime")
            .field("phase", &self.phase())
            .field("hooks", &self.inner.hooks.lock().len())
            .finish()
    }
}

impl HostLifetime {
    pub(crate) fn new() -> Self {
        let (phase, _) = watch::channel(LifetimePhase::Running);
        Self {
            inner: Arc::new(LifetimeInner {
                phase,
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn phase(&self) -> LifetimePhase {
        *self.inner.phase.borrow()
    }

    pub fn is_stopping(&self) -> bool {
        self.phase() != LifetimePhase::Running
    }

    /// 登记停机钩子，执行顺序与登记顺序一致。
    pub fn register_on_stop(
        &self,
        label: impl Into<Cow<'static, str>>,
        hook: Arc<dyn ShutdownHook>,
    ) -> Result<(), DisposedStateError> {
        let mut hooks = self.inner.hooks.lock();
        // 在钩子锁内检查阶段，与 `begin_stopping` 的取出动作互斥。
        if self.is_stopping() {
            return Err(DisposedStateError::new("register_on_stop"));
        }
        let label = label.into();
        tracing::debug!(hook = %label, "shutdown hook registered");
        hooks.push(RegisteredHook { label, hook });
        Ok(())
    }

    /// 挂起直到停机信号发出；信号已发出时立即返回。
    pub async fn stopping(&self) {
        let mut receiver = self.inner.phase.subscribe();
        // 发送端与本句柄同生命周期，`wait_for` 不会因通道关闭而失败。
        let _ = receiver
            .wait_for(|phase| *phase != LifetimePhase::Running)
            .await;
    }

    /// 挂起直到钩子全部执行完毕。
    pub async fn stopped(&self) {
        let mut receiver = self.inner.phase.subscribe();
        let _ = receiver
            .wait_for(|phase| *phase == LifetimePhase::Stopped)
            .await;
    }

    /// 进入 `Stopping` 并取出全部钩子。重复调用返回空列表。
    pub(crate) fn begin_stopping(&self) -> Vec<RegisteredHook> {
        let mut hooks = self.inner.hooks.lock();
        let transitioned = self.inner.phase.send_if_modified(|phase| {
            if *phase == LifetimePhase::Running {
                *phase = LifetimePhase::Stopping;
                true
            } else {
                false
            }
        });
        if transitioned {
            std::mem::take(&mut *hooks)
        } else {
            Vec::new()
        }
    }

    pub(crate) fn mark_stopped(&self) {
        self.inner.hooks.lock().clear();
        self.inner.phase.send_replace(LifetimePhase::Stopped);
    }
}
