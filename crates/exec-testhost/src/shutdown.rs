#![allow(clippy::module_name_repetitions)]

use std::{borrow::Cow, time::Duration};

use tokio::time::Instant;

use crate::{error::HookError, lifetime::HostLifetime};

/// 单个停机钩子的执行结果。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ShutdownStatus {
    Completed,
    Failed(HookError),
    /// 超过 [`HostSettings::shutdown_timeout`](crate::HostSettings::shutdown_timeout) 仍未完成，钩子 Future 已被丢弃。
    TimedOut,
}

/// 停机报告中的一条记录。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShutdownRecord {
    pub label: Cow<'static, str>,
    pub status: ShutdownStatus,
    /// 以 Tokio 计时器度量，与超时使用同一时间源。
    pub elapsed: Duration,
}

/// 一次停机的结构化报告，按钩子登记顺序排列。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShutdownReport {
    records: Vec<ShutdownRecord>,
    released_services: usize,
}

impl ShutdownReport {
    pub fn records(&self) -> &[ShutdownRecord] {
        &self.records
    }

    /// 所有钩子都已正常完成。
    pub fn is_clean(&self) -> bool {
        self.records
            .iter()
            .all(|record| record.status == ShutdownStatus::Completed)
    }

    /// 释放阶段丢弃的注册项数量。
    pub fn released_services(&self) -> usize {
        self.released_services
    }

    pub(crate) fn with_released_services(mut self, released: usize) -> Self {
        self.released_services = released;
        self
    }
}

/// 串联宿主停机的“通知 + 等待”阶段。
///
/// # 教案式注解
/// - **流程概览 (How)**：
///   1. 将生命周期切换到 `Stopping`，唤醒所有等待停机信号的组件，并取出已登记的钩子；
///   2. 按登记顺序逐个执行钩子，每个钩子与超时计时器竞赛；
///   3. 记录结果后切换到 `Stopped`；
/// - **契约 (What)**：失败或超时的钩子只记录并告警，不会中断后续钩子；
///   资源释放由调用方在本函数返回后执行，保证“先停止、后释放”的顺序；
/// - **风险提示 (Trade-offs)**：逐个等待而非并发等待，总耗时上限为“钩子数 × 超时”。
pub(crate) async fn run_shutdown(
    host_name: &str,
    lifetime: &HostLifetime,
    timeout: Duration,
) -> ShutdownReport {
    let hooks = lifetime.begin_stopping();
    tracing::info!(
        host = host_name,
        hooks = hooks.len(),
        timeout_ms = timeout.as_millis() as u64,
        "graceful shutdown initiated"
    );

    let mut records = Vec::with_capacity(hooks.len());
    for registered in hooks {
        let start = Instant::now();
        let status = match tokio::time::timeout(timeout, registered.hook.on_stop()).await {
            Ok(Ok(())) => ShutdownStatus::Completed,
            Ok(Err(error)) => {
                tracing::warn!(
                    host = host_name,
                    hook = %registered.label,
                    error = %error,
                    "shutdown hook failed"
                );
                ShutdownStatus::Failed(error)
            }
            Err(_) => {
                tracing::warn!(
                    host = host_name,
                    hook = %registered.label,
                    timeout_ms = timeout.as_millis() as u64,
                    "shutdown hook timed out"
                );
                ShutdownStatus::TimedOut
            }
        };
        records.push(ShutdownRecord {
            label: registered.label,
            status,
            elapsed: start.elapsed(),
        });
    }

    lifetime.mark_stopped();
    ShutdownReport {
        records,
        released_services: 0,
    }
}
