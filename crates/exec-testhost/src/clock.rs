//! 时间抽象：让依赖时间的执行逻辑在测试中完全确定。
//!
//! - [`Clock`]：`now` 与 `sleep` 两个原语，被测组件只依赖该 trait；
//! - [`FakeClock`]：测试宿主默认注册的虚拟时钟，只在 [`FakeClock::advance`] 时前进；
//! - [`SystemClock`]：真实时间实现，`sleep` 委托给 Tokio 计时器。

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

/// 时钟返回的统一睡眠 Future。
pub type Sleep = BoxFuture<'static, ()>;

/// 可注入的时间源。
///
/// # 接口约束（What）
/// - `now` 单调不减；
/// - `sleep` 返回的 Future 至少等待给定时长后才完成；
/// - 通过 `Arc<dyn Clock>` 在组件之间共享，测试宿主以 `dyn Clock` 为键登记。
pub trait Clock: Send + Sync + 'static {
    /// 当前单调时间点。
    fn now(&self) -> Instant;

    /// 在给定持续时间后完成的睡眠 Future。
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// 真实时间。`sleep` 需要在 Tokio 运行时（启用 `time`）内轮询。
#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// 虚拟时钟：通过手动推进时间复现确定性的唤醒序列。
///
/// # 行为概览（How）
/// - 内部维护自基准时间起的 `elapsed` 偏移与待唤醒的睡眠列表；
/// - [`advance`](Self::advance) 累加偏移，并按登记顺序唤醒所有到期的睡眠 Future；
/// - 睡眠 Future 提前 Drop 时会从列表移除，不会再被唤醒。
///
/// # 契约说明（What）
/// - 时间只增不减，不提供回拨接口；
/// - 推进量超出 `Instant` 的表示范围时停在可表示的最大时间点，`now` 不会溢出；
/// - 克隆得到的句柄共享同一时间线，宿主与被测组件看到的是同一个“现在”；
/// - 不同宿主各自持有独立的 `FakeClock`，互不影响。
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<FakeClockInner>,
}

struct FakeClockInner {
    state: Mutex<ClockState>,
}

struct ClockState {
    origin: Instant,
    elapsed: Duration,
    sleepers: Vec<Arc<SleepState>>,
    next_id: u64,
}

impl FakeClock {
    /// 以当前系统时间为基准构造虚拟时钟。
    pub fn new() -> Self {
        Self::with_origin(Instant::now())
    }

    /// 以指定基准构造，便于在测试中固定起点。
    pub fn with_origin(origin: Instant) -> Self {
        Self {
            inner: Arc::new(FakeClockInner {
                state: Mutex::new(ClockState {
                    origin,
                    elapsed: Duration::ZERO,
                    sleepers: Vec::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// 推进虚拟时间并唤醒到期的睡眠 Future。
    ///
    /// 唤醒发生在释放内部锁之后，被唤醒的任务可以立即再次调用时钟。
    pub fn advance(&self, delta: Duration) {
        if delta.is_zero() {
            return;
        }

        let mut to_wake = Vec::new();
        {
            let mut guard = self.inner.state.lock();
            let wanted = guard.elapsed.saturating_add(delta);
            guard.elapsed = representable_offset(guard.origin, wanted);
            let elapsed = guard.elapsed;
            guard.sleepers.retain(|entry| {
                if entry.cancelled.load(Ordering::SeqCst) {
                    return false;
                }
                if elapsed >= entry.deadline {
                    entry.completed.store(true, Ordering::SeqCst);
                    if let Some(waker) = entry.waker.lock().take() {
                        to_wake.push(waker);
                    }
                    false
                } else {
                    true
                }
            });
        }

        tracing::trace!(
            delta_ms = delta.as_millis() as u64,
            woken = to_wake.len(),
            "fake clock advanced"
        );
        for waker in to_wake {
            waker.wake();
        }
    }

    /// 自基准时间起经过的虚拟时长。
    pub fn elapsed(&self) -> Duration {
        self.inner.state.lock().elapsed
    }

    /// 尚未到期的睡眠 Future 数量。
    pub fn pending_sleepers(&self) -> usize {
        self.inner.state.lock().sleepers.len()
    }
}

/// 不超过 `wanted` 且 `origin + offset` 仍可表示为 `Instant` 的最大偏移。
fn representable_offset(origin: Instant, wanted: Duration) -> Duration {
    if origin.checked_add(wanted).is_some() {
        return wanted;
    }
    let (mut low, mut high) = (Duration::ZERO, wanted);
    while high - low > Duration::from_nanos(1) {
        let mid = low + (high - low) / 2;
        if origin.checked_add(mid).is_some() {
            low = mid;
        } else {
            high = mid;
        }
    }
    low
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FakeClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.state.lock();
        f.debug_struct("FakeClock")
            .field("elapsed", &guard.elapsed)
            .field("pending_sleepers", &guard.sleepers.len())
            .finish()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        let guard = self.inner.state.lock();
        guard.origin + guard.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let state = {
            let mut guard = self.inner.state.lock();
            let deadline = guard.elapsed.saturating_add(duration);
            let id = guard.next_id;
            guard.next_id += 1;
            let state = Arc::new(SleepState::new(id, deadline));
            // 零时长的睡眠无需登记，首次轮询即完成。
            if !duration.is_zero() {
                guard.sleepers.push(Arc::clone(&state));
            }
            state
        };

        Box::pin(FakeSleep {
            inner: Arc::clone(&self.inner),
            state,
        })
    }
}

struct SleepState {
    id: u64,
    deadline: Duration,
    waker: Mutex<Option<Waker>>,
    completed: AtomicBool,
    cancelled: AtomicBool,
}

impl SleepState {
    fn new(id: u64, deadline: Duration) -> Self {
        Self {
            id,
            deadline,
            waker: Mutex::new(None),
            completed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    fn store_waker(&self, waker: &Waker) {
        let mut guard = self.waker.lock();
        if guard
            .as_ref()
            .is_some_and(|existing| existing.will_wake(waker))
        {
            return;
        }
        *guard = Some(waker.clone());
    }
}

struct FakeSleep {
    inner: Arc<FakeClockInner>,
    state: Arc<SleepState>,
}

impl Future for FakeSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.completed.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }

        let elapsed = self.inner.state.lock().elapsed;
        if elapsed >= self.state.deadline {
            self.state.completed.store(true, Ordering::SeqCst);
            return Poll::Ready(());
        }

        self.state.store_waker(cx.waker());
        Poll::Pending
    }
}

impl Drop for FakeSleep {
    fn drop(&mut self) {
        if !self.state.completed.load(Ordering::SeqCst) {
            self.state.cancelled.store(true, Ordering::SeqCst);
            self.state.waker.lock().take();
            let id = self.state.id;
            self.inner.state.lock().sleepers.retain(|entry| entry.id != id);
        }
    }
}
