#![deny(unsafe_code)]
#![doc = "exec-testhost: 为执行服务提供进程内测试宿主，以虚拟时钟、内存事件日志与 Mock 适配器替代真实基础设施。"]

pub mod builder;
pub mod clock;
pub mod error;
pub mod event_log;
mod host;
pub mod lifetime;
pub mod logging;
pub mod mock;
mod service;
pub mod settings;
pub mod shutdown;

pub use builder::TestServiceHostBuilder;
pub use clock::{Clock, FakeClock, Sleep, SystemClock};
pub use error::{
    ConfigurationError, DisposedStateError, EventLogError, HookError, MockAdapterError,
    ResolveError, ServiceRegistrationError, SettingsError,
};
pub use event_log::{EventLog, EventRecord, InMemoryEventLog};
pub use host::{HostEnvironment, HostState, TestServiceHost};
pub use lifetime::{HostLifetime, LifetimePhase, ShutdownHook};
pub use mock::MockAdapter;
pub use service::{ServiceLifetime, ServiceProvider, ServiceRegistry};
pub use settings::HostSettings;
pub use shutdown::{ShutdownRecord, ShutdownReport, ShutdownStatus};
