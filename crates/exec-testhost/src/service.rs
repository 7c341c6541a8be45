use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};

use crate::error::{DisposedStateError, ResolveError, ServiceRegistrationError};

/// 类型擦除后的服务实例，内部实际保存 `Arc<T>`。
type ErasedService = Box<dyn Any + Send + Sync>;

type ErasedFactory =
    Arc<dyn Fn(&ServiceProvider) -> Result<ErasedService, ResolveError> + Send + Sync>;

/// 工厂注册项的实例化策略。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceLifetime {
    /// 预先构造好的实例。
    Instance,
    /// 首次解析时创建，随后缓存复用。
    Singleton,
    /// 每次解析都创建新实例。
    Transient,
}

/// 服务注册项：直接实例或惰性工厂。
#[derive(Clone)]
enum ServiceEntry {
    Instance(Arc<ErasedService>),
    Factory {
        lifetime: ServiceLifetime,
        factory: ErasedFactory,
    },
}

impl ServiceEntry {
    fn lifetime(&self) -> ServiceLifetime {
        match self {
            ServiceEntry::Instance(_) => ServiceLifetime::Instance,
            ServiceEntry::Factory { lifetime, .. } => *lifetime,
        }
    }
}

#[derive(Clone)]
struct Registration {
    type_name: &'static str,
    entry: ServiceEntry,
}

/// `ServiceRegistry` 维护宿主可见的服务目录。
///
/// # 教案级注释
/// - **目标 (Why)**
///   - 在宿主构建前集中登记被测组件及其替身依赖，命名冲突在注册时即被捕获；
/// - **设计要点 (How)**
///   - 以能力类型的 `TypeId` 为键，`T` 允许为 `?Sized`，因此 `dyn Clock`、`dyn EventLog`
///     这类 trait 对象可以直接作为能力登记；
///   - 值统一保存为 `Arc<T>` 的类型擦除形态，解析时再向下转型；
/// - **契约 (What)**
///   - 每个能力类型只能登记一次，重复登记返回 [`ServiceRegistrationError::Duplicate`]；
///   - 注册表在 [`TestServiceHostBuilder::build`](crate::TestServiceHostBuilder::build) 时被移入
///     [`ServiceProvider`]，此后不可再修改。
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    entries: HashMap<TypeId, Registration>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.entries.values().map(|r| r.type_name).collect();
        names.sort_unstable();
        f.debug_struct("ServiceRegistry")
            .field("services", &names)
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册已构造好的实例。
    ///
    /// 传入 `Arc<具体类型>` 并显式指定 `T = dyn Trait` 时会发生非定长转换，
    /// 例如 `registry.register_instance::<dyn Gateway>(Arc::new(mock))`。
    pub fn register_instance<T>(&mut self, service: Arc<T>) -> Result<(), ServiceRegistrationError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let erased: ErasedService = Box::new(service);
        self.insert::<T>(ServiceEntry::Instance(Arc::new(erased)))
    }

    /// 注册单例工厂：首次解析时调用，结果被缓存直到宿主释放。
    ///
    /// 工厂可以通过传入的 [`ServiceProvider`] 解析自身依赖。
    pub fn register_singleton<T, F>(&mut self, factory: F) -> Result<(), ServiceRegistrationError>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceProvider) -> Result<Arc<T>, ResolveError> + Send + Sync + 'static,
    {
        self.insert::<T>(ServiceEntry::Factory {
            lifetime: ServiceLifetime::Singleton,
            factory: erase_factory(factory),
        })
    }

    /// 注册瞬态工厂：每次解析都返回新实例。
    pub fn register_transient<T, F>(&mut self, factory: F) -> Result<(), ServiceRegistrationError>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceProvider) -> Result<Arc<T>, ResolveError> + Send + Sync + 'static,
    {
        self.insert::<T>(ServiceEntry::Factory {
            lifetime: ServiceLifetime::Transient,
            factory: erase_factory(factory),
        })
    }

    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert<T: ?Sized + 'static>(
        &mut self,
        entry: ServiceEntry,
    ) -> Result<(), ServiceRegistrationError> {
        let key = TypeId::of::<T>();
        let type_name = type_name::<T>();
        if self.entries.contains_key(&key) {
            return Err(ServiceRegistrationError::Duplicate { type_name });
        }
        tracing::debug!(service = type_name, lifetime = ?entry.lifetime(), "service registered");
        self.entries.insert(key, Registration { type_name, entry });
        Ok(())
    }
}

fn erase_factory<T, F>(factory: F) -> ErasedFactory
where
    T: ?Sized + Send + Sync + 'static,
    F: Fn(&ServiceProvider) -> Result<Arc<T>, ResolveError> + Send + Sync + 'static,
{
    Arc::new(move |provider| {
        factory(provider).map(|service| Box::new(service) as ErasedService)
    })
}

/// 宿主释放前持有的全部解析状态。
struct ProviderState {
    registrations: HashMap<TypeId, Registration>,
    singletons: HashMap<TypeId, Arc<ErasedService>>,
    /// 正在首次创建的单例槽位，创建完成后移除。
    creating: HashMap<TypeId, Arc<Mutex<()>>>,
}

/// `ServiceProvider` 是宿主对测试代码暴露的服务解析面。
///
/// # 教案级注释
/// - **意图 (Why)**：测试通过能力类型取得被测组件；组件自身也可以持有克隆来解析依赖；
/// - **关键流程 (How)**：
///   1. 读锁下查找注册项或单例缓存；
///   2. 工厂在状态锁外执行，允许其递归解析其他依赖；
///   3. 单例的首次创建按类型串行：并发的首次解析只有一个线程调用工厂，其余线程等待后读取缓存；
/// - **契约 (What)**：
///   - 宿主释放后，所有克隆都会返回 [`ResolveError::Disposed`]，不会交出陈旧实例；
///   - 释放时注册项与缓存在锁外被 Drop，组件的析构逻辑可以安全地再次访问解析面；
/// - **风险提示 (Trade-offs)**：不检测工厂之间的循环依赖；单例的循环会在创建槽位上死锁，
///   瞬态之间的循环会导致栈溢出。
#[derive(Clone)]
pub struct ServiceProvider {
    inner: Arc<RwLock<Option<ProviderState>>>,
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.read().as_ref() {
            Some(state) => f
                .debug_struct("ServiceProvider")
                .field("registrations", &state.registrations.len())
                .field("cached_singletons", &state.singletons.len())
                .finish(),
            None => f.write_str("ServiceProvider(released)"),
        }
    }
}

impl ServiceProvider {
    pub(crate) fn new(registry: ServiceRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(ProviderState {
                registrations: registry.entries,
                singletons: HashMap::new(),
                creating: HashMap::new(),
            }))),
        }
    }

    /// 解析能力 `T`。
    pub fn get<T>(&self) -> Result<Arc<T>, ResolveError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = TypeId::of::<T>();
        let type_name = type_name::<T>();

        let (lifetime, factory) = {
            let guard = self.inner.read();
            let state = guard.as_ref().ok_or(DisposedStateError::new("resolve"))?;
            if let Some(cached) = state.singletons.get(&key) {
                return downcast::<T>(cached);
            }
            let registration = state
                .registrations
                .get(&key)
                .ok_or(ResolveError::NotRegistered { type_name })?;
            match &registration.entry {
                ServiceEntry::Instance(instance) => return downcast::<T>(instance),
                ServiceEntry::Factory { lifetime, factory } => (*lifetime, Arc::clone(factory)),
            }
        };

        if lifetime == ServiceLifetime::Transient {
            let created = self.create(type_name, lifetime, &factory)?;
            return downcast::<T>(&created);
        }

        // 同一单例的首次创建串行化：后到者等待槽位，再从缓存取得先到者的实例。
        let slot = {
            let mut guard = self.inner.write();
            let state = guard.as_mut().ok_or(DisposedStateError::new("resolve"))?;
            Arc::clone(state.creating.entry(key).or_default())
        };
        let _creating = slot.lock();

        let cached = {
            let guard = self.inner.read();
            let state = guard.as_ref().ok_or(DisposedStateError::new("resolve"))?;
            state.singletons.get(&key).cloned()
        };
        if let Some(cached) = cached {
            return downcast::<T>(&cached);
        }

        let created = self.create(type_name, lifetime, &factory)?;
        let mut guard = self.inner.write();
        let state = guard.as_mut().ok_or(DisposedStateError::new("resolve"))?;
        state.creating.remove(&key);
        let cached = state.singletons.entry(key).or_insert(created);
        downcast::<T>(cached)
    }

    fn create(
        &self,
        type_name: &'static str,
        lifetime: ServiceLifetime,
        factory: &ErasedFactory,
    ) -> Result<Arc<ErasedService>, ResolveError> {
        let created = factory(self).map_err(|error| match error {
            ResolveError::Disposed(disposed) => ResolveError::Disposed(disposed),
            other => ResolveError::Factory {
                type_name,
                reason: other.to_string(),
            },
        })?;
        tracing::debug!(service = type_name, ?lifetime, "service created by factory");
        Ok(Arc::new(created))
    }

    /// 解析能力 `T`，未登记或宿主已释放时返回 `None`。
    pub fn try_get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get::<T>().ok()
    }

    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.inner
            .read()
            .as_ref()
            .is_some_and(|state| state.registrations.contains_key(&TypeId::of::<T>()))
    }

    /// 已登记的能力及其实例化策略，按类型名排序。
    pub fn registered_types(
        &self,
    ) -> Result<Vec<(&'static str, ServiceLifetime)>, DisposedStateError> {
        let guard = self.inner.read();
        let state = guard.as_ref().ok_or(DisposedStateError::new("registered_types"))?;
        let mut types: Vec<_> = state
            .registrations
            .values()
            .map(|registration| (registration.type_name, registration.entry.lifetime()))
            .collect();
        types.sort_unstable_by_key(|(name, _)| *name);
        Ok(types)
    }

    pub fn is_released(&self) -> bool {
        self.inner.read().is_none()
    }

    /// 丢弃全部注册项与单例缓存，返回被释放的注册项数量。重复调用返回 0。
    pub(crate) fn release(&self) -> usize {
        let state = self.inner.write().take();
        // 锁已释放，组件析构期间访问解析面只会得到 Disposed 错误。
        match state {
            Some(state) => {
                let released = state.registrations.len();
                drop(state);
                released
            }
            None => 0,
        }
    }
}

fn downcast<T>(service: &Arc<ErasedService>) -> Result<Arc<T>, ResolveError>
where
    T: ?Sized + Send + Sync + 'static,
{
    service
        .downcast_ref::<Arc<T>>()
        .cloned()
        .ok_or_else(|| ResolveError::Factory {
            type_name: type_name::<T>(),
            reason: "registered value has a different type".to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".to_owned()
        }
    }

    #[test]
    fn trait_objects_resolve_by_capability() {
        let mut registry = ServiceRegistry::new();
        registry
            .register_instance::<dyn Greeter>(Arc::new(English))
            .unwrap();
        let provider = ServiceProvider::new(registry);

        assert_eq!(provider.get::<dyn Greeter>().unwrap().greet(), "hello");
        assert!(provider.try_get::<English>().is_none());
    }

    #[test]
    fn duplicate_capability_is_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register_instance(Arc::new(1_u32)).unwrap();
        let error = registry
            .register_singleton::<u32, _>(|_| Ok(Arc::new(2)))
            .unwrap_err();
        assert_eq!(error, ServiceRegistrationError::Duplicate { type_name: "u32" });
    }

    #[test]
    fn singleton_factory_runs_once_and_transient_every_time() {
        let singleton_calls = Arc::new(AtomicUsize::new(0));
        let transient_calls = Arc::new(AtomicUsize::new(0));

        let mut registry = ServiceRegistry::new();
        let counter = Arc::clone(&singleton_calls);
        registry
            .register_singleton::<String, _>(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new("shared".to_owned()))
            })
            .unwrap();
        let counter = Arc::clone(&transient_calls);
        registry
            .register_transient::<Vec<u8>, _>(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Vec::new()))
            })
            .unwrap();
        let provider = ServiceProvider::new(registry);

        let first = provider.get::<String>().unwrap();
        let second = provider.get::<String>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(singleton_calls.load(Ordering::SeqCst), 1);

        let a = provider.get::<Vec<u8>>().unwrap();
        let b = provider.get::<Vec<u8>>().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(transient_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_first_resolution_runs_singleton_factory_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new();
        let counter = Arc::clone(&calls);
        registry
            .register_singleton::<String, _>(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(100));
                Ok(Arc::new("slow".to_owned()))
            })
            .unwrap();
        let provider = ServiceProvider::new(registry);

        let (first, second) = std::thread::scope(|scope| {
            let first = scope.spawn(|| provider.get::<String>().unwrap());
            let second = scope.spawn(|| provider.get::<String>().unwrap());
            (first.join().unwrap(), second.join().unwrap())
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn failed_singleton_factory_can_be_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new();
        let counter = Arc::clone(&calls);
        registry
            .register_singleton::<String, _>(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(ResolveError::NotRegistered { type_name: "warmup" });
                }
                Ok(Arc::new("ready".to_owned()))
            })
            .unwrap();
        let provider = ServiceProvider::new(registry);

        assert!(provider.get::<String>().is_err());
        assert_eq!(provider.get::<String>().unwrap().as_str(), "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn factories_resolve_their_dependencies() {
        let mut registry = ServiceRegistry::new();
        registry.register_instance(Arc::new(21_u64)).unwrap();
        registry
            .register_singleton::<String, _>(|provider| {
                let base = provider.get::<u64>()?;
                Ok(Arc::new(format!("answer={}", *base * 2)))
            })
            .unwrap();
        let provider = ServiceProvider::new(registry);

        assert_eq!(provider.get::<String>().unwrap().as_str(), "answer=42");
    }

    #[test]
    fn factory_failure_names_the_requested_type() {
        let mut registry = ServiceRegistry::new();
        registry
            .register_singleton::<String, _>(|provider| {
                let missing = provider.get::<u16>()?;
                Ok(Arc::new(missing.to_string()))
            })
            .unwrap();
        let provider = ServiceProvider::new(registry);

        match provider.get::<String>().unwrap_err() {
            ResolveError::Factory { type_name, reason } => {
                assert!(type_name.ends_with("String"), "{type_name}");
                assert_eq!(reason, "service `u16` is not registered");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn released_provider_rejects_every_clone() {
        let mut registry = ServiceRegistry::new();
        registry.register_instance(Arc::new(7_i32)).unwrap();
        let provider = ServiceProvider::new(registry);
        let component_copy = provider.clone();

        assert_eq!(provider.release(), 1);
        assert!(component_copy.is_released());
        assert_eq!(
            component_copy.get::<i32>().unwrap_err(),
            ResolveError::Disposed(DisposedStateError::new("resolve"))
        );
        assert_eq!(provider.release(), 0);
    }

    #[test]
    fn registered_types_are_sorted_by_name() {
        let mut registry = ServiceRegistry::new();
        registry.register_instance(Arc::new(1_u8)).unwrap();
        registry
            .register_transient::<bool, _>(|_| Ok(Arc::new(true)))
            .unwrap();
        let provider = ServiceProvider::new(registry);

        assert_eq!(
            provider.registered_types().unwrap(),
            vec![
                ("bool", ServiceLifetime::Transient),
                ("u8", ServiceLifetime::Instance),
            ]
        );
    }
}
