use std::{borrow::Cow, collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;

use crate::error::MockAdapterError;

type Responder<Req, Resp> = Arc<dyn Fn(&Req) -> Result<Resp, MockAdapterError> + Send + Sync>;

/// `MockAdapter` 代替执行服务需要访问的外部系统（队列、存储、网络对端）。
///
/// # 教案级注释
/// - **意图 (Why)**：被测组件通过 trait 访问外部系统；测试为该 trait 实现一个薄包装，
///   内部把调用转交给 `MockAdapter`，即可记录请求并按脚本返回响应；
/// - **执行逻辑 (How)**：
///   1. 每次 [`call`](Self::call) 先把请求追加到调用记录；
///   2. 优先消费 FIFO 脚本中的响应；
///   3. 脚本耗尽时交给兜底响应器；两者皆无则返回 [`MockAdapterError::Unscripted`]；
/// - **契约 (What)**：克隆共享同一份脚本与调用记录，测试持有一个克隆用于断言；
/// - **风险提示 (Trade-offs)**：响应器在锁外执行，并发调用时脚本消费顺序即加锁顺序。
pub struct MockAdapter<Req, Resp> {
    name: Cow<'static, str>,
    state: Arc<Mutex<AdapterState<Req, Resp>>>,
}

struct AdapterState<Req, Resp> {
    script: VecDeque<Result<Resp, String>>,
    fallback: Option<Responder<Req, Resp>>,
    calls: Vec<Req>,
}

impl<Req, Resp> Clone for MockAdapter<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<Req, Resp> fmt::Debug for MockAdapter<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockAdapter")
            .field("name", &self.name)
            .field("scripted", &state.script.len())
            .field("has_fallback", &state.fallback.is_some())
            .field("calls", &state.calls.len())
            .finish()
    }
}

impl<Req, Resp> MockAdapter<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(AdapterState {
                script: VecDeque::new(),
                fallback: None,
                calls: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 追加一条成功响应。
    pub fn respond_with(&self, response: Resp) -> &Self {
        self.state.lock().script.push_back(Ok(response));
        self
    }

    /// 追加一条失败响应，调用方会收到 [`MockAdapterError::Scripted`]。
    pub fn fail_with(&self, message: impl Into<String>) -> &Self {
        self.state.lock().script.push_back(Err(message.into()));
        self
    }

    /// 脚本耗尽后使用的兜底响应器。
    pub fn fallback<F>(&self, responder: F) -> &Self
    where
        F: Fn(&Req) -> Result<Resp, MockAdapterError> + Send + Sync + 'static,
    {
        self.state.lock().fallback = Some(Arc::new(responder));
        self
    }

    /// 记录请求并给出响应。
    pub fn call(&self, request: Req) -> Result<Resp, MockAdapterError> {
        let (call_index, scripted, fallback) = {
            let mut state = self.state.lock();
            state.calls.push(request.clone());
            let call_index = state.calls.len() - 1;
            let scripted = state.script.pop_front();
            let fallback = if scripted.is_none() {
                state.fallback.clone()
            } else {
                None
            };
            (call_index, scripted, fallback)
        };

        tracing::debug!(adapter = %self.name, call_index, "mock adapter invoked");
        match (scripted, fallback) {
            (Some(Ok(response)), _) => Ok(response),
            (Some(Err(message)), _) => Err(MockAdapterError::Scripted {
                adapter: self.name.clone(),
                message,
            }),
            (None, Some(responder)) => responder(&request),
            (None, None) => Err(MockAdapterError::Unscripted {
                adapter: self.name.clone(),
                call_index,
            }),
        }
    }

    /// 所有已记录请求的副本，按调用顺序排列。
    pub fn calls(&self) -> Vec<Req> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn remaining_responses(&self) -> usize {
        self.state.lock().script.len()
    }
}
