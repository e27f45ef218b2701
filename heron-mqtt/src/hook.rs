//! mqtt 事件发生时的回调，由用户实现
//!
//! 回调按能力拆成几组，用户只需要实现关心的那一组，其余使用默认的空实现：
//! * [`AcceptGate`]：是否接受一个传输连接
//! * [`AuthProvider`]：基础认证、增强认证、重认证
//! * [`SubscriptionGate`]：订阅、取消订阅前的检查
//! * [`PublishGate`]：消息到达、消息分发前的检查
//! * [`LifecycleObserver`]：各个状态变化后的通知，返回值不影响 broker 的处理
//!
//! 检查类的回调返回错误时只会拒绝当前操作，除非错误被标记为 fatal

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    auth::AuthExchange,
    error::CloseReason,
    network::{
        packet::{Auth, Connect, LastWill, Publish, ReasonCode, Subscribe, Unsubscribe},
        TransportInfo,
    },
    protocol::{
        session::SessionTerminatedReason, subscription::Subscription, Client, DeliveryError,
        Message,
    },
};

/// 检查类回调返回的错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({reason:?})")]
pub struct HookError {
    /// 回复给客户端的原因码
    pub reason: ReasonCode,
    pub message: String,
    /// 为 true 时关闭连接，而不只是拒绝当前操作
    pub fatal: bool,
}

impl HookError {
    pub fn new(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn not_authorized(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::NotAuthorized, message)
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

/// 增强认证、重认证每一轮的回复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    /// 为 true 时需要客户端再发送一个 AUTH 报文
    pub continue_auth: bool,
    pub auth_data: Bytes,
}

impl AuthResponse {
    /// 认证完成
    pub fn success(auth_data: impl Into<Bytes>) -> Self {
        Self {
            continue_auth: false,
            auth_data: auth_data.into(),
        }
    }

    /// 需要再进行一轮
    pub fn challenge(auth_data: impl Into<Bytes>) -> Self {
        Self {
            continue_auth: true,
            auth_data: auth_data.into(),
        }
    }
}

#[async_trait]
pub trait AcceptGate: Send + Sync + 'static {
    /// 返回 false 时直接关闭传输连接，不再调用其他回调
    async fn on_accept(&self, _transport: &TransportInfo) -> bool {
        true
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// CONNECT 不带认证方法时调用
    async fn on_basic_auth(&self, _client: &Client, _connect: &Connect) -> Result<(), HookError> {
        Ok(())
    }

    /// CONNECT 带认证方法时调用，是增强认证的第一轮
    async fn on_enhanced_auth(
        &self,
        _client: &Client,
        _connect: &Connect,
    ) -> Result<AuthResponse, HookError> {
        Err(HookError::new(
            ReasonCode::BadAuthenticationMethod,
            "enhanced authentication not supported",
        ))
    }

    /// 增强认证、重认证的后续每一轮，交互状态由 broker 保存在 exchange 中
    async fn on_auth(
        &self,
        _client: &Client,
        _exchange: &AuthExchange,
        _auth: &Auth,
    ) -> Result<AuthResponse, HookError> {
        Err(HookError::new(
            ReasonCode::BadAuthenticationMethod,
            "enhanced authentication not supported",
        ))
    }

    /// 已连接的客户端发起重认证，是重认证的第一轮
    async fn on_re_auth(&self, _client: &Client, _auth: &Auth) -> Result<AuthResponse, HookError> {
        Err(HookError::new(
            ReasonCode::BadAuthenticationMethod,
            "re-authentication not supported",
        ))
    }
}

#[async_trait]
pub trait SubscriptionGate: Send + Sync + 'static {
    /// 修改订阅表之前调用，返回错误时整个请求被拒绝
    async fn on_subscribe(&self, _client: &Client, _req: &Subscribe) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_unsubscribe(&self, _client: &Client, _req: &Unsubscribe) -> Result<(), HookError> {
        Ok(())
    }
}

#[async_trait]
pub trait PublishGate: Send + Sync + 'static {
    /// 收到 PUBLISH 时调用，返回错误时拒绝这条消息
    async fn on_msg_arrived(&self, _client: &Client, _req: &Publish) -> Result<(), HookError> {
        Ok(())
    }

    /// 分发之前调用，返回 false 时不分发
    async fn on_publish(&self, _client: &Client, _msg: &Message) -> bool {
        true
    }
}

#[async_trait]
pub trait LifecycleObserver: Send + Sync + 'static {
    /// 认证和会话建立都完成之后
    async fn on_connected(&self, _client: &Client) {}

    async fn on_session_created(&self, _client: &Client) {}

    async fn on_session_resumed(&self, _client: &Client) {}

    async fn on_subscribed(&self, _client: &Client, _subscription: &Subscription) {}

    async fn on_unsubscribed(&self, _client: &Client, _topic_filter: &str) {}

    /// 消息已写入接收者的连接
    async fn on_delivered(&self, _client: &Client, _msg: &Message) {}

    /// 消息没能投递给某个接收者，不影响其他接收者
    async fn on_msg_dropped(&self, _client_id: &str, _msg: &Message, _err: &DeliveryError) {}

    async fn on_will_publish(&self, _client_id: &str, _will: &LastWill) {}

    async fn on_will_published(&self, _client_id: &str, _msg: &Message) {}

    /// 连接关闭，正常断开时 err 为 None
    async fn on_closed(&self, _client: &Client, _err: Option<&CloseReason>) {}

    async fn on_session_terminated(&self, _client_id: &str, _reason: SessionTerminatedReason) {}

    /// broker 停止
    async fn on_stop(&self) {}
}

/// 全部使用默认行为的回调
pub struct HookNoop;

impl AcceptGate for HookNoop {}
impl AuthProvider for HookNoop {}
impl SubscriptionGate for HookNoop {}
impl PublishGate for HookNoop {}
impl LifecycleObserver for HookNoop {}

/// broker 持有的回调表，构建 broker 时传入
#[derive(Clone)]
pub struct Hooks {
    pub(crate) accept: Arc<dyn AcceptGate>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) subscription: Arc<dyn SubscriptionGate>,
    pub(crate) publish: Arc<dyn PublishGate>,
    pub(crate) observer: Arc<dyn LifecycleObserver>,
}

impl Default for Hooks {
    fn default() -> Self {
        let noop = Arc::new(HookNoop);
        Self {
            accept: noop.clone(),
            auth: noop.clone(),
            subscription: noop.clone(),
            publish: noop.clone(),
            observer: noop,
        }
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 一个对象实现了全部回调
    pub fn all<H>(hook: Arc<H>) -> Self
    where
        H: AcceptGate + AuthProvider + SubscriptionGate + PublishGate + LifecycleObserver,
    {
        Self {
            accept: hook.clone(),
            auth: hook.clone(),
            subscription: hook.clone(),
            publish: hook.clone(),
            observer: hook,
        }
    }

    pub fn accept(mut self, gate: Arc<dyn AcceptGate>) -> Self {
        self.accept = gate;
        self
    }

    pub fn auth(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = provider;
        self
    }

    pub fn subscription(mut self, gate: Arc<dyn SubscriptionGate>) -> Self {
        self.subscription = gate;
        self
    }

    pub fn publish(mut self, gate: Arc<dyn PublishGate>) -> Self {
        self.publish = gate;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }
}
