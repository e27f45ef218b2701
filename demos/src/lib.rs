use async_trait::async_trait;
use heron_mqtt::{
    auth::AuthExchange,
    config::Config,
    error::CloseReason,
    network::{
        packet::{Auth, Connect, LastWill, Publish, Subscribe, Unsubscribe},
        TransportInfo,
    },
    protocol::{
        session::SessionTerminatedReason, subscription::Subscription, Client, DeliveryError,
        Message,
    },
    AcceptGate, AuthProvider, AuthResponse, HookError, LifecycleObserver, PublishGate,
    SubscriptionGate,
};
use log::info;
use tokio::{fs, io::AsyncReadExt};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Read config file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse config error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Broker config error: {0}")]
    Broker(#[from] heron_mqtt::config::Error),
    #[error("Env error: {0}")]
    Env(#[from] envy::Error),
}

/// demo 自己的配置，和 broker 配置放在同一个文件中
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log: LogConfig,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// flexi_logger 的日志级别描述，如 "info, heron_mqtt=debug"
    pub spec: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            spec: "info".into(),
        }
    }
}

/// 环境变量覆盖，前缀 HERON_
#[derive(Debug, Default, serde::Deserialize)]
pub struct EnvOverrides {
    pub log: Option<String>,
    pub dump_packet: Option<bool>,
    pub allow_zero_len_client_id: Option<bool>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self, Error> {
        Ok(envy::prefixed("HERON_").from_env::<EnvOverrides>()?)
    }

    pub fn apply(&self, cfg: &mut Config, settings: &mut Settings) {
        if let Some(spec) = &self.log {
            settings.log.spec = spec.clone();
        }
        if let Some(dump_packet) = self.dump_packet {
            cfg.broker.dump_packet = dump_packet;
        }
        if let Some(allow) = self.allow_zero_len_client_id {
            cfg.broker.allow_zero_len_client_id = allow;
        }
    }
}

/// 读取配置文件，返回 broker 配置和 demo 配置
pub async fn load(path: &str) -> Result<(Config, Settings), Error> {
    let mut file = fs::File::open(path).await?;
    let mut s = String::new();
    file.read_to_string(&mut s).await?;

    let cfg = Config::parse(&s)?;
    let settings = toml::from_str::<Settings>(&s)?;
    Ok((cfg, settings))
}

/// 每个回调都打印日志，其余行为和默认一致，认证全部通过
pub struct LoggingHooks;

#[async_trait]
impl AcceptGate for LoggingHooks {
    async fn on_accept(&self, transport: &TransportInfo) -> bool {
        info!("on_accept: {}", transport);
        true
    }
}

#[async_trait]
impl AuthProvider for LoggingHooks {
    async fn on_basic_auth(&self, client: &Client, connect: &Connect) -> Result<(), HookError> {
        info!(
            "on_basic_auth: client {}, username {:?}",
            client.client_id,
            connect.login.as_ref().map(|login| &login.username)
        );
        Ok(())
    }

    async fn on_enhanced_auth(
        &self,
        client: &Client,
        connect: &Connect,
    ) -> Result<AuthResponse, HookError> {
        info!(
            "on_enhanced_auth: client {}, method {:?}",
            client.client_id, connect.auth_method
        );
        Ok(AuthResponse::success(Vec::new()))
    }

    async fn on_auth(
        &self,
        client: &Client,
        exchange: &AuthExchange,
        _auth: &Auth,
    ) -> Result<AuthResponse, HookError> {
        info!("on_auth: client {}, step {}", client.client_id, exchange.step);
        Ok(AuthResponse::success(Vec::new()))
    }

    async fn on_re_auth(&self, client: &Client, auth: &Auth) -> Result<AuthResponse, HookError> {
        info!("on_re_auth: client {}, method {:?}", client.client_id, auth.method);
        Ok(AuthResponse::success(Vec::new()))
    }
}

#[async_trait]
impl SubscriptionGate for LoggingHooks {
    async fn on_subscribe(&self, client: &Client, req: &Subscribe) -> Result<(), HookError> {
        let filters = req.filters.iter().map(|f| f.path.as_str()).collect::<Vec<_>>();
        info!("on_subscribe: client {}, filters {:?}", client.client_id, filters);
        Ok(())
    }

    async fn on_unsubscribe(&self, client: &Client, req: &Unsubscribe) -> Result<(), HookError> {
        info!("on_unsubscribe: client {}, filters {:?}", client.client_id, req.filters);
        Ok(())
    }
}

#[async_trait]
impl PublishGate for LoggingHooks {
    async fn on_msg_arrived(&self, client: &Client, req: &Publish) -> Result<(), HookError> {
        info!("on_msg_arrived: client {}, topic {}", client.client_id, req.topic);
        Ok(())
    }

    async fn on_publish(&self, client: &Client, msg: &Message) -> bool {
        info!("on_publish: client {}, topic {}", client.client_id, msg.topic);
        true
    }
}

#[async_trait]
impl LifecycleObserver for LoggingHooks {
    async fn on_connected(&self, client: &Client) {
        info!("on_connected: client {}", client.client_id);
    }

    async fn on_session_created(&self, client: &Client) {
        info!("on_session_created: client {}", client.client_id);
    }

    async fn on_session_resumed(&self, client: &Client) {
        info!("on_session_resumed: client {}", client.client_id);
    }

    async fn on_subscribed(&self, client: &Client, subscription: &Subscription) {
        info!(
            "on_subscribed: client {}, filter {}, qos {:?}",
            client.client_id, subscription.topic_filter, subscription.options.qos
        );
    }

    async fn on_unsubscribed(&self, client: &Client, topic_filter: &str) {
        info!("on_unsubscribed: client {}, filter {}", client.client_id, topic_filter);
    }

    async fn on_delivered(&self, client: &Client, msg: &Message) {
        info!(
            "on_delivered: client {}, topic {}, payload {:?}",
            client.client_id, msg.topic, msg.payload
        );
    }

    async fn on_msg_dropped(&self, client_id: &str, msg: &Message, err: &DeliveryError) {
        info!("on_msg_dropped: client {}, topic {}: {}", client_id, msg.topic, err);
    }

    async fn on_will_publish(&self, client_id: &str, will: &LastWill) {
        info!("on_will_publish: client {}, topic {}", client_id, will.topic);
    }

    async fn on_will_published(&self, client_id: &str, msg: &Message) {
        info!("on_will_published: client {}, topic {}", client_id, msg.topic);
    }

    async fn on_closed(&self, client: &Client, err: Option<&CloseReason>) {
        match err {
            Some(err) => info!("on_closed: client {}: {}", client.client_id, err),
            None => info!("on_closed: client {}", client.client_id),
        }
    }

    async fn on_session_terminated(&self, client_id: &str, reason: SessionTerminatedReason) {
        info!("on_session_terminated: client {}, reason {:?}", client_id, reason);
    }

    async fn on_stop(&self) {
        info!("on_stop");
    }
}
