use std::{path::Path, time::Duration};

use tokio::{fs, io::AsyncReadExt};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Read config file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse config error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: Broker,
    pub session: Session,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Broker {
    /// 是否允许零长度的 client id，允许时由服务端分配
    pub allow_zero_len_client_id: bool,
    /// 一次增强认证/重认证最多的交互轮数
    pub max_auth_rounds: u32,
    /// 等待 connect/auth 报文的超时时长（秒）
    pub connect_timeout: u64,
    /// 每个连接发送队列的长度，满了之后的消息会被丢弃
    pub outgoing_capacity: usize,
    /// 服务端接受的客户端主题别名最大值
    pub topic_alias_maximum: u16,
    /// 是否打印每一个收发的报文
    pub dump_packet: bool,
    /// 是否支持保留消息
    pub retain_available: bool,
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            allow_zero_len_client_id: false,
            max_auth_rounds: 8,
            connect_timeout: 10,
            outgoing_capacity: 1000,
            topic_alias_maximum: 16,
            dump_packet: false,
            retain_available: true,
        }
    }
}

impl Broker {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Session {
    /// 会话过期时长的上限（秒），客户端请求的值超过时按此值处理
    pub expire_interval: u64,
    /// 离线会话最多积压的消息数
    pub max_offline_messages: usize,
    /// 检查过期会话的间隔（秒）
    pub expiry_check_interval: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            expire_interval: 3600,
            max_offline_messages: 1000,
            expiry_check_interval: 5,
        }
    }
}

impl Session {
    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval.max(1))
    }

    /// 按上限裁剪客户端请求的会话过期时长
    pub fn clamp_expiry(&self, requested: u32) -> u32 {
        u32::try_from(self.expire_interval)
            .map(|max| requested.min(max))
            .unwrap_or(requested)
    }
}

impl Config {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut file = fs::File::open(path).await?;
        let mut s = String::new();
        file.read_to_string(&mut s).await?;

        Self::parse(&s)
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str::<Config>(s)?)
    }
}
