//! 传输层与协议层之间交换的报文
//!
//! 这里只定义报文的语义结构，不涉及字节编解码，编解码由具体的传输实现负责

use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// v3.1.1
    V4,
    /// v5
    V5,
}

/// 服务质量
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[allow(clippy::enum_variant_names)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// 实际投递使用发布端和订阅端中较低的 QoS
    pub fn downgrade(self, qos: QoS) -> QoS {
        self.min(qos)
    }
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            qos => Err(Error::InvalidQoS(qos)),
        }
    }
}

/// v5 原因码，只包含 broker 会用到的部分
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    /// 同时表示 NormalDisconnection 和 GrantedQoS0
    Success = 0x00,
    GrantedQoS1 = 0x01,
    GrantedQoS2 = 0x02,
    DisconnectWithWill = 0x04,
    NoMatchingSubscribers = 0x10,
    NoSubscriptionExisted = 0x11,
    ContinueAuthentication = 0x18,
    ReAuthenticate = 0x19,
    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationSpecificError = 0x83,
    ClientIdentifierNotValid = 0x85,
    BadUserNameOrPassword = 0x86,
    NotAuthorized = 0x87,
    ServerUnavailable = 0x88,
    ServerBusy = 0x89,
    ServerShuttingDown = 0x8B,
    BadAuthenticationMethod = 0x8C,
    KeepAliveTimeout = 0x8D,
    SessionTakenOver = 0x8E,
    TopicFilterInvalid = 0x8F,
    TopicNameInvalid = 0x90,
    PacketIdentifierInUse = 0x91,
    PacketIdentifierNotFound = 0x92,
    TopicAliasInvalid = 0x94,
    QuotaExceeded = 0x97,
    AdministrativeAction = 0x98,
    MaximumConnectTime = 0xA0,
}

impl ReasonCode {
    pub fn is_error(self) -> bool {
        self as u8 >= 0x80
    }

    /// 订阅成功时授予的 QoS
    pub fn granted(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => ReasonCode::Success,
            QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
            QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
        }
    }
}

/// 登录凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub username: String,
    pub password: Bytes,
}

/// 遗嘱消息
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// 遗嘱延迟发布时长（秒），目前只记录不生效
    pub delay_interval: u32,
    pub properties: PublishProperties,
}

impl LastWill {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            delay_interval: 0,
            properties: PublishProperties::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    /// mqtt 协议版本
    pub protocol: Protocol,
    /// 客户端id
    pub client_id: String,
    /// 是否清除会话
    pub clean_start: bool,
    /// keepalive 时长（秒），0 表示不检查
    pub keep_alive: u16,
    /// 会话过期时长（秒），0 表示连接断开即结束会话
    pub session_expiry_interval: u32,
    /// 登录凭证
    pub login: Option<Login>,
    /// 增强认证方法，存在即表示使用增强认证
    pub auth_method: Option<String>,
    pub auth_data: Option<Bytes>,
    /// 遗嘱消息
    pub will: Option<LastWill>,
    /// 客户端能接受的主题别名最大值
    pub topic_alias_maximum: u16,
}

impl Connect {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::V5,
            client_id: client_id.into(),
            clean_start: true,
            keep_alive: 60,
            session_expiry_interval: 0,
            login: None,
            auth_method: None,
            auth_data: None,
            will: None,
            topic_alias_maximum: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ReasonCode,
    /// 服务端为零长度 client id 分配的标识
    pub assigned_client_id: Option<String>,
    pub auth_method: Option<String>,
    pub auth_data: Option<Bytes>,
    pub topic_alias_maximum: u16,
}

impl ConnAck {
    pub fn new(code: ReasonCode, session_present: bool) -> Self {
        Self {
            session_present,
            code,
            assigned_client_id: None,
            auth_method: None,
            auth_data: None,
            topic_alias_maximum: 0,
        }
    }
}

/// AUTH 报文，增强认证和重认证都使用它
#[derive(Debug, Clone, PartialEq)]
pub struct Auth {
    pub code: ReasonCode,
    pub method: Option<String>,
    pub data: Option<Bytes>,
}

impl Auth {
    pub fn new(code: ReasonCode, method: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            code,
            method: Some(method.into()),
            data: Some(data.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PublishProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// QoS0 时为 0
    pub packet_id: u16,
    pub payload: Bytes,
    pub topic_alias: Option<u16>,
    pub properties: PublishProperties,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id: 0,
            payload: payload.into(),
            topic_alias: None,
            properties: PublishProperties::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
    pub code: ReasonCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubRec {
    pub packet_id: u16,
    pub code: ReasonCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubRel {
    pub packet_id: u16,
    pub code: ReasonCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubComp {
    pub packet_id: u16,
    pub code: ReasonCode,
}

/// 订阅选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    /// 不接收自己发布的消息
    pub no_local: bool,
    /// 转发时保留 retain 标识
    pub retain_as_published: bool,
}

impl SubscriptionOptions {
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            no_local: false,
            retain_as_published: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub options: SubscriptionOptions,
}

impl SubscribeFilter {
    pub fn new(path: impl Into<String>, qos: QoS) -> Self {
        Self {
            path: path.into(),
            options: SubscriptionOptions::new(qos),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<SubscribeFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<ReasonCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub return_codes: Vec<ReasonCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub code: ReasonCode,
    /// 断开时更新会话过期时长
    pub session_expiry_interval: Option<u32>,
}

impl Disconnect {
    pub fn new(code: ReasonCode) -> Self {
        Self {
            code,
            session_expiry_interval: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect(_) => "DISCONNECT",
            Packet::Auth(_) => "AUTH",
        }
    }
}
