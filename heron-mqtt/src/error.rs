use crate::{
    config, network,
    network::packet::ReasonCode,
    protocol::{persist, session::SessionTerminatedReason},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Network conn error: {0}")]
    Network(#[from] network::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::Error),
    #[error("Session store error: {0}")]
    Store(#[from] persist::StoreError),
}

/// 连接被关闭的原因
///
/// 客户端正常断开时没有原因，`on_closed` 收到的是 `None`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloseReason {
    /// 网络读写失败，只影响当前连接
    #[error("transport error: {0}")]
    Transport(String),
    /// 客户端违反协议，会话如果是持久化的则保留
    #[error("protocol error ({code:?}): {message}")]
    Protocol { code: ReasonCode, message: String },
    /// 连接时或重认证时认证失败
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("keep alive timeout")]
    KeepAlive,
    /// 同一个 client id 的新连接接管了会话
    #[error("session taken over by a new connection")]
    Takeover,
    /// 服务端主动断开，如踢下线、broker 停止、钩子返回致命错误
    #[error("closed by server: {0}")]
    Administrative(String),
}

impl CloseReason {
    pub(crate) fn protocol(code: ReasonCode, message: impl Into<String>) -> Self {
        CloseReason::Protocol {
            code,
            message: message.into(),
        }
    }

    /// 会话因为此原因被终结时对外暴露的原因
    pub fn session_reason(&self) -> SessionTerminatedReason {
        match self {
            CloseReason::Transport(_) | CloseReason::Protocol { .. } => {
                SessionTerminatedReason::ProtocolError
            }
            CloseReason::Auth(_) => SessionTerminatedReason::AuthenticationFailure,
            CloseReason::KeepAlive => SessionTerminatedReason::KeepAliveTimeout,
            CloseReason::Takeover => SessionTerminatedReason::TakenOver,
            CloseReason::Administrative(_) => SessionTerminatedReason::Administrative,
        }
    }

    /// 服务端主动断开时发给客户端的 DISCONNECT 原因码，网络错误时不发送
    pub(crate) fn disconnect_code(&self) -> Option<ReasonCode> {
        match self {
            CloseReason::Transport(_) => None,
            CloseReason::Protocol { code, .. } => Some(*code),
            CloseReason::Auth(_) => Some(ReasonCode::NotAuthorized),
            CloseReason::KeepAlive => Some(ReasonCode::KeepAliveTimeout),
            CloseReason::Takeover => Some(ReasonCode::SessionTakenOver),
            CloseReason::Administrative(_) => Some(ReasonCode::AdministrativeAction),
        }
    }
}

impl From<network::Error> for CloseReason {
    fn from(e: network::Error) -> Self {
        match e {
            network::Error::Malformed(message) => {
                CloseReason::protocol(ReasonCode::MalformedPacket, message)
            }
            e => CloseReason::Transport(e.to_string()),
        }
    }
}
