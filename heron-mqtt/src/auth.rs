//! 认证
//!
//! [`Authenticator`] 本身不保存任何状态，每一次调用都只依赖传入的参数。
//! 增强认证和重认证可能需要多轮交互，交互状态保存在 [`AuthExchange`] 中，由连接持有，
//! 交互结束（成功或失败）后即丢弃

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    hook::{AuthProvider, AuthResponse, HookError},
    network::packet::{Auth, Connect, ReasonCode},
    protocol::Client,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("rejected: {0}")]
    Rejected(HookError),
    #[error("authentication method mismatch, expected {expected}, got {got:?}")]
    MethodMismatch { expected: String, got: Option<String> },
    #[error("authentication exceeded {0} rounds")]
    TooManyRounds(u32),
    #[error("unexpected reason code {0:?} in AUTH packet")]
    UnexpectedReason(ReasonCode),
}

impl AuthError {
    /// 回复给客户端的原因码
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            AuthError::Rejected(e) if e.reason.is_error() => e.reason,
            AuthError::Rejected(_) => ReasonCode::NotAuthorized,
            AuthError::MethodMismatch { .. } => ReasonCode::BadAuthenticationMethod,
            AuthError::TooManyRounds(_) => ReasonCode::NotAuthorized,
            AuthError::UnexpectedReason(_) => ReasonCode::ProtocolError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// CONNECT 时的增强认证
    Connect,
    /// 连接建立之后的重认证
    ReAuth,
}

/// 一次增强认证或重认证交互的状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthExchange {
    pub kind: ExchangeKind,
    pub method: String,
    /// 已经完成的轮数
    pub step: u32,
    /// 上一轮服务端发出的数据
    pub server_data: Bytes,
    /// 最近一轮客户端发来的数据
    pub client_data: Bytes,
    /// 是否还需要客户端再发一个 AUTH
    pub continue_auth: bool,
}

impl AuthExchange {
    fn new(kind: ExchangeKind, method: String, client_data: Bytes) -> Self {
        Self {
            kind,
            method,
            step: 0,
            server_data: Bytes::new(),
            client_data,
            continue_auth: true,
        }
    }

    fn apply(&mut self, response: AuthResponse) -> AuthStep {
        self.step += 1;
        self.continue_auth = response.continue_auth;
        self.server_data = response.auth_data.clone();
        if response.continue_auth {
            AuthStep::Continue(response.auth_data)
        } else {
            AuthStep::Success(response.auth_data)
        }
    }
}

/// 每一轮认证的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// 把数据发给客户端，等待下一个 AUTH
    Continue(Bytes),
    /// 认证成功，数据随 CONNACK/AUTH 返回
    Success(Bytes),
}

pub(crate) struct Authenticator {
    provider: Arc<dyn AuthProvider>,
    max_rounds: u32,
}

impl Authenticator {
    pub(crate) fn new(provider: Arc<dyn AuthProvider>, max_rounds: u32) -> Self {
        Self {
            provider,
            max_rounds: max_rounds.max(1),
        }
    }

    /// 基础认证，只有一轮
    pub(crate) async fn basic(&self, client: &Client, connect: &Connect) -> Result<(), AuthError> {
        self.provider
            .on_basic_auth(client, connect)
            .await
            .map_err(AuthError::Rejected)
    }

    /// 增强认证的第一轮，认证方法取自 CONNECT
    pub(crate) async fn start_enhanced(
        &self,
        client: &Client,
        connect: &Connect,
        method: &str,
    ) -> Result<(AuthExchange, AuthStep), AuthError> {
        let mut exchange = AuthExchange::new(
            ExchangeKind::Connect,
            method.into(),
            connect.auth_data.clone().unwrap_or_default(),
        );
        let response = self
            .provider
            .on_enhanced_auth(client, connect)
            .await
            .map_err(AuthError::Rejected)?;
        let step = exchange.apply(response);
        Ok((exchange, step))
    }

    /// 重认证的第一轮，认证方法必须和连接时使用的一致
    pub(crate) async fn start_reauth(
        &self,
        client: &Client,
        method: &str,
        auth: &Auth,
    ) -> Result<(AuthExchange, AuthStep), AuthError> {
        if auth.code != ReasonCode::ReAuthenticate {
            return Err(AuthError::UnexpectedReason(auth.code));
        }
        check_method(method, auth)?;
        let mut exchange = AuthExchange::new(
            ExchangeKind::ReAuth,
            method.into(),
            auth.data.clone().unwrap_or_default(),
        );
        let response = self
            .provider
            .on_re_auth(client, auth)
            .await
            .map_err(AuthError::Rejected)?;
        let step = exchange.apply(response);
        Ok((exchange, step))
    }

    /// 后续的每一轮，客户端必须回复 ContinueAuthentication
    pub(crate) async fn resume(
        &self,
        client: &Client,
        exchange: &mut AuthExchange,
        auth: &Auth,
    ) -> Result<AuthStep, AuthError> {
        if auth.code != ReasonCode::ContinueAuthentication {
            return Err(AuthError::UnexpectedReason(auth.code));
        }
        check_method(&exchange.method, auth)?;
        if exchange.step >= self.max_rounds {
            return Err(AuthError::TooManyRounds(self.max_rounds));
        }
        exchange.client_data = auth.data.clone().unwrap_or_default();
        let response = self
            .provider
            .on_auth(client, exchange, auth)
            .await
            .map_err(AuthError::Rejected)?;
        Ok(exchange.apply(response))
    }
}

fn check_method(expected: &str, auth: &Auth) -> Result<(), AuthError> {
    match auth.method.as_deref() {
        Some(method) if method == expected => Ok(()),
        got => Err(AuthError::MethodMismatch {
            expected: expected.into(),
            got: got.map(Into::into),
        }),
    }
}
