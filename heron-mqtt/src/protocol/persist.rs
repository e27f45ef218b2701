//! 会话持久化
//!
//! 持久化会话（会话过期时长大于 0）在连接断开时保存，过期或被终结时删除。
//! broker 重启后，客户端可以从存储中恢复会话。不配置存储时只在内存中保留会话

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;

use super::session::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// 保存到存储中的会话
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// 连接断开的时间，unix 秒
    pub suspended_at: u64,
}

impl SessionSnapshot {
    pub fn new(state: SessionState, suspended_at: SystemTime) -> Self {
        Self {
            state,
            suspended_at: suspended_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// 离线时长超过会话过期时长即为过期
    pub fn is_expired(&self, now: SystemTime) -> bool {
        let suspended_at = UNIX_EPOCH + Duration::from_secs(self.suspended_at);
        match now.duration_since(suspended_at) {
            Ok(elapsed) => elapsed >= Duration::from_secs(self.state.expiry_interval as u64),
            Err(_) => false,
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError>;

    async fn load(&self, client_id: &str) -> Result<Option<SessionSnapshot>, StoreError>;

    async fn delete(&self, client_id: &str) -> Result<(), StoreError>;
}

/// 内存存储，broker 实例之间可以共享，适合测试和单进程场景
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.state.client_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, client_id: &str) -> Result<Option<SessionSnapshot>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(client_id)
            .cloned())
    }

    async fn delete(&self, client_id: &str) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_id);
        Ok(())
    }
}
