use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant, SystemTime},
};

use log::{debug, info, warn};
use tokio::sync::{
    mpsc::{error::TrySendError, Receiver, Sender, UnboundedReceiver, UnboundedSender},
    oneshot,
};

use crate::{
    error::CloseReason,
    hook::LifecycleObserver,
    network::packet::{QoS, SubscriptionOptions},
};

use super::{
    persist::{SessionSnapshot, SessionStore},
    router::DeliveryError,
    subscription::{Subscription, SubscriptionRegistry},
    ConnectionId, Kick, Message,
};

/// 会话被终结的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionTerminatedReason {
    /// 客户端正常断开
    NormalDisconnect,
    /// 协议错误或者网络异常断开
    ProtocolError,
    KeepAliveTimeout,
    /// 离线时长超过会话过期时长
    SessionExpired,
    /// 服务端主动断开
    Administrative,
    /// 被同一个 client id 的新连接接管
    TakenOver,
    AuthenticationFailure,
}

/// 已发给客户端、还没有完成确认的 QoS1/QoS2 消息
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InflightMessage {
    pub packet_id: u16,
    pub message: Message,
    /// 收到 PUBREC 并回复了 PUBREL，等待 PUBCOMP
    pub released: bool,
}

/// 会话状态，持久化会话断开后保存的就是这部分
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionState {
    /// 客户端 id，immutable
    pub client_id: String,
    /// 会话过期时长（秒），0 表示连接断开即结束
    pub expiry_interval: u32,
    /// 订阅的主题，key = topic-filter，重复订阅只替换选项
    pub subscriptions: BTreeMap<String, SubscriptionOptions>,
    /// 发送给客户端但是还没有确认的消息
    pub inflight: Vec<InflightMessage>,
    /// 离线期间积压的消息
    pub offline: VecDeque<Message>,
    /// 收到 qos2 publish 后保存，收到 pubrel 后删除
    pub received: BTreeSet<u16>,
}

impl SessionState {
    pub fn new(client_id: &str, expiry_interval: u32) -> Self {
        Self {
            client_id: client_id.into(),
            expiry_interval,
            subscriptions: BTreeMap::new(),
            inflight: Vec::new(),
            offline: VecDeque::new(),
            received: BTreeSet::new(),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.expiry_interval > 0
    }

    /// 取出需要交给连接继续处理的消息状态
    fn take_pending(&mut self) -> Pending {
        Pending {
            inflight: std::mem::take(&mut self.inflight),
            offline: std::mem::take(&mut self.offline),
            received: std::mem::take(&mut self.received),
        }
    }

    fn enqueue_offline(&mut self, message: Message, max: usize) -> Result<(), (Message, DeliveryError)> {
        if message.qos == QoS::AtMostOnce {
            return Err((message, DeliveryError::Offline));
        }
        if self.offline.len() >= max {
            return Err((message, DeliveryError::OfflineQueueFull));
        }
        self.offline.push_back(message);
        Ok(())
    }
}

/// 恢复会话时交给连接的消息状态
#[derive(Debug, Default)]
pub(crate) struct Pending {
    pub(crate) inflight: Vec<InflightMessage>,
    pub(crate) offline: VecDeque<Message>,
    pub(crate) received: BTreeSet<u16>,
}

/// 会话建立的结果
#[derive(Debug)]
pub(crate) enum Establish {
    Created,
    Resumed(Pending),
}

/// 连接断开时交还给会话的状态
pub(crate) struct Detach {
    pub(crate) conn_id: ConnectionId,
    pub(crate) reason: SessionTerminatedReason,
    /// 是否允许保留会话，认证失败时不保留
    pub(crate) preserve: bool,
    pub(crate) expiry_interval: u32,
    pub(crate) inflight: Vec<InflightMessage>,
    pub(crate) received: BTreeSet<u16>,
}

/// 会话当前绑定的连接
#[derive(Debug, Clone)]
pub(crate) struct ConnHandle {
    pub(crate) id: ConnectionId,
    /// 投递消息的发送队列
    pub(crate) tx: Sender<Message>,
    pub(crate) kick: UnboundedSender<Kick>,
}

struct SessionEntry {
    state: SessionState,
    /// 为 None 表示会话处于离线状态
    conn: Option<ConnHandle>,
    /// 进入离线状态的时间
    suspended_at: Option<Instant>,
    /// 进入离线状态的系统时间，写入存储用
    suspended_since: Option<SystemTime>,
}

impl SessionEntry {
    fn new(state: SessionState, conn: ConnHandle) -> Self {
        Self {
            state,
            conn: Some(conn),
            suspended_at: None,
            suspended_since: None,
        }
    }

    fn suspend(&mut self) {
        self.conn = None;
        self.suspended_at = Some(Instant::now());
        self.suspended_since = Some(SystemTime::now());
    }

    /// 离线会话的快照，在线时返回 None
    fn snapshot(&self) -> Option<SessionSnapshot> {
        match (&self.conn, self.suspended_since) {
            (None, Some(since)) => Some(SessionSnapshot::new(self.state.clone(), since)),
            _ => None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self.suspended_at {
            Some(at) => {
                now.duration_since(at) >= Duration::from_secs(self.state.expiry_interval as u64)
            }
            None => false,
        }
    }

    fn conn_id(&self) -> Option<ConnectionId> {
        self.conn.as_ref().map(|c| c.id)
    }
}

/// 已经从会话表中移除、等待通知的会话
struct Terminated {
    client_id: String,
    reason: SessionTerminatedReason,
    /// 会话中没有投递出去的消息
    dropped: Vec<Message>,
}

/// 一次投递的结果
#[derive(Debug, Default)]
pub(crate) struct Dispatched {
    /// 成功放入队列的接收者数量
    pub(crate) delivered: usize,
    pub(crate) dropped: Vec<(String, Message, DeliveryError)>,
    /// 离线队列有变化、需要重新保存的会话
    pub(crate) suspended: Vec<String>,
}

/// 会话管理
///
/// 会话表是判断一个 client id 是否在线的唯一依据，接管、恢复、终结都在同一把锁下决定。
/// 锁只在同步代码中持有，调用钩子和存储之前一定先释放
pub(crate) struct SessionManager {
    /// key = client_id
    sessions: Mutex<HashMap<String, SessionEntry>>,
    registry: Arc<SubscriptionRegistry>,
    store: Option<Arc<dyn SessionStore>>,
    /// 存储的读写按顺序进行，快照在锁内读取，后写入的不会比先写入的旧
    store_lock: tokio::sync::Mutex<()>,
    observer: Arc<dyn LifecycleObserver>,
    max_offline: usize,
}

impl SessionManager {
    pub(crate) fn new(
        registry: Arc<SubscriptionRegistry>,
        store: Option<Arc<dyn SessionStore>>,
        observer: Arc<dyn LifecycleObserver>,
        max_offline: usize,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            registry,
            store,
            store_lock: tokio::sync::Mutex::new(()),
            observer,
            max_offline,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 为认证通过的连接建立会话
    ///
    /// 同一个 client id 已经有在线连接时，先踢掉旧连接并等待它断开完成
    pub(crate) async fn establish(
        &self,
        client_id: &str,
        clean_start: bool,
        expiry_interval: u32,
        conn: ConnHandle,
    ) -> Establish {
        let mut stored = if clean_start {
            None
        } else {
            self.load_stored(client_id).await
        };

        let (outcome, terminated) = loop {
            let old = {
                let mut sessions = self.lock();
                match sessions.get(client_id).and_then(|e| e.conn.clone()) {
                    Some(old) => old,
                    None => {
                        break self.attach(
                            &mut sessions,
                            client_id,
                            clean_start,
                            expiry_interval,
                            conn.clone(),
                            stored.take(),
                        )
                    }
                }
            };
            self.evict(client_id, old).await;
        };

        if let Some(terminated) = terminated {
            self.finish(terminated).await;
        }
        if clean_start {
            self.delete_stored(client_id).await;
        }

        outcome
    }

    /// 在锁内把连接绑定到会话上
    fn attach(
        &self,
        sessions: &mut HashMap<String, SessionEntry>,
        client_id: &str,
        clean_start: bool,
        expiry_interval: u32,
        conn: ConnHandle,
        stored: Option<SessionSnapshot>,
    ) -> (Establish, Option<Terminated>) {
        let mut terminated = None;

        if let Some(entry) = sessions.remove(client_id) {
            if !clean_start && !entry.is_expired(Instant::now()) {
                let mut state = entry.state;
                state.expiry_interval = expiry_interval;
                let pending = state.take_pending();
                sessions.insert(client_id.into(), SessionEntry::new(state, conn));
                return (Establish::Resumed(pending), None);
            }
            let reason = if clean_start {
                SessionTerminatedReason::TakenOver
            } else {
                SessionTerminatedReason::SessionExpired
            };
            terminated = Some(self.terminate_locked(client_id, entry.state, reason));
        } else if let Some(snapshot) = stored {
            if !snapshot.is_expired(SystemTime::now()) {
                let mut state = snapshot.state;
                state.expiry_interval = expiry_interval;
                let filters = state
                    .subscriptions
                    .iter()
                    .map(|(filter, options)| (filter.clone(), *options))
                    .collect::<Vec<_>>();
                self.registry.subscribe(client_id, &filters);
                let pending = state.take_pending();
                sessions.insert(client_id.into(), SessionEntry::new(state, conn));
                return (Establish::Resumed(pending), None);
            }
            terminated = Some(Terminated {
                client_id: client_id.into(),
                reason: SessionTerminatedReason::SessionExpired,
                dropped: snapshot.state.offline.into(),
            });
        }

        sessions.insert(
            client_id.into(),
            SessionEntry::new(SessionState::new(client_id, expiry_interval), conn),
        );
        (Establish::Created, terminated)
    }

    /// 踢掉旧连接，等它断开并解除会话绑定
    async fn evict(&self, client_id: &str, old: ConnHandle) {
        info!("client {} takeover connection {}", client_id, old.id);
        let (done_tx, done_rx) = oneshot::channel();
        let kick = Kick {
            reason: CloseReason::Takeover,
            done: done_tx,
        };
        if old.kick.send(kick).is_ok() && done_rx.await.is_ok() {
            return;
        }

        // 旧连接已经退出但还没有解除绑定
        let mut sessions = self.lock();
        if let Some(entry) = sessions.get_mut(client_id) {
            if entry.conn_id() == Some(old.id) {
                entry.suspend();
            }
        }
    }

    /// 连接断开，解除会话绑定
    ///
    /// 持久化会话转为离线状态，否则终结会话。
    /// 发送队列和踢下线的队列在锁内关闭并排空，router 投递消息也在同一把锁内，所以不会有消息丢在队列里
    pub(crate) async fn detach(
        &self,
        client_id: &str,
        conn_rx: &mut Receiver<Message>,
        kick_rx: &mut UnboundedReceiver<Kick>,
        detach: Detach,
    ) -> Vec<oneshot::Sender<()>> {
        let mut kicks = Vec::new();
        let mut pending = Vec::new();
        let mut suspended = false;
        let mut terminated = None;
        {
            let mut sessions = self.lock();
            conn_rx.close();
            while let Ok(message) = conn_rx.try_recv() {
                pending.push(message);
            }
            kick_rx.close();
            while let Ok(kick) = kick_rx.try_recv() {
                kicks.push(kick.done);
            }

            let owned = sessions.get(client_id).and_then(SessionEntry::conn_id) == Some(detach.conn_id);
            if owned && detach.preserve && detach.expiry_interval > 0 {
                if let Some(entry) = sessions.get_mut(client_id) {
                    entry.suspend();
                    entry.state.expiry_interval = detach.expiry_interval;
                    entry.state.inflight = detach.inflight;
                    entry.state.received = detach.received;
                    // 还没来得及发出的消息排在离线消息前面
                    for message in pending.drain(..).rev() {
                        entry.state.offline.push_front(message);
                    }
                    suspended = true;
                }
            } else if owned {
                if let Some(entry) = sessions.remove(client_id) {
                    terminated = Some(self.terminate_locked(client_id, entry.state, detach.reason));
                }
            }
        }

        if suspended {
            debug!("session {} suspended", client_id);
            self.persist(&[client_id.to_owned()]).await;
        }
        for message in pending {
            self.observer
                .on_msg_dropped(client_id, &message, &DeliveryError::ConnectionClosed)
                .await;
        }
        if let Some(terminated) = terminated {
            self.finish(terminated).await;
        }

        kicks
    }

    /// 把消息投递给各个订阅者
    ///
    /// 在线的放入连接的发送队列，离线的持久化会话放入离线队列。
    /// 离线队列变化的会话由调用方在锁外通过 [`SessionManager::persist`] 保存
    pub(crate) fn dispatch(
        &self,
        message: &Message,
        targets: Vec<(String, SubscriptionOptions)>,
        retained: bool,
    ) -> Dispatched {
        let mut dispatched = Dispatched::default();
        let mut sessions = self.lock();

        for (client_id, options) in targets {
            if !retained && options.no_local && message.publisher.as_deref() == Some(client_id.as_str()) {
                continue;
            }

            // 每个接收者一份拷贝
            let mut copy = message.clone();
            copy.qos = message.qos.downgrade(options.qos);
            copy.retain = message.retain && (retained || options.retain_as_published);

            let entry = match sessions.get_mut(&client_id) {
                Some(entry) => entry,
                None => {
                    dispatched
                        .dropped
                        .push((client_id, copy, DeliveryError::RecipientGone));
                    continue;
                }
            };

            let queued = match &entry.conn {
                Some(conn) => match conn.tx.try_send(copy) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(copy)) => Err((copy, DeliveryError::QueueFull)),
                    // 连接正在断开，持久化会话转入离线队列，断开时一起保存
                    Err(TrySendError::Closed(copy)) if entry.state.is_persistent() => {
                        entry.state.enqueue_offline(copy, self.max_offline)
                    }
                    Err(TrySendError::Closed(copy)) => Err((copy, DeliveryError::ConnectionClosed)),
                },
                None => {
                    let queued = entry.state.enqueue_offline(copy, self.max_offline);
                    if queued.is_ok() && self.store.is_some() {
                        dispatched.suspended.push(client_id.clone());
                    }
                    queued
                }
            };

            match queued {
                Ok(()) => dispatched.delivered += 1,
                Err((copy, e)) => dispatched.dropped.push((client_id, copy, e)),
            }
        }

        dispatched
    }

    /// 把离线会话的最新状态写入存储，会话已经恢复或终结时跳过
    pub(crate) async fn persist(&self, client_ids: &[String]) {
        let store = match &self.store {
            Some(store) => store,
            None => return,
        };
        for client_id in client_ids {
            let _guard = self.store_lock.lock().await;
            let snapshot = self.lock().get(client_id).and_then(SessionEntry::snapshot);
            if let Some(snapshot) = snapshot {
                if let Err(e) = store.save(&snapshot).await {
                    warn!("save session {} error: {}", client_id, e);
                }
            }
        }
    }

    pub(crate) fn record_subscriptions(&self, client_id: &str, filters: &[(String, SubscriptionOptions)]) {
        if let Some(entry) = self.lock().get_mut(client_id) {
            for (filter, options) in filters {
                entry.state.subscriptions.insert(filter.clone(), *options);
            }
        }
    }

    pub(crate) fn record_unsubscriptions(&self, client_id: &str, filters: &[String]) {
        if let Some(entry) = self.lock().get_mut(client_id) {
            for filter in filters {
                entry.state.subscriptions.remove(filter);
            }
        }
    }

    /// 清理过期的离线会话
    pub(crate) async fn sweep_expired(&self) {
        let expired = {
            let mut sessions = self.lock();
            let now = Instant::now();
            let client_ids = sessions
                .iter()
                .filter(|(_, entry)| entry.conn.is_none() && entry.is_expired(now))
                .map(|(client_id, _)| client_id.clone())
                .collect::<Vec<_>>();

            client_ids
                .into_iter()
                .filter_map(|client_id| {
                    let entry = sessions.remove(&client_id)?;
                    Some(self.terminate_locked(
                        &client_id,
                        entry.state,
                        SessionTerminatedReason::SessionExpired,
                    ))
                })
                .collect::<Vec<_>>()
        };

        for terminated in expired {
            self.finish(terminated).await;
        }
    }

    /// 要求在线的客户端断开，返回客户端是否在线
    pub(crate) async fn kick(&self, client_id: &str, reason: CloseReason) -> bool {
        let conn = self.lock().get(client_id).and_then(|e| e.conn.clone());
        let conn = match conn {
            Some(conn) => conn,
            None => return false,
        };

        let (done_tx, done_rx) = oneshot::channel();
        if conn
            .kick
            .send(Kick {
                reason,
                done: done_tx,
            })
            .is_err()
        {
            return false;
        }
        let _ = done_rx.await;
        true
    }

    pub(crate) fn is_connected(&self, client_id: &str) -> bool {
        self.lock()
            .get(client_id)
            .map(|e| e.conn.is_some())
            .unwrap_or(false)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn subscriptions(&self, client_id: &str) -> Vec<Subscription> {
        self.lock()
            .get(client_id)
            .map(|entry| {
                entry
                    .state
                    .subscriptions
                    .iter()
                    .map(|(filter, options)| Subscription {
                        client_id: client_id.into(),
                        topic_filter: filter.clone(),
                        options: *options,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 在锁内移除会话的订阅
    fn terminate_locked(
        &self,
        client_id: &str,
        state: SessionState,
        reason: SessionTerminatedReason,
    ) -> Terminated {
        let filters = state.subscriptions.keys().collect::<Vec<_>>();
        self.registry.unsubscribe(client_id, &filters);
        Terminated {
            client_id: client_id.into(),
            reason,
            dropped: state.offline.into(),
        }
    }

    /// 通知会话终结
    async fn finish(&self, terminated: Terminated) {
        let Terminated {
            client_id,
            reason,
            dropped,
        } = terminated;
        info!("session {} terminated: {:?}", client_id, reason);

        self.delete_stored(&client_id).await;
        for message in dropped.iter() {
            self.observer
                .on_msg_dropped(&client_id, message, &DeliveryError::SessionTerminated)
                .await;
        }
        self.observer.on_session_terminated(&client_id, reason).await;
    }

    /// 内存中没有会话时才从存储中加载，加载失败按新会话处理
    async fn load_stored(&self, client_id: &str) -> Option<SessionSnapshot> {
        let store = self.store.as_ref()?;
        if self.lock().contains_key(client_id) {
            return None;
        }
        match store.load(client_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("load session {} error, start a new one: {}", client_id, e);
                None
            }
        }
    }

    async fn delete_stored(&self, client_id: &str) {
        if let Some(store) = &self.store {
            let _guard = self.store_lock.lock().await;
            if let Err(e) = store.delete(client_id).await {
                warn!("delete session {} error: {}", client_id, e);
            }
        }
    }
}
