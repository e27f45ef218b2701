//! 网络层
//! 传输层只负责以报文为单位读写，字节编解码由具体的传输实现负责。
//! 每个连接由一个 [`ClientEventLoop`] 处理：读取 connect、认证、建立会话，之后处理所有报文

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::{
    select,
    sync::{
        mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    time::{self, Instant},
};

use crate::{
    auth::{AuthError, AuthExchange, AuthStep},
    broker::Context,
    error::CloseReason,
    protocol::{
        alias::TopicAliasResolver,
        router::PublishOutcome,
        session::{ConnHandle, Detach, Establish, InflightMessage, Pending, SessionTerminatedReason},
        subscription::Subscription,
        Client, ConnectionId, DeliveryError, Kick, Message,
    },
};

use self::packet::{
    Auth, ConnAck, Connect, Disconnect, LastWill, Packet, Protocol, PubAck, PubComp, PubRec,
    PubRel, Publish, QoS, ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

pub(crate) use conn::Connection;

mod conn;
pub mod memory;
pub mod packet;
pub mod topic;

/// 出方向未确认消息的上限，packet id 只有这么多
const MAX_INFLIGHT: usize = u16::MAX as usize - 1;

/// 服务端断开连接时等待 DISCONNECT 写出的时长
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Acceptor closed")]
    AcceptorClosed,
    #[error("Malformed packet: {0}")]
    Malformed(String),
}

/// 传输连接的描述，交给 on_accept 钩子
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    /// 对端地址
    pub peer: String,
}

impl TransportInfo {
    pub fn new(peer: impl Into<String>) -> Self {
        Self { peer: peer.into() }
    }
}

impl fmt::Display for TransportInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.peer)
    }
}

/// 一个已建立的传输连接，以报文为单位读写
#[async_trait]
pub trait Transport: Send + 'static {
    /// 读取下一个报文，会在 select! 中使用，必须是取消安全的
    async fn read_packet(&mut self) -> Result<Packet, Error>;

    async fn write_packet(&mut self, packet: Packet) -> Result<(), Error>;

    async fn close(&mut self);

    fn info(&self) -> TransportInfo;
}

/// 产生传输连接，如 tcp 监听
#[async_trait]
pub trait Acceptor: Send + 'static {
    type Transport: Transport;

    async fn accept(&mut self) -> Result<Self::Transport, Error>;
}

/// 处理一个新的传输连接，直到连接关闭
pub(crate) async fn serve(ctx: Arc<Context>, transport: Box<dyn Transport>, id: ConnectionId) {
    let mut conn = Connection::new(transport, ctx.cfg.broker.dump_packet);
    let client = Client::anonymous(id, conn.peer().into());
    let mut shutdown = ctx.shutdown.clone();

    let first = if *shutdown.borrow() {
        Err(broker_stopped())
    } else {
        select! {
            read = conn.read_connect(ctx.cfg.broker.connect_timeout()) => read,
            _ = shutdown.changed() => Err(broker_stopped()),
        }
    };

    match first {
        Ok(connect) => {
            let event_loop = ClientEventLoop::new(ctx, conn, client, &connect, shutdown);
            event_loop.start(connect).await
        }
        Err(reason) => {
            warn!("connection {} from {} closed before connect: {}", id, client.peer, reason);
            conn.close().await;
            ctx.hooks.observer.on_closed(&client, Some(&reason)).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// 已收到 connect，正在认证、建立会话
    Connecting,
    /// 会话已建立
    Connected,
}

/// 事件循环退出的方式
#[derive(Debug)]
enum Closing {
    /// 客户端发送了 DISCONNECT
    Normal { publish_will: bool },
    Error(CloseReason),
}

impl From<CloseReason> for Closing {
    fn from(reason: CloseReason) -> Self {
        Closing::Error(reason)
    }
}

impl From<Error> for Closing {
    fn from(e: Error) -> Self {
        Closing::Error(e.into())
    }
}

pub(crate) struct ClientEventLoop {
    ctx: Arc<Context>,
    conn: Connection,
    client: Client,
    state: ConnState,
    /// conn_tx 由 session 持有，用于给当前这个 connection 发送消息
    conn_tx: Sender<Message>,
    conn_rx: Receiver<Message>,
    /// 踢下线单独一个队列，不受发送队列是否已满影响
    kick_tx: UnboundedSender<Kick>,
    kick_rx: UnboundedReceiver<Kick>,
    /// 1.5 倍的 keep alive，为 None 时不检查
    keep_alive: Option<Duration>,
    last_seen: Instant,
    will: Option<LastWill>,
    session_expiry: u32,
    /// 连接时使用的增强认证方法，重认证必须使用同一个
    auth_method: Option<String>,
    /// 正在进行的重认证
    reauth: Option<AuthExchange>,
    aliases: Box<dyn TopicAliasResolver>,
    /// 发给客户端还没有确认的消息，key = packet id
    inflight: BTreeMap<u16, InflightMessage>,
    /// 收到的 qos2 消息，收到 pubrel 后删除
    received: BTreeSet<u16>,
    packet_id_seq: u16,
    shutdown: watch::Receiver<bool>,
    /// 被踢下线时，断开完成后通知
    kicked: Vec<oneshot::Sender<()>>,
    /// 写报文的过程被打断，连接上的数据可能不完整，不能再写
    write_cancelled: bool,
}

impl ClientEventLoop {
    fn new(
        ctx: Arc<Context>,
        conn: Connection,
        client: Client,
        connect: &Connect,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (conn_tx, conn_rx) = mpsc::channel(ctx.cfg.broker.outgoing_capacity.max(1));
        let (kick_tx, kick_rx) = mpsc::unbounded_channel();
        let keep_alive = match connect.keep_alive {
            0 => None,
            k => Some(Duration::from_millis(k as u64 * 1500)),
        };
        let aliases = ctx
            .alias_factory
            .create(ctx.cfg.broker.topic_alias_maximum, connect.topic_alias_maximum);

        Self {
            ctx,
            conn,
            client,
            state: ConnState::Connecting,
            conn_tx,
            conn_rx,
            kick_tx,
            kick_rx,
            keep_alive,
            last_seen: Instant::now(),
            will: None,
            session_expiry: 0,
            auth_method: None,
            reauth: None,
            aliases,
            inflight: BTreeMap::new(),
            received: BTreeSet::new(),
            packet_id_seq: 0,
            shutdown,
            kicked: Vec::new(),
            write_cancelled: false,
        }
    }

    /// 开启事件循环
    /// * connect 报文已在 serve 中读取，这里先完成认证和会话建立
    /// * 从网络层读取 packet 处理
    /// * 接收 session/router 投递的消息，写入网络层
    async fn start(mut self, connect: Connect) {
        let closing = match self.handshake(connect).await {
            Ok(()) => self.event_loop().await,
            Err(reason) => Closing::Error(reason),
        };
        self.teardown(closing).await
    }

    async fn handshake(&mut self, mut connect: Connect) -> Result<(), CloseReason> {
        let ctx = self.ctx.clone();
        self.client.protocol = connect.protocol;
        self.client.username = connect.login.as_ref().map(|login| login.username.clone());

        // 零长度的 client id 由服务端分配
        let mut assigned_client_id = None;
        if connect.client_id.is_empty() {
            if !ctx.cfg.broker.allow_zero_len_client_id {
                self.reject(ReasonCode::ClientIdentifierNotValid).await;
                return Err(CloseReason::protocol(
                    ReasonCode::ClientIdentifierNotValid,
                    "zero length client id",
                ));
            }
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or_default();
            let client_id = format!("heron-{}-{}", self.client.connection_id, nanos);
            connect.client_id = client_id.clone();
            assigned_client_id = Some(client_id);
        }
        self.client.client_id = connect.client_id.clone();
        info!(
            "client {} connecting from {}, connection {}",
            self.client.client_id, self.client.peer, self.client.connection_id
        );

        let auth_data = self.authenticate(&connect).await?;

        // 建立会话，同一个 client id 的旧连接会被踢掉
        let expiry = ctx.cfg.session.clamp_expiry(connect.session_expiry_interval);
        self.session_expiry = expiry;
        let handle = ConnHandle {
            id: self.client.connection_id,
            tx: self.conn_tx.clone(),
            kick: self.kick_tx.clone(),
        };
        let outcome = ctx
            .sessions
            .establish(&self.client.client_id, connect.clean_start, expiry, handle)
            .await;
        self.state = ConnState::Connected;

        let observer = &ctx.hooks.observer;
        let (session_present, pending) = match outcome {
            Establish::Created => {
                observer.on_session_created(&self.client).await;
                (false, Pending::default())
            }
            Establish::Resumed(pending) => {
                observer.on_session_resumed(&self.client).await;
                (true, pending)
            }
        };
        self.will = connect.will.take();

        let mut ack = ConnAck::new(ReasonCode::Success, session_present);
        ack.assigned_client_id = assigned_client_id;
        ack.auth_method = self.auth_method.clone();
        ack.auth_data = auth_data;
        ack.topic_alias_maximum = ctx.cfg.broker.topic_alias_maximum;
        self.write_packet(Packet::ConnAck(ack)).await?;

        info!(
            "client {} connected, session present: {}",
            self.client.client_id, session_present
        );
        observer.on_connected(&self.client).await;

        self.restore(pending).await
    }

    /// 基础认证或增强认证，成功时返回 CONNACK 携带的认证数据
    async fn authenticate(&mut self, connect: &Connect) -> Result<Option<Bytes>, CloseReason> {
        let ctx = self.ctx.clone();
        let authenticator = &ctx.authenticator;

        let method = match &connect.auth_method {
            Some(method) => method.clone(),
            None => {
                return match authenticator.basic(&self.client, connect).await {
                    Ok(()) => Ok(None),
                    Err(e) => Err(self.auth_failed(e).await),
                }
            }
        };

        let (mut exchange, mut step) =
            match authenticator.start_enhanced(&self.client, connect, &method).await {
                Ok(started) => started,
                Err(e) => return Err(self.auth_failed(e).await),
            };

        loop {
            let data = match step {
                AuthStep::Success(data) => {
                    debug!(
                        "client {} authenticated by {} in {} rounds",
                        self.client.client_id, method, exchange.step
                    );
                    self.auth_method = Some(method);
                    return Ok(Some(data));
                }
                AuthStep::Continue(data) => data,
            };

            let challenge = Auth::new(ReasonCode::ContinueAuthentication, method.as_str(), data);
            self.write_packet(Packet::Auth(challenge)).await?;

            // 等待客户端回复期间 broker 停止，放弃这次认证
            let read = select! {
                read = time::timeout(ctx.cfg.broker.connect_timeout(), self.conn.read_packet()) => read,
                _ = self.shutdown.changed() => return Err(broker_stopped()),
            };
            let packet = match read {
                Ok(read) => read?,
                Err(_) => {
                    return Err(CloseReason::protocol(
                        ReasonCode::MaximumConnectTime,
                        "wait for AUTH timeout",
                    ))
                }
            };
            let auth = match packet {
                Packet::Auth(auth) => auth,
                packet => {
                    self.reject(ReasonCode::ProtocolError).await;
                    return Err(CloseReason::protocol(
                        ReasonCode::ProtocolError,
                        format!("unexpected {} during authentication", packet.name()),
                    ));
                }
            };

            step = match authenticator.resume(&self.client, &mut exchange, &auth).await {
                Ok(step) => step,
                Err(e) => return Err(self.auth_failed(e).await),
            };
        }
    }

    async fn auth_failed(&mut self, e: AuthError) -> CloseReason {
        warn!("client {} authentication failed: {}", self.client.client_id, e);
        self.reject(e.reason_code()).await;
        CloseReason::Auth(e.to_string())
    }

    /// 连接失败时回复 CONNACK，session present 必须为 0
    async fn reject(&mut self, code: ReasonCode) {
        if let Err(e) = self.write_packet(Packet::ConnAck(ConnAck::new(code, false))).await {
            debug!("write CONNACK to {} error: {}", self.client.peer, e);
        }
    }

    /// 恢复会话：重发未确认的消息，发送离线期间积压的消息
    async fn restore(&mut self, pending: Pending) -> Result<(), CloseReason> {
        self.received = pending.received;

        for inflight in pending.inflight {
            let packet = if inflight.released {
                Packet::PubRel(PubRel {
                    packet_id: inflight.packet_id,
                    code: ReasonCode::Success,
                })
            } else {
                let mut publish = inflight.message.to_publish(inflight.packet_id);
                publish.dup = true;
                Packet::Publish(publish)
            };
            self.inflight.insert(inflight.packet_id, inflight);
            self.write_packet(packet).await?;
        }

        for message in pending.offline {
            self.deliver(message).await?;
        }
        Ok(())
    }

    async fn event_loop(&mut self) -> Closing {
        loop {
            let deadline = self.keep_alive.map(|k| self.last_seen + k);
            let handled = select! {
                // 从网络层读数据
                read = self.conn.read_packet() => match read {
                    Ok(packet) => {
                        self.last_seen = Instant::now();
                        self.handle_packet(packet).await
                    }
                    Err(e) => Err(e.into()),
                },
                // session/router 投递的消息
                Some(message) = self.conn_rx.recv() => self.deliver(message).await.map_err(Closing::from),
                Some(kick) = self.kick_rx.recv() => {
                    self.kicked.push(kick.done);
                    Err(kick.reason.into())
                }
                _ = keep_alive_expired(deadline) => Err(CloseReason::KeepAlive.into()),
                _ = self.shutdown.changed() => Err(broker_stopped().into()),
            };

            if let Err(closing) = handled {
                return closing;
            }
        }
    }

    /// 把消息写给客户端，qos > 0 的消息保存到 inflight 等待确认
    async fn deliver(&mut self, message: Message) -> Result<(), CloseReason> {
        let observer = self.ctx.hooks.observer.clone();

        let packet_id = match message.qos {
            QoS::AtMostOnce => 0,
            _ if self.inflight.len() >= MAX_INFLIGHT => {
                observer
                    .on_msg_dropped(&self.client.client_id, &message, &DeliveryError::QueueFull)
                    .await;
                return Ok(());
            }
            _ => {
                let packet_id = self.next_packet_id();
                self.inflight.insert(
                    packet_id,
                    InflightMessage {
                        packet_id,
                        message: message.clone(),
                        released: false,
                    },
                );
                packet_id
            }
        };

        let mut publish = message.to_publish(packet_id);
        if let Some(alias) = self.aliases.assign_outbound(&publish.topic) {
            publish.topic_alias = Some(alias.alias);
            // 客户端已经知道这个别名，省略 topic
            if alias.known {
                publish.topic.clear();
            }
        }

        match self.write_packet(Packet::Publish(publish)).await {
            Ok(()) => {
                observer.on_delivered(&self.client, &message).await;
                Ok(())
            }
            Err(reason) => {
                // qos > 0 的消息留在 inflight 中，会话保留时下次重发
                if message.qos == QoS::AtMostOnce {
                    let err = match &reason {
                        CloseReason::Transport(e) => DeliveryError::Transport(e.clone()),
                        _ => DeliveryError::ConnectionClosed,
                    };
                    observer
                        .on_msg_dropped(&self.client.client_id, &message, &err)
                        .await;
                }
                Err(reason)
            }
        }
    }

    fn next_packet_id(&mut self) -> u16 {
        loop {
            self.packet_id_seq = self.packet_id_seq.wrapping_add(1).max(1);
            if !self.inflight.contains_key(&self.packet_id_seq) {
                return self.packet_id_seq;
            }
        }
    }

    /// 写一个报文
    ///
    /// 对端不读数据时写会一直阻塞，等待期间仍然响应踢下线和 broker 停止
    async fn write_packet(&mut self, packet: Packet) -> Result<(), CloseReason> {
        let closed = select! {
            written = self.conn.write_packet(packet) => return Ok(written?),
            Some(kick) = self.kick_rx.recv() => {
                self.kicked.push(kick.done);
                kick.reason
            }
            _ = self.shutdown.changed() => broker_stopped(),
        };
        self.write_cancelled = true;
        Err(closed)
    }

    async fn write(&mut self, packet: Packet) -> Result<(), Closing> {
        Ok(self.write_packet(packet).await?)
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Closing> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PubAck(puback) => {
                if self.inflight.remove(&puback.packet_id).is_none() {
                    debug!("client {} PUBACK unknown packet id {}", self.client.client_id, puback.packet_id);
                }
                Ok(())
            }
            Packet::PubRec(pubrec) => self.handle_publish_receive(pubrec).await,
            Packet::PubRel(pubrel) => self.handle_publish_release(pubrel).await,
            Packet::PubComp(pubcomp) => {
                self.inflight.remove(&pubcomp.packet_id);
                Ok(())
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await,
            Packet::PingReq => self.write(Packet::PingResp).await,
            Packet::Auth(auth) => self.handle_auth(auth).await,
            Packet::Disconnect(disconnect) => Err(self.handle_disconnect(disconnect)),
            packet => Err(CloseReason::protocol(
                ReasonCode::ProtocolError,
                format!("unexpected {} packet", packet.name()),
            )
            .into()),
        }
    }

    /// 处理 publish 请求
    async fn handle_publish(&mut self, mut publish: Publish) -> Result<(), Closing> {
        if let Some(alias) = publish.topic_alias {
            publish.topic = self
                .aliases
                .resolve_inbound(alias, &publish.topic)
                .map_err(|e| CloseReason::protocol(ReasonCode::TopicAliasInvalid, e.to_string()))?;
        }
        if !topic::valid_publish_topic(&publish.topic) {
            return Err(CloseReason::protocol(
                ReasonCode::TopicNameInvalid,
                format!("invalid topic name {:?}", publish.topic),
            )
            .into());
        }

        let Publish { qos, packet_id, .. } = publish;
        // 重发的 qos2 消息已经分发过，只回复 pubrec
        if qos == QoS::ExactlyOnce && self.received.contains(&packet_id) {
            return self.ack_publish(qos, packet_id, ReasonCode::Success).await;
        }

        let ctx = self.ctx.clone();
        if let Err(e) = ctx.hooks.publish.on_msg_arrived(&self.client, &publish).await {
            warn!(
                "client {} publish to {} rejected: {}",
                self.client.client_id, publish.topic, e
            );
            if e.fatal {
                return Err(CloseReason::Administrative(e.message).into());
            }
            let code = if e.reason.is_error() {
                e.reason
            } else {
                ReasonCode::NotAuthorized
            };
            return self.ack_publish(qos, packet_id, code).await;
        }

        let message = Message::from_publish(&publish, &self.client.client_id);
        let code = match ctx.router.publish(&self.client, message).await {
            PublishOutcome::Routed(0) => ReasonCode::NoMatchingSubscribers,
            _ => ReasonCode::Success,
        };
        if qos == QoS::ExactlyOnce {
            // 保存起来，下次接收到 pubrel 消息时删除
            self.received.insert(packet_id);
        }
        self.ack_publish(qos, packet_id, code).await
    }

    async fn ack_publish(&mut self, qos: QoS, packet_id: u16, code: ReasonCode) -> Result<(), Closing> {
        match qos {
            QoS::AtMostOnce => Ok(()),
            QoS::AtLeastOnce => self.write(Packet::PubAck(PubAck { packet_id, code })).await,
            QoS::ExactlyOnce => self.write(Packet::PubRec(PubRec { packet_id, code })).await,
        }
    }

    /// 处理 pubrec，回复 pubrel
    async fn handle_publish_receive(&mut self, pubrec: PubRec) -> Result<(), Closing> {
        let packet_id = pubrec.packet_id;
        if pubrec.code.is_error() {
            // 客户端拒绝了这条消息，流程结束
            self.inflight.remove(&packet_id);
            return Ok(());
        }
        let code = match self.inflight.get_mut(&packet_id) {
            Some(inflight) => {
                inflight.released = true;
                ReasonCode::Success
            }
            None => ReasonCode::PacketIdentifierNotFound,
        };
        self.write(Packet::PubRel(PubRel { packet_id, code })).await
    }

    /// 处理 pubrel，回复 pubcomp
    async fn handle_publish_release(&mut self, pubrel: PubRel) -> Result<(), Closing> {
        let packet_id = pubrel.packet_id;
        let code = if self.received.remove(&packet_id) {
            ReasonCode::Success
        } else {
            ReasonCode::PacketIdentifierNotFound
        };
        self.write(Packet::PubComp(PubComp { packet_id, code })).await
    }

    /// 处理订阅请求，一个请求中所有合法的 filter 一起生效
    async fn handle_subscribe(&mut self, subscribe: Subscribe) -> Result<(), Closing> {
        let ctx = self.ctx.clone();
        let packet_id = subscribe.packet_id;

        if let Err(e) = ctx.hooks.subscription.on_subscribe(&self.client, &subscribe).await {
            warn!("client {} subscribe rejected: {}", self.client.client_id, e);
            if e.fatal {
                return Err(CloseReason::Administrative(e.message).into());
            }
            let code = if e.reason.is_error() {
                e.reason
            } else {
                ReasonCode::NotAuthorized
            };
            let return_codes = vec![code; subscribe.filters.len()];
            return self
                .write(Packet::SubAck(SubAck {
                    packet_id,
                    return_codes,
                }))
                .await;
        }

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut accepted = Vec::with_capacity(subscribe.filters.len());
        for filter in subscribe.filters {
            if topic::valid_subscribe_filter(&filter.path) {
                return_codes.push(ReasonCode::granted(filter.options.qos));
                accepted.push((filter.path, filter.options));
            } else {
                debug!("client {} invalid topic filter {:?}", self.client.client_id, filter.path);
                return_codes.push(ReasonCode::TopicFilterInvalid);
            }
        }

        let client_id = self.client.client_id.clone();
        ctx.registry.subscribe(&client_id, &accepted);
        ctx.sessions.record_subscriptions(&client_id, &accepted);
        for (filter, options) in accepted.iter() {
            let subscription = Subscription {
                client_id: client_id.clone(),
                topic_filter: filter.clone(),
                options: *options,
            };
            ctx.hooks.observer.on_subscribed(&self.client, &subscription).await;
        }

        self.write(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
        .await?;

        // 保留消息在 suback 之后通过发送队列投递
        ctx.router.deliver_retained(&client_id, &accepted).await;
        Ok(())
    }

    async fn handle_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> Result<(), Closing> {
        let ctx = self.ctx.clone();
        let packet_id = unsubscribe.packet_id;

        if let Err(e) = ctx.hooks.subscription.on_unsubscribe(&self.client, &unsubscribe).await {
            warn!("client {} unsubscribe rejected: {}", self.client.client_id, e);
            if e.fatal {
                return Err(CloseReason::Administrative(e.message).into());
            }
            let code = if e.reason.is_error() {
                e.reason
            } else {
                ReasonCode::NotAuthorized
            };
            let return_codes = vec![code; unsubscribe.filters.len()];
            return self
                .write(Packet::UnsubAck(UnsubAck {
                    packet_id,
                    return_codes,
                }))
                .await;
        }

        let client_id = self.client.client_id.clone();
        let existed = ctx.registry.unsubscribe(&client_id, &unsubscribe.filters);
        ctx.sessions.record_unsubscriptions(&client_id, &unsubscribe.filters);

        let mut return_codes = Vec::with_capacity(existed.len());
        for (filter, existed) in unsubscribe.filters.iter().zip(existed) {
            if existed {
                ctx.hooks.observer.on_unsubscribed(&self.client, filter).await;
                return_codes.push(ReasonCode::Success);
            } else {
                return_codes.push(ReasonCode::NoSubscriptionExisted);
            }
        }

        self.write(Packet::UnsubAck(UnsubAck {
            packet_id,
            return_codes,
        }))
        .await
    }

    /// 已连接的客户端发起重认证
    async fn handle_auth(&mut self, auth: Auth) -> Result<(), Closing> {
        let method = match &self.auth_method {
            Some(method) => method.clone(),
            None => {
                return Err(CloseReason::protocol(
                    ReasonCode::ProtocolError,
                    "AUTH received but connection used basic authentication",
                )
                .into())
            }
        };

        let ctx = self.ctx.clone();
        let step = match self.reauth.take() {
            Some(mut exchange) => {
                let step = ctx.authenticator.resume(&self.client, &mut exchange, &auth).await;
                self.reauth = Some(exchange);
                step
            }
            None => match ctx.authenticator.start_reauth(&self.client, &method, &auth).await {
                Ok((exchange, step)) => {
                    self.reauth = Some(exchange);
                    Ok(step)
                }
                Err(e) => Err(e),
            },
        };

        match step {
            Ok(AuthStep::Continue(data)) => {
                let challenge = Auth::new(ReasonCode::ContinueAuthentication, method.as_str(), data);
                self.write(Packet::Auth(challenge)).await
            }
            Ok(AuthStep::Success(data)) => {
                self.reauth = None;
                info!("client {} re-authenticated", self.client.client_id);
                self.write(Packet::Auth(Auth::new(ReasonCode::Success, method.as_str(), data)))
                    .await
            }
            Err(e) => {
                self.reauth = None;
                warn!("client {} re-authentication failed: {}", self.client.client_id, e);
                Err(CloseReason::Auth(e.to_string()).into())
            }
        }
    }

    /// 客户端断开连接，0x04 原因码要求发送遗嘱
    fn handle_disconnect(&mut self, disconnect: Disconnect) -> Closing {
        if let Some(expiry) = disconnect.session_expiry_interval {
            // 连接时过期时长为 0，断开时不能再改为非 0
            if self.session_expiry == 0 && expiry > 0 {
                return CloseReason::protocol(
                    ReasonCode::ProtocolError,
                    "session expiry interval changed from zero on DISCONNECT",
                )
                .into();
            }
            self.session_expiry = self.ctx.cfg.session.clamp_expiry(expiry);
        }

        Closing::Normal {
            publish_will: disconnect.code == ReasonCode::DisconnectWithWill,
        }
    }

    /// 关闭连接
    /// * 服务端主动断开时先给客户端发送 DISCONNECT
    /// * 非正常断开时发布遗嘱消息
    /// * 解除会话绑定，持久化会话转为离线，否则终结
    async fn teardown(mut self, closing: Closing) {
        let ctx = self.ctx.clone();
        let reason = match &closing {
            Closing::Normal { .. } => None,
            Closing::Error(reason) => Some(reason.clone()),
        };
        let established = self.state == ConnState::Connected;

        if established && self.client.protocol == Protocol::V5 && !self.write_cancelled {
            if let Some(code) = reason.as_ref().and_then(CloseReason::disconnect_code) {
                let disconnect = Packet::Disconnect(Disconnect::new(code));
                match time::timeout(DISCONNECT_TIMEOUT, self.conn.write_packet(disconnect)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("write DISCONNECT to {} error: {}", self.client.peer, e),
                    Err(_) => debug!("write DISCONNECT to {} timeout", self.client.peer),
                }
            }
        }
        self.conn.close().await;

        match &reason {
            Some(reason) => info!(
                "client {} connection {} closed: {}",
                self.client.client_id, self.client.connection_id, reason
            ),
            None => info!(
                "client {} connection {} disconnected",
                self.client.client_id, self.client.connection_id
            ),
        }
        ctx.hooks.observer.on_closed(&self.client, reason.as_ref()).await;

        if !established {
            return;
        }

        let publish_will = match &closing {
            Closing::Normal { publish_will } => *publish_will,
            Closing::Error(_) => true,
        };
        if let Some(will) = self.will.take() {
            if publish_will {
                ctx.router.publish_will(&self.client.client_id, &will).await;
            }
        }

        let detach = Detach {
            conn_id: self.client.connection_id,
            reason: reason
                .as_ref()
                .map(CloseReason::session_reason)
                .unwrap_or(SessionTerminatedReason::NormalDisconnect),
            preserve: !matches!(reason, Some(CloseReason::Auth(_))),
            expiry_interval: self.session_expiry,
            inflight: std::mem::take(&mut self.inflight).into_values().collect(),
            received: std::mem::take(&mut self.received),
        };
        let kicked = ctx
            .sessions
            .detach(&self.client.client_id, &mut self.conn_rx, &mut self.kick_rx, detach)
            .await;

        // 通知等待断开的一方（接管的新连接或 kick）
        for done in self.kicked.drain(..).chain(kicked) {
            let _ = done.send(());
        }
    }
}

fn broker_stopped() -> CloseReason {
    CloseReason::Administrative("broker stopped".into())
}

async fn keep_alive_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
