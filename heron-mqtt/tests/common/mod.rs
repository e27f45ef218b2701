#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use heron_mqtt::{
    auth::AuthExchange,
    config::Config,
    error::CloseReason,
    network::{
        memory::{self, ClientEnd},
        packet::{
            Auth, ConnAck, Connect, LastWill, Packet, PubAck, Publish, QoS, ReasonCode, SubAck,
            Subscribe, SubscribeFilter, Unsubscribe,
        },
        TransportInfo,
    },
    protocol::{
        session::SessionTerminatedReason, subscription::Subscription, Client, DeliveryError,
        Message,
    },
    AcceptGate, AuthProvider, AuthResponse, Broker, HookError, Hooks, LifecycleObserver,
    PublishGate, SubscriptionGate,
};
use tokio::time::{self, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Accept(String),
    BasicAuth(String),
    EnhancedAuth(String),
    Auth(String, u32),
    ReAuth(String),
    Connected(String),
    SessionCreated(String),
    SessionResumed(String),
    Subscribe(String),
    Subscribed(String, String),
    Unsubscribe(String),
    Unsubscribed(String, String),
    MsgArrived(String, String),
    Publish(String, String),
    /// client, topic, payload
    Delivered(String, String, Bytes),
    Dropped(String, String, DeliveryError),
    WillPublish(String),
    WillPublished(String, String),
    Closed(String, Option<CloseReason>),
    SessionTerminated(String, SessionTerminatedReason),
    Stop,
}

/// 记录每一次回调，行为可以在测试中调整
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    pub accept: AtomicBool,
    pub allow_publish: AtomicBool,
    pub reject_arrived: AtomicBool,
    pub reject_subscribe: AtomicBool,
    pub reject_basic_auth: AtomicBool,
    /// 增强认证、重认证每一轮依次取出的回复
    auth_script: Mutex<VecDeque<Result<AuthResponse, HookError>>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
            allow_publish: AtomicBool::new(true),
            reject_arrived: AtomicBool::new(false),
            reject_subscribe: AtomicBool::new(false),
            reject_basic_auth: AtomicBool::new(false),
            auth_script: Mutex::new(VecDeque::new()),
        }
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count<F: Fn(&Event) -> bool>(&self, pred: F) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn script_auth(&self, responses: Vec<Result<AuthResponse, HookError>>) {
        self.auth_script.lock().unwrap().extend(responses);
    }

    /// 等到事件满足条件，超时则 panic
    pub async fn wait_for<F: Fn(&[Event]) -> bool>(&self, pred: F) {
        self.wait_for_within(Duration::from_secs(5), pred).await
    }

    pub async fn wait_for_within<F: Fn(&[Event]) -> bool>(&self, limit: Duration, pred: F) {
        let deadline = Instant::now() + limit;
        loop {
            if pred(&self.events()) {
                return;
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for events, got {:?}", self.events());
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_event(&self, event: Event) {
        self.wait_for(|events| events.contains(&event)).await
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn next_auth(&self) -> Result<AuthResponse, HookError> {
        self.auth_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(HookError::not_authorized("auth script exhausted")))
    }
}

#[async_trait]
impl AcceptGate for Recorder {
    async fn on_accept(&self, transport: &TransportInfo) -> bool {
        self.record(Event::Accept(transport.peer.clone()));
        self.accept.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for Recorder {
    async fn on_basic_auth(&self, client: &Client, _connect: &Connect) -> Result<(), HookError> {
        self.record(Event::BasicAuth(client.client_id.clone()));
        if self.reject_basic_auth.load(Ordering::SeqCst) {
            return Err(HookError::not_authorized("bad password"));
        }
        Ok(())
    }

    async fn on_enhanced_auth(
        &self,
        client: &Client,
        _connect: &Connect,
    ) -> Result<AuthResponse, HookError> {
        self.record(Event::EnhancedAuth(client.client_id.clone()));
        self.next_auth()
    }

    async fn on_auth(
        &self,
        client: &Client,
        exchange: &AuthExchange,
        _auth: &Auth,
    ) -> Result<AuthResponse, HookError> {
        self.record(Event::Auth(client.client_id.clone(), exchange.step));
        self.next_auth()
    }

    async fn on_re_auth(&self, client: &Client, _auth: &Auth) -> Result<AuthResponse, HookError> {
        self.record(Event::ReAuth(client.client_id.clone()));
        self.next_auth()
    }
}

#[async_trait]
impl SubscriptionGate for Recorder {
    async fn on_subscribe(&self, client: &Client, _req: &Subscribe) -> Result<(), HookError> {
        self.record(Event::Subscribe(client.client_id.clone()));
        if self.reject_subscribe.load(Ordering::SeqCst) {
            return Err(HookError::not_authorized("subscribe denied"));
        }
        Ok(())
    }

    async fn on_unsubscribe(&self, client: &Client, _req: &Unsubscribe) -> Result<(), HookError> {
        self.record(Event::Unsubscribe(client.client_id.clone()));
        Ok(())
    }
}

#[async_trait]
impl PublishGate for Recorder {
    async fn on_msg_arrived(&self, client: &Client, req: &Publish) -> Result<(), HookError> {
        self.record(Event::MsgArrived(client.client_id.clone(), req.topic.clone()));
        if self.reject_arrived.load(Ordering::SeqCst) {
            return Err(HookError::not_authorized("publish denied"));
        }
        Ok(())
    }

    async fn on_publish(&self, client: &Client, msg: &Message) -> bool {
        self.record(Event::Publish(client.client_id.clone(), msg.topic.clone()));
        self.allow_publish.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LifecycleObserver for Recorder {
    async fn on_connected(&self, client: &Client) {
        self.record(Event::Connected(client.client_id.clone()));
    }

    async fn on_session_created(&self, client: &Client) {
        self.record(Event::SessionCreated(client.client_id.clone()));
    }

    async fn on_session_resumed(&self, client: &Client) {
        self.record(Event::SessionResumed(client.client_id.clone()));
    }

    async fn on_subscribed(&self, client: &Client, subscription: &Subscription) {
        self.record(Event::Subscribed(
            client.client_id.clone(),
            subscription.topic_filter.clone(),
        ));
    }

    async fn on_unsubscribed(&self, client: &Client, topic_filter: &str) {
        self.record(Event::Unsubscribed(
            client.client_id.clone(),
            topic_filter.into(),
        ));
    }

    async fn on_delivered(&self, client: &Client, msg: &Message) {
        self.record(Event::Delivered(
            client.client_id.clone(),
            msg.topic.clone(),
            msg.payload.clone(),
        ));
    }

    async fn on_msg_dropped(&self, client_id: &str, msg: &Message, err: &DeliveryError) {
        self.record(Event::Dropped(client_id.into(), msg.topic.clone(), err.clone()));
    }

    async fn on_will_publish(&self, client_id: &str, _will: &LastWill) {
        self.record(Event::WillPublish(client_id.into()));
    }

    async fn on_will_published(&self, client_id: &str, msg: &Message) {
        self.record(Event::WillPublished(client_id.into(), msg.topic.clone()));
    }

    async fn on_closed(&self, client: &Client, err: Option<&CloseReason>) {
        self.record(Event::Closed(client.client_id.clone(), err.cloned()));
    }

    async fn on_session_terminated(&self, client_id: &str, reason: SessionTerminatedReason) {
        self.record(Event::SessionTerminated(client_id.into(), reason));
    }

    async fn on_stop(&self) {
        self.record(Event::Stop);
    }
}

pub fn config() -> Config {
    let mut cfg = Config::default();
    cfg.session.expiry_check_interval = 1;
    cfg
}

/// 构建一个所有回调都被记录的 broker
pub fn broker(cfg: Config) -> (Broker, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let broker = Broker::builder(cfg)
        .hooks(Hooks::all(recorder.clone()))
        .build();
    (broker, recorder)
}

/// 轮询直到条件成立，超时则 panic
pub async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        time::sleep(Duration::from_millis(10)).await;
    }
}

/// 等到客户端的连接从会话上解绑
pub async fn wait_offline(broker: &Broker, client_id: &str) {
    eventually("client offline", || !broker.is_connected(client_id)).await
}

/// 持久化会话的 CONNECT
pub fn persistent(client_id: &str, expiry: u32) -> Connect {
    let mut connect = Connect::new(client_id);
    connect.clean_start = false;
    connect.session_expiry_interval = expiry;
    connect
}

pub struct TestClient {
    end: ClientEnd,
}

impl TestClient {
    /// 建立传输连接，不发送任何报文
    pub async fn open(broker: &Broker, peer: &str) -> Option<TestClient> {
        let (transport, end) = memory::channel(64, peer);
        if broker.accept(transport).await {
            Some(TestClient { end })
        } else {
            None
        }
    }

    pub async fn connect(broker: &Broker, connect: Connect) -> (TestClient, ConnAck) {
        let peer = format!("memory-{}", connect.client_id);
        let mut client = TestClient::open(broker, &peer)
            .await
            .expect("connection rejected");
        client.send(Packet::Connect(connect)).await;
        match client.recv().await {
            Packet::ConnAck(ack) => (client, ack),
            packet => panic!("expect CONNACK, got {:?}", packet),
        }
    }

    /// 连接成功的客户端
    pub async fn online(broker: &Broker, connect: Connect) -> TestClient {
        let (client, ack) = TestClient::connect(broker, connect).await;
        assert_eq!(ack.code, ReasonCode::Success);
        client
    }

    pub async fn send(&self, packet: Packet) {
        self.end.send(packet).await.expect("send to broker");
    }

    pub async fn recv(&mut self) -> Packet {
        match time::timeout(TIMEOUT, self.end.recv()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => panic!("connection closed by broker"),
            Err(_) => panic!("timed out waiting for packet"),
        }
    }

    /// 在 limit 内收到的下一个报文，超时或连接关闭时返回 None
    pub async fn try_recv(&mut self, limit: Duration) -> Option<Packet> {
        time::timeout(limit, self.end.recv()).await.ok().flatten()
    }

    /// 等待 broker 关闭连接，返回关闭前收到的报文
    pub async fn closed(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        loop {
            match time::timeout(Duration::from_secs(5), self.end.recv()).await {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => return packets,
                Err(_) => panic!("connection not closed, got {:?}", packets),
            }
        }
    }

    pub async fn subscribe(&mut self, filter: &str, qos: QoS) -> SubAck {
        self.subscribe_with(vec![SubscribeFilter::new(filter, qos)]).await
    }

    pub async fn subscribe_with(&mut self, filters: Vec<SubscribeFilter>) -> SubAck {
        self.send(Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters,
        }))
        .await;
        match self.recv().await {
            Packet::SubAck(ack) => ack,
            packet => panic!("expect SUBACK, got {:?}", packet),
        }
    }

    /// 发布 qos1 消息并等待 puback
    pub async fn publish_qos1(&mut self, topic: &str, payload: &'static str, packet_id: u16) -> PubAck {
        let mut publish = Publish::new(topic, QoS::AtLeastOnce, payload);
        publish.packet_id = packet_id;
        self.send(Packet::Publish(publish)).await;
        match self.recv().await {
            Packet::PubAck(ack) => ack,
            packet => panic!("expect PUBACK, got {:?}", packet),
        }
    }

    pub async fn publish_qos0(&self, topic: &str, payload: &'static str) {
        self.send(Packet::Publish(Publish::new(topic, QoS::AtMostOnce, payload)))
            .await
    }

    pub async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            packet => panic!("expect PUBLISH, got {:?}", packet),
        }
    }

    /// 网络断开，不发送 DISCONNECT
    pub fn drop_connection(mut self) {
        self.end.close();
    }
}
