use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use log::{debug, info, warn};

use crate::{
    hook::Hooks,
    network::{
        packet::{LastWill, SubscriptionOptions},
        topic,
    },
};

use super::{session::SessionManager, subscription::SubscriptionRegistry, Client, Message};

/// 消息没能投递给某个接收者的原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("recipient session not found")]
    RecipientGone,
    #[error("outgoing queue is full")]
    QueueFull,
    #[error("offline queue is full")]
    OfflineQueueFull,
    #[error("QoS 0 message is not queued for an offline client")]
    Offline,
    #[error("connection closed before delivery")]
    ConnectionClosed,
    #[error("session terminated before delivery")]
    SessionTerminated,
    #[error("write to transport failed: {0}")]
    Transport(String),
}

/// 一次发布的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PublishOutcome {
    /// on_publish 钩子拦截了这条消息
    Suppressed,
    /// 成功放入了多少个接收者的队列
    Routed(usize),
}

/// 处理消息路由
///
/// QoS0：发送端 和 接受端 均不保存数据
/// QoS1：发送端 保存数据，接受端 不保存
/// QoS2：发送端 和 接受端 均保存数据
///
/// router 只负责把消息放到接收者的队列中，等待确认由各个连接自己处理
pub(crate) struct Router {
    registry: Arc<SubscriptionRegistry>,
    sessions: Arc<SessionManager>,
    hooks: Hooks,
    /// 保留消息，key = topic
    retains: RwLock<HashMap<String, Message>>,
    retain_available: bool,
}

impl Router {
    pub(crate) fn new(
        registry: Arc<SubscriptionRegistry>,
        sessions: Arc<SessionManager>,
        hooks: Hooks,
        retain_available: bool,
    ) -> Self {
        Self {
            registry,
            sessions,
            hooks,
            retains: RwLock::new(HashMap::new()),
            retain_available,
        }
    }

    /// 发布客户端的消息
    pub(crate) async fn publish(&self, client: &Client, message: Message) -> PublishOutcome {
        if !self.hooks.publish.on_publish(client, &message).await {
            info!(
                "client {} publish to {} suppressed by hook",
                client.client_id, message.topic
            );
            return PublishOutcome::Suppressed;
        }

        PublishOutcome::Routed(self.route(message).await)
    }

    /// 发布遗嘱消息，不经过 on_publish 检查
    pub(crate) async fn publish_will(&self, client_id: &str, will: &LastWill) {
        let observer = &self.hooks.observer;
        observer.on_will_publish(client_id, will).await;

        let message = Message::from_will(will, client_id);
        let routed = self.route(message.clone()).await;
        debug!("will of client {} routed to {} subscribers", client_id, routed);

        observer.on_will_published(client_id, &message).await;
    }

    /// 给新订阅的 filter 发送匹配的保留消息
    pub(crate) async fn deliver_retained(
        &self,
        client_id: &str,
        filters: &[(String, SubscriptionOptions)],
    ) {
        let matched = {
            let retains = self.retains.read().unwrap_or_else(|e| e.into_inner());
            let mut matched = Vec::new();
            for (filter, options) in filters {
                for message in retains.values() {
                    if topic::matches(&message.topic, filter) {
                        matched.push((message.clone(), *options));
                    }
                }
            }
            matched
        };

        for (message, options) in matched {
            let dispatched =
                self.sessions
                    .dispatch(&message, vec![(client_id.to_owned(), options)], true);
            self.report_dropped(dispatched.dropped).await;
        }
    }

    async fn route(&self, message: Message) -> usize {
        if message.retain && self.retain_available {
            self.retain(&message);
        }

        let targets = self.registry.matches(&message.topic);
        let dispatched = self.sessions.dispatch(&message, targets, false);
        // 离线队列落盘之后才算发布完成
        self.sessions.persist(&dispatched.suspended).await;
        self.report_dropped(dispatched.dropped).await;
        dispatched.delivered
    }

    /// payload 为空的保留消息用于清除该主题的保留消息
    fn retain(&self, message: &Message) {
        let mut retains = self.retains.write().unwrap_or_else(|e| e.into_inner());
        if message.payload.is_empty() {
            retains.remove(&message.topic);
        } else {
            let mut retained = message.clone();
            retained.will = false;
            retains.insert(message.topic.clone(), retained);
        }
    }

    async fn report_dropped(&self, dropped: Vec<(String, Message, DeliveryError)>) {
        for (client_id, message, err) in dropped {
            warn!(
                "drop message on {} for client {}: {}",
                message.topic, client_id, err
            );
            self.hooks
                .observer
                .on_msg_dropped(&client_id, &message, &err)
                .await;
        }
    }

    pub(crate) fn retained_count(&self) -> usize {
        self.retains.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
