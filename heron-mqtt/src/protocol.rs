//! 协议层
//! 处理会话、订阅、消息路由等协议相关的逻辑，不关心网络读写

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{
    error::CloseReason,
    network::packet::{LastWill, Protocol, Publish, PublishProperties, QoS},
};

pub use router::DeliveryError;

pub mod alias;
pub mod persist;
pub(crate) mod router;
pub mod session;
pub mod subscription;

/// 连接 id（服务端分配）
pub type ConnectionId = u64;

/// 交给钩子函数的客户端信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// 连接 id（服务端分配）
    pub connection_id: ConnectionId,
    /// 客户端 id，CONNECT 之前为空
    pub client_id: String,
    pub username: Option<String>,
    /// 传输层给出的对端描述
    pub peer: String,
    pub protocol: Protocol,
}

impl Client {
    pub(crate) fn anonymous(connection_id: ConnectionId, peer: String) -> Self {
        Self {
            connection_id,
            client_id: String::new(),
            username: None,
            peer,
            protocol: Protocol::V5,
        }
    }
}

/// 路由中流转的消息
///
/// 发布之后不可变，每个接收者拿到的都是自己的一份拷贝
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: PublishProperties,
    /// 发布者的 client id
    pub publisher: Option<String>,
    /// 是否是遗嘱消息
    pub will: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            properties: PublishProperties::default(),
            publisher: None,
            will: false,
        }
    }

    pub(crate) fn from_publish(publish: &Publish, publisher: &str) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
            properties: publish.properties.clone(),
            publisher: Some(publisher.into()),
            will: false,
        }
    }

    pub(crate) fn from_will(will: &LastWill, client_id: &str) -> Self {
        Self {
            topic: will.topic.clone(),
            payload: will.payload.clone(),
            qos: will.qos,
            retain: will.retain,
            properties: will.properties.clone(),
            publisher: Some(client_id.into()),
            will: true,
        }
    }

    pub(crate) fn to_publish(&self, packet_id: u16) -> Publish {
        Publish {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id,
            payload: self.payload.clone(),
            topic_alias: None,
            properties: self.properties.clone(),
        }
    }
}

/// 要求连接断开，断开完成后通过 done 通知
///
/// 与投递消息走不同的 channel，连接阻塞在写报文上时也能收到
#[derive(Debug)]
pub(crate) struct Kick {
    pub(crate) reason: CloseReason,
    pub(crate) done: oneshot::Sender<()>,
}
