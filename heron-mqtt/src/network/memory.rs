//! 进程内的传输实现
//!
//! 报文直接通过 channel 传递，不经过编解码。用于测试和嵌入式场景

use async_trait::async_trait;
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::{packet::Packet, Acceptor, Error, Transport, TransportInfo};

/// 服务端一侧
#[derive(Debug)]
pub struct MemoryTransport {
    rx: Receiver<Packet>,
    tx: Option<Sender<Packet>>,
    info: TransportInfo,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read_packet(&mut self) -> Result<Packet, Error> {
        self.rx.recv().await.ok_or(Error::ConnectionClosed)
    }

    async fn write_packet(&mut self, packet: Packet) -> Result<(), Error> {
        match &self.tx {
            Some(tx) => tx.send(packet).await.map_err(|_| Error::ConnectionClosed),
            None => Err(Error::ConnectionClosed),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    fn info(&self) -> TransportInfo {
        self.info.clone()
    }
}

/// 客户端一侧，drop 或者 close 即断开连接
#[derive(Debug)]
pub struct ClientEnd {
    tx: Option<Sender<Packet>>,
    rx: Receiver<Packet>,
}

impl ClientEnd {
    pub async fn send(&self, packet: Packet) -> Result<(), Error> {
        match &self.tx {
            Some(tx) => tx.send(packet).await.map_err(|_| Error::ConnectionClosed),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// 服务端关闭连接后返回 None
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// 不发送 DISCONNECT 直接断开，服务端视为网络异常
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// 创建一对相连的传输端点
pub fn channel(capacity: usize, peer: impl Into<String>) -> (MemoryTransport, ClientEnd) {
    let (client_tx, server_rx) = mpsc::channel(capacity.max(1));
    let (server_tx, client_rx) = mpsc::channel(capacity.max(1));

    let transport = MemoryTransport {
        rx: server_rx,
        tx: Some(server_tx),
        info: TransportInfo::new(peer),
    };
    let client = ClientEnd {
        tx: Some(client_tx),
        rx: client_rx,
    };
    (transport, client)
}

/// 客户端用来发起连接
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    tx: Sender<MemoryTransport>,
    capacity: usize,
}

impl MemoryConnector {
    pub async fn connect(&self, peer: impl Into<String>) -> Result<ClientEnd, Error> {
        let (transport, client) = channel(self.capacity, peer);
        self.tx
            .send(transport)
            .await
            .map_err(|_| Error::AcceptorClosed)?;
        Ok(client)
    }
}

/// broker 一侧的监听
#[derive(Debug)]
pub struct MemoryAcceptor {
    rx: Receiver<MemoryTransport>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    type Transport = MemoryTransport;

    async fn accept(&mut self) -> Result<MemoryTransport, Error> {
        self.rx.recv().await.ok_or(Error::AcceptorClosed)
    }
}

/// 创建一个进程内监听，capacity 同时作为每个连接的报文缓冲长度
pub fn listener(capacity: usize) -> (MemoryConnector, MemoryAcceptor) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MemoryConnector { tx, capacity }, MemoryAcceptor { rx })
}

#[cfg(test)]
mod tests {
    use crate::network::packet::Connect;

    use super::*;

    #[tokio::test]
    async fn packets_flow_both_ways() {
        let (mut server, mut client) = channel(4, "memory-1");
        assert_eq!(server.info().peer, "memory-1");

        client.send(Packet::PingReq).await.unwrap();
        assert_eq!(server.read_packet().await.unwrap(), Packet::PingReq);

        server.write_packet(Packet::PingResp).await.unwrap();
        assert_eq!(client.recv().await, Some(Packet::PingResp));
    }

    #[tokio::test]
    async fn client_close_ends_server_reads() {
        let (mut server, mut client) = channel(4, "memory-1");
        client.close();
        assert!(matches!(
            server.read_packet().await,
            Err(Error::ConnectionClosed)
        ));

        server.close().await;
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn listener_hands_out_transports() {
        let (connector, mut acceptor) = listener(4);
        let client = connector.connect("memory-2").await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        client
            .send(Packet::Connect(Connect::new("c1")))
            .await
            .unwrap();
        assert!(matches!(server.read_packet().await, Ok(Packet::Connect(_))));

        drop(connector);
        assert!(matches!(acceptor.accept().await, Err(Error::AcceptorClosed)));
    }
}
