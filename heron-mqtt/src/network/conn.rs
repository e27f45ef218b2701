use std::time::Duration;

use log::debug;
use tokio::time;

use crate::error::CloseReason;

use super::{
    packet::{Connect, Packet, ReasonCode},
    Error, Transport,
};

/// 客户端与服务器之间的连接
/// 在传输层之上以 packet 为单位读写，按配置打印收发的报文
pub(crate) struct Connection {
    transport: Box<dyn Transport>,
    peer: String,
    dump: bool,
}

impl Connection {
    pub(crate) fn new(transport: Box<dyn Transport>, dump: bool) -> Self {
        let peer = transport.info().peer;
        Self {
            transport,
            peer,
            dump,
        }
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    /// 读取一个 packet，取消是安全的
    pub(crate) async fn read_packet(&mut self) -> Result<Packet, Error> {
        let packet = self.transport.read_packet().await?;
        if self.dump {
            debug!("{} -> {:?}", self.peer, packet);
        }
        Ok(packet)
    }

    /// 读取第一个报文，必须是 connect 报文
    pub(crate) async fn read_connect(&mut self, timeout: Duration) -> Result<Connect, CloseReason> {
        match time::timeout(timeout, self.read_packet()).await {
            Ok(Ok(Packet::Connect(connect))) => Ok(connect),
            Ok(Ok(packet)) => Err(CloseReason::protocol(
                ReasonCode::ProtocolError,
                format!("first packet is {}, not CONNECT", packet.name()),
            )),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CloseReason::protocol(
                ReasonCode::MaximumConnectTime,
                "wait for CONNECT timeout",
            )),
        }
    }

    pub(crate) async fn write_packet(&mut self, packet: Packet) -> Result<(), Error> {
        if self.dump {
            debug!("{} <- {:?}", self.peer, packet);
        }
        self.transport.write_packet(packet).await
    }

    pub(crate) async fn close(&mut self) {
        self.transport.close().await
    }
}
