use std::{error::Error, sync::Arc, time::Duration};

use bytes::Bytes;
use clap::Parser;
use demos::{EnvOverrides, LoggingHooks};
use flexi_logger::Logger;
use heron_mqtt::{
    network::{
        memory::{self, ClientEnd},
        packet::{Connect, LastWill, Packet, Publish, QoS, Subscribe, SubscribeFilter},
    },
    Broker, Hooks,
};
use log::{info, warn};
use tokio::time;

#[derive(Parser, Debug)]
#[clap(name = "standalone", about = "Run a heron-mqtt broker against in-memory clients")]
struct Args {
    /// 配置文件路径
    #[clap(short, long, default_value = "./standalone.toml")]
    config: String,

    /// 日志级别，覆盖配置文件和环境变量
    #[clap(short, long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    // 获取配置
    let (mut cfg, mut settings) = demos::load(&args.config).await?;
    EnvOverrides::from_env()?.apply(&mut cfg, &mut settings);
    if let Some(spec) = args.log {
        settings.log.spec = spec;
    }
    let _logger = Logger::try_with_str(&settings.log.spec)?.start()?;

    // 启动 broker
    let broker = Broker::builder(cfg)
        .hooks(Hooks::all(Arc::new(LoggingHooks)))
        .build();
    let (connector, acceptor) = memory::listener(64);
    let server = broker.clone();
    let accept_loop = tokio::spawn(async move { server.run(acceptor).await });

    // 订阅端
    let mut a = connector.connect("memory-a").await?;
    handshake(&mut a, Connect::new("A")).await?;
    a.send(Packet::Subscribe(Subscribe {
        packet_id: 1,
        filters: vec![SubscribeFilter::new("sensors/+/temp", QoS::AtLeastOnce)],
    }))
    .await?;
    expect(&mut a, "SUBACK").await?;

    // 发布端，带遗嘱
    let mut b = connector.connect("memory-b").await?;
    let mut connect = Connect::new("B");
    connect.will = Some(LastWill::new("sensors/B/status", "offline", QoS::AtLeastOnce));
    handshake(&mut b, connect).await?;

    let mut publish = Publish::new("sensors/3/temp", QoS::AtLeastOnce, Bytes::from_static(b"21.5"));
    publish.packet_id = 1;
    b.send(Packet::Publish(publish)).await?;
    expect(&mut b, "PUBACK").await?;

    match expect(&mut a, "PUBLISH").await? {
        Packet::Publish(publish) => info!(
            "A received {} on {}",
            String::from_utf8_lossy(&publish.payload),
            publish.topic
        ),
        packet => warn!("A received unexpected {}", packet.name()),
    }

    // B 网络异常断开，遗嘱不会匹配 A 的订阅
    b.close();
    time::sleep(Duration::from_millis(100)).await;

    broker.stop().await;
    accept_loop.await??;
    Ok(())
}

async fn handshake(client: &mut ClientEnd, connect: Connect) -> Result<(), Box<dyn Error>> {
    let client_id = connect.client_id.clone();
    client.send(Packet::Connect(connect)).await?;
    match expect(client, "CONNACK").await? {
        Packet::ConnAck(ack) if !ack.code.is_error() => {
            info!("{} connected", client_id);
            Ok(())
        }
        packet => Err(format!("{} connect failed: {:?}", client_id, packet).into()),
    }
}

/// 等待下一个报文，名称不符时报错
async fn expect(client: &mut ClientEnd, name: &str) -> Result<Packet, Box<dyn Error>> {
    let packet = time::timeout(Duration::from_secs(2), client.recv())
        .await?
        .ok_or("connection closed")?;
    if packet.name() != name {
        return Err(format!("expect {}, got {}", name, packet.name()).into());
    }
    Ok(packet)
}
