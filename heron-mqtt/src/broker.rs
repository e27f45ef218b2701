use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use futures::future::join_all;
use log::{debug, info};
use tokio::{select, sync::watch, task::JoinHandle, time};

use crate::{
    auth::Authenticator,
    config::Config,
    error::{CloseReason, Error},
    hook::Hooks,
    network::{self, Acceptor, Transport},
    protocol::{
        alias::{FifoAliasFactory, TopicAliasFactory},
        persist::SessionStore,
        router::Router,
        session::SessionManager,
        subscription::{Subscription, SubscriptionRegistry},
    },
};

/// 所有连接共享的 broker 状态
pub(crate) struct Context {
    pub(crate) cfg: Config,
    pub(crate) hooks: Hooks,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) router: Router,
    pub(crate) authenticator: Authenticator,
    pub(crate) alias_factory: Arc<dyn TopicAliasFactory>,
    /// broker 停止时变为 true
    pub(crate) shutdown: watch::Receiver<bool>,
}

pub struct BrokerBuilder {
    cfg: Config,
    hooks: Hooks,
    store: Option<Arc<dyn SessionStore>>,
    alias_factory: Arc<dyn TopicAliasFactory>,
}

impl BrokerBuilder {
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// 持久化会话的存储，不设置时会话只保存在内存中
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn alias_factory(mut self, factory: Arc<dyn TopicAliasFactory>) -> Self {
        self.alias_factory = factory;
        self
    }

    /// 构建 broker，会启动过期会话的清理任务，必须在 tokio 运行时中调用
    pub fn build(self) -> Broker {
        let BrokerBuilder {
            cfg,
            hooks,
            store,
            alias_factory,
        } = self;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(SubscriptionRegistry::new());
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            store,
            hooks.observer.clone(),
            cfg.session.max_offline_messages,
        ));
        let router = Router::new(
            registry.clone(),
            sessions.clone(),
            hooks.clone(),
            cfg.broker.retain_available,
        );
        let authenticator = Authenticator::new(hooks.auth.clone(), cfg.broker.max_auth_rounds);

        // 过期会话清理后台协程
        let sweeper = {
            let sessions = sessions.clone();
            let mut shutdown = shutdown_rx.clone();
            let mut ticker = time::interval(cfg.session.expiry_check_interval());
            tokio::spawn(async move {
                debug!("start session expiry sweeper");
                loop {
                    select! {
                        _ = ticker.tick() => sessions.sweep_expired().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let ctx = Context {
            cfg,
            hooks,
            registry,
            sessions,
            router,
            authenticator,
            alias_factory,
            shutdown: shutdown_rx,
        };

        Broker {
            ctx: Arc::new(ctx),
            shutdown: Arc::new(shutdown_tx),
            workers: Arc::new(Mutex::new(vec![sweeper])),
            next_id: Arc::new(AtomicU64::new(1)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// 代表一个 mqtt 节点
///
/// clone 出来的实例共享同一个 broker
#[derive(Clone)]
pub struct Broker {
    ctx: Arc<Context>,
    shutdown: Arc<watch::Sender<bool>>,
    /// 每个连接一个协程，停止时等待它们全部退出
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
}

impl Broker {
    /// 使用默认钩子构建 broker，必须在 tokio 运行时中调用
    pub fn new(cfg: Config) -> Self {
        Self::builder(cfg).build()
    }

    pub fn builder(cfg: Config) -> BrokerBuilder {
        BrokerBuilder {
            cfg,
            hooks: Hooks::default(),
            store: None,
            alias_factory: Arc::new(FifoAliasFactory),
        }
    }

    /// 接入一个传输连接，on_accept 拒绝或 broker 已停止时返回 false
    pub async fn accept<T: Transport>(&self, mut transport: T) -> bool {
        let info = transport.info();
        if self.stopped.load(Ordering::SeqCst) {
            debug!("broker stopped, close connection from {}", info);
            transport.close().await;
            return false;
        }
        if !self.ctx.hooks.accept.on_accept(&info).await {
            info!("connection from {} rejected by hook", info);
            transport.close().await;
            return false;
        }

        // stop 在同一把锁下取走 workers，检查和登记必须在锁内一起完成
        let rejected = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            if self.stopped.load(Ordering::SeqCst) {
                Some(transport)
            } else {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                info!("new connection {} from {}", id, info);
                workers.retain(|worker| !worker.is_finished());
                workers.push(tokio::spawn(network::serve(
                    self.ctx.clone(),
                    Box::new(transport),
                    id,
                )));
                None
            }
        };
        if let Some(mut transport) = rejected {
            debug!("broker stopped, close connection from {}", info);
            transport.close().await;
            return false;
        }
        true
    }

    /// 不断从 acceptor 获取连接，直到 broker 停止
    pub async fn run<A: Acceptor>(&self, mut acceptor: A) -> Result<(), Error> {
        let mut shutdown = self.ctx.shutdown.clone();
        debug!("start client accept loop");
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            select! {
                accepted = acceptor.accept() => {
                    let transport = accepted?;
                    self.accept(transport).await;
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// 踢客户端下线，客户端不在线时返回 false
    pub async fn kick(&self, client_id: &str) -> bool {
        info!("kick client {}", client_id);
        self.ctx
            .sessions
            .kick(client_id, CloseReason::Administrative("kicked".into()))
            .await
    }

    /// 停止 broker：断开所有连接，等待连接协程退出
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("broker stopping");
        let _ = self.shutdown.send(true);

        // 之后 accept 在锁内一定能看到 stopped
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        join_all(workers).await;

        self.ctx.hooks.observer.on_stop().await;
        info!("broker stopped");
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.ctx.sessions.is_connected(client_id)
    }

    /// 在线和离线的会话总数
    pub fn session_count(&self) -> usize {
        self.ctx.sessions.len()
    }

    pub fn subscriptions_of(&self, client_id: &str) -> Vec<Subscription> {
        self.ctx.sessions.subscriptions(client_id)
    }

    pub fn retained_count(&self) -> usize {
        self.ctx.router.retained_count()
    }
}
