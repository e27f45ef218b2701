//! 主题别名
//!
//! 别名只在一个连接的生命周期内有效，每个连接由 [`TopicAliasFactory`] 创建一个解析器：
//! * 入方向：客户端在 PUBLISH 中携带别名，服务端记录并解析
//! * 出方向：服务端给客户端发送消息时分配别名，超过客户端允许的数量后按 FIFO 淘汰

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AliasError {
    #[error("topic alias 0 is not allowed")]
    Zero,
    #[error("topic alias {alias} exceeds maximum {max}")]
    ExceedsMax { alias: u16, max: u16 },
    #[error("unknown topic alias {0}")]
    Unknown(u16),
}

/// 出方向分配的别名
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundAlias {
    pub alias: u16,
    /// 客户端是否已经知道这个别名，知道时报文中可以省略 topic
    pub known: bool,
}

pub trait TopicAliasResolver: Send + 'static {
    /// 解析客户端发来的别名，topic 非空时建立（或更新）映射
    fn resolve_inbound(&mut self, alias: u16, topic: &str) -> Result<String, AliasError>;

    /// 给发往客户端的 topic 分配别名，客户端不接受别名时返回 None
    fn assign_outbound(&mut self, topic: &str) -> Option<OutboundAlias>;
}

pub trait TopicAliasFactory: Send + Sync + 'static {
    /// inbound_max 为服务端允许的最大值，outbound_max 为客户端 CONNECT 中声明的最大值
    fn create(&self, inbound_max: u16, outbound_max: u16) -> Box<dyn TopicAliasResolver>;
}

#[derive(Debug, Default)]
pub struct FifoAliasFactory;

impl TopicAliasFactory for FifoAliasFactory {
    fn create(&self, inbound_max: u16, outbound_max: u16) -> Box<dyn TopicAliasResolver> {
        Box::new(FifoAliasResolver::new(inbound_max, outbound_max))
    }
}

#[derive(Debug)]
pub struct FifoAliasResolver {
    inbound: HashMap<u16, String>,
    inbound_max: u16,
    /// topic -> alias
    outbound: HashMap<String, u16>,
    /// 出方向别名的分配顺序，队头最先被淘汰
    order: VecDeque<String>,
    outbound_max: u16,
}

impl FifoAliasResolver {
    pub fn new(inbound_max: u16, outbound_max: u16) -> Self {
        Self {
            inbound: HashMap::new(),
            inbound_max,
            outbound: HashMap::new(),
            order: VecDeque::new(),
            outbound_max,
        }
    }
}

impl TopicAliasResolver for FifoAliasResolver {
    fn resolve_inbound(&mut self, alias: u16, topic: &str) -> Result<String, AliasError> {
        if alias == 0 {
            return Err(AliasError::Zero);
        }
        if alias > self.inbound_max {
            return Err(AliasError::ExceedsMax {
                alias,
                max: self.inbound_max,
            });
        }

        if topic.is_empty() {
            self.inbound
                .get(&alias)
                .cloned()
                .ok_or(AliasError::Unknown(alias))
        } else {
            self.inbound.insert(alias, topic.into());
            Ok(topic.into())
        }
    }

    fn assign_outbound(&mut self, topic: &str) -> Option<OutboundAlias> {
        if self.outbound_max == 0 {
            return None;
        }
        if let Some(alias) = self.outbound.get(topic) {
            return Some(OutboundAlias {
                alias: *alias,
                known: true,
            });
        }

        let alias = if self.outbound.len() < self.outbound_max as usize {
            self.outbound.len() as u16 + 1
        } else {
            // 淘汰最早分配的别名，复用它的编号
            let oldest = self.order.pop_front()?;
            self.outbound.remove(&oldest)?
        };
        self.outbound.insert(topic.into(), alias);
        self.order.push_back(topic.into());

        Some(OutboundAlias {
            alias,
            known: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_alias_lifecycle() {
        let mut resolver = FifoAliasResolver::new(2, 0);

        assert_eq!(resolver.resolve_inbound(1, "a/b").unwrap(), "a/b");
        assert_eq!(resolver.resolve_inbound(1, "").unwrap(), "a/b");
        assert_eq!(resolver.resolve_inbound(1, "c/d").unwrap(), "c/d");
        assert_eq!(resolver.resolve_inbound(1, "").unwrap(), "c/d");

        assert_eq!(resolver.resolve_inbound(2, ""), Err(AliasError::Unknown(2)));
        assert_eq!(resolver.resolve_inbound(0, "a"), Err(AliasError::Zero));
        assert_eq!(
            resolver.resolve_inbound(3, "a"),
            Err(AliasError::ExceedsMax { alias: 3, max: 2 })
        );
    }

    #[test]
    fn outbound_disabled_when_client_max_is_zero() {
        let mut resolver = FifoAliasResolver::new(10, 0);
        assert_eq!(resolver.assign_outbound("a/b"), None);
    }

    #[test]
    fn outbound_fifo_eviction() {
        let mut resolver = FifoAliasResolver::new(0, 2);

        let a = resolver.assign_outbound("a").unwrap();
        let b = resolver.assign_outbound("b").unwrap();
        assert_eq!((a.alias, a.known), (1, false));
        assert_eq!((b.alias, b.known), (2, false));
        assert!(resolver.assign_outbound("a").unwrap().known);

        // 淘汰 a，复用别名 1
        let c = resolver.assign_outbound("c").unwrap();
        assert_eq!((c.alias, c.known), (1, false));
        assert_eq!(resolver.assign_outbound("a").unwrap().alias, 2);
    }
}
