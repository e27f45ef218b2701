use std::{
    collections::{hash_map::Entry, HashMap},
    fmt::Debug,
    sync::RwLock,
};

use crate::network::packet::SubscriptionOptions;

/// 一条订阅记录
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Subscription {
    pub client_id: String,
    pub topic_filter: String,
    pub options: SubscriptionOptions,
}

/// 订阅树
/// 每一层 filter 对应一个节点，订阅数据挂在 filter 最后一层的节点上
#[derive(Debug)]
pub struct SubscriptionTree<T: Debug> {
    /// 订阅树的根节点，是个空节点
    root: SubscriptionNode<T>,
}

impl<T: Debug> Default for SubscriptionTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug> SubscriptionTree<T> {
    pub fn new() -> Self {
        Self {
            root: SubscriptionNode::new(),
        }
    }

    /// 插入一个订阅记录，同一个 key 重复订阅同一个 filter 时替换旧数据并返回
    pub fn insert(&mut self, filter: &str, key: &str, data: T) -> Option<T> {
        let mut current_node = &mut self.root;
        for level in filter.split('/') {
            current_node = current_node
                .children
                .entry(level.into())
                .or_insert_with(SubscriptionNode::new);
        }

        current_node.data.insert(key.into(), data)
    }

    /// 删除订阅记录
    pub fn remove(&mut self, filter: &str, key: &str) -> Option<T> {
        self.root.remove(filter.split('/'), key)
    }

    /// 查找发布消息的主题匹配的记录
    pub fn matches(&self, topic: &str) -> Vec<(&str, &T)> {
        let levels = topic.split('/').collect::<Vec<&str>>();
        let mut matches = Vec::new();

        // 以 $ 开头的主题不参与第一层的通配符匹配
        if topic.starts_with('$') {
            if let Some((first, rest)) = levels.split_first() {
                if let Some(node) = self.root.children.get(*first) {
                    node.collect(rest, &mut matches);
                }
            }
        } else {
            self.root.collect(&levels, &mut matches);
        }

        matches
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }
}

/// 订阅树的节点
#[derive(Debug)]
struct SubscriptionNode<T: Debug> {
    /// 当前节点包含的数据，key = client_id
    data: HashMap<String, T>,
    /// 子节点 key = filter 的一层
    children: HashMap<String, SubscriptionNode<T>>,
}

impl<T: Debug> SubscriptionNode<T> {
    fn new() -> Self {
        Self {
            data: HashMap::new(),
            children: HashMap::new(),
        }
    }

    /// 收集子树中和 topic 剩余层级匹配的数据
    fn collect<'a>(&'a self, levels: &[&str], matches: &mut Vec<(&'a str, &'a T)>) {
        // # 匹配父级，"a/#" 同样匹配 "a"
        if let Some(node) = self.children.get("#") {
            matches.extend(node.data.iter().map(|(k, v)| (k.as_str(), v)));
        }

        match levels.split_first() {
            Some((level, rest)) => {
                if let Some(node) = self.children.get(*level) {
                    node.collect(rest, matches);
                }
                if let Some(node) = self.children.get("+") {
                    node.collect(rest, matches);
                }
            }
            // topic 层级用完了，当前节点的数据就是匹配的
            None => matches.extend(self.data.iter().map(|(k, v)| (k.as_str(), v))),
        }
    }

    /// 删除子树中对应的订阅
    fn remove<'a, I>(&mut self, mut filter_iter: I, key: &str) -> Option<T>
    where
        I: Iterator<Item = &'a str>,
    {
        match filter_iter.next() {
            // 有下一层，去子树里找
            Some(level) => {
                let node = self.children.get_mut(level)?;
                let removed = node.remove(filter_iter, key);
                // 子节点成为了叶子节点且数据为空，则删除这个子节点
                if node.children.is_empty() && node.data.is_empty() {
                    self.children.remove(level);
                }
                removed
            }
            // 没有下一层，截止到当前节点
            None => self.data.remove(key),
        }
    }
}

/// 全局订阅表，filter -> 订阅的客户端
///
/// 读（消息匹配）和写（订阅/取消订阅）都只在很短的临界区内持有锁，
/// 一次 SUBSCRIBE 中的所有 filter 在同一个写锁内生效
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    tree: RwLock<SubscriptionTree<SubscriptionOptions>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加订阅，返回每个 filter 是否替换了已有的订阅
    pub fn subscribe(&self, client_id: &str, filters: &[(String, SubscriptionOptions)]) -> Vec<bool> {
        let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
        filters
            .iter()
            .map(|(filter, options)| tree.insert(filter, client_id, *options).is_some())
            .collect()
    }

    /// 取消订阅，返回每个 filter 之前是否存在
    pub fn unsubscribe<S: AsRef<str>>(&self, client_id: &str, filters: &[S]) -> Vec<bool> {
        let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
        filters
            .iter()
            .map(|filter| tree.remove(filter.as_ref(), client_id).is_some())
            .collect()
    }

    /// 查找 topic 的所有订阅者
    ///
    /// 同一个客户端的多个订阅同时匹配时只投递一次，取最高的 QoS
    pub fn matches(&self, topic: &str) -> Vec<(String, SubscriptionOptions)> {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        let mut subscribers: HashMap<&str, SubscriptionOptions> = HashMap::new();
        for (client_id, options) in tree.matches(topic) {
            match subscribers.entry(client_id) {
                Entry::Occupied(mut entry) => {
                    let merged = entry.get_mut();
                    merged.qos = merged.qos.max(options.qos);
                    merged.no_local &= options.no_local;
                    merged.retain_as_published |= options.retain_as_published;
                }
                Entry::Vacant(entry) => {
                    entry.insert(*options);
                }
            }
        }

        subscribers
            .into_iter()
            .map(|(client_id, options)| (client_id.to_owned(), options))
            .collect()
    }
}
