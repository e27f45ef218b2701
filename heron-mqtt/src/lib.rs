//! 一个以钩子为中心的 mqtt v5 服务端库，用户可以使用此库构建自己的 mqtt broker
//!
//! 库本身不包含编解码和监听，传输层通过 [`network::Transport`] 接入，
//! 认证、授权和各种事件通知通过 [`hook`] 中的回调定制

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod hook;
pub mod network;
pub mod protocol;

pub use broker::{Broker, BrokerBuilder};
pub use hook::{
    AcceptGate, AuthProvider, AuthResponse, HookError, HookNoop, Hooks, LifecycleObserver,
    PublishGate, SubscriptionGate,
};
