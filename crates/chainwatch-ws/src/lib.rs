//! chainwatch-ws — WebSocket chain client for ChainWatch.
//!
//! # Features
//! - Substrate JSON-RPC over a single WebSocket per chain
//! - Multiplexed storage subscriptions (`state_subscribeStorage`), one
//!   value per requested slot on every tick
//! - No hidden reconnect: a dropped socket ends every subscription and the
//!   connection registry reconnects on demand

pub mod client;
pub mod error;
pub mod rpc;
pub mod subscriptions;

pub use client::{WsChainClient, WsClientConfig, WsClientFactory};
pub use error::WsError;
pub use subscriptions::SubscriptionManager;
