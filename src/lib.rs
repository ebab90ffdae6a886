//! Out-of-process module binding for a message broker / gateway.
//!
//! A module normally runs in-process and is driven directly by the broker.
//! This crate lets it run in a separate OS process instead: [`proxy`] is the
//! in-process half presenting the usual module contract to the broker,
//! [`host`] is the out-of-process half embedding the real [`host::Module`].
//! The two halves exchange control directives and data messages over a pair
//! of [`transport`] sockets using the [`wire`] codec.

pub mod broker;
pub mod error;
pub mod host;
pub mod logging;
pub mod proxy;
pub mod queue;
pub mod transport;
pub mod wire;

pub use broker::{Broker, GatewayMessage};
pub use host::{HostConfig, HostHandle, Module};
pub use proxy::{LifecycleMode, ProxyConfig, ProxyHandle};

/// The gateway message format version this crate speaks. Carried in every
/// `ModuleCreate` frame; the Host rejects a mismatch rather than attempting
/// any negotiation (§3 non-goals: "versioning/negotiation of the module ABI
/// beyond a single major version check").
pub const GATEWAY_MESSAGE_VERSION: u8 = 1;
