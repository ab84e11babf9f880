//! tlsengine
//!
//! A sans-IO TLS 1.2 and DTLS 1.2 connection engine for constrained targets.
//!
//! The engine owns a fixed arena of connections and is driven from the outside:
//!
//! * [`Engine::tick`] runs every state machine once. Cryptography is never called
//!   directly, every step goes through a polled [`CryptoService`] job.
//! * [`Engine::rx_indication`] hands received wire bytes to a connection.
//! * [`Engine::tx_confirmation`] reports bytes the transport has flushed (stream only).
//! * [`Engine::send`] queues application data for protection and transmission.
//! * [`Engine::poll_output`] drains events and received application data.
//!
//! The ingress entry points are also available on the cloneable [`Ingress`] handle
//! so a receive context can feed data while the main loop owns the [`Engine`].
//!
//! Supported cipher suites are PSK and ECDHE-ECDSA with either AES-128-GCM or a
//! NULL cipher with HMAC integrity. See [`CipherSuite`].
//!
//! A [`SoftwareCryptoService`] backed by RustCrypto is included. It completes jobs
//! after a configurable number of polls to exercise the asynchronous paths.
#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod arena;
mod buffer;
mod config;
mod connection;
mod engine;
mod error;
mod handshake;
mod record;
mod timer;
mod txconfirm;
mod types;
mod window;

pub mod certificate;
pub mod crypto;

pub use config::{Config, ConfigBuilder, KeyResolver};
pub use crypto::{
    CryptoService, JobId, JobKind, JobOutput, JobPoll, JobRequest, KeyRef, SoftwareCryptoService,
    StreamMode,
};
pub use engine::{ConnectionId, Engine, Ingress, Output, Transport};
pub use error::{CryptoError, Error, TransportError};
pub use types::{
    AlertDescription, AlertLevel, CipherSuite, ConnectionState, ContentType, HandshakeType,
    MacAlgorithm, Role, State, TransportKind,
};
