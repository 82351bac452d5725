//! Micronets WebSocket meetup proxy
//!
//! Pairs two mutually-authenticated WebSocket clients that connect with the
//! same meetup ID and relays every frame between them:
//!
//! - mTLS listener and URL routing (`server`, `tls`, `identity`)
//! - hello handshake validation (`hello`)
//! - meetup pairing (`registry`)
//! - per-session relay, writer and keepalive tasks (`session`, `relay`, `keepalive`)
//! - counters and registry reports (`metrics`, `report`)

pub mod config;
pub mod error;
pub mod hello;
pub mod identity;
pub mod keepalive;
pub mod metrics;
pub mod registry;
mod relay;
pub mod report;
pub mod server;
pub mod session;
pub mod tls;

pub use config::{Config, ConfigError};
pub use error::ProxyError;
pub use keepalive::KeepaliveConfig;
pub use registry::{Attachment, MeetupRegistry, RejectReason};
pub use server::{ProxyServer, ProxySettings, ProxyState};
pub use session::{CloseRequest, Session, SessionHandle, SessionInfo, SessionState};
