//! portside: an embeddable HTTP/WebSocket server.
//!
//! The crate is organized around the connection lifecycle: a dedicated
//! acceptor task feeds per-connection worker tasks, each of which drives a
//! read-parse-dispatch-write loop with keep-alive budgeting; a periodic
//! sweeper force-closes sessions whose read has been pending too long; a
//! WebSocket upgrade hands the transport to a new session exactly once.
//!
//! Features:
//! - task-per-connection request loop with keep-alive budgeting
//! - idle-read sweeper reaping stalled connections
//! - WebSocket upgrade with exactly-once transport hand-off
//! - live session counts, high-water marks and acceptance rates
//! - pluggable session establishment for transport wrapping

pub mod config;
pub mod error;
pub mod http;
mod lifecycle;
pub mod metrics;
mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod websocket;

pub use config::{Config, ServerConfig};
pub use error::{ServerError, SessionError};
pub use http::{Method, Request, Response};
pub use metrics::MetricsReport;
pub use router::{Route, RouteTable, Router};
pub use server::Server;
pub use session::{Session, SessionConfig, SessionFactory, TcpSessionFactory};
pub use websocket::{WebSocketSession, WebSocketUpgradeResponse};
