//! # chorus
//!
//! An extensible collaborative document sync server built on Y-CRDTs.
//!
//! Clients connect over WebSocket and multiplex per-document framed binary
//! messages: sync updates are merged into the shared document and fanned out
//! to every other attached client, awareness (cursors, presence) is relayed,
//! and a stateless side-channel carries application payloads. Every
//! lifecycle event runs through an ordered [`Extension`] pipeline that can
//! authenticate connections, load and store documents, and observe traffic.
//! Persistence is debounced per document and flushed when the last client
//! disconnects.
//!
//! ```no_run
//! use chorus::{Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(ServerOptions::default());
//!     server.configure().await.unwrap();
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3030").await.unwrap();
//!     server.started(listener.local_addr().unwrap()).await.unwrap();
//!     axum::serve(listener, server.router()).await.unwrap();
//! }
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod debounce;
pub mod document;
pub mod error;
pub mod extension;
pub mod message;
pub mod server;
pub mod trace_log;

pub use config::ServerOptions;
pub use connection::{CloseEvent, Connection};
pub use context::{
    CloseReason, ConnectionConfiguration, Context, RequestInfo, FORBIDDEN, NORMAL_CLOSURE,
    RESET_CONNECTION, UNAUTHORIZED,
};
pub use debounce::Debouncer;
pub use document::{Document, LoadState, UpdateEvent};
pub use error::{CodecError, HookChainError, HookError};
pub use extension::{Extension, HookResult, HttpResponse, LoadedState};
pub use message::{IncomingFrame, MessageKind, SyncPayload};
pub use server::{Server, ServerHandle, ServerStats};
pub use trace_log::{Direction, TraceLog};
