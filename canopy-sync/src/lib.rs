//! # canopy-sync — keeps a local UI tree in step with a server
//!
//! The server owns the truth and streams full trees and patches over a
//! WebSocket; this crate decodes them, applies them to an immutable tree
//! and sends user input back, debounced and in a safe order.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐  Frame / Status   ┌───────────────┐
//! │ ConnectionManager │ ────────────────▸ │    Session    │ ──▸ watch<View>
//! │ (reconnect loop)  │                   │  decode → apply│
//! └─────────▲─────────┘                   └──┬─────────┬──┘
//!           │ widget_event                   │         │
//! ┌─────────┴─────────┐                ┌─────▼───┐ ┌───▼──────────────┐
//! │  EventDispatcher  │ ◂── dispatch ── │ Offload │ │ NavigationRecon. │
//! │ (debounce, flush) │                │ (worker)│ │ (page cache)     │
//! └───────────────────┘                └─────────┘ └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages
//! - [`intern`] — `$def`/`$ref` token table, reset per connection
//! - [`decoder`] — frames → trees and op lists (compact and compressed)
//! - [`client`] — WebSocket connection with exponential backoff
//! - [`offload`] — patch application on a worker thread with timeout
//! - [`dispatch`] — debounced outbound events, flush before actions
//! - [`navigation`] — page cache, optimistic page switches, location sync
//! - [`session`] — the ordered pipeline tying it all together
//! - [`config`] — JSON-loadable configuration
//!
//! ## Quick start
//!
//! ```no_run
//! use canopy_sync::{session, MemoryLocation, SessionConfig};
//! use std::sync::Arc;
//!
//! # async fn start() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::for_origin("http://localhost:8501")?;
//! let (mut manager, mut session, events) =
//!     session::connect(&config, Arc::new(MemoryLocation::default()))?;
//! let mut view = session.view();
//!
//! manager.connect();
//! tokio::spawn(async move { session.run(events).await });
//! while view.changed().await.is_ok() {
//!     let _tree = view.borrow().tree.clone();
//! }
//! # Ok(())
//! # }
//! ```

pub mod protocol;
pub mod intern;
pub mod decoder;
pub mod client;
pub mod offload;
pub mod dispatch;
pub mod navigation;
pub mod session;
pub mod config;

// Re-exports for convenience
pub use protocol::{ApplicationError, InboundMessage, OutboundMessage, ProtocolError};
pub use intern::InternTable;
pub use decoder::{DecodeError, DecodeStats, Decoded, DecoderConfig, WireDecoder};
pub use client::{
    Backoff, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionHandle,
    ConnectionManager, ConnectionState, EventSink,
};
pub use offload::{OffloadConfig, OffloadStats, PatchExecutor, PatchOffloader, WorkerError};
pub use dispatch::{DispatchConfig, DispatchOptions, EventDispatcher};
pub use navigation::{
    LocationSync, MemoryLocation, NavigationConfig, NavigationReconciler, PageCache,
};
pub use session::{Session, SessionCommand, View};
pub use config::{ConfigError, SessionConfig};
