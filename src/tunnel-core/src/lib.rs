//! # Tunnel Core
//!
//! Control core of the tunnel client: engine lifecycle, feedback upload and
//! the session-resumption plumbing around them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Host application                         │
//! │        Provider (notices, network, DNS, device binding)      │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 │ embed::start / stop          │ embed::start_send_feedback
//! ┌───────────────▼───────────────┐  ┌───────────▼──────────────┐
//! │       EngineCoordinator       │  │   FeedbackCoordinator    │
//! │  CallbackProxy ── Config      │  │  NetworkBinding ─ Config │
//! │  ImportTask ─┐                │  │  FeedbackUploader        │
//! │  TunnelEngine├─ CandidateStore│  │   (age seal + HTTP PUT)  │
//! │              └─ SessionCache  │  │                          │
//! └───────────────┬───────────────┘  └───────────┬──────────────┘
//!                 └────────────► NoticeSink ◄────┘
//! ```
//!
//! Session cryptography lives in the `tunnel-crypto` crate; this crate
//! stores and restores its records through [`session_cache::SessionCache`].

/// Bootstrap candidates, bundle import and exchange payloads
pub mod candidate;
/// Client configuration and data paths
pub mod config;
/// Engine lifecycle coordinator
pub mod controller;
/// Candidate and session-resumption datastore
pub mod datastore;
/// Blocking process-wide facade for foreign hosts
pub mod embed;
/// Tunnel engine seam
pub mod engine;
pub mod error;
/// Feedback upload coordinator and HTTP uploader
pub mod feedback;
pub mod memory;
/// JSON notice sink
pub mod notice;
/// Host capability traits and the callback proxy
pub mod provider;
pub mod session_cache;

pub use candidate::{Candidate, CandidateBundle, ExchangePayload};
pub use config::Config;
pub use controller::EngineCoordinator;
pub use datastore::{CandidateStore, DataStoreOpener, FileDataStore, FileDataStoreOpener};
pub use engine::{EngineContext, EngineFactory, TunnelEngine};
pub use error::{CoreError, Result};
pub use feedback::{
    FeedbackCompletionHandler, FeedbackCoordinator, FeedbackRequest, FeedbackUploader,
    HttpFeedbackUploader,
};
pub use notice::{NoticeSink, NoticeType};
pub use provider::{CallbackFlags, CallbackProxy, NetworkQuery, NoticeHandler, Provider};
pub use session_cache::{session_scope, SessionCache};
