//! BetterBot Client Library
//!
//! Turns the backend's live signal stream, its REST polling endpoints and its
//! published run artifacts into one consistent in-memory state for a UI.
//!
//! - [`signals`]: reconciliation store (dedup, context arbitration, retention)
//! - [`ingest`]: stream coalescing buffer, WebSocket client, REST poller
//! - [`certified`]: artifact cache, validators and the fail-closed loader
//! - [`api`]: REST client and the traits the layers above are written against

pub mod api;
pub mod certified;
pub mod config;
pub mod ingest;
pub mod models;
pub mod signals;
pub mod telemetry;

pub use config::ClientConfig;
pub use models::{ConnectionStatus, Signal, SignalContextUpdate, SignalStats, SignalType, StreamEvent};
pub use signals::SignalStore;
