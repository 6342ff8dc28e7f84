//! # Survey Core
//!
//! Core types, record decoding, and strategy traits for the survey firehose
//! indexer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │    Frame    │────►│  Envelope / │────►│  EventBody  │────►│ IndexStore  │
//! │ (raw JSON)  │     │ StreamEvent │     │  (decoded)  │     │  Strategy   │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!                                                                   │
//!                                                             ┌─────┴─────┐
//!                                                             │  Cursor   │
//!                                                             │    row    │
//!                                                             └───────────┘
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod model;
pub mod record;
pub mod slug;
pub mod strategy;

pub use crate::config::*;
pub use crate::error::*;
pub use crate::message::*;
pub use crate::metrics::*;
pub use crate::model::*;
pub use crate::record::*;
pub use crate::strategy::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::IndexerConfig;
    pub use crate::error::{DecodeError, IndexerError, Result};
    pub use crate::message::{Collection, Envelope, Frame, Operation, StreamEvent};
    pub use crate::record::{decode_event, EventBody};
    pub use crate::strategy::{FeedConnector, HealthCheck, IndexStore, IndexTxn};
}
