//! Storage backends for the index

pub mod memory;
pub mod postgres;

pub use memory::{IndexState, MemoryStore, MemoryTxn};
pub use postgres::{PgStore, PgTxn, CURSOR_ROW_ID};
