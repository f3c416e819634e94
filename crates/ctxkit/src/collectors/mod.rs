//! The three memory sources a prompt is rebuilt from.
//!
//! - [`static_index`]: code knowledge, chunked and searchable.
//! - [`dynamic`]: live environment state.
//! - [`temporal`]: session memory.

pub mod dynamic;
pub mod static_index;
pub mod temporal;

pub use dynamic::{DynamicConfig, DynamicContextCollector, DynamicState};
pub use static_index::{RetrievalStrategy, SearchResult, StaticContextCollector, StaticIndexConfig};
pub use temporal::{FrustrationConfig, TemporalConfig, TemporalContextCollector, TemporalState};
