//! Configurable document workflow engine
//!
//! Tenants define their own status graphs per document type; transitions are
//! gated by role authorization and optional approval quorums, and every
//! committed or rejected attempt lands in an append-only history ledger.

pub mod actions;
pub mod approval;
pub mod authorize;
pub mod definition;
pub mod engine;
pub mod error;
pub mod graph;
pub mod history;
pub mod instance;
pub mod timestamp;
pub mod utils;
