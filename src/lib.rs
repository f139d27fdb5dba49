//! Material request and inventory workflow engine
//!
//! The core of an institutional store: an append-only inventory ledger, a
//! role-gated request lifecycle with stock reservation, goods receipts and
//! stocktake reconciliation. [`service::StoreService`] is the entry point
//! for callers; data lives in an embedded sled database supplied by the
//! host application.

pub mod error;
pub mod ledger;
pub mod material;
pub mod report;
pub mod request;
pub mod service;
pub mod stocktake;
pub mod timestamp;
pub mod utils;
