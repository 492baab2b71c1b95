//! HTTP endpoint handlers for the exporter.
//!
//! This module provides handlers for all HTTP endpoints:
//! - `/metrics`: Prometheus metrics endpoint
//! - `/health`: Health check endpoint
//! - `/entity/{type}/{id}`: One cached entity with its counters
//! - `/counter`: One scaled counter value
//! - `/tags`, `/tags/{type}/{id}`: Cached tags
//! - `/inventory`, `/inventory/{type}/{id}`: Inventory snapshot
//! - `/dump`, `/memory`: Cache diagnostics
//! - `/doc`: Documentation endpoint

pub mod diagnostics;
pub mod doc;
pub mod entity;
pub mod health;
pub mod inventory;
pub mod metrics;
pub mod tags;

// Re-export handlers
pub use diagnostics::{dump_handler, memory_handler};
pub use doc::doc_handler;
pub use entity::{counter_handler, entity_handler};
pub use health::health_handler;
pub use inventory::{inventory_handler, object_handler};
pub use metrics::metrics_handler;
pub use tags::{entity_tags_handler, tags_handler};
