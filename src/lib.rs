//! VMware performance and tag cache behind herakles-vmware-exporter.
//!
//! A background [`collector::Collector`] polls a [`source::VsphereSource`]
//! and publishes inventory, performance counter values and tags into a
//! [`cache::VmwareCache`], whose memory is one fixed-budget
//! [`arena::Arena`]. Every update is sized before it is written; an update
//! that does not fit is skipped and readers keep the previous generation.

pub mod arena;
pub mod cache;
pub mod catalog;
pub mod collector;
pub mod config;
pub mod error;
pub mod health_stats;
pub mod inventory;
pub mod perf;
pub mod source;
pub mod strpool;
pub mod tags;

pub use cache::VmwareCache;
pub use collector::{Collector, CollectorSettings};
pub use error::{CacheError, CollectorError, SourceError};

#[cfg(test)]
mod proptests;
