//! Digest Enrich: admission control and resilience for costly post enrichment.

pub mod admission;
pub mod clock;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod provider;
pub mod store;
