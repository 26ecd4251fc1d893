//! churnlens-core: point-in-time payment ledger, subscription lifecycle
//! classification and leakage-free churn feature tables.

pub mod calendar;
pub mod config;
pub mod cycle;
pub mod engine;
pub mod error;
pub mod event;
pub mod fact;
pub mod features;
pub mod lifecycle;
pub mod provider;
pub mod resolver;
pub mod rng;
pub mod scoring;
pub mod store;
pub mod synthetic;
pub mod training;
pub mod types;
pub mod versioning;
