//! celltrust: per-cell token issuance, introspection and trust-chain
//! engine for a multi-tenant unit.

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod observability;
pub mod registry;
pub mod token;

pub use app::{build_router, AppState};
pub use config::UnitConfig;

#[cfg(test)]
pub(crate) mod test_support;
