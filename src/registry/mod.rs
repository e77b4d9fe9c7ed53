//! Cell and account lookup.
//!
//! The engine never owns cell data; it talks to a [`CellRegistry`] behind
//! a trait so the in-memory implementation here can be swapped for a real
//! directory. A registry failure is surfaced to callers as 503 and never
//! retried inside the engine.

pub mod keys;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::token::{CellToken, RoleRef};

pub use memory::InMemoryRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("registry unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub name: String,
    /// Canonical URL, trailing slash included.
    pub url: String,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub username: String,
}

#[async_trait]
pub trait CellRegistry: Send + Sync {
    async fn get_cell(&self, name: &str) -> RegistryResult<Cell>;

    /// `Ok(None)` for an unknown account; `Err` only when the registry
    /// itself is unreachable.
    async fn get_account(&self, cell: &str, username: &str) -> RegistryResult<Option<Account>>;

    async fn authenticate(&self, cell: &str, username: &str, password: &str)
        -> RegistryResult<bool>;

    async fn roles_for_account(&self, cell: &str, username: &str) -> RegistryResult<Vec<RoleRef>>;

    /// Roles this cell grants the foreign subject of `token`, resolved
    /// through the cell's ext-cell mapping keyed by the token's issuer.
    async fn roles_here(&self, cell: &str, token: &CellToken) -> RegistryResult<Vec<RoleRef>>;
}
