//! In-memory registry, used by the binary's bootstrap seeding and by
//! tests. Passwords are stored salted and hashed, never in the clear.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Account, Cell, CellRegistry, RegistryError, RegistryResult};
use crate::token::{CellToken, RoleRef};

struct AccountEntry {
    account: Account,
    salt: [u8; 16],
    password_hash: String,
    roles: Vec<RoleRef>,
}

struct CellEntry {
    cell: Cell,
    accounts: HashMap<String, AccountEntry>,
    /// Issuer cell URL -> roles granted to subjects that issuer vouches for.
    ext_grants: HashMap<String, Vec<RoleRef>>,
}

#[derive(Default)]
pub struct InMemoryRegistry {
    cells: RwLock<HashMap<String, CellEntry>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_cell(&self, name: &str, url: &str) {
        let mut cells = self.cells.write().await;
        cells.insert(
            name.to_string(),
            CellEntry {
                cell: Cell {
                    name: name.to_string(),
                    url: url.to_string(),
                    owner: None,
                },
                accounts: HashMap::new(),
                ext_grants: HashMap::new(),
            },
        );
    }

    pub async fn add_account(
        &self,
        cell: &str,
        username: &str,
        password: &str,
        roles: Vec<RoleRef>,
    ) -> RegistryResult<()> {
        let mut cells = self.cells.write().await;
        let entry = cells
            .get_mut(cell)
            .ok_or_else(|| RegistryError::NotFound(format!("cell {cell}")))?;
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        entry.accounts.insert(
            username.to_string(),
            AccountEntry {
                account: Account {
                    id: Uuid::new_v4().to_string(),
                    username: username.to_string(),
                },
                salt,
                password_hash: hash_password(&salt, password),
                roles,
            },
        );
        Ok(())
    }

    /// Grant local roles to subjects arriving with tokens minted by
    /// `issuer_url`.
    pub async fn grant_visitor_roles(
        &self,
        cell: &str,
        issuer_url: &str,
        roles: Vec<RoleRef>,
    ) -> RegistryResult<()> {
        let mut cells = self.cells.write().await;
        let entry = cells
            .get_mut(cell)
            .ok_or_else(|| RegistryError::NotFound(format!("cell {cell}")))?;
        entry.ext_grants.insert(issuer_url.to_string(), roles);
        Ok(())
    }
}

fn hash_password(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl CellRegistry for InMemoryRegistry {
    async fn get_cell(&self, name: &str) -> RegistryResult<Cell> {
        let cells = self.cells.read().await;
        cells
            .get(name)
            .map(|e| e.cell.clone())
            .ok_or_else(|| RegistryError::NotFound(format!("cell {name}")))
    }

    async fn get_account(&self, cell: &str, username: &str) -> RegistryResult<Option<Account>> {
        let cells = self.cells.read().await;
        let entry = cells
            .get(cell)
            .ok_or_else(|| RegistryError::NotFound(format!("cell {cell}")))?;
        Ok(entry.accounts.get(username).map(|a| a.account.clone()))
    }

    async fn authenticate(
        &self,
        cell: &str,
        username: &str,
        password: &str,
    ) -> RegistryResult<bool> {
        let cells = self.cells.read().await;
        let entry = cells
            .get(cell)
            .ok_or_else(|| RegistryError::NotFound(format!("cell {cell}")))?;
        Ok(entry
            .accounts
            .get(username)
            .map(|a| a.password_hash == hash_password(&a.salt, password))
            .unwrap_or(false))
    }

    async fn roles_for_account(&self, cell: &str, username: &str) -> RegistryResult<Vec<RoleRef>> {
        let cells = self.cells.read().await;
        let entry = cells
            .get(cell)
            .ok_or_else(|| RegistryError::NotFound(format!("cell {cell}")))?;
        Ok(entry
            .accounts
            .get(username)
            .map(|a| a.roles.clone())
            .unwrap_or_default())
    }

    async fn roles_here(&self, cell: &str, token: &CellToken) -> RegistryResult<Vec<RoleRef>> {
        let cells = self.cells.read().await;
        let entry = cells
            .get(cell)
            .ok_or_else(|| RegistryError::NotFound(format!("cell {cell}")))?;
        Ok(entry
            .ext_grants
            .get(&token.issuer)
            .cloned()
            .unwrap_or_default())
    }
}
