//! Account and target persistence.
//!
//! The engine only needs six operations, so persistence is a trait. The
//! in-memory implementation backs tests and the fixture-driven dry run;
//! a database-backed store lives outside this crate.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{Account, Target};

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<Account>>;
    async fn get_account(&self, id: &str) -> Result<Account>;
    async fn upsert_account(&self, account: &Account) -> Result<()>;
    async fn list_enabled_targets(&self) -> Result<Vec<Target>>;
    async fn get_target(&self, id: &str) -> Result<Target>;
    async fn set_target_enabled(&self, id: &str, enabled: bool) -> Result<()>;
}

/// Fixture file layout: `[[accounts]]` and `[[targets]]` tables.
#[derive(Debug, Default, Deserialize)]
struct Fixture {
    #[serde(default)]
    accounts: Vec<Account>,
    #[serde(default)]
    targets: Vec<Target>,
}

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<String, Account>,
    targets: BTreeMap<String, Target>,
}

/// Store held entirely in memory. Listing order is by id.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new(accounts: Vec<Account>, targets: Vec<Target>) -> Self {
        let tables = Tables {
            accounts: accounts.into_iter().map(|a| (a.id.clone(), a)).collect(),
            targets: targets.into_iter().map(|t| (t.id.clone(), t)).collect(),
        };
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Parse a TOML fixture.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let fixture: Fixture = toml::from_str(content)?;
        Ok(Self::new(fixture.accounts, fixture.targets))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn insert_target(&self, target: Target) {
        self.write().targets.insert(target.id.clone(), target);
    }

    pub fn insert_account(&self, account: Account) {
        self.write().accounts.insert(account.id.clone(), account);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.read().accounts.values().cloned().collect())
    }

    async fn get_account(&self, id: &str) -> Result<Account> {
        self.read()
            .accounts
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("account {id}")))
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        self.write()
            .accounts
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn list_enabled_targets(&self) -> Result<Vec<Target>> {
        Ok(self
            .read()
            .targets
            .values()
            .filter(|t| t.enabled)
            .cloned()
            .collect())
    }

    async fn get_target(&self, id: &str) -> Result<Target> {
        self.read()
            .targets
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("target {id}")))
    }

    async fn set_target_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut tables = self.write();
        let target = tables
            .targets
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("target {id}")))?;
        target.enabled = enabled;
        Ok(())
    }
}
