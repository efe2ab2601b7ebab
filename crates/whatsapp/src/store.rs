//! Durable account records and the activity log.

mod sqlite;

use std::{collections::BTreeMap, sync::Mutex};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

use wazper_common::{
    Account, AccountId, AccountStatus, AccountUpdate, ActivityAction, Error, Result,
};

pub use sqlite::SqliteAccountStore;

/// One row of the activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub account_id: AccountId,
    pub action: ActivityAction,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(account_id: AccountId, action: ActivityAction) -> Self {
        Self {
            account_id,
            action,
            details: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, account_id: AccountId) -> Result<Account>;

    /// Accounts whose status is not in `excluded`, ordered by id.
    async fn list_by_status_not_in(&self, excluded: &[AccountStatus]) -> Result<Vec<Account>>;

    /// Apply a partial update. Fails with `NotFound` when no row matched.
    async fn update(&self, account_id: AccountId, update: AccountUpdate) -> Result<()>;

    async fn append_activity_log(&self, entry: ActivityEntry) -> Result<()>;
}

/// Volatile account store.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<BTreeMap<AccountId, Account>>,
    activity: Mutex<Vec<ActivityEntry>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: Account) {
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.insert(account.id, account);
        }
    }

    /// Create an account with the next free id.
    pub fn create(&self, name: impl Into<String>) -> Result<Account> {
        let mut accounts = self.lock_accounts()?;
        let next = accounts.keys().next_back().map_or(1, |id| id.get() + 1);
        let account = Account::new(AccountId::new(next), name);
        accounts.insert(account.id, account.clone());
        drop(accounts);
        self.push_activity(ActivityEntry::new(account.id, ActivityAction::Created))?;
        Ok(account)
    }

    pub fn delete(&self, account_id: AccountId) -> Result<()> {
        self.lock_accounts()?
            .remove(&account_id)
            .map(|_| ())
            .ok_or(Error::NotFound(account_id))
    }

    pub fn activity(&self, account_id: AccountId) -> Vec<ActivityEntry> {
        self.activity
            .lock()
            .map(|log| {
                log.iter()
                    .filter(|e| e.account_id == account_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn actions(&self, account_id: AccountId) -> Vec<ActivityAction> {
        self.activity(account_id)
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    fn lock_accounts(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<AccountId, Account>>> {
        self.accounts
            .lock()
            .map_err(|e| Error::store(e.to_string()))
    }

    fn push_activity(&self, entry: ActivityEntry) -> Result<()> {
        self.activity
            .lock()
            .map_err(|e| Error::store(e.to_string()))?
            .push(entry);
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn get(&self, account_id: AccountId) -> Result<Account> {
        self.lock_accounts()?
            .get(&account_id)
            .cloned()
            .ok_or(Error::NotFound(account_id))
    }

    async fn list_by_status_not_in(&self, excluded: &[AccountStatus]) -> Result<Vec<Account>> {
        Ok(self
            .lock_accounts()?
            .values()
            .filter(|a| !excluded.contains(&a.status))
            .cloned()
            .collect())
    }

    async fn update(&self, account_id: AccountId, update: AccountUpdate) -> Result<()> {
        let mut accounts = self.lock_accounts()?;
        let account = accounts
            .get_mut(&account_id)
            .ok_or(Error::NotFound(account_id))?;
        account.apply(&update);
        Ok(())
    }

    async fn append_activity_log(&self, entry: ActivityEntry) -> Result<()> {
        self.push_activity(entry)
    }
}
