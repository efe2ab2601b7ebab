use std::str::FromStr;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    sqlx::{
        QueryBuilder, Row, Sqlite, SqlitePool,
        sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    },
    tracing::{debug, info},
};

use wazper_common::{
    Account, AccountId, AccountStatus, AccountUpdate, ActivityAction, Error, Result,
};

use super::{AccountStore, ActivityEntry};

const ACCOUNT_COLUMNS: &str =
    "id, name, phone, status, pairing_payload, last_connected, created_at, updated_at";

/// SQLite-backed account store.
#[derive(Debug, Clone)]
pub struct SqliteAccountStore {
    pool: SqlitePool,
}

impl SqliteAccountStore {
    /// Open (creating if needed) the database and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(Error::store)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(Error::store)?;
        let store = Self::with_pool(pool).await?;
        info!(url, "account store ready");
        Ok(store)
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(Error::store)?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(Error::store)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_account(&self, name: &str, phone: Option<&str>) -> Result<Account> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO accounts (name, phone, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(phone)
        .bind(AccountStatus::Disconnected.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::store)?;

        let id = AccountId::try_from(result.last_insert_rowid())?;
        self.append_activity_log(ActivityEntry::new(id, ActivityAction::Created))
            .await?;
        debug!(account_id = %id, name, "created account");
        self.get(id).await
    }

    pub async fn delete_account(&self, account_id: AccountId) -> Result<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(db_id(account_id)?)
            .execute(&self.pool)
            .await
            .map_err(Error::store)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(account_id));
        }
        Ok(())
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.list_by_status_not_in(&[]).await
    }

    /// Newest entries first.
    pub async fn activity_logs(
        &self,
        account_id: AccountId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ActivityEntry>> {
        let rows = sqlx::query(
            "SELECT account_id, action, details, created_at FROM activity_logs \
             WHERE account_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(db_id(account_id)?)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::store)?;

        rows.iter().map(activity_from_row).collect()
    }
}

fn db_id(account_id: AccountId) -> Result<i64> {
    i64::try_from(account_id.get()).map_err(|_| Error::InvalidAccountId(account_id.to_string()))
}

fn account_from_row(row: &SqliteRow) -> Result<Account> {
    let id: i64 = row.try_get("id").map_err(Error::store)?;
    let status: String = row.try_get("status").map_err(Error::store)?;
    Ok(Account {
        id: AccountId::try_from(id)?,
        name: row.try_get("name").map_err(Error::store)?,
        phone: row.try_get("phone").map_err(Error::store)?,
        status: status.parse()?,
        pairing_payload: row.try_get("pairing_payload").map_err(Error::store)?,
        last_connected: row
            .try_get::<Option<DateTime<Utc>>, _>("last_connected")
            .map_err(Error::store)?,
        created_at: row.try_get("created_at").map_err(Error::store)?,
        updated_at: row.try_get("updated_at").map_err(Error::store)?,
    })
}

fn activity_from_row(row: &SqliteRow) -> Result<ActivityEntry> {
    let account_id: i64 = row.try_get("account_id").map_err(Error::store)?;
    let action: String = row.try_get("action").map_err(Error::store)?;
    Ok(ActivityEntry {
        account_id: AccountId::try_from(account_id)?,
        action: action.parse()?,
        details: row.try_get("details").map_err(Error::store)?,
        created_at: row.try_get("created_at").map_err(Error::store)?,
    })
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn get(&self, account_id: AccountId) -> Result<Account> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(db_id(account_id)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::store)?
            .ok_or(Error::NotFound(account_id))?;
        account_from_row(&row)
    }

    async fn list_by_status_not_in(&self, excluded: &[AccountStatus]) -> Result<Vec<Account>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {ACCOUNT_COLUMNS} FROM accounts"));
        if !excluded.is_empty() {
            qb.push(" WHERE status NOT IN (");
            let mut list = qb.separated(", ");
            for status in excluded {
                list.push_bind(status.as_str());
            }
            list.push_unseparated(")");
        }
        qb.push(" ORDER BY id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Error::store)?;
        rows.iter().map(account_from_row).collect()
    }

    async fn update(&self, account_id: AccountId, update: AccountUpdate) -> Result<()> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE accounts SET updated_at = ");
        qb.push_bind(Utc::now());
        if let Some(status) = update.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(phone) = update.phone {
            qb.push(", phone = ").push_bind(phone);
        }
        if let Some(payload) = update.pairing_payload {
            qb.push(", pairing_payload = ").push_bind(payload);
        }
        if let Some(at) = update.last_connected {
            qb.push(", last_connected = ").push_bind(at);
        }
        qb.push(" WHERE id = ").push_bind(db_id(account_id)?);

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(Error::store)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(account_id));
        }
        Ok(())
    }

    async fn append_activity_log(&self, entry: ActivityEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO activity_logs (account_id, action, details, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(db_id(entry.account_id)?)
        .bind(entry.action.as_str())
        .bind(entry.details)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::store)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_and_update() {
        let store = SqliteAccountStore::in_memory().await.unwrap();
        let account = store.create_account("sales", None).await.unwrap();
        assert_eq!(account.status, AccountStatus::Disconnected);
        assert!(account.phone.is_none());

        let now = Utc::now();
        store
            .update(
                account.id,
                AccountUpdate::status(AccountStatus::Connected)
                    .with_phone("628123")
                    .with_last_connected(now)
                    .clear_pairing_payload(),
            )
            .await
            .unwrap();

        let loaded = store.get(account.id).await.unwrap();
        assert_eq!(loaded.status, AccountStatus::Connected);
        assert_eq!(loaded.phone.as_deref(), Some("628123"));
        assert!(loaded.last_connected.is_some());
        assert!(loaded.pairing_payload.is_none());
    }

    #[tokio::test]
    async fn pairing_payload_set_and_cleared() {
        let store = SqliteAccountStore::in_memory().await.unwrap();
        let id = store.create_account("a", None).await.unwrap().id;

        store
            .update(
                id,
                AccountUpdate::status(AccountStatus::Connecting).with_pairing_payload("data:x"),
            )
            .await
            .unwrap();
        assert_eq!(
            store.get(id).await.unwrap().pairing_payload.as_deref(),
            Some("data:x")
        );

        store
            .update(id, AccountUpdate::default().clear_pairing_payload())
            .await
            .unwrap();
        let account = store.get(id).await.unwrap();
        assert!(account.pairing_payload.is_none());
        assert_eq!(account.status, AccountStatus::Connecting);
    }

    #[tokio::test]
    async fn update_missing_row_is_not_found() {
        let store = SqliteAccountStore::in_memory().await.unwrap();
        let err = store
            .update(AccountId::new(77), AccountUpdate::status(AccountStatus::Error))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(matches!(
            store.get(AccountId::new(77)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_excludes_statuses() {
        let store = SqliteAccountStore::in_memory().await.unwrap();
        let a = store.create_account("a", None).await.unwrap();
        let b = store.create_account("b", Some("62811")).await.unwrap();
        let c = store.create_account("c", None).await.unwrap();
        store
            .update(b.id, AccountUpdate::status(AccountStatus::Reconnecting))
            .await
            .unwrap();
        store
            .update(c.id, AccountUpdate::status(AccountStatus::Error))
            .await
            .unwrap();

        let resumable = store
            .list_by_status_not_in(&[AccountStatus::Disconnected])
            .await
            .unwrap();
        let ids: Vec<_> = resumable.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![b.id, c.id]);
        assert_eq!(store.list_accounts().await.unwrap().len(), 3);
        assert_eq!(store.list_accounts().await.unwrap()[0].id, a.id);
    }

    #[tokio::test]
    async fn activity_logs_page_newest_first() {
        let store = SqliteAccountStore::in_memory().await.unwrap();
        let id = store.create_account("a", None).await.unwrap().id;
        store
            .append_activity_log(ActivityEntry::new(id, ActivityAction::PairingIssued))
            .await
            .unwrap();
        store
            .append_activity_log(
                ActivityEntry::new(id, ActivityAction::Connected).with_details("628123"),
            )
            .await
            .unwrap();

        let page = store.activity_logs(id, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].action, ActivityAction::Connected);
        assert_eq!(page[0].details.as_deref(), Some("628123"));
        assert_eq!(page[1].action, ActivityAction::PairingIssued);

        let rest = store.activity_logs(id, 10, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].action, ActivityAction::Created);
    }

    #[tokio::test]
    async fn delete_account_removes_row() {
        let store = SqliteAccountStore::in_memory().await.unwrap();
        let id = store.create_account("a", None).await.unwrap().id;
        store.delete_account(id).await.unwrap();
        assert!(matches!(
            store.delete_account(id).await,
            Err(Error::NotFound(_))
        ));
    }
}
