//! Transaction storage
//!
//! The proxy only needs `create`; listing and lookup serve the API, the
//! history CLI and the scanner.

use crate::error::StoreError;
use crate::model::{Request, Response, Transaction};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use uuid::Uuid;

/// Storage for captured transactions. Implementations synchronize internally.
pub trait TransactionStore: Send + Sync {
    /// Persist a transaction, returning it with its assigned id
    fn create(&self, transaction: Transaction) -> Result<Transaction, StoreError>;

    fn get_by_id(&self, id: &str) -> Result<Option<Transaction>, StoreError>;

    /// All transactions, newest first
    fn list(&self) -> Result<Vec<Transaction>, StoreError>;
}

/// SQLite backed transaction store
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Task(format!("create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(&db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: db_path_str,
        };

        store.initialize()?;

        Ok(store)
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                request TEXT NOT NULL,
                response TEXT NOT NULL,
                response_body BLOB NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_created_at ON transactions(created_at)",
            [],
        )?;

        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn from_row(row: &Row<'_>) -> Result<Transaction, StoreError> {
        let id: String = row.get(0)?;
        let created_at: String = row.get(1)?;
        let request: String = row.get(2)?;
        let response: String = row.get(3)?;
        let body: Vec<u8> = row.get(4)?;

        let request: Request = serde_json::from_str(&request)?;
        let mut response: Response = serde_json::from_str(&response)?;
        response.body = body;

        Ok(Transaction {
            id: Some(id),
            request,
            response,
            created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        })
    }
}

impl TransactionStore for SqliteStore {
    fn create(&self, mut transaction: Transaction) -> Result<Transaction, StoreError> {
        let id = Uuid::new_v4().to_string();
        let request = serde_json::to_string(&transaction.request)?;
        let response = serde_json::to_string(&transaction.response)?;
        // Fixed precision keeps lexical and chronological order identical
        let created_at = transaction
            .created_at
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO transactions (id, created_at, request, response, response_body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, created_at, request, response, transaction.response.body],
        )?;

        transaction.id = Some(id);
        Ok(transaction)
    }

    fn get_by_id(&self, id: &str) -> Result<Option<Transaction>, StoreError> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, created_at, request, response, response_body
             FROM transactions WHERE id = ?1",
        )?;

        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::from_row(row)?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<Transaction>, StoreError> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, created_at, request, response, response_body
             FROM transactions ORDER BY created_at DESC",
        )?;

        let mut transactions = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            transactions.push(Self::from_row(row)?);
        }

        Ok(transactions)
    }
}

impl SqliteStore {
    /// Number of stored transactions
    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
            .optional()?
            .unwrap_or(0);
        Ok(count as usize)
    }
}

/// In-memory store for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryStore {
    transactions: RwLock<Vec<Transaction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.read().is_empty()
    }
}

impl TransactionStore for MemoryStore {
    fn create(&self, mut transaction: Transaction) -> Result<Transaction, StoreError> {
        transaction.id = Some(Uuid::new_v4().to_string());
        self.transactions.write().push(transaction.clone());
        Ok(transaction)
    }

    fn get_by_id(&self, id: &str) -> Result<Option<Transaction>, StoreError> {
        Ok(self
            .transactions
            .read()
            .iter()
            .find(|t| t.id.as_deref() == Some(id))
            .cloned())
    }

    fn list(&self) -> Result<Vec<Transaction>, StoreError> {
        let mut transactions = self.transactions.read().clone();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn transaction(path: &str, age_secs: i64) -> Transaction {
        let request = Request {
            method: "GET".to_string(),
            host: "example.com".to_string(),
            path: path.to_string(),
            scheme: "http".to_string(),
            body: b"request body".to_vec(),
            ..Default::default()
        };
        let response = Response {
            status: 200,
            body: format!("body of {}", path).into_bytes(),
            ..Default::default()
        };
        let mut transaction = Transaction::new(request, response);
        transaction.created_at = Utc::now() - Duration::seconds(age_secs);
        transaction
    }

    #[test]
    fn test_create_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("test.db");
        let store = SqliteStore::new(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_create_and_get_keeps_response_body() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("test.db")).unwrap();

        let stored = store.create(transaction("/x", 0)).unwrap();
        let id = stored.id.clone().unwrap();

        let loaded = store.get_by_id(&id).unwrap().unwrap();
        assert_eq!(loaded.request, stored.request);
        assert_eq!(loaded.response.body, b"body of /x");
        assert_eq!(loaded.request.body, b"request body");
        assert_eq!(
            loaded.created_at.timestamp_micros(),
            stored.created_at.timestamp_micros()
        );

        assert!(store.get_by_id("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_newest_first() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("test.db")).unwrap();

        store.create(transaction("/old", 60)).unwrap();
        store.create(transaction("/new", 0)).unwrap();
        store.create(transaction("/middle", 30)).unwrap();

        let paths: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|t| t.request.path)
            .collect();
        assert_eq!(paths, vec!["/new", "/middle", "/old"]);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.create(transaction("/old", 10)).unwrap();
        let newest = store.create(transaction("/new", 0)).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.list().unwrap()[0].request.path, "/new");
        let found = store.get_by_id(newest.id.as_deref().unwrap()).unwrap();
        assert_eq!(found.unwrap().request.path, "/new");
    }
}
