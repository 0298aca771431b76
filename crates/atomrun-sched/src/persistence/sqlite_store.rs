//! SQLite document store.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension};

use crate::error::{SchedError, SchedResult};
use crate::persistence::JobStore;
use crate::persistence::retry::{RetryPolicy, retry_transient};
use crate::record::{CalculationRecord, RecordFilter};

/// SQLite-based job store.
///
/// Each record is kept as a JSON document alongside indexed `style`, `name`,
/// `status` and `calc_style` columns. Busy or locked databases are common
/// when many runners share one file, so every operation runs under a
/// [`RetryPolicy`].
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Open (creating if needed) a store at the given path.
    pub fn new(path: impl AsRef<Path>) -> SchedResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /// Create a new in-memory store.
    pub fn in_memory() -> SchedResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> SchedResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            retry: RetryPolicy::default(),
        };
        store.init_schema_sync()?;
        Ok(store)
    }

    /// Set the retry policy for busy databases.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn init_schema_sync(&self) -> SchedResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS records (
                    style TEXT NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    calc_style TEXT NOT NULL,
                    data TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (style, name)
                );

                CREATE INDEX IF NOT EXISTS idx_records_status ON records(style, status);

                CREATE TABLE IF NOT EXISTS blobs (
                    style TEXT NOT NULL,
                    name TEXT NOT NULL,
                    data BLOB NOT NULL,
                    PRIMARY KEY (style, name)
                );
                "#,
            )?;
            Ok(())
        })
    }

    fn with_conn<T>(&self, op: impl FnOnce(&Connection) -> SchedResult<T>) -> SchedResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SchedError::DatabaseError(e.to_string()))?;
        op(&conn)
    }

    /// Run a database operation under the retry policy.
    async fn call<T>(
        &self,
        operation: &str,
        op: impl Fn(&Connection) -> SchedResult<T>,
    ) -> SchedResult<T> {
        retry_transient(&self.retry, operation, || {
            std::future::ready(self.with_conn(&op))
        })
        .await
    }
}

fn select_records(
    conn: &Connection,
    style: &str,
    filter: &RecordFilter,
) -> SchedResult<Vec<CalculationRecord>> {
    let mut sql = String::from("SELECT data FROM records WHERE style = ?1");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(style.to_string())];

    let mut push_in = |column: &str, values: Vec<String>, sql: &mut String| {
        let placeholders: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", params.len() + i + 1))
            .collect();
        sql.push_str(&format!(" AND {column} IN ({})", placeholders.join(", ")));
        for v in values {
            params.push(Box::new(v));
        }
    };

    if let Some(ref statuses) = filter.status {
        let names = statuses.iter().map(|s| s.name().to_string()).collect();
        push_in("status", names, &mut sql);
    }
    if let Some(ref names) = filter.names {
        push_in("name", names.clone(), &mut sql);
    }
    if let Some(ref styles) = filter.calc_style {
        push_in("calc_style", styles.clone(), &mut sql);
    }
    sql.push_str(" ORDER BY rowid");

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))?;

    let mut records = Vec::new();
    for row in rows {
        let data = row?;
        records.push(serde_json::from_str::<CalculationRecord>(&data)?);
    }

    // Metadata lives inside the document; the limit applies after it.
    Ok(filter.apply(records))
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn add_record(&self, record: &CalculationRecord) -> SchedResult<()> {
        let data = serde_json::to_string(record)?;

        self.call("add_record", |conn| {
            let inserted = conn.execute(
                r#"
                INSERT INTO records (style, name, status, calc_style, data, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                rusqlite::params![
                    record.style,
                    record.name,
                    record.status.name(),
                    record.calc_style,
                    data,
                    record.updated_at.to_rfc3339(),
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                    Err(SchedError::duplicate(&record.style, &record.name))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_record(
        &self,
        style: &str,
        name: &str,
    ) -> SchedResult<Option<CalculationRecord>> {
        let data: Option<String> = self
            .call("get_record", |conn| {
                Ok(conn
                    .query_row(
                        "SELECT data FROM records WHERE style = ?1 AND name = ?2",
                        rusqlite::params![style, name],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        data.map(|d| serde_json::from_str(&d).map_err(SchedError::from))
            .transpose()
    }

    async fn update_record(&self, record: &CalculationRecord) -> SchedResult<()> {
        let data = serde_json::to_string(record)?;

        self.call("update_record", |conn| {
            let updated = conn.execute(
                r#"
                UPDATE records
                SET status = ?3, calc_style = ?4, data = ?5, updated_at = ?6
                WHERE style = ?1 AND name = ?2
                "#,
                rusqlite::params![
                    record.style,
                    record.name,
                    record.status.name(),
                    record.calc_style,
                    data,
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            if updated == 0 {
                return Err(SchedError::not_found(&record.style, &record.name));
            }
            Ok(())
        })
        .await
    }

    async fn get_records(
        &self,
        style: &str,
        filter: &RecordFilter,
    ) -> SchedResult<Vec<CalculationRecord>> {
        self.call("get_records", |conn| select_records(conn, style, filter))
            .await
    }

    async fn delete_record(&self, style: &str, name: &str) -> SchedResult<bool> {
        self.call("delete_record", |conn| {
            let deleted = conn.execute(
                "DELETE FROM records WHERE style = ?1 AND name = ?2",
                rusqlite::params![style, name],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn add_blob(&self, style: &str, name: &str, data: &[u8]) -> SchedResult<()> {
        self.call("add_blob", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO blobs (style, name, data) VALUES (?1, ?2, ?3)",
                rusqlite::params![style, name, data],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_blob(&self, style: &str, name: &str) -> SchedResult<Option<Vec<u8>>> {
        self.call("get_blob", |conn| {
            Ok(conn
                .query_row(
                    "SELECT data FROM blobs WHERE style = ?1 AND name = ?2",
                    rusqlite::params![style, name],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn delete_blob(&self, style: &str, name: &str) -> SchedResult<bool> {
        self.call("delete_blob", |conn| {
            let deleted = conn.execute(
                "DELETE FROM blobs WHERE style = ?1 AND name = ?2",
                rusqlite::params![style, name],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn has_blob(&self, style: &str, name: &str) -> SchedResult<bool> {
        self.call("has_blob", |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM blobs WHERE style = ?1 AND name = ?2",
                rusqlite::params![style, name],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }
}
