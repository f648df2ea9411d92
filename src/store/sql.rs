//! Relational policy driver (Postgres or SQLite through sqlx's Any driver).
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: `postgres://...` or `sqlite:...` connection string
//!   (default: `sqlite://rbac.sqlite.db?mode=rwc`)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)
//! - `RBAC_TABLE_PREFIX`: Optional table name prefix (default: none)
//! - `RBAC_SAVE_MODE`: `chunked` or `transactional` (default: chunked)
//!
//! A variable that is set but does not parse is a configuration error.
//!
//! ## Layout
//!
//! One table `[<prefix>_]casbin_rule` with a surrogate `id` for insertion
//! order, seven text columns and a unique index over all seven.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, AnyPool, Connection, Row, Transaction};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use super::{check_selector, check_storable, check_update_pairs, AdapterError, PolicyAdapter, SaveMode, FLUSH_EVERY};
use crate::canonical::rule_set_fingerprint;
use crate::codec::RULE_COLUMNS;
use crate::model::PolicyModel;
use crate::preview::preview;
use crate::types::{BatchFilter, RuleRecord, SqlPredicate};
use crate::RULE_TABLE_NAME;

/// Connection URL used when `DATABASE_URL` is unset.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://rbac.sqlite.db?mode=rwc";

/// SQL dialect, picked from the connection URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL.
    Postgres,
    /// SQLite.
    Sqlite,
}

impl Dialect {
    /// Detect the dialect of a connection URL.
    pub fn from_url(url: &str) -> Result<Self, AdapterError> {
        let scheme = url.split(':').next().unwrap_or_default().to_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(AdapterError::InvalidConfig(format!(
                "unsupported database scheme {:?}",
                scheme
            ))),
        }
    }

    fn identity_column(self) -> &'static str {
        match self {
            Self::Postgres => "id BIGSERIAL PRIMARY KEY",
            Self::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    /// `CREATE TABLE` and `CREATE UNIQUE INDEX` statements for `table`.
    pub fn schema(self, table: &str) -> [String; 2] {
        let columns: Vec<String> = RULE_COLUMNS
            .iter()
            .map(|c| format!("{} VARCHAR(255) NOT NULL DEFAULT ''", c))
            .collect();
        [
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({}, {})",
                table,
                self.identity_column(),
                columns.join(", ")
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_{} ON {} ({})",
                table,
                table,
                RULE_COLUMNS.join(",")
            ),
        ]
    }
}

/// Configuration for the relational driver.
///
/// Pool defaults match a small service: fail fast on acquire, release idle
/// connections, recycle long-lived ones.
#[derive(Debug, Clone)]
pub struct SqlConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum connections in pool (default: 10).
    pub max_connections: u32,
    /// Minimum idle connections to keep warm (default: 2).
    pub min_connections: u32,
    /// Connection acquire timeout in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds (default: 300 = 5 min).
    pub idle_timeout_secs: u64,
    /// Maximum connection lifetime in seconds (default: 1800 = 30 min).
    pub max_lifetime_secs: u64,
    /// Optional prefix; the table becomes `<prefix>_casbin_rule`.
    pub table_prefix: Option<String>,
    /// Save strategy (default: chunked).
    pub save_mode: SaveMode,
}

impl SqlConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self, AdapterError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections)?,
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs)?,
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs)?,
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", defaults.max_lifetime_secs)?,
            table_prefix: std::env::var("RBAC_TABLE_PREFIX")
                .ok()
                .filter(|s| !s.is_empty()),
            save_mode: std::env::var("RBAC_SAVE_MODE")
                .ok()
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or_default(),
        })
    }

    /// Configuration for a URL with the remaining settings at their defaults.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_secs: 10,
            idle_timeout_secs: 300,
            max_lifetime_secs: 1800,
            table_prefix: None,
            save_mode: SaveMode::default(),
        }
    }

    /// Full table name, validated as a plain SQL identifier.
    pub fn table_name(&self) -> Result<String, AdapterError> {
        let name = match &self.table_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}_{}", prefix, RULE_TABLE_NAME),
            _ => RULE_TABLE_NAME.to_string(),
        };
        let identifier = regex_lite::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$")
            .map_err(|e| AdapterError::InvalidConfig(e.to_string()))?;
        if identifier.is_match(&name) {
            Ok(name)
        } else {
            Err(AdapterError::InvalidConfig(format!(
                "table name {:?} is not a plain SQL identifier",
                name
            )))
        }
    }
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATABASE_URL)
    }
}

/// Read `name` and parse it, or fall back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T, AdapterError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| {
            AdapterError::InvalidConfig(format!("{} = {:?}: {}", name, raw, e))
        }),
        Err(_) => Ok(default),
    }
}

/// Outcome of [`SqlAdapter::transaction`].
#[derive(Debug)]
pub struct TransactionOutcome<T> {
    /// What the caller's function returned (or the commit error).
    pub result: Result<T, AdapterError>,
    /// Rules reloaded from the pool after commit or rollback.
    pub policy: Vec<RuleRecord>,
}

type SharedTransaction = Arc<Mutex<Option<Transaction<'static, Any>>>>;

/// Where statements run: the pool, or one caller-scoped transaction.
#[derive(Clone)]
enum Handle {
    Pool(AnyPool),
    Transaction(SharedTransaction),
}

/// A connection borrowed for one operation.
enum Conn<'a> {
    Pooled(PoolConnection<Any>),
    Scoped(MappedMutexGuard<'a, Transaction<'static, Any>>),
}

impl Deref for Conn<'_> {
    type Target = AnyConnection;

    fn deref(&self) -> &AnyConnection {
        match self {
            Conn::Pooled(conn) => conn,
            Conn::Scoped(tx) => tx,
        }
    }
}

impl DerefMut for Conn<'_> {
    fn deref_mut(&mut self) -> &mut AnyConnection {
        match self {
            Conn::Pooled(conn) => &mut **conn,
            Conn::Scoped(tx) => &mut ***tx,
        }
    }
}

/// Policy adapter over a relational table.
///
/// Loads come back in insertion (identity) order. The unique index turns
/// duplicate inserts into [`AdapterError::ConstraintViolation`].
pub struct SqlAdapter {
    handle: Handle,
    pool: AnyPool,
    dialect: Dialect,
    table: String,
    save_mode: SaveMode,
    filtered: AtomicBool,
}

impl SqlAdapter {
    /// Connect, then create the rule table and its unique index if missing.
    pub async fn new(config: SqlConfig) -> Result<Self, AdapterError> {
        let dialect = Dialect::from_url(&config.database_url)?;
        let table = config.table_name()?;

        tracing::info!(
            ?dialect,
            table = %table,
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            save_mode = %config.save_mode,
            "Initializing relational policy adapter"
        );

        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        let adapter = Self {
            handle: Handle::Pool(pool.clone()),
            pool,
            dialect,
            table,
            save_mode: config.save_mode,
            filtered: AtomicBool::new(false),
        };
        adapter.create_table().await?;
        Ok(adapter)
    }

    /// Create an adapter from environment variables.
    pub async fn from_env() -> Result<Self, AdapterError> {
        Self::new(SqlConfig::from_env()?).await
    }

    /// Full table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Detected dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Get the connection pool for health checks.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    async fn create_table(&self) -> Result<(), AdapterError> {
        let mut conn = self.conn().await?;
        for statement in self.dialect.schema(&self.table) {
            sqlx::query(&statement).execute(&mut *conn).await?;
        }
        Ok(())
    }

    /// Run `f` against a transaction-bound clone of this adapter.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. Either way the
    /// policy is then reloaded from the pool, so a rolled-back transaction
    /// never shows up and a committed one is visible in the reload.
    pub async fn transaction<F, Fut, T>(
        &self,
        model: &dyn PolicyModel,
        f: F,
    ) -> Result<TransactionOutcome<T>, AdapterError>
    where
        F: FnOnce(SqlAdapter) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let tx = self.pool.begin().await?;
        let slot: SharedTransaction = Arc::new(Mutex::new(Some(tx)));
        let scoped = SqlAdapter {
            handle: Handle::Transaction(Arc::clone(&slot)),
            ..self.detached()
        };

        let outcome = f(scoped).await;
        let tx = slot.lock().await.take();
        let result = match (outcome, tx) {
            (Ok(value), Some(tx)) => tx.commit().await.map(|_| value).map_err(AdapterError::from),
            (Ok(_), None) => Err(AdapterError::TransactionClosed),
            (Err(err), Some(tx)) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
            (Err(err), None) => Err(err),
        };

        tracing::info!(
            table = %self.table,
            committed = result.is_ok(),
            "Policy transaction finished"
        );

        let policy = self.detached().load_policy(model).await?;
        Ok(TransactionOutcome { result, policy })
    }

    /// A pool-bound adapter over the same table, with a fresh filtered flag.
    fn detached(&self) -> SqlAdapter {
        SqlAdapter {
            handle: Handle::Pool(self.pool.clone()),
            pool: self.pool.clone(),
            dialect: self.dialect,
            table: self.table.clone(),
            save_mode: self.save_mode,
            filtered: AtomicBool::new(false),
        }
    }

    async fn conn(&self) -> Result<Conn<'_>, AdapterError> {
        match &self.handle {
            Handle::Pool(pool) => Ok(Conn::Pooled(pool.acquire().await?)),
            Handle::Transaction(slot) => {
                let guard = slot.lock().await;
                MutexGuard::try_map(guard, |tx| tx.as_mut())
                    .map(Conn::Scoped)
                    .map_err(|_| AdapterError::TransactionClosed)
            }
        }
    }

    fn select_sql(&self, predicate: &SqlPredicate) -> String {
        format!(
            "SELECT {} FROM {}{} ORDER BY id",
            RULE_COLUMNS.join(", "),
            self.table,
            predicate.where_clause()
        )
    }

    async fn select(
        &self,
        conn: &mut AnyConnection,
        predicate: &SqlPredicate,
    ) -> Result<Vec<RuleRecord>, AdapterError> {
        let sql = self.select_sql(predicate);
        let mut query = sqlx::query(&sql);
        for arg in &predicate.args {
            query = query.bind(arg.clone());
        }
        let rows = query.fetch_all(&mut *conn).await?;
        rows.iter()
            .map(parse_rule_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AdapterError::from)
    }

    async fn delete(
        &self,
        conn: &mut AnyConnection,
        predicate: &SqlPredicate,
    ) -> Result<u64, AdapterError> {
        let sql = format!("DELETE FROM {}{}", self.table, predicate.where_clause());
        let mut query = sqlx::query(&sql);
        for arg in &predicate.args {
            query = query.bind(arg.clone());
        }
        Ok(query.execute(&mut *conn).await?.rows_affected())
    }

    /// Insert `rules` as one multi-row statement.
    async fn insert(&self, conn: &mut AnyConnection, rules: &[RuleRecord]) -> Result<u64, AdapterError> {
        if rules.is_empty() {
            return Ok(0);
        }
        let rows: Vec<String> = (0..rules.len())
            .map(|r| {
                let placeholders: Vec<String> = (1..=RULE_COLUMNS.len())
                    .map(|c| format!("${}", r * RULE_COLUMNS.len() + c))
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table,
            RULE_COLUMNS.join(", "),
            rows.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for rule in rules {
            for field in rule.fields() {
                query = query.bind(field.to_string());
            }
        }
        Ok(query.execute(&mut *conn).await?.rows_affected())
    }

    async fn update(
        &self,
        conn: &mut AnyConnection,
        old: &RuleRecord,
        new: &RuleRecord,
    ) -> Result<u64, AdapterError> {
        let assignments: Vec<String> = RULE_COLUMNS
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ${}", c, i + 1))
            .collect();
        let predicate = SqlPredicate::for_pattern(old, RULE_COLUMNS.len());
        let sql = format!(
            "UPDATE {} SET {}{}",
            self.table,
            assignments.join(", "),
            predicate.where_clause()
        );

        let mut query = sqlx::query(&sql);
        for field in new.fields() {
            query = query.bind(field.to_string());
        }
        for arg in &predicate.args {
            query = query.bind(arg.clone());
        }
        Ok(query.execute(&mut *conn).await?.rows_affected())
    }
}

/// Parse a rule from a database row.
fn parse_rule_row(row: &AnyRow) -> Result<RuleRecord, sqlx::Error> {
    let mut record = RuleRecord {
        ptype: row.try_get("ptype")?,
        values: Default::default(),
    };
    for (i, slot) in record.values.iter_mut().enumerate() {
        *slot = row.try_get(RULE_COLUMNS[i + 1])?;
    }
    Ok(record)
}

#[async_trait]
impl PolicyAdapter for SqlAdapter {
    async fn load_policy(&self, model: &dyn PolicyModel) -> Result<Vec<RuleRecord>, AdapterError> {
        let mut conn = self.conn().await?;
        let mut records = self.select(&mut conn, &SqlPredicate::default()).await?;
        preview(&mut records, model);

        tracing::info!(
            table = %self.table,
            rule_count = records.len(),
            fingerprint = %rule_set_fingerprint(&records),
            "Loaded policy"
        );
        Ok(records)
    }

    async fn load_filtered_policy(
        &self,
        model: &dyn PolicyModel,
        filter: &BatchFilter,
    ) -> Result<Vec<RuleRecord>, AdapterError> {
        let mut conn = self.conn().await?;
        let mut records = Vec::new();
        for f in &filter.filters {
            let predicate = SqlPredicate::for_filter(f, 0);
            records.extend(self.select(&mut conn, &predicate).await?);
        }
        preview(&mut records, model);
        self.filtered.store(true, Ordering::SeqCst);

        tracing::debug!(
            table = %self.table,
            filters = filter.filters.len(),
            rule_count = records.len(),
            "Loaded filtered policy"
        );
        Ok(records)
    }

    fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::SeqCst)
    }

    async fn save_policy(&self, rules: &[RuleRecord]) -> Result<(), AdapterError> {
        if self.is_filtered() {
            tracing::warn!(
                table = %self.table,
                "Saving from a filtered adapter replaces rules that were never loaded"
            );
        }

        check_storable(rules)?;
        let mut conn = self.conn().await?;
        let everything = SqlPredicate::default();
        match self.save_mode {
            SaveMode::Chunked => {
                self.delete(&mut conn, &everything).await?;
                for chunk in rules.chunks(FLUSH_EVERY) {
                    self.insert(&mut conn, chunk).await?;
                }
            }
            SaveMode::Transactional => {
                let mut tx = conn.begin().await?;
                self.delete(&mut tx, &everything).await?;
                for chunk in rules.chunks(FLUSH_EVERY) {
                    self.insert(&mut tx, chunk).await?;
                }
                tx.commit().await?;
            }
        }

        tracing::info!(
            table = %self.table,
            rule_count = rules.len(),
            save_mode = %self.save_mode,
            fingerprint = %rule_set_fingerprint(rules),
            "Saved policy"
        );
        Ok(())
    }

    async fn add_policy(&self, rule: &RuleRecord) -> Result<(), AdapterError> {
        check_storable(std::slice::from_ref(rule))?;
        let mut conn = self.conn().await?;
        self.insert(&mut conn, std::slice::from_ref(rule)).await?;
        tracing::debug!(rule = %rule, "Added policy");
        Ok(())
    }

    async fn add_policies(&self, rules: &[RuleRecord]) -> Result<(), AdapterError> {
        check_storable(rules)?;
        let mut conn = self.conn().await?;
        let mut tx = conn.begin().await?;
        for chunk in rules.chunks(FLUSH_EVERY) {
            self.insert(&mut tx, chunk).await?;
        }
        tx.commit().await?;
        tracing::debug!(rule_count = rules.len(), "Added policies");
        Ok(())
    }

    async fn remove_policy(&self, pattern: &RuleRecord) -> Result<(), AdapterError> {
        let mut conn = self.conn().await?;
        let removed = self
            .delete(&mut conn, &SqlPredicate::for_pattern(pattern, 0))
            .await?;
        tracing::debug!(rule = %pattern, removed, "Removed policy");
        Ok(())
    }

    async fn remove_policies(&self, patterns: &[RuleRecord]) -> Result<(), AdapterError> {
        let mut conn = self.conn().await?;
        let mut tx = conn.begin().await?;
        let mut removed = 0;
        for pattern in patterns {
            removed += self
                .delete(&mut tx, &SqlPredicate::for_pattern(pattern, 0))
                .await?;
        }
        tx.commit().await?;
        tracing::debug!(patterns = patterns.len(), removed, "Removed policies");
        Ok(())
    }

    async fn remove_filtered_policy(
        &self,
        ptype: &str,
        field_index: i32,
        field_values: &[String],
    ) -> Result<(), AdapterError> {
        check_selector(field_index, field_values)?;
        let pattern = RuleRecord::from_selector(ptype, field_index, field_values);
        let mut conn = self.conn().await?;
        let removed = self
            .delete(&mut conn, &SqlPredicate::for_pattern(&pattern, 0))
            .await?;
        tracing::debug!(ptype, field_index, removed, "Removed filtered policy");
        Ok(())
    }

    async fn update_policy(&self, old: &RuleRecord, new: &RuleRecord) -> Result<(), AdapterError> {
        check_storable(std::slice::from_ref(new))?;
        let mut conn = self.conn().await?;
        let updated = self.update(&mut conn, old, new).await?;
        tracing::debug!(old = %old, new = %new, updated, "Updated policy");
        Ok(())
    }

    async fn update_policies(
        &self,
        old: &[RuleRecord],
        new: &[RuleRecord],
    ) -> Result<(), AdapterError> {
        check_update_pairs(old, new)?;
        check_storable(new)?;
        let mut conn = self.conn().await?;
        let mut tx = conn.begin().await?;
        for (old_rule, new_rule) in old.iter().zip(new) {
            self.update(&mut tx, old_rule, new_rule).await?;
        }
        tx.commit().await?;
        tracing::debug!(rule_count = new.len(), "Updated policies");
        Ok(())
    }

    async fn update_filtered_policies(
        &self,
        ptype: &str,
        new_rules: &[RuleRecord],
        field_index: i32,
        field_values: &[String],
    ) -> Result<Vec<RuleRecord>, AdapterError> {
        check_selector(field_index, field_values)?;
        check_storable(new_rules)?;
        let pattern = RuleRecord::from_selector(ptype, field_index, field_values);
        let predicate = SqlPredicate::for_pattern(&pattern, 0);

        let mut conn = self.conn().await?;
        let mut tx = conn.begin().await?;
        let removed = self.select(&mut tx, &predicate).await?;
        self.delete(&mut tx, &predicate).await?;
        for chunk in new_rules.chunks(FLUSH_EVERY) {
            self.insert(&mut tx, chunk).await?;
        }
        tx.commit().await?;

        tracing::debug!(
            ptype,
            removed = removed.len(),
            inserted = new_rules.len(),
            "Updated filtered policies"
        );
        Ok(removed)
    }
}
