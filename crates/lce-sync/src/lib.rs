//! Load pipeline: duplicate guard, transactional loader, scheduled fetch and
//! read-access policy administration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lce_core::{
    CatalogDocument, CatalogError, ColumnValue, EntitySchema, EntityTable, SourceName,
    CATALOG_SCHEMA, PROVENANCE_COLUMN,
};
use lce_storage::{
    ArtifactError, ArtifactStore, CatalogRequest, FetchError, HttpClientConfig, HttpFetcher,
    DEFAULT_CATALOG_ENDPOINT, DEFAULT_LOCALE,
};
use lce_transform::transform_catalog;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lce-sync";

/// PostgreSQL caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;
const MAX_ROWS_PER_INSERT: usize = 1_000;

pub const READ_POLICY_NAME: &str = "Allow public read access";

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("cannot connect to {target} database: {message}")]
    Connection { target: String, message: String },
    #[error("source {source_name} is already loaded ({existing_rows} rows carry it)")]
    DuplicateFile {
        source_name: String,
        existing_rows: i64,
    },
    #[error("table {table} has no {column} provenance column")]
    MissingProvenanceColumn { table: String, column: &'static str },
    #[error("loading table {table} failed: {message}")]
    Load { table: String, message: String },
    #[error(transparent)]
    Transform(#[from] CatalogError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseTarget {
    Local,
    Cloud,
}

impl DatabaseTarget {
    pub fn label(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub local_database_url: Option<String>,
    pub cloud_database_url: Option<String>,
    pub catalog_endpoint: String,
    pub locale: String,
    pub artifacts_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub db_connect_timeout_secs: u64,
    pub db_schema: String,
    pub fetch_cron: String,
    pub log_file: PathBuf,
    pub user_agent: String,
}

impl EtlConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            local_database_url: non_empty("DATABASE_URI_LOCAL_VER"),
            cloud_database_url: non_empty("DATABASE_URI"),
            catalog_endpoint: non_empty("CATALOG_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_CATALOG_ENDPOINT.to_string()),
            locale: non_empty("CATALOG_LOCALE").unwrap_or_else(|| DEFAULT_LOCALE.to_string()),
            artifacts_dir: non_empty("CATALOG_FILES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("files")),
            http_timeout_secs: non_empty("CATALOG_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            db_connect_timeout_secs: non_empty("CATALOG_DB_CONNECT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
            db_schema: non_empty("CATALOG_DB_SCHEMA").unwrap_or_else(|| "public".to_string()),
            fetch_cron: non_empty("CATALOG_FETCH_CRON")
                .unwrap_or_else(|| "0 0 11 * * *".to_string()),
            log_file: non_empty("CATALOG_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("etl_process.log")),
            user_agent: non_empty("CATALOG_USER_AGENT")
                .unwrap_or_else(|| "lce-bot/0.1".to_string()),
        }
    }

    pub fn database_url(&self, target: DatabaseTarget) -> Result<&str, EtlError> {
        let (url, var) = match target {
            DatabaseTarget::Local => (&self.local_database_url, "DATABASE_URI_LOCAL_VER"),
            DatabaseTarget::Cloud => (&self.cloud_database_url, "DATABASE_URI"),
        };
        url.as_deref().ok_or_else(|| EtlError::Connection {
            target: target.label().to_string(),
            message: format!("{var} is not set"),
        })
    }

    pub fn catalog_request(&self) -> CatalogRequest {
        CatalogRequest {
            endpoint: self.catalog_endpoint.clone(),
            locale: self.locale.clone(),
        }
    }

    pub fn artifact_store(&self) -> ArtifactStore {
        ArtifactStore::new(self.artifacts_dir.clone())
    }

    pub fn http_fetcher(&self) -> Result<HttpFetcher, EtlError> {
        Ok(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })?)
    }
}

pub async fn connect_pool(config: &EtlConfig, target: DatabaseTarget) -> Result<PgPool, EtlError> {
    let url = config.database_url(target)?;
    info!(db_target = target.label(), "connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(config.db_connect_timeout_secs))
        .connect(url)
        .await
        .map_err(|err| EtlError::Connection {
            target: target.label().to_string(),
            message: err.to_string(),
        })?;
    info!(db_target = target.label(), "connected to database");
    Ok(pool)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub has_provenance: bool,
}

/// Database seam used by the duplicate guard and the loader.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Every base table of the target schema.
    async fn list_tables(&self) -> Result<Vec<TableInfo>, EtlError>;

    async fn count_rows_for_source(
        &self,
        table: &str,
        source_name: &SourceName,
    ) -> Result<i64, EtlError>;

    async fn begin_batch(&self) -> Result<Box<dyn BatchWriter>, EtlError>;
}

/// One open transaction; dropping it without `commit` discards every append.
#[async_trait]
pub trait BatchWriter: Send {
    async fn append(&mut self, table_name: &str, table: &EntityTable) -> Result<u64, EtlError>;
    async fn commit(self: Box<Self>) -> Result<(), EtlError>;
    async fn rollback(self: Box<Self>) -> Result<(), EtlError>;
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

fn rows_per_insert(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).clamp(1, MAX_ROWS_PER_INSERT)
}

async fn list_schema_tables<'e, E>(executor: E, schema: &str) -> Result<Vec<TableInfo>, EtlError>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows: Vec<(String, bool)> = sqlx::query_as(
        r#"
        SELECT t.table_name::text,
               EXISTS (
                   SELECT 1
                     FROM information_schema.columns c
                    WHERE c.table_schema = t.table_schema
                      AND c.table_name = t.table_name
                      AND c.column_name = $2
               )
          FROM information_schema.tables t
         WHERE t.table_schema = $1
           AND t.table_type = 'BASE TABLE'
         ORDER BY t.table_name
        "#,
    )
    .bind(schema)
    .bind(PROVENANCE_COLUMN)
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(name, has_provenance)| TableInfo {
            name,
            has_provenance,
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
    schema: String,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn list_tables(&self) -> Result<Vec<TableInfo>, EtlError> {
        list_schema_tables(&self.pool, &self.schema).await
    }

    async fn count_rows_for_source(
        &self,
        table: &str,
        source_name: &SourceName,
    ) -> Result<i64, EtlError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = $1",
            qualified_table(&self.schema, table),
            quote_ident(PROVENANCE_COLUMN)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(source_name.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn begin_batch(&self) -> Result<Box<dyn BatchWriter>, EtlError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgBatchWriter {
            tx,
            schema: self.schema.clone(),
        }))
    }
}

pub struct PgBatchWriter {
    tx: Transaction<'static, Postgres>,
    schema: String,
}

/// Text form of a cell, cast by the server to the destination column type.
fn sql_text(value: &ColumnValue) -> Option<String> {
    match value {
        ColumnValue::Null => None,
        ColumnValue::Bool(b) => Some(b.to_string()),
        ColumnValue::Integer(i) => Some(i.to_string()),
        ColumnValue::Float(f) => Some(f.to_string()),
        ColumnValue::Text(s) | ColumnValue::Json(s) => Some(s.clone()),
    }
}

fn push_column_value(
    row: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
    value: &ColumnValue,
    column_type: Option<&str>,
) {
    match sql_text(value) {
        // A typed NULL parameter would clash with non-text columns.
        None => {
            row.push("NULL");
        }
        Some(text) => {
            row.push_bind(text);
            if let Some(column_type) = column_type {
                row.push_unseparated(format!("::{column_type}"));
            }
        }
    }
}

/// Column name to declared type (without modifiers) of an existing table.
/// An unknown table yields an empty map.
async fn column_types<'e, E>(
    executor: E,
    schema: &str,
    table: &str,
) -> Result<HashMap<String, String>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT a.attname::text, format_type(a.atttypid, NULL)
          FROM pg_catalog.pg_attribute a
         WHERE a.attrelid = to_regclass($1)
           AND a.attnum > 0
           AND NOT a.attisdropped
        "#,
    )
    .bind(qualified_table(schema, table))
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().collect())
}

#[async_trait]
impl BatchWriter for PgBatchWriter {
    async fn append(&mut self, table_name: &str, table: &EntityTable) -> Result<u64, EtlError> {
        if table.is_empty() {
            return Ok(0);
        }

        let load_err = |err: sqlx::Error| EtlError::Load {
            table: table_name.to_string(),
            message: err.to_string(),
        };
        let declared = column_types(&mut *self.tx, &self.schema, table_name)
            .await
            .map_err(load_err)?;
        let casts: Vec<Option<&str>> = table
            .columns()
            .iter()
            .map(|c| declared.get(c).map(String::as_str))
            .collect();

        let column_list = table
            .columns()
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_prefix = format!(
            "INSERT INTO {} ({column_list}) ",
            qualified_table(&self.schema, table_name)
        );

        let mut appended = 0u64;
        for chunk in table.rows().chunks(rows_per_insert(table.columns().len())) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(insert_prefix.as_str());
            qb.push_values(chunk, |mut b, row| {
                for (value, column_type) in row.iter().zip(&casts) {
                    push_column_value(&mut b, value, *column_type);
                }
            });
            let result = qb
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(load_err)?;
            appended += result.rows_affected();
        }
        Ok(appended)
    }

    async fn commit(self: Box<Self>) -> Result<(), EtlError> {
        let Self { tx, .. } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), EtlError> {
        let Self { tx, .. } = *self;
        tx.rollback().await?;
        Ok(())
    }
}

/// Refuse a batch whose source name already appears in any table.
pub async fn check_duplicates(
    store: &dyn CatalogStore,
    source_name: &SourceName,
) -> Result<(), EtlError> {
    let tables = store.list_tables().await?;

    if let Some(table) = tables.iter().find(|t| !t.has_provenance) {
        error!(
            table = %table.name,
            source_name = %source_name,
            "table lacks the provenance column, duplicate check cannot run"
        );
        return Err(EtlError::MissingProvenanceColumn {
            table: table.name.clone(),
            column: PROVENANCE_COLUMN,
        });
    }

    let mut existing_rows = 0i64;
    for table in &tables {
        let count = store.count_rows_for_source(&table.name, source_name).await?;
        debug!(table = %table.name, count, "provenance count");
        existing_rows += count;
    }

    if existing_rows > 0 {
        error!(
            source_name = %source_name,
            existing_rows,
            "this file already exists in the database"
        );
        return Err(EtlError::DuplicateFile {
            source_name: source_name.to_string(),
            existing_rows,
        });
    }
    Ok(())
}

/// Append one entity table inside the caller's batch.
pub async fn load(
    table: &EntityTable,
    table_name: &str,
    batch: &mut dyn BatchWriter,
) -> Result<u64, EtlError> {
    let rows = batch.append(table_name, table).await?;
    info!(table = table_name, rows, "successfully loaded");
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableLoadCount {
    pub table: String,
    pub rows: u64,
}

/// Load every table in one batch; any failure rolls the whole batch back.
pub async fn load_tables(
    store: &dyn CatalogStore,
    tables: &[EntityTable],
    source_name: &SourceName,
) -> Result<Vec<TableLoadCount>, EtlError> {
    let mut batch = store.begin_batch().await?;
    info!(tables = tables.len(), "loading tables transactionally");

    let mut counts = Vec::with_capacity(tables.len());
    for table in tables {
        match load(table, table.name(), batch.as_mut()).await {
            Ok(rows) => counts.push(TableLoadCount {
                table: table.name().to_string(),
                rows,
            }),
            Err(err) => {
                error!(
                    table = table.name(),
                    source_name = %source_name,
                    error = %err,
                    "load failed, rolling back batch"
                );
                if let Err(rollback_err) = batch.rollback().await {
                    warn!(error = %rollback_err, "explicit rollback failed; transaction is discarded on drop");
                }
                return Err(err);
            }
        }
    }

    batch.commit().await?;
    info!(source_name = %source_name, "transaction committed");
    Ok(counts)
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub source_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableLoadCount>,
    pub total_rows: u64,
}

/// Guard, transform and load an already-parsed catalog document.
pub async fn load_document(
    store: &dyn CatalogStore,
    schemas: &[EntitySchema],
    document: &CatalogDocument,
    source_name: &SourceName,
) -> Result<LoadSummary, EtlError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("load_batch", %run_id, source_name = %source_name);

    async {
        info!("checking if file already exists");
        check_duplicates(store, source_name).await?;

        info!("tables are being transformed");
        let tables = transform_catalog(schemas, document, source_name)?;

        let counts = load_tables(store, &tables, source_name).await?;
        let total_rows = counts.iter().map(|c| c.rows).sum();
        Ok::<_, EtlError>(LoadSummary {
            run_id,
            source_name: source_name.to_string(),
            started_at,
            finished_at: Utc::now(),
            tables: counts,
            total_rows,
        })
    }
    .instrument(span)
    .await
}

pub async fn run_load(
    store: &dyn CatalogStore,
    artifacts: &ArtifactStore,
    source_name: &SourceName,
) -> Result<LoadSummary, EtlError> {
    let document = artifacts.read_document(source_name).await.map_err(|err| {
        error!(source_name = %source_name, error = %err, "cannot read source artifact");
        err
    })?;
    load_document(store, CATALOG_SCHEMA, &document, source_name).await
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub run_id: Uuid,
    pub artifact: String,
    pub path: String,
    pub bytes: usize,
    pub content_hash: String,
    pub deduplicated: bool,
}

pub async fn fetch_catalog_artifact(
    fetcher: &HttpFetcher,
    artifacts: &ArtifactStore,
    request: &CatalogRequest,
) -> Result<FetchSummary, EtlError> {
    let run_id = Uuid::new_v4();
    info!(%run_id, endpoint = %request.endpoint, locale = %request.locale, "fetching catalog");
    let response = fetcher.fetch_catalog(run_id, request).await?;
    let stored = artifacts
        .store_fetched(response.fetched_at, &response.body)
        .await?;
    info!(
        %run_id,
        artifact = %stored.name,
        bytes = stored.byte_size,
        deduplicated = stored.deduplicated,
        "saved catalog artifact"
    );
    Ok(FetchSummary {
        run_id,
        artifact: stored.name.to_string(),
        path: stored.absolute_path.display().to_string(),
        bytes: stored.byte_size,
        content_hash: stored.content_hash,
        deduplicated: stored.deduplicated,
    })
}

pub async fn run_fetch_once(config: &EtlConfig) -> Result<FetchSummary, EtlError> {
    let fetcher = config.http_fetcher()?;
    fetch_catalog_artifact(&fetcher, &config.artifact_store(), &config.catalog_request()).await
}

/// Scheduler running one fetch per cron tick; failures are logged, not propagated.
pub async fn build_fetch_scheduler(config: EtlConfig) -> Result<JobScheduler, EtlError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|err| EtlError::Scheduler(format!("creating scheduler: {err}")))?;
    let cron = config.fetch_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = config.clone();
        Box::pin(async move {
            info!("timer trigger starting catalog extraction");
            match run_fetch_once(&config).await {
                Ok(summary) => info!(artifact = %summary.artifact, "scheduled fetch completed"),
                Err(err) => error!(error = %err, "scheduled fetch failed"),
            }
        })
    })
    .map_err(|err| EtlError::Scheduler(format!("creating job for cron {cron}: {err}")))?;
    sched
        .add(job)
        .await
        .map_err(|err| EtlError::Scheduler(format!("adding job: {err}")))?;
    Ok(sched)
}

/// Enable row level security with a SELECT-only policy for `anon` on every
/// table of `schema`. Re-running replaces the policy.
pub async fn grant_read_access(
    pool: &PgPool,
    schema: &str,
    target_label: &str,
) -> Result<Vec<String>, EtlError> {
    info!(db_target = target_label, "enabling row level security");
    let result = async {
        let mut tx = pool.begin().await?;
        let tables = list_schema_tables(&mut *tx, schema).await?;
        let policy = quote_ident(READ_POLICY_NAME);
        for table in &tables {
            let qualified = qualified_table(schema, &table.name);
            sqlx::query(&format!("DROP POLICY IF EXISTS {policy} ON {qualified}"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!("ALTER TABLE {qualified} ENABLE ROW LEVEL SECURITY"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!(
                "CREATE POLICY {policy} ON {qualified} FOR SELECT TO anon USING (true)"
            ))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok::<_, EtlError>(tables.into_iter().map(|t| t.name).collect::<Vec<_>>())
    }
    .await;

    match &result {
        Ok(tables) => info!(
            db_target = target_label,
            tables = tables.len(),
            "read-only access granted to anon on all tables"
        ),
        Err(err) => error!(db_target = target_label, error = %err, "failed to set row level security"),
    }
    result
}
