//! Read-only access to the relational store and the optimization engine store.
//!
//! Both stores are PostgreSQL instances running in the cluster. Queries are
//! issued through `psql` inside the database pod via the exec subresource, so
//! the verifier needs no database network route or driver. Every query is
//! behind a trait so the verifier logic can be exercised without a cluster.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use parking_lot::RwLock;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use pipecheck_common::kube_utils::{exec_capture, find_running_pod};
use pipecheck_common::{Error, Result};

use crate::config::StoreTarget;

/// Column separator passed to `psql -F`; never appears in stored values
const FIELD_SEPARATOR: char = '\u{1f}';

/// Longest identifier PostgreSQL accepts without truncation
const MAX_IDENTIFIER_LEN: usize = 63;

/// Runs one SQL statement and returns its rows as text columns
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SqlRunner: Send + Sync {
    /// Execute `sql` and return every row
    async fn query(&self, sql: &str) -> Result<Vec<Vec<String>>>;
}

/// `psql` executed inside a database pod
pub struct PsqlPod {
    client: Client,
    target: StoreTarget,
    label: String,
    timeout: Duration,
    pod: RwLock<Option<String>>,
}

impl fmt::Debug for PsqlPod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PsqlPod")
            .field("label", &self.label)
            .field("namespace", &self.target.namespace)
            .field("database", &self.target.database)
            .finish()
    }
}

impl PsqlPod {
    /// Create a runner for the database described by `target`
    ///
    /// `label` names the store in errors (e.g. `cost`, `optimization`).
    pub fn new(
        client: Client,
        target: StoreTarget,
        label: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            target,
            label: label.into(),
            timeout,
            pod: RwLock::new(None),
        }
    }

    async fn pod_name(&self) -> Result<String> {
        let cached = self.pod.read().clone();
        if let Some(name) = cached {
            return Ok(name);
        }
        let target = &self.target;
        let name = find_running_pod(&self.client, &target.namespace, &target.pod_selector).await?;
        debug!(store = %self.label, pod = %name, "Resolved database pod");
        *self.pod.write() = Some(name.clone());
        Ok(name)
    }

    fn command(&self, sql: &str) -> Vec<String> {
        vec![
            "psql".to_string(),
            "-U".to_string(),
            self.target.user.clone(),
            "-d".to_string(),
            self.target.database.clone(),
            "-At".to_string(),
            "-F".to_string(),
            FIELD_SEPARATOR.to_string(),
            "-v".to_string(),
            "ON_ERROR_STOP=1".to_string(),
            "-c".to_string(),
            sql.to_string(),
        ]
    }
}

#[async_trait]
impl SqlRunner for PsqlPod {
    async fn query(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        let pod = self.pod_name().await?;
        let output = exec_capture(
            &self.client,
            &self.target.namespace,
            &pod,
            self.target.container.as_deref(),
            &self.command(sql),
            self.timeout,
        )
        .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                // the pod may have been rescheduled; resolve it again next time
                self.pod.write().take();
                return Err(e);
            }
        };

        if !output.success {
            let detail = if output.stderr.trim().is_empty() {
                output.message.unwrap_or_else(|| "psql exited non-zero".to_string())
            } else {
                output.stderr.trim().to_string()
            };
            return Err(Error::store(&self.label, detail));
        }
        if !output.stderr.trim().is_empty() {
            warn!(store = %self.label, stderr = %output.stderr.trim(), "psql wrote to stderr");
        }

        Ok(parse_rows(&output.stdout))
    }
}

/// Split unaligned `psql` output into rows of columns
pub fn parse_rows(stdout: &str) -> Vec<Vec<String>> {
    stdout
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| line.split(FIELD_SEPARATOR).map(str::to_string).collect())
        .collect()
}

/// Quote a value as a SQL string literal
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote a value as a `LIKE '%value%'` pattern with wildcards escaped
pub fn like_contains(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{} ESCAPE '\\'", sql_literal(&format!("%{}%", escaped)))
}

/// Accept only lowercase unquoted PostgreSQL identifiers
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::config(format!(
            "'{}' is not a valid schema identifier",
            name
        )));
    }
    Ok(())
}

// =============================================================================
// Relational store
// =============================================================================

/// Provider record created once a registration reaches the ingestion service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    /// Provider UUID
    pub uuid: String,
    /// Provider name
    pub name: String,
    /// Correlation key stored in the provider credentials
    pub cluster_id: String,
}

/// Most recent manifest for a correlation key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    /// Manifest row id
    pub id: i64,
    /// Correlation key the manifest was recorded under
    pub cluster_id: String,
    /// Number of files the uploaded manifest declared
    pub file_count: u32,
    /// When processing of every file finished, if it has
    pub completed_at: Option<String>,
}

/// Processing state of one report file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Not yet processed
    Pending,
    /// Processed successfully
    Success,
    /// Processing failed
    Failed,
}

impl FileState {
    /// Interpret the status column and completion timestamp of a status row
    ///
    /// Accepts both the numeric status codes and textual states; rows without
    /// a status fall back to whether the file has a completion time.
    pub fn from_columns(status: &str, completed_at: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "1" | "success" | "done" | "complete" | "completed" => FileState::Success,
            "2" | "failed" | "failure" | "error" => FileState::Failed,
            "" if !completed_at.trim().is_empty() => FileState::Success,
            _ => FileState::Pending,
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileState::Pending => write!(f, "pending"),
            FileState::Success => write!(f, "success"),
            FileState::Failed => write!(f, "failed"),
        }
    }
}

/// One report file of a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    /// Report file name
    pub name: String,
    /// Processing state
    pub state: FileState,
}

/// Aggregated daily summary for a correlation key
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    /// Correlation key of the aggregated rows
    pub cluster_id: String,
    /// Number of summary rows
    pub row_count: u64,
    /// Sum of pod CPU usage, core-hours
    pub cpu_core_hours: f64,
    /// Sum of pod memory usage, GB-hours
    pub memory_gigabyte_hours: f64,
}

/// Queries against the relational store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Provider created for a registered resource
    async fn provider_for_cluster(&self, correlation_key: &str) -> Result<Option<ProviderRecord>>;

    /// Latest manifest recorded for the key
    async fn manifest(&self, correlation_key: &str) -> Result<Option<ManifestRecord>>;

    /// Per-file status rows of a manifest
    async fn file_statuses(&self, manifest_id: i64) -> Result<Vec<FileStatus>>;

    /// Aggregated summary for the key; `None` when no rows exist
    async fn summary(&self, correlation_key: &str) -> Result<Option<SummaryRecord>>;
}

/// [`RelationalStore`] over the cost management schema
pub struct CostStore<R> {
    runner: R,
    schema: String,
}

impl<R: SqlRunner> CostStore<R> {
    /// Create a store querying summary tables in `schema`
    pub fn new(runner: R, schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        validate_identifier(&schema)?;
        Ok(Self { runner, schema })
    }
}

fn column<'a>(row: &'a [String], idx: usize, store: &str) -> Result<&'a str> {
    row.get(idx)
        .map(String::as_str)
        .ok_or_else(|| Error::store(store, format!("row has no column {}", idx)))
}

fn parse_column<T: std::str::FromStr>(row: &[String], idx: usize, store: &str) -> Result<T> {
    let raw = column(row, idx, store)?;
    raw.trim()
        .parse()
        .map_err(|_| Error::store(store, format!("unexpected value '{}' in column {}", raw, idx)))
}

#[async_trait]
impl<R: SqlRunner> RelationalStore for CostStore<R> {
    async fn provider_for_cluster(&self, correlation_key: &str) -> Result<Option<ProviderRecord>> {
        let sql = format!(
            "SELECT p.uuid, p.name, a.credentials->>'cluster_id' \
             FROM api_provider p \
             JOIN api_providerauthentication a ON p.authentication_id = a.id \
             WHERE a.credentials->>'cluster_id' = {} \
             ORDER BY p.created_timestamp DESC LIMIT 1",
            sql_literal(correlation_key)
        );
        let rows = self.runner.query(&sql).await?;
        rows.first()
            .map(|row| {
                Ok(ProviderRecord {
                    uuid: column(row, 0, "cost")?.to_string(),
                    name: column(row, 1, "cost")?.to_string(),
                    cluster_id: column(row, 2, "cost")?.to_string(),
                })
            })
            .transpose()
    }

    async fn manifest(&self, correlation_key: &str) -> Result<Option<ManifestRecord>> {
        let sql = format!(
            "SELECT id, cluster_id, coalesce(num_total_files, 0), \
             coalesce(to_char(completed_datetime, 'YYYY-MM-DD\"T\"HH24:MI:SS'), '') \
             FROM reporting_common_costusagereportmanifest \
             WHERE cluster_id = {} ORDER BY id DESC LIMIT 1",
            sql_literal(correlation_key)
        );
        let rows = self.runner.query(&sql).await?;
        rows.first()
            .map(|row| {
                let completed = column(row, 3, "cost")?;
                Ok(ManifestRecord {
                    id: parse_column(row, 0, "cost")?,
                    cluster_id: column(row, 1, "cost")?.to_string(),
                    file_count: parse_column(row, 2, "cost")?,
                    completed_at: (!completed.is_empty()).then(|| completed.to_string()),
                })
            })
            .transpose()
    }

    async fn file_statuses(&self, manifest_id: i64) -> Result<Vec<FileStatus>> {
        let sql = format!(
            "SELECT report_name, coalesce(status::text, ''), \
             coalesce(to_char(completed_datetime, 'YYYY-MM-DD\"T\"HH24:MI:SS'), '') \
             FROM reporting_common_costusagereportstatus \
             WHERE manifest_id = {} ORDER BY report_name",
            manifest_id
        );
        self.runner
            .query(&sql)
            .await?
            .iter()
            .map(|row| {
                Ok(FileStatus {
                    name: column(row, 0, "cost")?.to_string(),
                    state: FileState::from_columns(
                        column(row, 1, "cost")?,
                        column(row, 2, "cost")?,
                    ),
                })
            })
            .collect()
    }

    async fn summary(&self, correlation_key: &str) -> Result<Option<SummaryRecord>> {
        let sql = format!(
            "SELECT cluster_id, count(*), \
             coalesce(sum(pod_usage_cpu_core_hours), 0), \
             coalesce(sum(pod_usage_memory_gigabyte_hours), 0) \
             FROM {}.reporting_ocpusagelineitem_daily_summary \
             WHERE cluster_id = {} GROUP BY cluster_id",
            self.schema,
            sql_literal(correlation_key)
        );
        let rows = self.runner.query(&sql).await?;
        rows.first()
            .map(|row| {
                Ok(SummaryRecord {
                    cluster_id: column(row, 0, "cost")?.to_string(),
                    row_count: parse_column(row, 1, "cost")?,
                    cpu_core_hours: parse_column(row, 2, "cost")?,
                    memory_gigabyte_hours: parse_column(row, 3, "cost")?,
                })
            })
            .transpose()
    }
}

// =============================================================================
// Optimization engine store
// =============================================================================

/// Queries against the optimization engine store
///
/// The engine keeps the correlation key inside a composite experiment name,
/// so both counts match it as a substring.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OptimizationStore: Send + Sync {
    /// Experiments whose name contains the key
    async fn experiment_count(&self, correlation_key: &str) -> Result<u64>;

    /// Recommendations whose experiment name contains the key
    async fn recommendation_count(&self, correlation_key: &str) -> Result<u64>;
}

/// [`OptimizationStore`] over the engine's experiment tables
pub struct OptimizationEngineStore<R> {
    runner: R,
}

impl<R: SqlRunner> OptimizationEngineStore<R> {
    /// Create a store over `runner`
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    async fn count(&self, table: &str, correlation_key: &str) -> Result<u64> {
        let sql = format!(
            "SELECT count(*) FROM {} WHERE experiment_name LIKE {}",
            table,
            like_contains(correlation_key)
        );
        let rows = self.runner.query(&sql).await?;
        match rows.first() {
            Some(row) => parse_column(row, 0, "optimization"),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl<R: SqlRunner> OptimizationStore for OptimizationEngineStore<R> {
    async fn experiment_count(&self, correlation_key: &str) -> Result<u64> {
        self.count("kruize_experiments", correlation_key).await
    }

    async fn recommendation_count(&self, correlation_key: &str) -> Result<u64> {
        self.count("kruize_recommendations", correlation_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;

    fn row(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn literals_escape_quotes() {
        assert_eq!(sql_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(
            like_contains("test_cluster%1"),
            r"'%test\_cluster\%1%' ESCAPE '\'"
        );
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("org1234567").is_ok());
        assert!(validate_identifier("_tenant").is_ok());
        assert!(validate_identifier("Org1").is_err());
        assert!(validate_identifier("1org").is_err());
        assert!(validate_identifier("org; DROP").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn psql_output_is_split_on_separator() {
        let out = format!("1{0}a{0}\n\n2{0}b{0}x\n", FIELD_SEPARATOR);
        assert_eq!(
            parse_rows(&out),
            vec![row(&["1", "a", ""]), row(&["2", "b", "x"])]
        );
    }

    #[test]
    fn file_state_accepts_codes_text_and_timestamps() {
        assert_eq!(FileState::from_columns("1", ""), FileState::Success);
        assert_eq!(FileState::from_columns("2", ""), FileState::Failed);
        assert_eq!(FileState::from_columns("0", ""), FileState::Pending);
        assert_eq!(FileState::from_columns("FAILED", ""), FileState::Failed);
        assert_eq!(FileState::from_columns("", "2024-01-01T00:00:00"), FileState::Success);
        assert_eq!(FileState::from_columns("", ""), FileState::Pending);
    }

    #[tokio::test]
    async fn manifest_is_parsed() {
        let mut runner = MockSqlRunner::new();
        runner
            .expect_query()
            .withf(|sql| sql.contains("cluster_id = 'test-cluster-1'"))
            .times(1)
            .returning(|_| Ok(vec![row(&["42", "test-cluster-1", "2", ""])]));

        let store = CostStore::new(runner, "org1234567").unwrap();
        let manifest = store.manifest("test-cluster-1").await.unwrap().unwrap();

        assert_eq!(manifest.id, 42);
        assert_eq!(manifest.file_count, 2);
        assert!(manifest.completed_at.is_none());
    }

    #[tokio::test]
    async fn missing_rows_are_none() {
        let mut runner = MockSqlRunner::new();
        runner.expect_query().returning(|_| Ok(vec![]));

        let store = CostStore::new(runner, "org1234567").unwrap();
        assert!(store.manifest("k").await.unwrap().is_none());
        assert!(store.summary("k").await.unwrap().is_none());
        assert!(store.provider_for_cluster("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn summary_queries_tenant_schema() {
        let mut runner = MockSqlRunner::new();
        runner
            .expect_query()
            .withf(|sql| sql.contains("FROM org1234567.reporting_ocpusagelineitem_daily_summary"))
            .returning(|_| Ok(vec![row(&["k", "24", "3.5", "12.25"])]));

        let store = CostStore::new(runner, "org1234567").unwrap();
        let summary = store.summary("k").await.unwrap().unwrap();

        assert_eq!(summary.row_count, 24);
        assert_eq!(summary.cpu_core_hours, 3.5);
    }

    #[tokio::test]
    async fn malformed_rows_are_store_errors() {
        let mut runner = MockSqlRunner::new();
        runner
            .expect_query()
            .returning(|_| Ok(vec![row(&["not-a-number", "k", "1", ""])]));

        let store = CostStore::new(runner, "org1234567").unwrap();
        let err = store.manifest("k").await.unwrap_err();
        assert!(matches!(err, Error::Store { .. }));
    }

    #[test]
    fn invalid_schema_is_rejected() {
        assert!(CostStore::new(MockSqlRunner::new(), "org-1").is_err());
    }

    #[tokio::test]
    async fn optimization_counts_match_substring() {
        let mut runner = MockSqlRunner::new();
        runner
            .expect_query()
            .with(eq(concat!(
                "SELECT count(*) FROM kruize_experiments ",
                r"WHERE experiment_name LIKE '%test-cluster-1%' ESCAPE '\'",
            )))
            .returning(|_| Ok(vec![row(&["3"])]));
        runner
            .expect_query()
            .withf(|sql| sql.contains("kruize_recommendations"))
            .returning(|_| Ok(vec![row(&["0"])]));

        let store = OptimizationEngineStore::new(runner);
        assert_eq!(store.experiment_count("test-cluster-1").await.unwrap(), 3);
        assert_eq!(store.recommendation_count("test-cluster-1").await.unwrap(), 0);
    }
}
