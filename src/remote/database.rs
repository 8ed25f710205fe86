//! Remote data channel for the relational store.
//!
//! The trait covers the structured query, bulk export, and bulk import
//! primitives the engine needs; the production backend shells out to
//! `psql` and `pg_dump`, which is the platform's supported access path.
//! Row transport uses the COPY text format in both directions, and all
//! stderr interpretation is confined to the classifier adapter at the
//! bottom of this file.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::Environment;
use crate::error::{RemoteError, Result, SyncError, is_rate_limit_signature};

use super::endpoint::ConnectionEndpoint;

/// Platform-internal schemas never touched by a sync.
pub const EXCLUDED_SCHEMAS: &[&str] = &[
    "cron",
    "extensions",
    "graphql",
    "graphql_public",
    "information_schema",
    "net",
    "pg_catalog",
    "pgbouncer",
    "pgsodium",
    "pgsodium_masks",
    "realtime",
    "storage",
    "supabase_functions",
    "supabase_migrations",
    "vault",
];

/// Rows per generated INSERT statement.
const INSERT_BATCH_SIZE: usize = 500;

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedTable {
    /// Schema name.
    pub schema: String,
    /// Table name.
    pub name: String,
}

impl QualifiedTable {
    /// Creates a qualified table name.
    #[must_use]
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parses `schema.table`; a bare name defaults to the `public` schema.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        value.split_once('.').map_or_else(
            || Self::new("public", value),
            |(schema, name)| Self::new(schema, name),
        )
    }

    /// Returns the double-quoted SQL reference for this table.
    #[must_use]
    pub fn sql_ref(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl std::fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared data type.
    pub data_type: String,
    /// Whether the column is part of the primary key.
    pub is_primary_key: bool,
}

/// One row as fetched through the channel; values are text-rendered,
/// `None` meaning SQL NULL.
pub type TableRow = Vec<Option<String>>;

/// How an upsert treats rows whose key already exists in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Keep the target's row untouched (`ON CONFLICT DO NOTHING`).
    Ignore,
    /// Overwrite non-key columns from the source row. Only used when a
    /// column-level merge was explicitly requested.
    Merge {
        /// Primary-key columns that identify the conflict.
        key_columns: Vec<String>,
    },
}

/// Structured query, bulk export, and bulk import against one
/// environment's database.
#[async_trait]
pub trait DatabaseChannel: Send + Sync {
    /// Lists syncable tables, excluding platform-internal schemas.
    async fn list_tables(&self, endpoint: &ConnectionEndpoint) -> Result<Vec<QualifiedTable>>;

    /// Returns the column set of one table in ordinal order.
    async fn table_columns(
        &self,
        endpoint: &ConnectionEndpoint,
        table: &QualifiedTable,
    ) -> Result<Vec<ColumnInfo>>;

    /// Fetches the named columns of every row.
    async fn fetch_rows(
        &self,
        endpoint: &ConnectionEndpoint,
        table: &QualifiedTable,
        columns: &[String],
    ) -> Result<Vec<TableRow>>;

    /// Inserts rows with the given conflict strategy; returns rows written.
    async fn upsert_rows(
        &self,
        endpoint: &ConnectionEndpoint,
        table: &QualifiedTable,
        columns: &[String],
        rows: &[TableRow],
        strategy: &ConflictStrategy,
    ) -> Result<u64>;

    /// Returns the DDL needed to recreate one table.
    async fn dump_table_schema(
        &self,
        endpoint: &ConnectionEndpoint,
        table: &QualifiedTable,
    ) -> Result<String>;

    /// Applies a SQL script.
    async fn apply_sql(&self, endpoint: &ConnectionEndpoint, sql: &str) -> Result<()>;

    /// Writes a full plain-SQL dump of the user schemas to `destination`.
    async fn dump_database(
        &self,
        endpoint: &ConnectionEndpoint,
        destination: &Path,
    ) -> Result<()>;
}

/// Subprocess-backed database channel for one environment.
pub struct PgCommandChannel {
    environment: Environment,
    psql_path: String,
    pg_dump_path: String,
}

impl PgCommandChannel {
    /// Creates a channel for the given environment.
    #[must_use]
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            psql_path: String::from("psql"),
            pg_dump_path: String::from("pg_dump"),
        }
    }

    /// Overrides the `psql` binary path.
    #[must_use]
    pub fn with_psql_path(mut self, path: impl Into<String>) -> Self {
        self.psql_path = path.into();
        self
    }

    /// Overrides the `pg_dump` binary path.
    #[must_use]
    pub fn with_pg_dump_path(mut self, path: impl Into<String>) -> Self {
        self.pg_dump_path = path.into();
        self
    }

    /// Builds the password-free connection URL for one endpoint. The
    /// password travels through `PGPASSWORD`, never argv.
    fn connection_url(endpoint: &ConnectionEndpoint) -> String {
        format!(
            "postgresql://{}@{}:{}/postgres?sslmode=require",
            endpoint.principal, endpoint.host, endpoint.port
        )
    }

    /// Runs `psql` with the given extra args, returning stdout.
    async fn run_psql(
        &self,
        endpoint: &ConnectionEndpoint,
        operation: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String> {
        let url = Self::connection_url(endpoint);
        debug!(operation, endpoint = %endpoint, "running psql");

        let mut command = Command::new(&self.psql_path);
        command
            .arg("-X")
            .arg("-v")
            .arg("ON_ERROR_STOP=1")
            .arg("-d")
            .arg(&url)
            .args(args)
            .env("PGPASSWORD", &self.environment.credentials.db_password)
            .env("PGCONNECT_TIMEOUT", "10")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            RemoteError::operation(operation, format!("failed to run {}: {e}", self.psql_path))
        })?;

        if let Some(input) = stdin
            && let Some(mut handle) = child.stdin.take()
        {
            handle.write_all(input.as_bytes()).await?;
            handle.shutdown().await?;
        } else {
            drop(child.stdin.take());
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_psql_failure(endpoint, operation, stderr.trim()))
        }
    }

    /// Runs a single query with tuples-only tab-separated output.
    async fn run_query(
        &self,
        endpoint: &ConnectionEndpoint,
        operation: &str,
        sql: &str,
    ) -> Result<String> {
        self.run_psql(endpoint, operation, &["-q", "-At", "-F", "\t", "-c", sql], None)
            .await
    }
}

#[async_trait]
impl DatabaseChannel for PgCommandChannel {
    async fn list_tables(&self, endpoint: &ConnectionEndpoint) -> Result<Vec<QualifiedTable>> {
        let sql = format!(
            "select schemaname, tablename from pg_tables where schemaname not in ({}) \
             order by schemaname, tablename",
            excluded_schemas_clause()
        );
        let output = self.run_query(endpoint, "list-tables", &sql).await?;

        Ok(output
            .lines()
            .filter_map(|line| {
                line.split_once('\t')
                    .map(|(schema, name)| QualifiedTable::new(schema, name))
            })
            .collect())
    }

    async fn table_columns(
        &self,
        endpoint: &ConnectionEndpoint,
        table: &QualifiedTable,
    ) -> Result<Vec<ColumnInfo>> {
        let sql = format!(
            "select c.column_name, c.data_type, \
                    case when kcu.column_name is not null then 't' else 'f' end \
               from information_schema.columns c \
               left join information_schema.table_constraints tc \
                 on tc.table_schema = c.table_schema \
                and tc.table_name = c.table_name \
                and tc.constraint_type = 'PRIMARY KEY' \
               left join information_schema.key_column_usage kcu \
                 on kcu.constraint_name = tc.constraint_name \
                and kcu.table_schema = c.table_schema \
                and kcu.column_name = c.column_name \
              where c.table_schema = {} and c.table_name = {} \
              order by c.ordinal_position",
            quote_literal(Some(&table.schema)),
            quote_literal(Some(&table.name)),
        );
        let output = self.run_query(endpoint, "table-columns", &sql).await?;

        let mut columns = Vec::new();
        for line in output.lines() {
            let mut parts = line.split('\t');
            let (Some(name), Some(data_type), Some(is_pk)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(RemoteError::InvalidResponse {
                    message: format!("malformed column row: {line}"),
                }
                .into());
            };
            columns.push(ColumnInfo {
                name: name.to_string(),
                data_type: data_type.to_string(),
                is_primary_key: is_pk == "t",
            });
        }
        Ok(columns)
    }

    async fn fetch_rows(
        &self,
        endpoint: &ConnectionEndpoint,
        table: &QualifiedTable,
        columns: &[String],
    ) -> Result<Vec<TableRow>> {
        if columns.is_empty() {
            return Ok(Vec::new());
        }

        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "copy (select {column_list} from {}) to stdout",
            table.sql_ref()
        );
        let output = self
            .run_psql(endpoint, "fetch-rows", &["-q", "-c", &sql], None)
            .await?;

        Ok(output.lines().map(parse_copy_line).collect())
    }

    async fn upsert_rows(
        &self,
        endpoint: &ConnectionEndpoint,
        table: &QualifiedTable,
        columns: &[String],
        rows: &[TableRow],
        strategy: &ConflictStrategy,
    ) -> Result<u64> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let script = build_insert_statements(table, columns, rows, strategy, INSERT_BATCH_SIZE)
            .join("\n");
        let output = self
            .run_psql(endpoint, "upsert-rows", &["-At"], Some(&script))
            .await?;
        Ok(parse_command_tag_count(&output))
    }

    async fn dump_table_schema(
        &self,
        endpoint: &ConnectionEndpoint,
        table: &QualifiedTable,
    ) -> Result<String> {
        let url = Self::connection_url(endpoint);
        let table_ref = format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name));

        let output = Command::new(&self.pg_dump_path)
            .arg("--schema-only")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--table")
            .arg(&table_ref)
            .arg("-d")
            .arg(&url)
            .env("PGPASSWORD", &self.environment.credentials.db_password)
            .env("PGCONNECT_TIMEOUT", "10")
            .output()
            .await
            .map_err(|e| {
                RemoteError::operation(
                    "dump-table-schema",
                    format!("failed to run {}: {e}", self.pg_dump_path),
                )
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_psql_failure(endpoint, "dump-table-schema", stderr.trim()))
        }
    }

    async fn apply_sql(&self, endpoint: &ConnectionEndpoint, sql: &str) -> Result<()> {
        self.run_psql(endpoint, "apply-sql", &["-q"], Some(sql))
            .await?;
        Ok(())
    }

    async fn dump_database(
        &self,
        endpoint: &ConnectionEndpoint,
        destination: &Path,
    ) -> Result<()> {
        let url = Self::connection_url(endpoint);
        debug!(endpoint = %endpoint, path = %destination.display(), "running pg_dump");

        let mut command = Command::new(&self.pg_dump_path);
        command
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("-f")
            .arg(destination)
            .arg("-d")
            .arg(&url)
            .env("PGPASSWORD", &self.environment.credentials.db_password)
            .env("PGCONNECT_TIMEOUT", "10");
        for schema in EXCLUDED_SCHEMAS {
            command.arg("--exclude-schema").arg(schema);
        }

        let output = command.output().await.map_err(|e| {
            RemoteError::operation(
                "dump-database",
                format!("failed to run {}: {e}", self.pg_dump_path),
            )
        })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_psql_failure(endpoint, "dump-database", stderr.trim()))
        }
    }
}

/// Renders the excluded-schema list as a SQL IN clause body.
fn excluded_schemas_clause() -> String {
    EXCLUDED_SCHEMAS
        .iter()
        .map(|s| quote_literal(Some(s)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Double-quotes an identifier, doubling embedded quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quotes a literal, doubling embedded quotes; `None` renders NULL.
#[must_use]
pub fn quote_literal(value: Option<&str>) -> String {
    value.map_or_else(
        || String::from("NULL"),
        |v| format!("'{}'", v.replace('\'', "''")),
    )
}

/// Parses one line of COPY text format into a row.
#[must_use]
pub fn parse_copy_line(line: &str) -> TableRow {
    line.split('\t').map(parse_copy_field).collect()
}

/// Unescapes one COPY text field; `\N` is NULL.
fn parse_copy_field(field: &str) -> Option<String> {
    if field == "\\N" {
        return None;
    }

    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('t') => out.push('\t'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('b') => out.push('\u{8}'),
                Some('f') => out.push('\u{c}'),
                Some('v') => out.push('\u{b}'),
                Some('\\') => out.push('\\'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Builds batched INSERT statements for the given rows.
#[must_use]
pub fn build_insert_statements(
    table: &QualifiedTable,
    columns: &[String],
    rows: &[TableRow],
    strategy: &ConflictStrategy,
    batch_size: usize,
) -> Vec<String> {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let conflict_clause = match strategy {
        ConflictStrategy::Ignore => String::from("on conflict do nothing"),
        ConflictStrategy::Merge { key_columns } => {
            let key_list = key_columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !key_columns.contains(c))
                .map(|c| format!("{id} = excluded.{id}", id = quote_ident(c)))
                .collect();
            if updates.is_empty() {
                String::from("on conflict do nothing")
            } else {
                format!("on conflict ({key_list}) do update set {}", updates.join(", "))
            }
        }
    };

    rows.chunks(batch_size.max(1))
        .map(|chunk| {
            let values = chunk
                .iter()
                .map(|row| {
                    let rendered = row
                        .iter()
                        .map(|v| quote_literal(v.as_deref()))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("({rendered})")
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "insert into {} ({column_list}) values {values} {conflict_clause};",
                table.sql_ref()
            )
        })
        .collect()
}

/// Sums the row counts from INSERT/DELETE command tags in psql output.
#[must_use]
pub fn parse_command_tag_count(output: &str) -> u64 {
    output
        .lines()
        .filter_map(|line| {
            let rest = line
                .strip_prefix("INSERT 0 ")
                .or_else(|| line.strip_prefix("DELETE "))?;
            rest.trim().parse::<u64>().ok()
        })
        .sum()
}

/// Maps libpq/psql stderr onto the error taxonomy.
///
/// This is the classifier adapter for the subprocess backend; the patterns
/// stay here and never leak into engine logic.
fn classify_psql_failure(
    endpoint: &ConnectionEndpoint,
    operation: &str,
    stderr: &str,
) -> SyncError {
    let lower = stderr.to_lowercase();

    let unreachable = [
        "could not connect",
        "connection refused",
        "connection timed out",
        "timeout expired",
        "could not translate host name",
        "no route to host",
        "network is unreachable",
        "server closed the connection",
        "connection reset",
    ];
    if unreachable.iter().any(|p| lower.contains(p)) {
        return RemoteError::unreachable(endpoint.describe(), stderr).into();
    }

    let unauthorized = [
        "password authentication failed",
        "permission denied",
        "no pg_hba.conf entry",
        "role \"",
    ];
    if unauthorized.iter().any(|p| lower.contains(p)) {
        return RemoteError::Unauthorized {
            message: stderr.to_string(),
        }
        .into();
    }

    if is_rate_limit_signature(stderr) || lower.contains("remaining connection slots") {
        return RemoteError::RateLimited {
            retry_after_secs: None,
        }
        .into();
    }

    if lower.contains("does not exist") {
        return RemoteError::NotFound {
            resource: operation.to_string(),
        }
        .into();
    }

    RemoteError::operation(operation, stderr).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::remote::endpoint::EndpointKind;

    fn test_endpoint() -> ConnectionEndpoint {
        ConnectionEndpoint {
            host: String::from("db.abcdefghijklmnopqrst.supabase.co"),
            port: 5432,
            principal: String::from("postgres"),
            kind: EndpointKind::DedicatedDirect,
        }
    }

    #[test]
    fn test_qualified_table_parse() {
        assert_eq!(
            QualifiedTable::parse("auth.roles"),
            QualifiedTable::new("auth", "roles")
        );
        assert_eq!(
            QualifiedTable::parse("profiles"),
            QualifiedTable::new("public", "profiles")
        );
        assert_eq!(QualifiedTable::parse("auth.roles").to_string(), "auth.roles");
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("profiles"), "\"profiles\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
        assert_eq!(quote_literal(Some("it's")), "'it''s'");
        assert_eq!(quote_literal(None), "NULL");
    }

    #[test]
    fn test_connection_url_has_no_password() {
        let url = PgCommandChannel::connection_url(&test_endpoint());
        assert_eq!(
            url,
            "postgresql://postgres@db.abcdefghijklmnopqrst.supabase.co:5432/postgres?sslmode=require"
        );
    }

    #[test]
    fn test_parse_copy_line() {
        assert_eq!(
            parse_copy_line("1\talice\t\\N"),
            vec![Some("1".into()), Some("alice".into()), None]
        );
        // Empty string and NULL are distinct
        assert_eq!(parse_copy_line(""), vec![Some(String::new())]);
        // Escaped separators unescape to real characters
        assert_eq!(
            parse_copy_line("a\\tb\\nc\t\\\\slash"),
            vec![Some("a\tb\nc".into()), Some("\\slash".into())]
        );
    }

    #[test]
    fn test_build_insert_on_conflict_do_nothing() {
        let table = QualifiedTable::new("public", "profiles");
        let columns = vec![String::from("id"), String::from("name")];
        let rows: Vec<TableRow> = vec![
            vec![Some("1".into()), Some("alice".into())],
            vec![Some("2".into()), None],
        ];

        let statements =
            build_insert_statements(&table, &columns, &rows, &ConflictStrategy::Ignore, 500);
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0],
            "insert into \"public\".\"profiles\" (\"id\", \"name\") \
             values ('1', 'alice'), ('2', NULL) on conflict do nothing;"
        );
    }

    #[test]
    fn test_build_insert_merge_updates_non_key_columns() {
        let table = QualifiedTable::new("public", "profiles");
        let columns = vec![String::from("id"), String::from("name")];
        let rows: Vec<TableRow> = vec![vec![Some("1".into()), Some("alice".into())]];
        let strategy = ConflictStrategy::Merge {
            key_columns: vec![String::from("id")],
        };

        let statements = build_insert_statements(&table, &columns, &rows, &strategy, 500);
        assert!(statements[0].contains("on conflict (\"id\") do update set \"name\" = excluded.\"name\""));
    }

    #[test]
    fn test_insert_batching() {
        let table = QualifiedTable::new("public", "t");
        let columns = vec![String::from("id")];
        let rows: Vec<TableRow> = (0..5).map(|i| vec![Some(i.to_string())]).collect();

        let statements =
            build_insert_statements(&table, &columns, &rows, &ConflictStrategy::Ignore, 2);
        assert_eq!(statements.len(), 3);
    }

    #[test]
    fn test_parse_command_tag_count() {
        assert_eq!(parse_command_tag_count("INSERT 0 5\nINSERT 0 3"), 8);
        assert_eq!(parse_command_tag_count("DELETE 7"), 7);
        assert_eq!(parse_command_tag_count("SET\nCOPY 4"), 0);
    }

    #[test]
    fn test_classifier_unreachable() {
        let error = classify_psql_failure(
            &test_endpoint(),
            "list-tables",
            "psql: error: connection to server failed: Connection refused",
        );
        assert_eq!(error.class(), ErrorClass::Unreachable);
    }

    #[test]
    fn test_classifier_unauthorized() {
        let error = classify_psql_failure(
            &test_endpoint(),
            "list-tables",
            "FATAL: password authentication failed for user \"postgres\"",
        );
        assert_eq!(error.class(), ErrorClass::Unauthorized);
    }

    #[test]
    fn test_classifier_rate_limited() {
        let error = classify_psql_failure(
            &test_endpoint(),
            "fetch-rows",
            "FATAL: too many connections for role",
        );
        assert_eq!(error.class(), ErrorClass::RateLimited);
    }

    #[test]
    fn test_classifier_not_found() {
        let error = classify_psql_failure(
            &test_endpoint(),
            "delete-rows",
            "ERROR: relation \"public.gone\" does not exist",
        );
        assert_eq!(error.class(), ErrorClass::NotFound);
    }

    #[test]
    fn test_classifier_default_is_operation_failure() {
        let error = classify_psql_failure(
            &test_endpoint(),
            "apply-sql",
            "ERROR: syntax error at or near \"frm\"",
        );
        assert_eq!(error.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_excluded_schemas_contains_platform_internals() {
        let clause = excluded_schemas_clause();
        assert!(clause.contains("'storage'"));
        assert!(clause.contains("'pg_catalog'"));
        // User-facing schemas like auth stay syncable
        assert!(!clause.contains("'auth'"));
    }
}
