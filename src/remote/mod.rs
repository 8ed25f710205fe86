//! Remote access layer.
//!
//! This module provides everything that touches a deployment environment
//! over the network: endpoint resolution, the retry/timeout/fallback
//! executor, and the three channel backends (database, object storage,
//! serverless functions).

mod database;
mod endpoint;
mod executor;
mod functions;
mod retry;
mod storage;

pub use database::{
    ColumnInfo, ConflictStrategy, DatabaseChannel, PgCommandChannel, QualifiedTable, TableRow,
    EXCLUDED_SCHEMAS,
};
pub use endpoint::{ConnectionEndpoint, EndpointKind, EndpointResolver};
pub use executor::RemoteExecutor;
pub use functions::{FunctionChannel, FunctionInfo, HttpFunctionChannel};
pub use retry::{RetryPolicy, retry_with_policy};
pub use storage::{BucketInfo, HttpStorageChannel, ObjectInfo, StorageChannel};
