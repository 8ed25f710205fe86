//! Sync engine orchestration.
//!
//! Ties the channels, comparator, planner, and executor together. A run
//! fetches one inventory per side, compares them, plans for the requested
//! mode, and executes the plan with per-resource failure isolation. Every
//! mutating run holds the per-target lock for its duration and leaves a
//! run record behind.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{ArtifactStore, RunRecord};
use crate::bundle::{FunctionBundle, SharedFileResolver};
use crate::config::{Environment, SettingsSpec};
use crate::error::{ArtifactError, ConfigError, ErrorClass, PlanError, RemoteError, Result, SyncError};
use crate::fingerprint::{
    BucketSnapshot, DiffClass, DiffResult, FunctionSnapshot, Inventory, TableSnapshot,
    compare_bucket_snapshots, compare_function_snapshots, compare_inventories,
    compare_table_snapshots, objects_match, tier1_verdict,
};
use crate::planner::{
    ActionHandler, ActionType, BlockedResource, PlannedAction, ResourceKind, SyncExecutor,
    SyncMode, SyncPlan, SyncResult,
};
use crate::remote::{
    BucketInfo, ConflictStrategy, ConnectionEndpoint, DatabaseChannel, EndpointResolver,
    FunctionChannel, FunctionInfo, HttpFunctionChannel, HttpStorageChannel, ObjectInfo,
    PgCommandChannel, QualifiedTable, RemoteExecutor, StorageChannel,
};

/// One environment with its resolved endpoints and live channels.
///
/// The handle owns one channel per lane; the engine addresses each lane
/// through the endpoint candidates resolved from the environment, walking
/// them in order when one is unreachable.
pub struct EnvironmentHandle {
    name: String,
    protected: bool,
    database_endpoints: Vec<ConnectionEndpoint>,
    storage_endpoints: Vec<ConnectionEndpoint>,
    management_endpoints: Vec<ConnectionEndpoint>,
    database: Box<dyn DatabaseChannel>,
    storage: Box<dyn StorageChannel>,
    functions: Box<dyn FunctionChannel>,
}

impl EnvironmentHandle {
    /// Connects the production channel backends to one environment.
    ///
    /// # Errors
    ///
    /// Returns an error when an HTTP client cannot be constructed.
    pub fn connect(environment: &Environment) -> Result<Self> {
        let resolver = EndpointResolver::new();
        Ok(Self {
            name: environment.name.clone(),
            protected: environment.protected,
            database_endpoints: resolver.resolve_database(environment),
            storage_endpoints: resolver.resolve_storage(environment),
            management_endpoints: resolver.resolve_management(environment),
            database: Box::new(PgCommandChannel::new(environment.clone())),
            storage: Box::new(HttpStorageChannel::new(environment)?),
            functions: Box::new(HttpFunctionChannel::new(environment)?),
        })
    }

    /// Builds a handle over explicit channels. The same endpoint list
    /// serves all three lanes.
    #[must_use]
    pub fn from_parts(
        name: impl Into<String>,
        protected: bool,
        endpoints: Vec<ConnectionEndpoint>,
        database: Box<dyn DatabaseChannel>,
        storage: Box<dyn StorageChannel>,
        functions: Box<dyn FunctionChannel>,
    ) -> Self {
        Self {
            name: name.into(),
            protected,
            database_endpoints: endpoints.clone(),
            storage_endpoints: endpoints.clone(),
            management_endpoints: endpoints,
            database,
            storage,
            functions,
        }
    }

    /// Environment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether destructive actions against this environment require a
    /// backup first.
    #[must_use]
    pub const fn protected(&self) -> bool {
        self.protected
    }
}

impl std::fmt::Debug for EnvironmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentHandle")
            .field("name", &self.name)
            .field("protected", &self.protected)
            .field("database_endpoints", &self.database_endpoints.len())
            .finish_non_exhaustive()
    }
}

/// What one engine run covers.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// Resource kinds to sync, in execution order.
    pub kinds: Vec<ResourceKind>,
    /// Mode applied to every kind.
    pub mode: SyncMode,
    /// Optional resource-name filter applied to each kind.
    pub filter: Option<Vec<String>>,
    /// Whether storage sync copies objects as well as buckets.
    pub include_files: bool,
}

impl SyncRequest {
    /// Request covering every resource kind.
    #[must_use]
    pub fn all(mode: SyncMode) -> Self {
        Self {
            kinds: vec![
                ResourceKind::Tables,
                ResourceKind::Storage,
                ResourceKind::Functions,
            ],
            mode,
            filter: None,
            include_files: false,
        }
    }

    /// Restricts the run to the given kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: Vec<ResourceKind>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Restricts every kind to resources with the given names. Table
    /// names parse as `schema.table`, defaulting to the `public` schema.
    #[must_use]
    pub fn with_filter(mut self, filter: Vec<String>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Enables object copying during storage sync.
    #[must_use]
    pub const fn with_include_files(mut self, include: bool) -> Self {
        self.include_files = include;
        self
    }
}

/// Orchestrates syncs from one environment to another.
pub struct SyncEngine<'a> {
    /// Environment content is copied from.
    source: &'a EnvironmentHandle,
    /// Environment content is copied to.
    target: &'a EnvironmentHandle,
    /// Store for run records, backups, and the per-target lock.
    artifacts: &'a dyn ArtifactStore,
    /// Retry/timeout/fallback policy for every remote call.
    executor: RemoteExecutor,
    /// Local directories searched for shared function files.
    shared_dirs: Vec<PathBuf>,
    /// Whether delete actions may be planned. Set only after the caller
    /// confirmed a replace run.
    allow_destructive: bool,
    /// Suppresses the pre-destruction backup on protected targets.
    skip_backup: bool,
    /// Forces tier-2 bundle comparison even when declared metadata
    /// matches.
    full_compare: bool,
    /// Cancellation signal checked between resources.
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> SyncEngine<'a> {
    /// Creates an engine between two environments.
    #[must_use]
    pub fn new(
        source: &'a EnvironmentHandle,
        target: &'a EnvironmentHandle,
        artifacts: &'a dyn ArtifactStore,
        settings: &SettingsSpec,
    ) -> Self {
        Self {
            source,
            target,
            artifacts,
            executor: RemoteExecutor::from_settings(settings),
            shared_dirs: settings.shared_dirs.iter().map(PathBuf::from).collect(),
            allow_destructive: false,
            skip_backup: false,
            full_compare: false,
            cancel: None,
        }
    }

    /// Overrides the remote execution policy.
    #[must_use]
    pub fn with_executor(mut self, executor: RemoteExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Permits delete actions. Callers set this only after an explicit
    /// confirmation of a replace run.
    #[must_use]
    pub const fn with_destructive_allowed(mut self, allow: bool) -> Self {
        self.allow_destructive = allow;
        self
    }

    /// Skips the pre-destruction backup on protected targets.
    #[must_use]
    pub const fn with_skip_backup(mut self, skip: bool) -> Self {
        self.skip_backup = skip;
        self
    }

    /// Forces byte-level function comparison.
    #[must_use]
    pub const fn with_full_compare(mut self, full: bool) -> Self {
        self.full_compare = full;
        self
    }

    /// Installs a cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Runs a full sync: acquires the target lock, syncs every requested
    /// kind in order, persists the run record, and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error when the target is locked by another run, when a
    /// kind's inventory cannot be fetched at all, or when a destructive
    /// plan was not allowed. Per-resource failures do not error; they are
    /// recorded in the returned record.
    pub async fn run(&self, request: &SyncRequest) -> Result<RunRecord> {
        if self.source.name == self.target.name {
            return Err(ConfigError::validation_general(format!(
                "source and target are both '{}'",
                self.source.name
            ))
            .into());
        }

        let mut record = RunRecord::new(&self.source.name, &self.target.name, request.mode);
        let lock = self
            .artifacts
            .acquire_lock(&self.target.name, &record.holder)
            .await?;
        info!(
            run_id = %record.run_id,
            source = %self.source.name,
            target = %self.target.name,
            mode = %request.mode,
            "sync run started"
        );

        let outcome = self.run_kinds(request, &mut record).await;

        if let Err(error) = self
            .artifacts
            .release_lock(&self.target.name, &lock.lock_id)
            .await
        {
            warn!(%error, target = %self.target.name, "failed to release sync lock");
        }

        record.finish();
        match self.artifacts.save_run(&record).await {
            Ok(path) => debug!(path = %path.display(), "run record saved"),
            Err(error) => warn!(%error, "failed to persist run record"),
        }

        outcome?;
        info!(
            run_id = %record.run_id,
            migrated = record.total_migrated(),
            failed = record.total_failed(),
            success = record.is_success(),
            "sync run finished"
        );
        Ok(record)
    }

    async fn run_kinds(&self, request: &SyncRequest, record: &mut RunRecord) -> Result<()> {
        let filter = request.filter.as_deref();
        for kind in &request.kinds {
            let result = match kind {
                ResourceKind::Tables => self.run_table_sync(filter, request.mode).await?,
                ResourceKind::Storage => {
                    self.run_storage_sync(filter, request.include_files, request.mode)
                        .await?
                }
                ResourceKind::Functions => self.run_function_sync(filter, request.mode).await?,
            };
            record.record_result(result);
        }
        Ok(())
    }

    /// Syncs tables and their rows.
    ///
    /// # Errors
    ///
    /// Returns an error when either side's table list cannot be fetched,
    /// when credentials are rejected, or when a destructive plan was not
    /// allowed.
    pub async fn run_table_sync(
        &self,
        filter: Option<&[String]>,
        mode: SyncMode,
    ) -> Result<SyncResult> {
        info!(
            source = %self.source.name,
            target = %self.target.name,
            %mode,
            "syncing tables"
        );
        let source_inv = self.table_inventory(self.source, filter).await?;
        let target_inv = self.table_inventory(self.target, filter).await?;
        let diff = compare_inventories(&source_inv, &target_inv, compare_table_snapshots);
        let plan = SyncPlan::from_diff(
            ResourceKind::Tables,
            &diff,
            mode,
            self.allow_destructive,
            Vec::new(),
        )?;
        let mut handler = TableHandler {
            engine: self,
            mode,
            source: &source_inv,
            target: &target_inv,
        };
        self.execute_plan(&plan, &mut handler).await
    }

    /// Syncs buckets, and their objects when `include_files` is set.
    ///
    /// # Errors
    ///
    /// Returns an error when either side's bucket list cannot be fetched,
    /// when credentials are rejected, or when the run would delete
    /// target-only content without destructive actions allowed.
    pub async fn run_storage_sync(
        &self,
        filter: Option<&[String]>,
        include_files: bool,
        mode: SyncMode,
    ) -> Result<SyncResult> {
        info!(
            source = %self.source.name,
            target = %self.target.name,
            %mode,
            include_files,
            "syncing storage"
        );
        let source_inv = self
            .bucket_inventory(self.source, filter, include_files)
            .await?;
        let target_inv = self
            .bucket_inventory(self.target, filter, include_files)
            .await?;

        // The planner gates bucket-level deletes; object-level deletes
        // inside shared buckets are gated here.
        if mode == SyncMode::Replace
            && include_files
            && !self.allow_destructive
            && has_target_only_objects(&source_inv, &target_inv)
        {
            return Err(PlanError::DestructiveNotAllowed {
                message: "replace would delete target-only storage objects".to_string(),
            }
            .into());
        }

        let diff = compare_inventories(&source_inv, &target_inv, compare_bucket_snapshots);
        let plan = SyncPlan::from_diff(
            ResourceKind::Storage,
            &diff,
            mode,
            self.allow_destructive,
            Vec::new(),
        )?;
        let mut handler = StorageHandler {
            engine: self,
            mode,
            include_files,
            source: &source_inv,
            target: &target_inv,
        };
        self.execute_plan(&plan, &mut handler).await
    }

    /// Syncs serverless functions.
    ///
    /// Functions whose shared imports cannot be satisfied from any tier
    /// are excluded from the plan, deletes included, and reported in the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns an error when either side's function list cannot be
    /// fetched, when credentials are rejected, or when a destructive plan
    /// was not allowed.
    pub async fn run_function_sync(
        &self,
        filter: Option<&[String]>,
        mode: SyncMode,
    ) -> Result<SyncResult> {
        info!(
            source = %self.source.name,
            target = %self.target.name,
            %mode,
            "syncing functions"
        );
        let mut source_inv = self.function_inventory(self.source, filter).await?;
        let mut target_inv = self.function_inventory(self.target, filter).await?;
        self.hydrate_bundles(&mut source_inv, &mut target_inv).await?;

        let full = self.full_compare;
        let diff = compare_inventories(&source_inv, &target_inv, |name, s, t| {
            compare_function_snapshots(name, s, t, full)
        });

        let candidates = deploy_candidates(&diff, mode);
        let (bundles, blocked) = self.prepare_bundles(&source_inv, &candidates).await?;

        let plan = SyncPlan::from_diff(
            ResourceKind::Functions,
            &diff,
            mode,
            self.allow_destructive,
            blocked,
        )?;
        let mut handler = FunctionHandler {
            engine: self,
            source: &source_inv,
            bundles,
            target: &target_inv,
        };
        self.execute_plan(&plan, &mut handler).await
    }

    /// Compares tables without mutating anything.
    ///
    /// # Errors
    ///
    /// Returns an error when either side's table list cannot be fetched.
    pub async fn diff_tables(&self, filter: Option<&[String]>) -> Result<DiffResult> {
        let source_inv = self.table_inventory(self.source, filter).await?;
        let target_inv = self.table_inventory(self.target, filter).await?;
        Ok(compare_inventories(
            &source_inv,
            &target_inv,
            compare_table_snapshots,
        ))
    }

    /// Compares buckets without mutating anything.
    ///
    /// # Errors
    ///
    /// Returns an error when either side's bucket list cannot be fetched.
    pub async fn diff_storage(
        &self,
        filter: Option<&[String]>,
        include_files: bool,
    ) -> Result<DiffResult> {
        let source_inv = self
            .bucket_inventory(self.source, filter, include_files)
            .await?;
        let target_inv = self
            .bucket_inventory(self.target, filter, include_files)
            .await?;
        Ok(compare_inventories(
            &source_inv,
            &target_inv,
            compare_bucket_snapshots,
        ))
    }

    /// Compares functions without mutating anything.
    ///
    /// # Errors
    ///
    /// Returns an error when either side's function list cannot be
    /// fetched.
    pub async fn diff_functions(&self, filter: Option<&[String]>) -> Result<DiffResult> {
        let mut source_inv = self.function_inventory(self.source, filter).await?;
        let mut target_inv = self.function_inventory(self.target, filter).await?;
        self.hydrate_bundles(&mut source_inv, &mut target_inv).await?;
        let full = self.full_compare;
        Ok(compare_inventories(&source_inv, &target_inv, |name, s, t| {
            compare_function_snapshots(name, s, t, full)
        }))
    }

    async fn execute_plan(
        &self,
        plan: &SyncPlan,
        handler: &mut dyn ActionHandler,
    ) -> Result<SyncResult> {
        let mut executor = SyncExecutor::new()
            .with_protected_target(self.target.protected)
            .with_skip_backup(self.skip_backup);
        if let Some(cancel) = &self.cancel {
            executor = executor.with_cancellation(cancel.clone());
        }
        executor.execute(plan, handler).await
    }

    /// Fetches one side's table inventory. A failed per-table snapshot is
    /// recorded in the inventory; a rejected credential aborts the fetch.
    async fn table_inventory(
        &self,
        side: &EnvironmentHandle,
        filter: Option<&[String]>,
    ) -> Result<Inventory<TableSnapshot>> {
        let tables = self
            .executor
            .execute_with_fallback(&side.database_endpoints, "list-tables", |endpoint| {
                async move { side.database.list_tables(&endpoint).await }
            })
            .await?;

        let mut inventory = Inventory::new();
        for table in tables {
            if !table_selected(filter, &table) {
                continue;
            }
            let name = table.to_string();
            match self.table_snapshot(side, &table).await {
                Ok(snapshot) => inventory.insert(name, snapshot),
                Err(error) if error.class() == ErrorClass::Unauthorized => return Err(error),
                Err(error) => {
                    warn!(environment = %side.name, table = %table, %error, "table snapshot failed");
                    inventory.record_failure(name, error.to_string());
                }
            }
        }
        debug!(environment = %side.name, tables = inventory.len(), "table inventory collected");
        Ok(inventory)
    }

    async fn table_snapshot(
        &self,
        side: &EnvironmentHandle,
        table: &QualifiedTable,
    ) -> Result<TableSnapshot> {
        let columns = self
            .executor
            .execute_with_fallback(&side.database_endpoints, "table-columns", |endpoint| {
                async move { side.database.table_columns(&endpoint, table).await }
            })
            .await?;
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let names_ref = &names;
        let rows = self
            .executor
            .execute_with_fallback(&side.database_endpoints, "fetch-rows", |endpoint| {
                async move { side.database.fetch_rows(&endpoint, table, names_ref).await }
            })
            .await?;
        Ok(TableSnapshot::new(table.clone(), columns, rows))
    }

    /// Fetches one side's bucket inventory. Object listings are fetched
    /// only when `include_files` is set.
    async fn bucket_inventory(
        &self,
        side: &EnvironmentHandle,
        filter: Option<&[String]>,
        include_files: bool,
    ) -> Result<Inventory<BucketSnapshot>> {
        let buckets = self
            .executor
            .execute_with_fallback(&side.storage_endpoints, "list-buckets", |endpoint| {
                async move { side.storage.list_buckets(&endpoint).await }
            })
            .await?;

        let mut inventory = Inventory::new();
        for bucket in buckets {
            if !selected(filter, &bucket.name) {
                continue;
            }
            if !include_files {
                inventory.insert(bucket.name.clone(), BucketSnapshot::new(bucket, Vec::new()));
                continue;
            }
            let key = bucket.name.clone();
            let key_ref = key.as_str();
            let listing = self
                .executor
                .execute_with_fallback(&side.storage_endpoints, "list-objects", |endpoint| {
                    async move { side.storage.list_objects(&endpoint, key_ref).await }
                })
                .await;
            match listing {
                Ok(objects) => {
                    inventory.insert(key.clone(), BucketSnapshot::new(bucket, objects));
                }
                Err(error) if error.class() == ErrorClass::Unauthorized => return Err(error),
                Err(error) => {
                    warn!(environment = %side.name, bucket = %key, %error, "object listing failed");
                    inventory.record_failure(key.clone(), error.to_string());
                }
            }
        }
        debug!(environment = %side.name, buckets = inventory.len(), "bucket inventory collected");
        Ok(inventory)
    }

    async fn function_inventory(
        &self,
        side: &EnvironmentHandle,
        filter: Option<&[String]>,
    ) -> Result<Inventory<FunctionSnapshot>> {
        let functions = self
            .executor
            .execute_with_fallback(&side.management_endpoints, "list-functions", |endpoint| {
                async move { side.functions.list_functions(&endpoint).await }
            })
            .await?;

        let mut inventory = Inventory::new();
        for info in functions {
            if !selected(filter, &info.slug) {
                continue;
            }
            inventory.insert(info.slug.clone(), FunctionSnapshot::new(info));
        }
        debug!(environment = %side.name, functions = inventory.len(), "function inventory collected");
        Ok(inventory)
    }

    /// Downloads bundles for functions present on both sides whenever
    /// metadata alone cannot settle the comparison. A failed download
    /// leaves the bundle absent, which the comparator reports as changed.
    async fn hydrate_bundles(
        &self,
        source_inv: &mut Inventory<FunctionSnapshot>,
        target_inv: &mut Inventory<FunctionSnapshot>,
    ) -> Result<()> {
        let source_names = source_inv.names();
        let target_names = target_inv.names();
        let shared: Vec<String> = source_names.intersection(&target_names).cloned().collect();

        for slug in shared {
            let needs = match (source_inv.get(&slug), target_inv.get(&slug)) {
                (Some(source), Some(target)) => {
                    self.full_compare || tier1_verdict(&source.info, &target.info).is_none()
                }
                _ => false,
            };
            if !needs {
                continue;
            }
            self.fill_bundle(self.source, source_inv, &slug).await?;
            self.fill_bundle(self.target, target_inv, &slug).await?;
        }
        Ok(())
    }

    async fn fill_bundle(
        &self,
        side: &EnvironmentHandle,
        inventory: &mut Inventory<FunctionSnapshot>,
        slug: &str,
    ) -> Result<()> {
        let already = inventory.get(slug).is_some_and(|s| s.bundle.is_some());
        if already {
            return Ok(());
        }
        match self.download_bundle(side, slug).await {
            Ok(bundle) => {
                if let Some(snapshot) = inventory.get_mut(slug) {
                    snapshot.bundle = Some(bundle);
                }
            }
            Err(error) if error.class() == ErrorClass::Unauthorized => return Err(error),
            Err(error) => {
                warn!(environment = %side.name, function = slug, %error, "bundle download failed");
            }
        }
        Ok(())
    }

    async fn download_bundle(
        &self,
        side: &EnvironmentHandle,
        slug: &str,
    ) -> Result<FunctionBundle> {
        self.executor
            .execute_with_fallback(&side.management_endpoints, "download-bundle", |endpoint| {
                async move { side.functions.download_bundle(&endpoint, slug).await }
            })
            .await
    }

    /// Downloads and resolves the bundle of every deploy candidate.
    ///
    /// Candidates whose shared imports cannot be satisfied are returned as
    /// blocked instead of prepared. The full-inventory scan runs at most
    /// once per call, only after the cheaper tiers have come up short.
    async fn prepare_bundles(
        &self,
        source_inv: &Inventory<FunctionSnapshot>,
        candidates: &[String],
    ) -> Result<(BTreeMap<String, FunctionBundle>, Vec<BlockedResource>)> {
        let mut resolver = SharedFileResolver::new(self.shared_dirs.clone());
        let mut prepared = BTreeMap::new();
        let mut blocked = Vec::new();
        let mut scanned_inventory = false;

        for slug in candidates {
            let Some(snapshot) = source_inv.get(slug) else {
                continue;
            };
            let mut bundle = match &snapshot.bundle {
                Some(bundle) => bundle.clone(),
                None => match self.download_bundle(self.source, slug).await {
                    Ok(bundle) => bundle,
                    Err(error) if error.class() == ErrorClass::Unauthorized => return Err(error),
                    Err(error) => {
                        warn!(function = %slug, %error, "source bundle download failed");
                        continue;
                    }
                },
            };

            let mut outcome = resolver.resolve(&mut bundle)?;
            if !outcome.is_complete() && !scanned_inventory {
                self.absorb_remaining_bundles(&mut resolver, source_inv, slug)
                    .await?;
                scanned_inventory = true;
                outcome = resolver.resolve(&mut bundle)?;
            }

            if outcome.is_complete() {
                prepared.insert(slug.clone(), bundle);
            } else {
                blocked.push(BlockedResource {
                    name: slug.clone(),
                    missing_imports: outcome.missing,
                });
            }
        }
        Ok((prepared, blocked))
    }

    /// Harvests shared files embedded in every other source bundle into
    /// the resolver's run cache.
    async fn absorb_remaining_bundles(
        &self,
        resolver: &mut SharedFileResolver,
        source_inv: &Inventory<FunctionSnapshot>,
        needed_by: &str,
    ) -> Result<()> {
        debug!(function = needed_by, "scanning source bundles for shared files");
        for (slug, snapshot) in source_inv.iter() {
            if slug == needed_by {
                continue;
            }
            if let Some(bundle) = &snapshot.bundle {
                resolver.absorb_bundle(bundle);
                continue;
            }
            match self.download_bundle(self.source, slug).await {
                Ok(bundle) => resolver.absorb_bundle(&bundle),
                Err(error) if error.class() == ErrorClass::Unauthorized => return Err(error),
                Err(error) => {
                    warn!(function = %slug, %error, "skipping bundle during shared-file scan");
                }
            }
        }
        Ok(())
    }

    /// Fallback bundle fetch for a deploy action whose preparation
    /// download failed.
    async fn late_bundle(&self, slug: &str) -> Result<FunctionBundle> {
        let mut bundle = self.download_bundle(self.source, slug).await?;
        let mut resolver = SharedFileResolver::new(self.shared_dirs.clone());
        let outcome = resolver.resolve(&mut bundle)?;
        if outcome.is_complete() {
            Ok(bundle)
        } else {
            Err(PlanError::DependencyResolutionFailed {
                message: format!(
                    "unresolved shared imports for '{slug}': {}",
                    outcome.missing.join(", ")
                ),
            }
            .into())
        }
    }

    async fn create_table(&self, snapshot: &TableSnapshot, mode: SyncMode) -> Result<()> {
        let source = self.source;
        let target = self.target;
        let table = &snapshot.table;
        let ddl = self
            .executor
            .execute_with_fallback(&source.database_endpoints, "dump-schema", |endpoint| {
                async move { source.database.dump_table_schema(&endpoint, table).await }
            })
            .await?;
        let ddl_ref = ddl.as_str();
        self.executor
            .execute_with_fallback(&target.database_endpoints, "apply-schema", |endpoint| {
                async move { target.database.apply_sql(&endpoint, ddl_ref).await }
            })
            .await?;
        info!(table = %table, "table created on target");
        let columns: Vec<String> = snapshot.columns.iter().map(|c| c.name.clone()).collect();
        self.copy_rows(snapshot, &columns, mode).await
    }

    async fn copy_rows(
        &self,
        snapshot: &TableSnapshot,
        columns: &[String],
        mode: SyncMode,
    ) -> Result<()> {
        if columns.is_empty() {
            warn!(table = %snapshot.table, "no shared columns, rows not copied");
            return Ok(());
        }
        let rows = project_rows(snapshot, columns);
        if rows.is_empty() {
            debug!(table = %snapshot.table, "source table has no rows");
            return Ok(());
        }
        let strategy = upsert_strategy(mode, snapshot, columns);
        let target = self.target;
        let table = &snapshot.table;
        let rows_ref = &rows;
        let strategy_ref = &strategy;
        let written = self
            .executor
            .execute_with_fallback(&target.database_endpoints, "upsert-rows", |endpoint| {
                async move {
                    target
                        .database
                        .upsert_rows(&endpoint, table, columns, rows_ref, strategy_ref)
                        .await
                }
            })
            .await?;
        info!(table = %table, rows = rows.len(), written, "rows copied");
        Ok(())
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        let table = QualifiedTable::parse(name);
        let sql = format!("drop table if exists {} cascade;", table.sql_ref());
        let sql_ref = sql.as_str();
        let target = self.target;
        self.executor
            .execute_with_fallback(&target.database_endpoints, "drop-table", |endpoint| {
                async move { target.database.apply_sql(&endpoint, sql_ref).await }
            })
            .await?;
        info!(table = %table, "target-only table dropped");
        Ok(())
    }

    async fn backup_database(&self) -> Result<PathBuf> {
        let dump_path =
            std::env::temp_dir().join(format!("envsync-dump-{}.sql", Uuid::new_v4()));
        let dump_ref = dump_path.as_path();
        let target = self.target;
        let dumped = self
            .executor
            .execute_with_fallback(&target.database_endpoints, "dump-database", |endpoint| {
                async move { target.database.dump_database(&endpoint, dump_ref).await }
            })
            .await;
        if let Err(error) = dumped {
            let _ = tokio::fs::remove_file(&dump_path).await;
            return Err(error);
        }
        let content = tokio::fs::read(&dump_path).await?;
        let _ = tokio::fs::remove_file(&dump_path).await;
        let path = self
            .artifacts
            .write_backup(&target.name, ResourceKind::Tables, "sql", &content)
            .await?;
        info!(path = %path.display(), bytes = content.len(), "database backup written");
        Ok(path)
    }

    async fn backup_storage_inventory(
        &self,
        inventory: &Inventory<BucketSnapshot>,
    ) -> Result<PathBuf> {
        let snapshots: Vec<&BucketSnapshot> = inventory.iter().map(|(_, s)| s).collect();
        let content = serde_json::to_vec_pretty(&snapshots)
            .map_err(|e| ArtifactError::serialization(e.to_string()))?;
        let path = self
            .artifacts
            .write_backup(&self.target.name, ResourceKind::Storage, "json", &content)
            .await?;
        info!(path = %path.display(), buckets = snapshots.len(), "storage inventory backup written");
        Ok(path)
    }

    async fn backup_function_inventory(
        &self,
        inventory: &Inventory<FunctionSnapshot>,
    ) -> Result<PathBuf> {
        let infos: Vec<&FunctionInfo> = inventory.iter().map(|(_, s)| &s.info).collect();
        let content = serde_json::to_vec_pretty(&infos)
            .map_err(|e| ArtifactError::serialization(e.to_string()))?;
        let path = self
            .artifacts
            .write_backup(&self.target.name, ResourceKind::Functions, "json", &content)
            .await?;
        info!(path = %path.display(), functions = infos.len(), "function inventory backup written");
        Ok(path)
    }

    async fn create_bucket(&self, bucket: &BucketInfo) -> Result<()> {
        let target = self.target;
        self.executor
            .execute_with_fallback(&target.storage_endpoints, "create-bucket", |endpoint| {
                async move { target.storage.create_bucket(&endpoint, bucket).await }
            })
            .await?;
        info!(bucket = %bucket.name, public = bucket.public, "bucket created on target");
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        let target = self.target;
        let result = self
            .executor
            .execute_with_fallback(&target.storage_endpoints, "delete-bucket", |endpoint| {
                async move { target.storage.delete_bucket(&endpoint, name).await }
            })
            .await;
        match result {
            Err(error) if error.class() == ErrorClass::NotFound => {
                debug!(bucket = name, "bucket already absent");
                Ok(())
            }
            Ok(()) => {
                info!(bucket = name, "target-only bucket deleted");
                Ok(())
            }
            other => other,
        }
    }

    async fn copy_object(&self, bucket: &str, object: &ObjectInfo) -> Result<()> {
        let source = self.source;
        let target = self.target;
        let key = object.key.as_str();
        let content = self
            .executor
            .execute_with_fallback(&source.storage_endpoints, "download-object", |endpoint| {
                async move { source.storage.download_object(&endpoint, bucket, key).await }
            })
            .await?;
        let content_type = object.content_type.as_deref();
        let content_ref = &content;
        self.executor
            .execute_with_fallback(&target.storage_endpoints, "upload-object", |endpoint| {
                let body = content_ref.clone();
                async move {
                    target
                        .storage
                        .upload_object(&endpoint, bucket, key, body, content_type)
                        .await
                }
            })
            .await?;
        debug!(bucket, key, bytes = content.len(), "object copied");
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let target = self.target;
        let result = self
            .executor
            .execute_with_fallback(&target.storage_endpoints, "delete-object", |endpoint| {
                async move { target.storage.delete_object(&endpoint, bucket, key).await }
            })
            .await;
        match result {
            Err(error) if error.class() == ErrorClass::NotFound => Ok(()),
            other => other,
        }
    }

    /// Copies one bucket's objects, attempting every object before
    /// reporting an aggregate failure so one bad key does not strand the
    /// rest of the bucket.
    async fn sync_bucket_objects(
        &self,
        bucket: &str,
        source: &BucketSnapshot,
        target: Option<&BucketSnapshot>,
        mode: SyncMode,
    ) -> Result<()> {
        let mut failed: Vec<String> = Vec::new();

        if mode == SyncMode::Replace {
            if let Some(existing) = target {
                for object in &existing.objects {
                    if source.objects.iter().any(|s| s.key == object.key) {
                        continue;
                    }
                    match self.delete_object(bucket, &object.key).await {
                        Ok(()) => {}
                        Err(error) if error.class() == ErrorClass::Unauthorized => {
                            return Err(error);
                        }
                        Err(error) => {
                            warn!(bucket, key = %object.key, %error, "object delete failed");
                            failed.push(object.key.clone());
                        }
                    }
                }
            }
        }

        let mut copied = 0usize;
        for object in &source.objects {
            let existing = target.and_then(|t| t.objects.iter().find(|o| o.key == object.key));
            let needs_copy = match existing {
                None => true,
                // Replace trusts only etag equality; the size/timestamp
                // fallback is an approximation.
                Some(current) => match mode {
                    SyncMode::Incremental => !objects_match(object, current),
                    SyncMode::Replace => !etags_equal(object, current),
                },
            };
            if !needs_copy {
                continue;
            }
            match self.copy_object(bucket, object).await {
                Ok(()) => copied += 1,
                Err(error) if error.class() == ErrorClass::Unauthorized => return Err(error),
                Err(error) => {
                    warn!(bucket, key = %object.key, %error, "object copy failed");
                    failed.push(object.key.clone());
                }
            }
        }

        if failed.is_empty() {
            info!(bucket, copied, total = source.objects.len(), "bucket contents synced");
            Ok(())
        } else {
            let shown = failed.iter().take(5).cloned().collect::<Vec<_>>().join(", ");
            let suffix = if failed.len() > 5 {
                format!(" and {} more", failed.len() - 5)
            } else {
                String::new()
            };
            Err(RemoteError::operation(
                "copy-objects",
                format!(
                    "{} of {} objects failed for bucket '{bucket}': {shown}{suffix}",
                    failed.len(),
                    source.objects.len()
                ),
            )
            .into())
        }
    }

    async fn deploy_function(&self, info: &FunctionInfo, bundle: &FunctionBundle) -> Result<()> {
        let target = self.target;
        self.executor
            .execute_with_fallback(&target.management_endpoints, "deploy-function", |endpoint| {
                async move { target.functions.deploy_function(&endpoint, info, bundle).await }
            })
            .await?;
        info!(function = %info.slug, files = bundle.len(), "function deployed");
        Ok(())
    }

    async fn delete_function(&self, slug: &str) -> Result<()> {
        let target = self.target;
        let result = self
            .executor
            .execute_with_fallback(&target.management_endpoints, "delete-function", |endpoint| {
                async move { target.functions.delete_function(&endpoint, slug).await }
            })
            .await;
        match result {
            Err(error) if error.class() == ErrorClass::NotFound => {
                debug!(function = slug, "function already absent");
                Ok(())
            }
            Ok(()) => {
                info!(function = slug, "target function deleted");
                Ok(())
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for SyncEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("source", &self.source.name)
            .field("target", &self.target.name)
            .field("allow_destructive", &self.allow_destructive)
            .field("full_compare", &self.full_compare)
            .finish_non_exhaustive()
    }
}

/// True when `name` passes the resource-name filter.
fn selected(filter: Option<&[String]>, name: &str) -> bool {
    match filter {
        Some(names) if !names.is_empty() => names.iter().any(|n| n.as_str() == name),
        _ => true,
    }
}

/// Table variant of [`selected`]; names parse with a `public` default
/// schema.
fn table_selected(filter: Option<&[String]>, table: &QualifiedTable) -> bool {
    match filter {
        Some(names) if !names.is_empty() => {
            names.iter().any(|name| QualifiedTable::parse(name) == *table)
        }
        _ => true,
    }
}

/// Source columns that also exist on the target, in source ordinal order.
fn shared_columns(source: &TableSnapshot, target: &TableSnapshot) -> Vec<String> {
    source
        .columns
        .iter()
        .filter(|column| target.columns.iter().any(|t| t.name == column.name))
        .map(|column| column.name.clone())
        .collect()
}

/// Projects every source row onto the named columns.
fn project_rows(snapshot: &TableSnapshot, columns: &[String]) -> Vec<Vec<Option<String>>> {
    let indexes: Vec<usize> = columns
        .iter()
        .filter_map(|name| snapshot.columns.iter().position(|c| &c.name == name))
        .collect();
    snapshot
        .rows
        .iter()
        .map(|row| indexes.iter().map(|&i| row.get(i).cloned().flatten()).collect())
        .collect()
}

/// Picks the conflict strategy for a row copy. Replace merges on the
/// primary key so target rows take the source's values; without a usable
/// key, or in incremental mode, existing rows are left untouched.
fn upsert_strategy(mode: SyncMode, snapshot: &TableSnapshot, columns: &[String]) -> ConflictStrategy {
    if mode == SyncMode::Replace {
        let mut keys = Vec::new();
        for key in snapshot.primary_key_columns() {
            if columns.iter().any(|c| c.as_str() == key) {
                keys.push(key.to_string());
            }
        }
        if !keys.is_empty() {
            return ConflictStrategy::Merge { key_columns: keys };
        }
    }
    ConflictStrategy::Ignore
}

fn etags_equal(source: &ObjectInfo, target: &ObjectInfo) -> bool {
    matches!((&source.etag, &target.etag), (Some(s), Some(t)) if s == t)
}

/// True when any shared bucket holds objects the source lacks.
fn has_target_only_objects(
    source: &Inventory<BucketSnapshot>,
    target: &Inventory<BucketSnapshot>,
) -> bool {
    target.iter().any(|(name, target_bucket)| {
        source.get(name).is_some_and(|source_bucket| {
            target_bucket
                .objects
                .iter()
                .any(|object| !source_bucket.objects.iter().any(|s| s.key == object.key))
        })
    })
}

/// Functions that the plan could create or upsert in the given mode.
fn deploy_candidates(diff: &DiffResult, mode: SyncMode) -> Vec<String> {
    diff.entries
        .iter()
        .filter(|entry| match mode {
            SyncMode::Incremental => {
                matches!(entry.class, DiffClass::NewInSource | DiffClass::Changed)
            }
            SyncMode::Replace => entry.class != DiffClass::NewInTarget,
        })
        .map(|entry| entry.name.clone())
        .collect()
}

/// Looks up a source snapshot, surfacing any recorded snapshot failure.
fn require_snapshot<'i, T>(inventory: &'i Inventory<T>, name: &str, kind: &str) -> Result<&'i T> {
    inventory.get(name).ok_or_else(|| {
        let detail = inventory
            .failure(name)
            .map(|message| format!(": {message}"))
            .unwrap_or_default();
        SyncError::internal(format!(
            "source snapshot unavailable for {kind} '{name}'{detail}"
        ))
    })
}

struct TableHandler<'e> {
    engine: &'e SyncEngine<'e>,
    mode: SyncMode,
    source: &'e Inventory<TableSnapshot>,
    target: &'e Inventory<TableSnapshot>,
}

#[async_trait]
impl ActionHandler for TableHandler<'_> {
    async fn apply(&mut self, action: &PlannedAction) -> Result<()> {
        match action.action {
            ActionType::Delete => self.engine.drop_table(&action.name).await,
            ActionType::Create => {
                let snapshot = require_snapshot(self.source, &action.name, "table")?;
                self.engine.create_table(snapshot, self.mode).await
            }
            ActionType::Upsert => {
                let snapshot = require_snapshot(self.source, &action.name, "table")?;
                let columns = match self.target.get(&action.name) {
                    Some(target) => shared_columns(snapshot, target),
                    None => snapshot.columns.iter().map(|c| c.name.clone()).collect(),
                };
                self.engine.copy_rows(snapshot, &columns, self.mode).await
            }
        }
    }

    async fn backup(&mut self) -> Result<PathBuf> {
        self.engine.backup_database().await
    }
}

struct StorageHandler<'e> {
    engine: &'e SyncEngine<'e>,
    mode: SyncMode,
    include_files: bool,
    source: &'e Inventory<BucketSnapshot>,
    target: &'e Inventory<BucketSnapshot>,
}

#[async_trait]
impl ActionHandler for StorageHandler<'_> {
    async fn apply(&mut self, action: &PlannedAction) -> Result<()> {
        match action.action {
            ActionType::Delete => self.engine.delete_bucket(&action.name).await,
            ActionType::Create => {
                let snapshot = require_snapshot(self.source, &action.name, "bucket")?;
                self.engine.create_bucket(&snapshot.bucket).await?;
                if self.include_files {
                    self.engine
                        .sync_bucket_objects(&action.name, snapshot, None, self.mode)
                        .await?;
                }
                Ok(())
            }
            ActionType::Upsert => {
                let snapshot = require_snapshot(self.source, &action.name, "bucket")?;
                let existing = self.target.get(&action.name);
                if let Some(current) = existing {
                    // Visibility is set at creation; the channel has no
                    // bucket update operation.
                    if current.bucket.public != snapshot.bucket.public {
                        warn!(
                            bucket = %action.name,
                            source_public = snapshot.bucket.public,
                            target_public = current.bucket.public,
                            "bucket visibility differs and is not updated"
                        );
                    }
                }
                if self.include_files {
                    self.engine
                        .sync_bucket_objects(&action.name, snapshot, existing, self.mode)
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn backup(&mut self) -> Result<PathBuf> {
        self.engine.backup_storage_inventory(self.target).await
    }
}

struct FunctionHandler<'e> {
    engine: &'e SyncEngine<'e>,
    source: &'e Inventory<FunctionSnapshot>,
    target: &'e Inventory<FunctionSnapshot>,
    bundles: BTreeMap<String, FunctionBundle>,
}

#[async_trait]
impl ActionHandler for FunctionHandler<'_> {
    async fn apply(&mut self, action: &PlannedAction) -> Result<()> {
        match action.action {
            ActionType::Delete => self.engine.delete_function(&action.name).await,
            ActionType::Create | ActionType::Upsert => {
                let snapshot = require_snapshot(self.source, &action.name, "function")?;
                match self.bundles.get(&action.name) {
                    Some(bundle) => self.engine.deploy_function(&snapshot.info, bundle).await,
                    None => {
                        let bundle = self.engine.late_bundle(&action.name).await?;
                        self.engine.deploy_function(&snapshot.info, &bundle).await
                    }
                }
            }
        }
    }

    async fn backup(&mut self) -> Result<PathBuf> {
        self.engine.backup_function_inventory(self.target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LocalArtifactStore;
    use crate::error::RemoteError;
    use crate::remote::{ColumnInfo, EndpointKind, TableRow};
    use chrono::TimeZone;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::{Arc, Mutex as StdMutex};
    use tempfile::TempDir;

    type CallLog = Arc<StdMutex<Vec<String>>>;

    fn log_entry(log: &CallLog, entry: String) {
        log.lock().unwrap().push(entry);
    }

    fn logged(log: &CallLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn count_logged(log: &CallLog, prefix: &str) -> usize {
        logged(log).iter().filter(|e| e.starts_with(prefix)).count()
    }

    struct FakeDatabase {
        tables: Vec<QualifiedTable>,
        columns: BTreeMap<String, Vec<ColumnInfo>>,
        rows: BTreeMap<String, Vec<TableRow>>,
        unauthorized: bool,
        log: CallLog,
    }

    impl FakeDatabase {
        fn new() -> (Self, CallLog) {
            let log = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    tables: Vec::new(),
                    columns: BTreeMap::new(),
                    rows: BTreeMap::new(),
                    unauthorized: false,
                    log: Arc::clone(&log),
                },
                log,
            )
        }

        fn with_table(
            mut self,
            table: QualifiedTable,
            columns: Vec<ColumnInfo>,
            rows: Vec<TableRow>,
        ) -> Self {
            let key = table.to_string();
            self.tables.push(table);
            self.columns.insert(key.clone(), columns);
            self.rows.insert(key, rows);
            self
        }

        /// Table appears in the listing but its snapshot calls fail.
        fn with_broken_table(mut self, table: QualifiedTable) -> Self {
            self.tables.push(table);
            self
        }
    }

    #[async_trait]
    impl DatabaseChannel for FakeDatabase {
        async fn list_tables(&self, _endpoint: &ConnectionEndpoint) -> Result<Vec<QualifiedTable>> {
            if self.unauthorized {
                return Err(RemoteError::Unauthorized {
                    message: "service key rejected".to_string(),
                }
                .into());
            }
            Ok(self.tables.clone())
        }

        async fn table_columns(
            &self,
            _endpoint: &ConnectionEndpoint,
            table: &QualifiedTable,
        ) -> Result<Vec<ColumnInfo>> {
            self.columns.get(&table.to_string()).cloned().ok_or_else(|| {
                RemoteError::operation("table-columns", format!("no columns for {table}")).into()
            })
        }

        async fn fetch_rows(
            &self,
            _endpoint: &ConnectionEndpoint,
            table: &QualifiedTable,
            _columns: &[String],
        ) -> Result<Vec<TableRow>> {
            self.rows.get(&table.to_string()).cloned().ok_or_else(|| {
                RemoteError::operation("fetch-rows", format!("no rows for {table}")).into()
            })
        }

        async fn upsert_rows(
            &self,
            _endpoint: &ConnectionEndpoint,
            table: &QualifiedTable,
            columns: &[String],
            rows: &[TableRow],
            strategy: &ConflictStrategy,
        ) -> Result<u64> {
            let tag = match strategy {
                ConflictStrategy::Ignore => "ignore",
                ConflictStrategy::Merge { .. } => "merge",
            };
            log_entry(
                &self.log,
                format!("upsert {table} cols={} rows={} {tag}", columns.len(), rows.len()),
            );
            Ok(rows.len() as u64)
        }

        async fn dump_table_schema(
            &self,
            _endpoint: &ConnectionEndpoint,
            table: &QualifiedTable,
        ) -> Result<String> {
            Ok(format!("create table {} ();", table.sql_ref()))
        }

        async fn apply_sql(&self, _endpoint: &ConnectionEndpoint, sql: &str) -> Result<()> {
            let head: String = sql.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
            log_entry(&self.log, format!("sql {head}"));
            Ok(())
        }

        async fn dump_database(
            &self,
            _endpoint: &ConnectionEndpoint,
            destination: &Path,
        ) -> Result<()> {
            tokio::fs::write(destination, b"-- test dump\n").await?;
            log_entry(&self.log, "dump-database".to_string());
            Ok(())
        }
    }

    struct FakeStorage {
        buckets: Vec<BucketInfo>,
        objects: BTreeMap<String, Vec<ObjectInfo>>,
        log: CallLog,
    }

    impl FakeStorage {
        fn new() -> (Self, CallLog) {
            let log = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    buckets: Vec::new(),
                    objects: BTreeMap::new(),
                    log: Arc::clone(&log),
                },
                log,
            )
        }

        fn with_bucket(mut self, bucket: BucketInfo, objects: Vec<ObjectInfo>) -> Self {
            self.objects.insert(bucket.name.clone(), objects);
            self.buckets.push(bucket);
            self
        }
    }

    #[async_trait]
    impl StorageChannel for FakeStorage {
        async fn list_buckets(&self, _endpoint: &ConnectionEndpoint) -> Result<Vec<BucketInfo>> {
            Ok(self.buckets.clone())
        }

        async fn create_bucket(
            &self,
            _endpoint: &ConnectionEndpoint,
            bucket: &BucketInfo,
        ) -> Result<()> {
            log_entry(&self.log, format!("create-bucket {}", bucket.name));
            Ok(())
        }

        async fn delete_bucket(&self, _endpoint: &ConnectionEndpoint, name: &str) -> Result<()> {
            log_entry(&self.log, format!("delete-bucket {name}"));
            Ok(())
        }

        async fn list_objects(
            &self,
            _endpoint: &ConnectionEndpoint,
            bucket: &str,
        ) -> Result<Vec<ObjectInfo>> {
            Ok(self.objects.get(bucket).cloned().unwrap_or_default())
        }

        async fn download_object(
            &self,
            _endpoint: &ConnectionEndpoint,
            bucket: &str,
            key: &str,
        ) -> Result<Vec<u8>> {
            log_entry(&self.log, format!("download {bucket}/{key}"));
            Ok(b"payload".to_vec())
        }

        async fn upload_object(
            &self,
            _endpoint: &ConnectionEndpoint,
            bucket: &str,
            key: &str,
            content: Vec<u8>,
            _content_type: Option<&str>,
        ) -> Result<()> {
            log_entry(
                &self.log,
                format!("upload {bucket}/{key} bytes={}", content.len()),
            );
            Ok(())
        }

        async fn delete_object(
            &self,
            _endpoint: &ConnectionEndpoint,
            bucket: &str,
            key: &str,
        ) -> Result<()> {
            log_entry(&self.log, format!("delete-object {bucket}/{key}"));
            Ok(())
        }
    }

    struct FakeFunctions {
        functions: Vec<FunctionInfo>,
        bundles: BTreeMap<String, FunctionBundle>,
        delete_not_found: bool,
        log: CallLog,
    }

    impl FakeFunctions {
        fn new() -> (Self, CallLog) {
            let log = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    functions: Vec::new(),
                    bundles: BTreeMap::new(),
                    delete_not_found: false,
                    log: Arc::clone(&log),
                },
                log,
            )
        }

        fn with_function(mut self, info: FunctionInfo, bundle: FunctionBundle) -> Self {
            self.bundles.insert(info.slug.clone(), bundle);
            self.functions.push(info);
            self
        }
    }

    #[async_trait]
    impl FunctionChannel for FakeFunctions {
        async fn list_functions(&self, _endpoint: &ConnectionEndpoint) -> Result<Vec<FunctionInfo>> {
            Ok(self.functions.clone())
        }

        async fn download_bundle(
            &self,
            _endpoint: &ConnectionEndpoint,
            slug: &str,
        ) -> Result<FunctionBundle> {
            log_entry(&self.log, format!("download-bundle {slug}"));
            self.bundles.get(slug).cloned().ok_or_else(|| {
                RemoteError::NotFound {
                    resource: slug.to_string(),
                }
                .into()
            })
        }

        async fn deploy_function(
            &self,
            _endpoint: &ConnectionEndpoint,
            info: &FunctionInfo,
            bundle: &FunctionBundle,
        ) -> Result<()> {
            log_entry(
                &self.log,
                format!("deploy {} files={}", info.slug, bundle.len()),
            );
            Ok(())
        }

        async fn delete_function(&self, _endpoint: &ConnectionEndpoint, slug: &str) -> Result<()> {
            log_entry(&self.log, format!("delete-function {slug}"));
            if self.delete_not_found {
                return Err(RemoteError::NotFound {
                    resource: slug.to_string(),
                }
                .into());
            }
            Ok(())
        }
    }

    fn endpoint() -> ConnectionEndpoint {
        ConnectionEndpoint {
            host: "localhost".to_string(),
            port: 5432,
            principal: "postgres".to_string(),
            kind: EndpointKind::DedicatedDirect,
        }
    }

    fn handle(
        name: &str,
        protected: bool,
        database: FakeDatabase,
        storage: FakeStorage,
        functions: FakeFunctions,
    ) -> EnvironmentHandle {
        EnvironmentHandle::from_parts(
            name,
            protected,
            vec![endpoint()],
            Box::new(database),
            Box::new(storage),
            Box::new(functions),
        )
    }

    fn empty_handle(name: &str) -> EnvironmentHandle {
        handle(
            name,
            false,
            FakeDatabase::new().0,
            FakeStorage::new().0,
            FakeFunctions::new().0,
        )
    }

    fn store(dir: &TempDir) -> LocalArtifactStore {
        LocalArtifactStore::with_base_dir(dir.path().join(".envsync"))
    }

    fn column(name: &str, pk: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: "text".to_string(),
            is_primary_key: pk,
        }
    }

    fn users_columns() -> Vec<ColumnInfo> {
        vec![column("id", true), column("email", false)]
    }

    fn users_rows() -> Vec<TableRow> {
        vec![
            vec![Some("1".to_string()), Some("a@example.com".to_string())],
            vec![Some("2".to_string()), None],
        ]
    }

    fn bucket(name: &str, public: bool) -> BucketInfo {
        BucketInfo {
            name: name.to_string(),
            public,
        }
    }

    fn object(key: &str, etag: Option<&str>) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            etag: etag.map(String::from),
            size: Some(7),
            updated_at: None,
            content_type: Some("image/png".to_string()),
        }
    }

    fn function_info(slug: &str, version: u32) -> FunctionInfo {
        FunctionInfo {
            slug: slug.to_string(),
            name: slug.to_string(),
            status: "ACTIVE".to_string(),
            version,
            verify_jwt: true,
            entrypoint_path: Some(format!("{slug}/index.ts")),
            import_map_path: None,
            updated_at: Some(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()),
        }
    }

    fn bundle(slug: &str, files: &[(&str, &[u8])]) -> FunctionBundle {
        let mut bundle = FunctionBundle::new(slug);
        for (name, content) in files {
            bundle.insert_file(*name, content.to_vec());
        }
        bundle
    }

    #[tokio::test]
    async fn test_table_sync_creates_missing_table() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_db, _) = FakeDatabase::new();
        let source_db = source_db.with_table(
            QualifiedTable::new("public", "users"),
            users_columns(),
            users_rows(),
        );
        let (target_db, target_log) = FakeDatabase::new();

        let source = handle("dev", false, source_db, FakeStorage::new().0, FakeFunctions::new().0);
        let target = handle("staging", false, target_db, FakeStorage::new().0, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let result = engine
            .run_table_sync(None, SyncMode::Incremental)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.migrated, vec!["public.users".to_string()]);
        let log = logged(&target_log);
        assert!(log.iter().any(|e| e.starts_with("sql create")), "schema applied: {log:?}");
        assert!(
            log.iter().any(|e| e.starts_with("upsert public.users") && e.ends_with("ignore")),
            "rows appended: {log:?}"
        );
    }

    #[tokio::test]
    async fn test_table_sync_skips_identical() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_db, _) = FakeDatabase::new();
        let source_db = source_db.with_table(
            QualifiedTable::new("public", "users"),
            users_columns(),
            users_rows(),
        );
        let (target_db, target_log) = FakeDatabase::new();
        let target_db = target_db.with_table(
            QualifiedTable::new("public", "users"),
            users_columns(),
            users_rows(),
        );

        let source = handle("dev", false, source_db, FakeStorage::new().0, FakeFunctions::new().0);
        let target = handle("staging", false, target_db, FakeStorage::new().0, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let result = engine
            .run_table_sync(None, SyncMode::Incremental)
            .await
            .unwrap();

        assert!(result.migrated.is_empty());
        assert_eq!(result.skipped.len(), 1);
        assert!(logged(&target_log).is_empty());
    }

    #[tokio::test]
    async fn test_table_filter_limits_scope() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_db, _) = FakeDatabase::new();
        let source_db = source_db
            .with_table(QualifiedTable::new("public", "users"), users_columns(), users_rows())
            .with_table(QualifiedTable::new("public", "orders"), users_columns(), users_rows());
        let (target_db, _) = FakeDatabase::new();

        let source = handle("dev", false, source_db, FakeStorage::new().0, FakeFunctions::new().0);
        let target = handle("staging", false, target_db, FakeStorage::new().0, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let filter = vec!["users".to_string()];
        let result = engine
            .run_table_sync(Some(&filter), SyncMode::Incremental)
            .await
            .unwrap();

        assert_eq!(result.migrated, vec!["public.users".to_string()]);
        assert!(result.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_failure_surfaces_as_failed_resource() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_db, _) = FakeDatabase::new();
        let source_db = source_db.with_broken_table(QualifiedTable::new("public", "events"));
        let (target_db, _) = FakeDatabase::new();

        let source = handle("dev", false, source_db, FakeStorage::new().0, FakeFunctions::new().0);
        let target = handle("staging", false, target_db, FakeStorage::new().0, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let result = engine
            .run_table_sync(None, SyncMode::Incremental)
            .await
            .unwrap();

        assert!(!result.is_success());
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].name, "public.events");
    }

    #[tokio::test]
    async fn test_unauthorized_aborts_table_sync() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (mut source_db, _) = FakeDatabase::new();
        source_db.unauthorized = true;

        let source = handle("dev", false, source_db, FakeStorage::new().0, FakeFunctions::new().0);
        let target = empty_handle("staging");
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let error = engine
            .run_table_sync(None, SyncMode::Incremental)
            .await
            .unwrap_err();
        assert_eq!(error.class(), ErrorClass::Unauthorized);
    }

    #[tokio::test]
    async fn test_replace_requires_destructive_flag() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_db, _) = FakeDatabase::new();
        let (target_db, _) = FakeDatabase::new();
        let target_db = target_db.with_table(
            QualifiedTable::new("public", "legacy"),
            users_columns(),
            Vec::new(),
        );

        let source = handle("dev", false, source_db, FakeStorage::new().0, FakeFunctions::new().0);
        let target = handle("staging", false, target_db, FakeStorage::new().0, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let error = engine
            .run_table_sync(None, SyncMode::Replace)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            SyncError::Plan(PlanError::DestructiveNotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn test_replace_drops_target_only_table() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_db, _) = FakeDatabase::new();
        let (target_db, target_log) = FakeDatabase::new();
        let target_db = target_db.with_table(
            QualifiedTable::new("public", "legacy"),
            users_columns(),
            Vec::new(),
        );

        let source = handle("dev", false, source_db, FakeStorage::new().0, FakeFunctions::new().0);
        let target = handle("staging", false, target_db, FakeStorage::new().0, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default())
            .with_destructive_allowed(true);

        let result = engine.run_table_sync(None, SyncMode::Replace).await.unwrap();

        assert_eq!(result.deleted, vec!["public.legacy".to_string()]);
        assert!(result.backup_path.is_none());
        assert!(logged(&target_log).iter().any(|e| e.starts_with("sql drop")));
    }

    #[tokio::test]
    async fn test_backup_written_for_protected_replace() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_db, _) = FakeDatabase::new();
        let (target_db, target_log) = FakeDatabase::new();
        let target_db = target_db.with_table(
            QualifiedTable::new("public", "legacy"),
            users_columns(),
            Vec::new(),
        );

        let source = handle("dev", false, source_db, FakeStorage::new().0, FakeFunctions::new().0);
        let target = handle("prod", true, target_db, FakeStorage::new().0, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default())
            .with_destructive_allowed(true);

        let result = engine.run_table_sync(None, SyncMode::Replace).await.unwrap();

        let backup = result.backup_path.expect("backup path recorded");
        assert!(backup.exists());
        let file_name = backup.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("prod-tables-"), "{file_name}");
        assert!(file_name.ends_with(".sql"), "{file_name}");
        assert!(logged(&target_log).contains(&"dump-database".to_string()));
    }

    #[tokio::test]
    async fn test_storage_sync_bucket_only_by_default() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_st, _) = FakeStorage::new();
        let source_st = source_st.with_bucket(bucket("avatars", true), vec![object("a.png", Some("x"))]);
        let (target_st, target_log) = FakeStorage::new();

        let source = handle("dev", false, FakeDatabase::new().0, source_st, FakeFunctions::new().0);
        let target = handle("staging", false, FakeDatabase::new().0, target_st, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let result = engine
            .run_storage_sync(None, false, SyncMode::Incremental)
            .await
            .unwrap();

        assert_eq!(result.migrated, vec!["avatars".to_string()]);
        let log = logged(&target_log);
        assert!(log.iter().any(|e| e.starts_with("create-bucket avatars")));
        assert!(!log.iter().any(|e| e.starts_with("upload")), "{log:?}");
    }

    #[tokio::test]
    async fn test_storage_sync_copies_missing_objects() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_st, source_log) = FakeStorage::new();
        let source_st = source_st.with_bucket(
            bucket("avatars", true),
            vec![object("a.png", Some("x")), object("b.png", Some("y"))],
        );
        let (target_st, target_log) = FakeStorage::new();
        let target_st = target_st.with_bucket(bucket("avatars", true), vec![object("a.png", Some("x"))]);

        let source = handle("dev", false, FakeDatabase::new().0, source_st, FakeFunctions::new().0);
        let target = handle("staging", false, FakeDatabase::new().0, target_st, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let result = engine
            .run_storage_sync(None, true, SyncMode::Incremental)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(count_logged(&source_log, "download avatars/b.png"), 1);
        assert_eq!(count_logged(&source_log, "download avatars/a.png"), 0);
        assert_eq!(count_logged(&target_log, "upload avatars/b.png"), 1);
    }

    #[tokio::test]
    async fn test_replace_storage_gates_object_deletes() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_st, _) = FakeStorage::new();
        let source_st = source_st.with_bucket(bucket("avatars", true), Vec::new());
        let (target_st, _) = FakeStorage::new();
        let target_st =
            target_st.with_bucket(bucket("avatars", true), vec![object("old.png", Some("z"))]);

        let source = handle("dev", false, FakeDatabase::new().0, source_st, FakeFunctions::new().0);
        let target = handle("staging", false, FakeDatabase::new().0, target_st, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let error = engine
            .run_storage_sync(None, true, SyncMode::Replace)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            SyncError::Plan(PlanError::DestructiveNotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn test_replace_storage_deletes_target_only_objects() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_st, _) = FakeStorage::new();
        let source_st = source_st.with_bucket(
            bucket("avatars", true),
            vec![object("keep.png", Some("k")), object("new.png", Some("n"))],
        );
        let (target_st, target_log) = FakeStorage::new();
        let target_st = target_st.with_bucket(
            bucket("avatars", true),
            vec![object("keep.png", Some("k")), object("old.png", Some("z"))],
        );

        let source = handle("dev", false, FakeDatabase::new().0, source_st, FakeFunctions::new().0);
        let target = handle("staging", false, FakeDatabase::new().0, target_st, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default())
            .with_destructive_allowed(true);

        let result = engine
            .run_storage_sync(None, true, SyncMode::Replace)
            .await
            .unwrap();

        assert!(result.is_success());
        let log = logged(&target_log);
        assert!(log.contains(&"delete-object avatars/old.png".to_string()), "{log:?}");
        // Matching etags skip the copy even in replace mode
        assert!(!log.iter().any(|e| e.starts_with("upload avatars/keep.png")), "{log:?}");
        assert!(log.iter().any(|e| e.starts_with("upload avatars/new.png")), "{log:?}");
    }

    #[tokio::test]
    async fn test_function_sync_deploys_new_function() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_fx, _) = FakeFunctions::new();
        let source_fx = source_fx.with_function(
            function_info("hello", 1),
            bundle("hello", &[("index.ts", b"export default 1;")]),
        );
        let (target_fx, target_log) = FakeFunctions::new();

        let source = handle("dev", false, FakeDatabase::new().0, FakeStorage::new().0, source_fx);
        let target = handle("staging", false, FakeDatabase::new().0, FakeStorage::new().0, target_fx);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let result = engine
            .run_function_sync(None, SyncMode::Incremental)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.migrated, vec!["hello".to_string()]);
        assert!(logged(&target_log).iter().any(|e| e.starts_with("deploy hello")));
    }

    #[tokio::test]
    async fn test_function_with_missing_import_is_blocked() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_fx, _) = FakeFunctions::new();
        let source_fx = source_fx.with_function(
            function_info("auth-hook", 1),
            bundle(
                "auth-hook",
                &[(
                    "index.ts",
                    b"import { verify } from \"../_shared/verify.ts\";".as_slice(),
                )],
            ),
        );
        let (target_fx, target_log) = FakeFunctions::new();

        let source = handle("dev", false, FakeDatabase::new().0, FakeStorage::new().0, source_fx);
        let target = handle("staging", false, FakeDatabase::new().0, FakeStorage::new().0, target_fx);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let result = engine
            .run_function_sync(None, SyncMode::Incremental)
            .await
            .unwrap();

        assert!(result.migrated.is_empty());
        assert_eq!(result.skipped_for_dependency.len(), 1);
        assert_eq!(result.skipped_for_dependency[0].name, "auth-hook");
        assert_eq!(
            result.skipped_for_dependency[0].missing_imports,
            vec!["_shared/verify.ts".to_string()]
        );
        assert!(!logged(&target_log).iter().any(|e| e.starts_with("deploy")));
    }

    #[tokio::test]
    async fn test_function_replace_mirrors_target() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_fx, _) = FakeFunctions::new();
        let source_fx = source_fx.with_function(
            function_info("new-fn", 1),
            bundle("new-fn", &[("index.ts", b"export default 1;")]),
        );
        let (target_fx, target_log) = FakeFunctions::new();
        let target_fx = target_fx.with_function(
            function_info("old-fn", 4),
            bundle("old-fn", &[("index.ts", b"export default 0;")]),
        );

        let source = handle("dev", false, FakeDatabase::new().0, FakeStorage::new().0, source_fx);
        let target = handle("staging", false, FakeDatabase::new().0, FakeStorage::new().0, target_fx);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default())
            .with_destructive_allowed(true);

        let result = engine
            .run_function_sync(None, SyncMode::Replace)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.deleted, vec!["old-fn".to_string()]);
        assert_eq!(result.migrated, vec!["new-fn".to_string()]);
        let log = logged(&target_log);
        let delete_pos = log.iter().position(|e| e == "delete-function old-fn").unwrap();
        let deploy_pos = log.iter().position(|e| e.starts_with("deploy new-fn")).unwrap();
        assert!(delete_pos < deploy_pos, "deletes run before deploys: {log:?}");
    }

    #[tokio::test]
    async fn test_function_delete_not_found_is_success() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_fx, _) = FakeFunctions::new();
        let (mut target_fx, _) = FakeFunctions::new();
        target_fx.delete_not_found = true;
        let target_fx = target_fx.with_function(
            function_info("ghost", 2),
            bundle("ghost", &[("index.ts", b"1".as_slice())]),
        );

        let source = handle("dev", false, FakeDatabase::new().0, FakeStorage::new().0, source_fx);
        let target = handle("staging", false, FakeDatabase::new().0, FakeStorage::new().0, target_fx);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default())
            .with_destructive_allowed(true);

        let result = engine
            .run_function_sync(None, SyncMode::Replace)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.deleted, vec!["ghost".to_string()]);
    }

    #[tokio::test]
    async fn test_tier1_match_skips_bundle_download() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_fx, source_log) = FakeFunctions::new();
        let source_fx = source_fx.with_function(
            function_info("hello", 3),
            bundle("hello", &[("index.ts", b"same".as_slice())]),
        );
        let (target_fx, target_log) = FakeFunctions::new();
        let target_fx = target_fx.with_function(
            function_info("hello", 3),
            bundle("hello", &[("index.ts", b"same".as_slice())]),
        );

        let source = handle("dev", false, FakeDatabase::new().0, FakeStorage::new().0, source_fx);
        let target = handle("staging", false, FakeDatabase::new().0, FakeStorage::new().0, target_fx);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let result = engine
            .run_function_sync(None, SyncMode::Incremental)
            .await
            .unwrap();

        assert!(result.migrated.is_empty());
        assert_eq!(count_logged(&source_log, "download-bundle"), 0);
        assert_eq!(count_logged(&target_log, "download-bundle"), 0);
    }

    #[tokio::test]
    async fn test_full_compare_downloads_both_bundles() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_fx, source_log) = FakeFunctions::new();
        let source_fx = source_fx.with_function(
            function_info("hello", 3),
            bundle("hello", &[("index.ts", b"same".as_slice())]),
        );
        let (target_fx, target_log) = FakeFunctions::new();
        let target_fx = target_fx.with_function(
            function_info("hello", 3),
            bundle("hello", &[("index.ts", b"same".as_slice())]),
        );

        let source = handle("dev", false, FakeDatabase::new().0, FakeStorage::new().0, source_fx);
        let target = handle("staging", false, FakeDatabase::new().0, FakeStorage::new().0, target_fx);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default())
            .with_full_compare(true);

        let result = engine
            .run_function_sync(None, SyncMode::Incremental)
            .await
            .unwrap();

        assert!(result.migrated.is_empty());
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(count_logged(&source_log, "download-bundle hello"), 1);
        assert_eq!(count_logged(&target_log, "download-bundle hello"), 1);
    }

    #[tokio::test]
    async fn test_diff_functions_reports_changed_bundle() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_fx, _) = FakeFunctions::new();
        let source_fx = source_fx.with_function(
            function_info("hello", 3),
            bundle("hello", &[("index.ts", b"new body".as_slice())]),
        );
        let (target_fx, target_log) = FakeFunctions::new();
        let target_fx = target_fx.with_function(
            function_info("hello", 3),
            bundle("hello", &[("index.ts", b"old body".as_slice())]),
        );

        let source = handle("dev", false, FakeDatabase::new().0, FakeStorage::new().0, source_fx);
        let target = handle("staging", false, FakeDatabase::new().0, FakeStorage::new().0, target_fx);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default())
            .with_full_compare(true);

        let diff = engine.diff_functions(None).await.unwrap();

        assert_eq!(diff.changed, 1);
        assert_eq!(diff.entries[0].class, DiffClass::Changed);
        assert!(!logged(&target_log).iter().any(|e| e.starts_with("deploy")));
    }

    #[tokio::test]
    async fn test_run_saves_record_and_releases_lock() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let source = empty_handle("dev");
        let target = empty_handle("staging");
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let request = SyncRequest::all(SyncMode::Incremental)
            .with_kinds(vec![ResourceKind::Tables]);
        let record = engine.run(&request).await.unwrap();

        assert!(record.is_success());
        assert_eq!(record.results.len(), 1);
        assert_eq!(record.results[0].kind, ResourceKind::Tables);

        let runs = artifacts.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, record.run_id);
        assert!(artifacts.lock_info("staging").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_rejects_same_environment() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let source = empty_handle("prod");
        let target = empty_handle("prod");
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let error = engine
            .run(&SyncRequest::all(SyncMode::Incremental))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("source and target"));
    }

    #[tokio::test]
    async fn test_run_releases_lock_when_a_kind_fails() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (mut source_db, _) = FakeDatabase::new();
        source_db.unauthorized = true;
        let source = handle("dev", false, source_db, FakeStorage::new().0, FakeFunctions::new().0);
        let target = empty_handle("staging");
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default());

        let request = SyncRequest::all(SyncMode::Incremental)
            .with_kinds(vec![ResourceKind::Tables]);
        let error = engine.run(&request).await.unwrap_err();

        assert_eq!(error.class(), ErrorClass::Unauthorized);
        assert!(artifacts.lock_info("staging").await.unwrap().is_none());
        // The aborted run still leaves an audit record behind
        assert_eq!(artifacts.list_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_upsert_merges_on_primary_key() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let (source_db, _) = FakeDatabase::new();
        let source_db = source_db.with_table(
            QualifiedTable::new("public", "users"),
            users_columns(),
            users_rows(),
        );
        let (target_db, target_log) = FakeDatabase::new();
        let target_db = target_db.with_table(
            QualifiedTable::new("public", "users"),
            users_columns(),
            vec![vec![Some("1".to_string()), Some("stale@example.com".to_string())]],
        );

        let source = handle("dev", false, source_db, FakeStorage::new().0, FakeFunctions::new().0);
        let target = handle("staging", false, target_db, FakeStorage::new().0, FakeFunctions::new().0);
        let engine = SyncEngine::new(&source, &target, &artifacts, &SettingsSpec::default())
            .with_destructive_allowed(true);

        let result = engine.run_table_sync(None, SyncMode::Replace).await.unwrap();

        assert!(result.is_success());
        let log = logged(&target_log);
        assert!(
            log.iter().any(|e| e.starts_with("upsert public.users") && e.ends_with("merge")),
            "replace merges on the key: {log:?}"
        );
    }
}
