//! The public entity API (§4.L): `create`/`get`/`find`/`update`/`delete`
//! and their bulk counterparts, plus snapshot/time-travel handles and the
//! maintenance, materialized-view, and vector-search entry points layered
//! over them.
//!
//! [`Database`] is the one stateful object client code holds. It owns the
//! blob store, one [`crate::wal::Wal`] + [`crate::schema::NamespaceSchema`]
//! per namespace (the "writer task holding the namespace write lock" of
//! §5), a registry of materialized views, and any vector indexes created
//! on top of a namespace field. There are no process-level singletons
//! (Design Notes §9): everything lives behind the `Database` handle the
//! caller constructed with its own [`crate::blob::BlobStore`].

use crate::blob::BlobStore;
use crate::cancel::CancellationToken;
use crate::columnar::{ColumnKind, ColumnarWriter};
use crate::commit::retry::{commit_with_retry, RetryConfig};
use crate::commit::{AddFile, CommitBatch, CommitDialect, Operation, RemoveFile};
use crate::delta::DeltaDialect;
use crate::embed::{Embedder, EmbeddingCache};
use crate::entity::{assemble_new, Entity, EntityId};
use crate::error::{DbResult, Error, InvalidKind};
use crate::filter::{self, Filter, UpdateOp};
use crate::iceberg::IcebergDialect;
use crate::maintenance::{compact, vacuum, CompactOptions, MaintenanceReport, VacuumOptions};
use crate::mview::{self, MaterializedView, MvDefinition, MvMetadata, OptimizeOptions, OptimizeQuery, OptimizeResult};
use crate::read::{scan, ScanOptions, SnapshotSelector, TableFormat, TableRef};
use crate::schema::NamespaceSchema;
use crate::value::{Instant, Value};
use crate::vector::{hybrid_search as run_hybrid_search, HnswConfig, HnswIndex, HybridOptions, HybridResult};
use crate::wal::{encode_batch, Wal, WalConfig, WalEvent, WalOp};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// Which dialect newly-created namespaces commit under. A production
/// deployment would let this vary per table; the engine picks one dialect
/// for the whole database handle, which is enough to exercise both (§1
/// scope item 2) without a second configuration axis this crate's callers
/// don't need.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub format: TableFormat,
    pub wal: WalConfig,
    pub retry: RetryConfig,
    pub embedding_cache_capacity: usize,
    pub embedding_cache_ttl: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            format: TableFormat::Delta,
            wal: WalConfig::default(),
            retry: RetryConfig::default(),
            embedding_cache_capacity: 1024,
            embedding_cache_ttl: Duration::from_secs(300),
        }
    }
}

fn validate_namespace(namespace: &str) -> DbResult<()> {
    if namespace.is_empty() || namespace.contains('/') {
        return Err(Error::invalid(InvalidKind::Collection, format!("invalid namespace `{namespace}`")));
    }
    Ok(())
}

/// Per-namespace writer state: the durable WAL/batcher, the observed
/// shredded-field schema, and an overlay of entities appended to the WAL
/// but not yet folded into a commit (so `get`/`find` observe their own
/// writes before the next flush -- the WAL/batcher section of SPEC_FULL
/// describes the buffer as the read surface between flushes, the same role
/// a memtable plays in front of an LSM tree).
struct NamespaceState {
    wal: Wal,
    schema: NamespaceSchema,
    pending: IndexMap<String, Entity>,
}

impl NamespaceState {
    fn pending_live(&self, include_deleted: bool) -> impl Iterator<Item = &Entity> {
        self.pending.values().filter(move |e| include_deleted || !e.is_deleted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// `project?:{k:0|1}` from §6. Mixed inclusion/exclusion is rejected
/// (§9 Open Questions: "implementers SHOULD reject mixed projections").
#[derive(Debug, Clone)]
pub enum Projection {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl Projection {
    pub fn from_json(map: &serde_json::Map<String, serde_json::Value>) -> DbResult<Projection> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for (k, v) in map {
            match v.as_i64() {
                Some(1) => include.push(k.clone()),
                Some(0) => exclude.push(k.clone()),
                _ => return Err(Error::invalid(InvalidKind::Project, format!("project value for `{k}` must be 0 or 1"))),
            }
        }
        match (include.is_empty(), exclude.is_empty()) {
            (false, false) => Err(Error::invalid(InvalidKind::Project, "cannot mix inclusion and exclusion in one projection")),
            (false, true) => Ok(Projection::Include(include)),
            _ => Ok(Projection::Exclude(exclude)),
        }
    }

    fn apply(&self, mut json: serde_json::Value) -> serde_json::Value {
        let serde_json::Value::Object(map) = &mut json else { return json };
        match self {
            Projection::Include(fields) => {
                let keep: HashSet<&str> = fields.iter().map(String::as_str).chain(std::iter::once(crate::entity::FIELD_ID)).collect();
                map.retain(|k, _| keep.contains(k.as_str()));
            }
            Projection::Exclude(fields) => {
                for f in fields {
                    map.remove(f);
                }
            }
        }
        json
    }
}

/// Options for [`Database::find`] (§6 `FindOptions`).
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub filter: Filter,
    pub project: Option<Projection>,
    /// Composite sort key, applied in list order (primary key first).
    pub sort: Vec<(String, SortDirection)>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub include_deleted: bool,
}

impl FindOptions {
    pub fn new(filter: Filter) -> Self {
        FindOptions { filter, ..Default::default() }
    }

    /// Parses the public JSON wire shape from §6. `sort`'s key order
    /// follows `serde_json::Map`'s own ordering (this crate doesn't enable
    /// `preserve_order`), so multi-field sort priority for a JSON-supplied
    /// options object follows lexicographic key order; build [`FindOptions`]
    /// directly for an explicit composite sort priority instead.
    pub fn from_json(json: &serde_json::Value) -> DbResult<FindOptions> {
        let obj = json.as_object().ok_or_else(|| Error::invalid(InvalidKind::Query, "options must be an object"))?;
        let filter = match obj.get("filter") {
            Some(f) => filter::parse_filter(f)?,
            None => Filter::MatchAll,
        };
        let project = match obj.get("project").and_then(|p| p.as_object()) {
            Some(map) => Some(Projection::from_json(map)?),
            None => None,
        };
        let mut sort = Vec::new();
        if let Some(map) = obj.get("sort").and_then(|s| s.as_object()) {
            for (k, v) in map {
                let dir = match v.as_i64() {
                    Some(1) => SortDirection::Asc,
                    Some(-1) => SortDirection::Desc,
                    _ => return Err(Error::invalid(InvalidKind::Sort, format!("sort value for `{k}` must be 1 or -1"))),
                };
                sort.push((k.clone(), dir));
            }
        }
        let skip = obj.get("skip").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let limit = match obj.get("limit") {
            None | Some(serde_json::Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| Error::invalid(InvalidKind::Limit, "limit must be a non-negative integer"))? as usize),
        };
        let cursor = obj.get("cursor").and_then(|v| v.as_str()).map(str::to_string);
        let include_deleted = obj.get("includeDeleted").and_then(|v| v.as_bool()).unwrap_or(false);
        Ok(FindOptions { filter, project, sort, skip, limit, cursor, include_deleted })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteManyResult {
    pub deleted_count: u64,
}

fn sort_key(entity: &Entity, path: &str) -> Option<Value> {
    entity.get(path)
}

fn compare_entities(a: &Entity, b: &Entity, sort: &[(String, SortDirection)]) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    for (path, dir) in sort {
        let ord = match (sort_key(a, path), sort_key(b, path)) {
            (Some(av), Some(bv)) => av.partial_compare(&bv).unwrap_or(Ordering::Equal),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ord = if *dir == SortDirection::Desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// The embeddable document database (§1, §4.L).
pub struct Database {
    blob: Arc<dyn BlobStore>,
    location: String,
    config: DbConfig,
    namespaces: tokio::sync::Mutex<HashMap<String, Arc<RwLock<NamespaceState>>>>,
    views: RwLock<HashMap<String, MaterializedView>>,
    vector_indexes: RwLock<HashMap<(String, String), Arc<RwLock<HnswIndex>>>>,
    embedder: Option<Arc<dyn Embedder>>,
    embedding_cache: EmbeddingCache,
}

impl Database {
    pub fn new(blob: Arc<dyn BlobStore>, location: impl Into<String>, config: DbConfig) -> Self {
        let embedding_cache = EmbeddingCache::new(config.embedding_cache_capacity, config.embedding_cache_ttl);
        Database {
            blob,
            location: location.into(),
            config,
            namespaces: tokio::sync::Mutex::new(HashMap::new()),
            views: RwLock::new(HashMap::new()),
            vector_indexes: RwLock::new(HashMap::new()),
            embedder: None,
            embedding_cache,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    pub fn embedding_cache(&self) -> &EmbeddingCache {
        &self.embedding_cache
    }

    fn table_root(&self, namespace: &str) -> String {
        format!("{}/{namespace}", self.location)
    }

    fn make_dialect(&self, table_root: &str, schema_hints: Vec<(String, String)>) -> Box<dyn CommitDialect> {
        match self.config.format {
            TableFormat::Iceberg => Box::new(IcebergDialect::new(self.blob.clone(), table_root, schema_hints)),
            TableFormat::Delta => Box::new(DeltaDialect::new(self.blob.clone(), table_root, schema_hints)),
        }
    }

    fn table_ref(&self, namespace: &str, column_kinds: std::collections::BTreeMap<String, ColumnKind>) -> TableRef {
        TableRef { blob: self.blob.clone(), table_root: self.table_root(namespace), format: self.config.format, column_kinds }
    }

    /// Rehydrates a namespace's shredded-field schema from the dialect's
    /// own on-disk schema record, for a namespace this `Database` handle is
    /// opening for the first time but that another process already wrote
    /// to (§9 "Schema caches are keyed by (tableLocation, version) and live
    /// inside the database handle").
    async fn rehydrate_schema(&self, table_root: &str) -> DbResult<NamespaceSchema> {
        let mut schema = NamespaceSchema::new();
        match self.config.format {
            TableFormat::Iceberg => {
                let dialect = IcebergDialect::new(self.blob.clone(), table_root, vec![]);
                if let Some(version) = dialect.current_version().await? {
                    let metadata = dialect.read_metadata(version).await?;
                    if let Some(current) = metadata.schemas.iter().find(|s| s.schema_id == metadata.current_schema_id) {
                        for field in &current.fields {
                            if field.name == crate::entity::FIELD_DATA || crate::entity::RESERVED_FIELDS.contains(&field.name.as_str()) {
                                continue;
                            }
                            let mut probe = crate::value::OrderedMap::new();
                            probe.insert(field.name.clone(), type_probe_value(&field.logical_type));
                            let _ = schema.observe(&probe);
                        }
                    }
                }
            }
            TableFormat::Delta => {
                let dialect = DeltaDialect::new(self.blob.clone(), table_root, vec![]);
                if let Some(version) = dialect.current_version().await? {
                    let adds = dialect.live_adds(version).await?;
                    // Delta doesn't expose the parsed struct schema through
                    // this dialect's public surface; fall back to widening
                    // from the first add's recorded column stats, which is
                    // always at least as complete as the schema for any
                    // column that has ever held a non-null value.
                    if let Some(add) = adds.first() {
                        if let Some(stats_json) = &add.stats {
                            let (_, stats) = crate::delta::commit::decode_delta_stats(stats_json);
                            for (name, s) in stats {
                                if crate::entity::RESERVED_FIELDS.contains(&name.as_str()) || name == crate::entity::FIELD_DATA {
                                    continue;
                                }
                                if let Some(sample) = s.min.or(s.max) {
                                    let mut probe = crate::value::OrderedMap::new();
                                    probe.insert(name, sample);
                                    let _ = schema.observe(&probe);
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(schema)
    }

    async fn ensure_namespace(&self, namespace: &str) -> DbResult<Arc<RwLock<NamespaceState>>> {
        validate_namespace(namespace)?;
        let mut namespaces = self.namespaces.lock().await;
        if let Some(existing) = namespaces.get(namespace) {
            return Ok(existing.clone());
        }
        let table_root = self.table_root(namespace);
        let schema = self.rehydrate_schema(&table_root).await?;
        let mut wal = Wal::new(self.blob.clone(), self.location.clone(), namespace, self.config.wal.clone());
        let recovered = wal.replay().await?;
        let state = Arc::new(RwLock::new(NamespaceState { wal, schema, pending: IndexMap::new() }));
        namespaces.insert(namespace.to_string(), state.clone());
        drop(namespaces);
        if recovered > 0 {
            info!(namespace, recovered, "replaying unflushed WAL entries after restart");
            let mut guard = state.write().await;
            self.flush_locked(namespace, &mut guard).await?;
        }
        Ok(state)
    }

    /// Writes one data file for `entities` and commits it (the WAL
    /// flush's body and the bulk path's only step, §4.C).
    async fn write_and_commit(
        &self,
        namespace: &str,
        schema: &NamespaceSchema,
        entities: &[Entity],
        removes: Vec<RemoveFile>,
        operation: Operation,
    ) -> DbResult<u64> {
        let table_root = self.table_root(namespace);
        let refs: Vec<&Entity> = entities.iter().collect();
        let shredded_fields = schema.shredded_fields();
        let encoded = encode_batch(&refs, &shredded_fields)?;
        let path = format!("{table_root}/{}", ColumnarWriter::path_for(&encoded.bytes));
        self.blob.write(&path, encoded.bytes.clone(), crate::blob::WriteOptions::default()).await?;

        let mut batch = CommitBatch::default();
        batch.operation = Some(operation);
        batch.removes = removes;
        if !entities.is_empty() {
            batch.adds.push(AddFile {
                path,
                size: encoded.bytes.len() as u64,
                record_count: entities.len() as u64,
                stats: encoded.footer.file_stats(),
                data_change: true,
            });
        }
        let dialect = self.make_dialect(&table_root, schema.schema_hints());
        let version = commit_with_retry(self.blob.as_ref(), dialect.as_ref(), batch, &self.config.retry, &CancellationToken::new()).await?;
        Ok(version)
    }

    /// Drains the WAL buffer into one data file and one commit (§4.C
    /// `flush()`). Folds each distinct entity id to its most recent `after`
    /// state, since the batcher writes current-state rows, not a row per
    /// mutation.
    async fn flush_locked(&self, namespace: &str, state: &mut NamespaceState) -> DbResult<()> {
        let events = state.wal.drain().await?;
        if events.is_empty() {
            return Ok(());
        }
        let mut by_id: IndexMap<String, Entity> = IndexMap::new();
        let mut all_creates = true;
        let mut all_deletes = true;
        for event in &events {
            match event.op {
                WalOp::Create => all_deletes = false,
                WalOp::Update => {
                    all_creates = false;
                    all_deletes = false;
                }
                WalOp::Delete => all_creates = false,
            }
            if let Some(after) = &event.after {
                by_id.insert(event.target.to_string(), after.clone());
            }
        }
        let operation = if all_deletes {
            Operation::Delete
        } else if all_creates {
            Operation::Write
        } else {
            Operation::Update
        };
        let entities: Vec<Entity> = by_id.values().cloned().collect();
        self.write_and_commit(namespace, &state.schema, &entities, vec![], operation).await?;
        for id in by_id.keys() {
            state.pending.shift_remove(id);
        }
        Ok(())
    }

    async fn append_and_maybe_flush(&self, namespace: &str, state: &mut NamespaceState, op: WalOp, entity: Entity) -> DbResult<()> {
        let seq = state.wal.next_seq();
        state.pending.insert(entity.id.to_string(), entity.clone());
        let event = WalEvent { seq, op, target: entity.id.clone(), before: None, after: Some(entity) };
        if state.wal.append(event).await? {
            self.flush_locked(namespace, state).await?;
        }
        Ok(())
    }

    /// Same as [`Database::append_and_maybe_flush`], but flushes
    /// unconditionally. `create`/`update`/`delete` are each a single call
    /// into the commit coordinator (§4.L), not a buffered write waiting for
    /// `WalConfig::max_events`/`max_bytes` -- the buffer/`BulkThreshold`
    /// gating is for the streamed and bulk entry points below, which fall
    /// back to looping over `append_and_maybe_flush` only under the bulk
    /// threshold.
    async fn append_and_commit(&self, namespace: &str, state: &mut NamespaceState, op: WalOp, entity: Entity) -> DbResult<()> {
        let seq = state.wal.next_seq();
        state.pending.insert(entity.id.to_string(), entity.clone());
        let event = WalEvent { seq, op, target: entity.id.clone(), before: None, after: Some(entity) };
        state.wal.append(event).await?;
        self.flush_locked(namespace, state).await?;
        Ok(())
    }

    // ---- create ----------------------------------------------------

    pub async fn create(&self, namespace: &str, entity_type: &str, data: serde_json::Value) -> DbResult<Entity> {
        let state = self.ensure_namespace(namespace).await?;
        let mut guard = state.write().await;
        let entity = assemble_new(namespace, entity_type, data, Instant::now())?;
        guard.schema.observe(&entity.data)?;
        self.append_and_commit(namespace, &mut guard, WalOp::Create, entity.clone()).await?;
        drop(guard);
        self.index_vectors(namespace, &entity).await;
        Ok(entity)
    }

    pub async fn bulk_create(&self, namespace: &str, entity_type: &str, data: Vec<serde_json::Value>) -> DbResult<Vec<Entity>> {
        let state = self.ensure_namespace(namespace).await?;
        let mut guard = state.write().await;
        let now = Instant::now();
        let entities: Vec<Entity> = data.into_iter().map(|d| assemble_new(namespace, entity_type, d, now)).collect::<DbResult<_>>()?;
        for e in &entities {
            guard.schema.observe(&e.data)?;
        }
        if guard.wal.is_bulk(entities.len()) {
            self.write_and_commit(namespace, &guard.schema, &entities, vec![], Operation::Write).await?;
        } else {
            for entity in entities.clone() {
                self.append_and_maybe_flush(namespace, &mut guard, WalOp::Create, entity).await?;
            }
        }
        drop(guard);
        for entity in &entities {
            self.index_vectors(namespace, entity).await;
        }
        Ok(entities)
    }

    // ---- read --------------------------------------------------------

    async fn scan_current(&self, namespace: &str, state: &NamespaceState, filter: &Filter, include_deleted: bool) -> DbResult<Vec<Entity>> {
        let table = self.table_ref(namespace, state.schema.column_kinds().clone());
        let Some(version) = table.current_version().await? else {
            return Ok(state.pending_live(include_deleted).filter(|e| filter::eval(filter, e)).cloned().collect());
        };
        let shredded_paths = state.schema.shredded_paths();
        let options = ScanOptions {
            filter,
            shredded_paths: &shredded_paths,
            projection: &[],
            skip: 0,
            limit: None,
            has_sort: true, // disable limit pushdown here -- find() applies skip/limit itself after merging the pending overlay
            include_deleted,
        };
        let (mut rows, _stats) = scan(&table, version, &options).await?;
        let committed_ids: HashSet<String> = rows.iter().map(|e| e.id.to_string()).collect();
        for pending in state.pending_live(include_deleted) {
            if !committed_ids.contains(&pending.id.to_string()) && filter::eval(filter, pending) {
                rows.push(pending.clone());
            }
        }
        Ok(rows)
    }

    pub async fn get(&self, id: &EntityId, include_deleted: bool) -> DbResult<Option<Entity>> {
        let state = self.ensure_namespace(&id.namespace).await?;
        let guard = state.read().await;
        if let Some(pending) = guard.pending.get(&id.to_string()) {
            if include_deleted || !pending.is_deleted() {
                return Ok(Some(pending.clone()));
            }
            return Ok(None);
        }
        let filter = Filter::Field { path: crate::entity::FIELD_ID.to_string(), op: crate::filter::CompareOp::Eq(Value::String(id.to_string())) };
        let rows = self.scan_current(&id.namespace, &guard, &filter, include_deleted).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn find(&self, namespace: &str, options: &FindOptions) -> DbResult<Vec<serde_json::Value>> {
        let state = self.ensure_namespace(namespace).await?;
        let guard = state.read().await;
        let mut rows = self.scan_current(namespace, &guard, &options.filter, options.include_deleted).await?;
        drop(guard);

        if !options.sort.is_empty() {
            rows.sort_by(|a, b| compare_entities(a, b, &options.sort));
        } else {
            // deterministic default order even without an explicit sort
            rows.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));
        }

        let skip = match &options.cursor {
            Some(cursor) => cursor.parse::<usize>().map_err(|_| Error::invalid(InvalidKind::Query, "malformed cursor"))?,
            None => options.skip,
        };
        let limit = options.limit.unwrap_or(usize::MAX);
        let page: Vec<&Entity> = rows.iter().skip(skip).take(limit).collect();

        Ok(page
            .into_iter()
            .map(|e| {
                let json = e.to_json();
                match &options.project {
                    Some(p) => p.apply(json),
                    None => json,
                }
            })
            .collect())
    }

    // ---- update --------------------------------------------------------

    async fn apply_update_to(&self, entity: &mut Entity, ops: &[UpdateOp]) -> DbResult<()> {
        filter::apply_update(&mut entity.data, ops)?;
        entity.version += 1;
        entity.updated_at = Instant::now();
        Ok(())
    }

    pub async fn update(&self, id: &EntityId, update: serde_json::Value) -> DbResult<Entity> {
        let ops = filter::parse_update(&update)?;
        let state = self.ensure_namespace(&id.namespace).await?;
        let mut guard = state.write().await;
        let mut entity = self
            .current_for_write(&id.namespace, &mut guard, id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.apply_update_to(&mut entity, &ops).await?;
        guard.schema.observe(&entity.data)?;
        self.append_and_commit(&id.namespace, &mut guard, WalOp::Update, entity.clone()).await?;
        drop(guard);
        self.index_vectors(&id.namespace, &entity).await;
        Ok(entity)
    }

    pub async fn bulk_update(&self, namespace: &str, filter_json: &serde_json::Value, update: serde_json::Value) -> DbResult<Vec<Entity>> {
        let filter = filter::parse_filter(filter_json)?;
        let ops = filter::parse_update(&update)?;
        let state = self.ensure_namespace(namespace).await?;
        let mut guard = state.write().await;
        let mut matched = self.scan_current(namespace, &guard, &filter, false).await?;
        for entity in &mut matched {
            self.apply_update_to(entity, &ops).await?;
            guard.schema.observe(&entity.data)?;
        }
        if guard.wal.is_bulk(matched.len()) {
            self.write_and_commit(namespace, &guard.schema, &matched, vec![], Operation::Update).await?;
            for e in &matched {
                guard.pending.shift_remove(&e.id.to_string());
            }
        } else {
            for entity in matched.clone() {
                self.append_and_maybe_flush(namespace, &mut guard, WalOp::Update, entity).await?;
            }
        }
        drop(guard);
        for entity in &matched {
            self.index_vectors(namespace, entity).await;
        }
        Ok(matched)
    }

    /// Resolves an entity's current state for a caller already holding the
    /// namespace write lock: the pending overlay first, else a point scan.
    async fn current_for_write(&self, namespace: &str, state: &mut NamespaceState, id: &EntityId) -> DbResult<Option<Entity>> {
        if let Some(pending) = state.pending.get(&id.to_string()) {
            if pending.is_deleted() {
                return Ok(None);
            }
            return Ok(Some(pending.clone()));
        }
        let filter = Filter::Field { path: crate::entity::FIELD_ID.to_string(), op: crate::filter::CompareOp::Eq(Value::String(id.to_string())) };
        let rows = self.scan_current(namespace, state, &filter, false).await?;
        Ok(rows.into_iter().next())
    }

    // ---- delete ----------------------------------------------------------

    /// Soft-deletes one entity (§3 "Lifecycle"). Returns `false` if the
    /// entity doesn't exist or is already deleted (§9 Open Questions: the
    /// `true`/`false` vs. `{deletedCount}` translation is left to adapters;
    /// this method's own contract is the boolean).
    pub async fn delete(&self, id: &EntityId) -> DbResult<bool> {
        let state = self.ensure_namespace(&id.namespace).await?;
        let mut guard = state.write().await;
        let Some(mut entity) = self.current_for_write(&id.namespace, &mut guard, id).await? else {
            return Ok(false);
        };
        let now = Instant::now();
        entity.version += 1;
        entity.updated_at = now;
        entity.deleted_at = Some(now);
        self.append_and_commit(&id.namespace, &mut guard, WalOp::Delete, entity).await?;
        Ok(true)
    }

    pub async fn delete_many(&self, namespace: &str, filter_json: &serde_json::Value) -> DbResult<DeleteManyResult> {
        let filter = filter::parse_filter(filter_json)?;
        let state = self.ensure_namespace(namespace).await?;
        let mut guard = state.write().await;
        let mut matched = self.scan_current(namespace, &guard, &filter, false).await?;
        let now = Instant::now();
        for entity in &mut matched {
            entity.version += 1;
            entity.updated_at = now;
            entity.deleted_at = Some(now);
        }
        let deleted_count = matched.len() as u64;
        if guard.wal.is_bulk(matched.len()) {
            self.write_and_commit(namespace, &guard.schema, &matched, vec![], Operation::Delete).await?;
            for e in &matched {
                guard.pending.shift_remove(&e.id.to_string());
            }
        } else {
            for entity in matched {
                self.append_and_maybe_flush(namespace, &mut guard, WalOp::Delete, entity).await?;
            }
        }
        Ok(DeleteManyResult { deleted_count })
    }

    // ---- snapshot / time travel -------------------------------------------

    pub async fn current_version(&self, namespace: &str) -> DbResult<Option<u64>> {
        let state = self.ensure_namespace(namespace).await?;
        let guard = state.read().await;
        self.table_ref(namespace, guard.schema.column_kinds().clone()).current_version().await
    }

    pub async fn snapshot(&self, namespace: &str, version: u64) -> DbResult<Snapshot<'_>> {
        let state = self.ensure_namespace(namespace).await?;
        let guard = state.read().await;
        let table = self.table_ref(namespace, guard.schema.column_kinds().clone());
        table.resolve_version(SnapshotSelector::Version(version)).await?;
        Ok(Snapshot { db: self, namespace: namespace.to_string(), version, shredded_paths: guard.schema.shredded_paths() })
    }

    pub async fn as_of(&self, namespace: &str, at: Instant) -> DbResult<Snapshot<'_>> {
        let state = self.ensure_namespace(namespace).await?;
        let guard = state.read().await;
        let table = self.table_ref(namespace, guard.schema.column_kinds().clone());
        let version = table
            .resolve_version(SnapshotSelector::AsOf(at))
            .await?
            .ok_or_else(|| Error::NotFound(format!("no snapshot of `{namespace}` as of {at}")))?;
        Ok(Snapshot { db: self, namespace: namespace.to_string(), version, shredded_paths: guard.schema.shredded_paths() })
    }

    // ---- maintenance -------------------------------------------------------

    pub async fn compact(&self, namespace: &str, opts: CompactOptions) -> DbResult<MaintenanceReport> {
        let state = self.ensure_namespace(namespace).await?;
        let guard = state.read().await;
        let table = self.table_ref(namespace, guard.schema.column_kinds().clone());
        let dialect = self.make_dialect(&self.table_root(namespace), guard.schema.schema_hints());
        compact::compact(&table, dialect.as_ref(), guard.schema.column_kinds(), &opts).await
    }

    pub async fn vacuum(&self, namespace: &str, opts: VacuumOptions) -> DbResult<MaintenanceReport> {
        let state = self.ensure_namespace(namespace).await?;
        let guard = state.read().await;
        let table = self.table_ref(namespace, guard.schema.column_kinds().clone());
        vacuum::vacuum(&table, &opts).await
    }

    // ---- materialized views --------------------------------------------------

    fn mv_namespace(name: &str) -> String {
        format!("__mv_{name}")
    }

    pub async fn create_view(&self, name: &str, definition: MvDefinition) -> DbResult<()> {
        let now = Instant::now();
        let view = MaterializedView {
            name: name.to_string(),
            definition,
            metadata: MvMetadata { last_refreshed_at: now, row_count: 0, lineage: format!("view:{name}"), source_version_at_refresh: 0 },
        };
        self.views.write().await.insert(name.to_string(), view);
        Ok(())
    }

    /// Re-runs the view's defining query against its source and replaces
    /// the view's materialized rows (§4.J).
    pub async fn refresh_view(&self, name: &str) -> DbResult<()> {
        let definition = {
            let views = self.views.read().await;
            views.get(name).ok_or_else(|| Error::NotFound(format!("view {name}")))?.definition.clone()
        };
        let options = FindOptions {
            filter: definition.filter.clone().unwrap_or(Filter::MatchAll),
            ..Default::default()
        };
        let rows = self.find(&definition.from, &options).await?;
        let mv_ns = Self::mv_namespace(name);
        self.delete_many(&mv_ns, &serde_json::json!({})).await.ok();
        if !rows.is_empty() {
            self.bulk_create(&mv_ns, "MvRow", rows.clone()).await?;
        }
        let source_version = self.current_version(&definition.from).await?.unwrap_or(0);
        let mut views = self.views.write().await;
        if let Some(view) = views.get_mut(name) {
            view.metadata = MvMetadata {
                last_refreshed_at: Instant::now(),
                row_count: rows.len() as u64,
                lineage: format!("view:{name} <- {}", definition.from),
                source_version_at_refresh: source_version,
            };
        }
        Ok(())
    }

    /// Decides whether a query over `namespace` should be served from a
    /// materialized view instead (§4.J). Pure decision -- does not execute
    /// the chosen plan; see [`Database::find_optimized`] for that.
    pub async fn optimize(
        &self,
        namespace: &str,
        filter_json: &serde_json::Value,
        is_aggregate: bool,
        requested_fields: Vec<String>,
    ) -> DbResult<OptimizeResult> {
        let filter = filter::parse_filter(filter_json)?;
        let source_row_count = self.row_count_estimate(namespace).await?;
        let source_version = self.current_version(namespace).await?.unwrap_or(0);
        let views: Vec<MaterializedView> = self.views.read().await.values().cloned().collect();
        let query = OptimizeQuery { namespace, filter: &filter, is_aggregate, requested_fields };
        Ok(mview::optimize(&query, source_row_count, source_version, &views, &OptimizeOptions::default()))
    }

    /// Runs [`Database::optimize`] and executes whichever plan it picked.
    pub async fn find_optimized(&self, namespace: &str, filter_json: &serde_json::Value, mut options: FindOptions) -> DbResult<Vec<serde_json::Value>> {
        let decision = self.optimize(namespace, filter_json, false, vec![]).await?;
        options.filter = decision.rewritten_filter.clone();
        let target = match &decision.selected {
            Some(name) if decision.use_mv => Self::mv_namespace(name),
            _ => namespace.to_string(),
        };
        self.find(&target, &options).await
    }

    async fn row_count_estimate(&self, namespace: &str) -> DbResult<u64> {
        let state = self.ensure_namespace(namespace).await?;
        let guard = state.read().await;
        let table = self.table_ref(namespace, guard.schema.column_kinds().clone());
        let Some(version) = table.current_version().await? else { return Ok(0) };
        let files = table.live_files(version).await?;
        Ok(files.iter().map(|f| f.record_count).sum())
    }

    // ---- vector search -----------------------------------------------------

    pub async fn create_vector_index(&self, namespace: &str, field: &str, config: HnswConfig) {
        self.vector_indexes.write().await.insert((namespace.to_string(), field.to_string()), Arc::new(RwLock::new(HnswIndex::new(config))));
    }

    async fn index_vectors(&self, namespace: &str, entity: &Entity) {
        let indexes = self.vector_indexes.read().await;
        for ((ns, field), index) in indexes.iter() {
            if ns != namespace {
                continue;
            }
            let mut guard = index.write().await;
            if entity.is_deleted() {
                guard.remove(&entity.id.to_string());
                continue;
            }
            if let Some(Value::Array(items)) = entity.data.get(field) {
                let vector: Vec<f32> = items.iter().filter_map(Value::as_f64).map(|f| f as f32).collect();
                if vector.len() == items.len() && !vector.is_empty() {
                    guard.insert(vector, entity.id.to_string(), None, None);
                }
            }
        }
    }

    /// Runs hybrid vector + metadata search against an index registered
    /// with [`Database::create_vector_index`] (§4.I). `residual_filter`,
    /// if given, is evaluated against live (non-deleted) entities to build
    /// both the pre-filter candidate set and the post-filter residual
    /// predicate.
    pub async fn hybrid_search(
        &self,
        namespace: &str,
        field: &str,
        query: &[f32],
        k: usize,
        mut opts: HybridOptions,
        residual_filter: Option<&serde_json::Value>,
    ) -> DbResult<HybridResult> {
        let indexes = self.vector_indexes.read().await;
        let index = indexes
            .get(&(namespace.to_string(), field.to_string()))
            .ok_or_else(|| Error::invalid(InvalidKind::Query, format!("no vector index on {namespace}.{field}")))?
            .clone();
        drop(indexes);

        let allowed: Option<HashSet<String>> = match residual_filter {
            Some(f) => {
                let filter = filter::parse_filter(f)?;
                let rows = self.find(namespace, &FindOptions::new(filter)).await?;
                Some(rows.iter().filter_map(|r| r.get(crate::entity::FIELD_ID)).filter_map(|v| v.as_str()).map(str::to_string).collect())
            }
            None => None,
        };
        if let Some(ids) = &allowed {
            opts.candidate_ids = opts.candidate_ids.or_else(|| Some(ids.iter().cloned().collect()));
        }

        let guard = index.read().await;
        let result = run_hybrid_search(&guard, query, k, &opts, |id| allowed.as_ref().is_none_or(|a| a.contains(id)));
        Ok(result)
    }
}

/// A read-only handle onto one committed snapshot (§4.G step 1). Mutating
/// methods exist only to return [`Error::ReadOnly`] (§5 "Read-only handles
/// enforce write rejection structurally") -- there is no path from a
/// `Snapshot` into the commit coordinator.
pub struct Snapshot<'db> {
    db: &'db Database,
    namespace: String,
    version: u64,
    shredded_paths: Vec<String>,
}

impl<'db> Snapshot<'db> {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub async fn find(&self, options: &FindOptions) -> DbResult<Vec<serde_json::Value>> {
        let table = self.db.table_ref(&self.namespace, std::collections::BTreeMap::new());
        let scan_options = ScanOptions {
            filter: &options.filter,
            shredded_paths: &self.shredded_paths,
            projection: &[],
            skip: 0,
            limit: None,
            has_sort: true,
            include_deleted: options.include_deleted,
        };
        let (mut rows, _stats) = scan(&table, self.version, &scan_options).await?;
        if !options.sort.is_empty() {
            rows.sort_by(|a, b| compare_entities(a, b, &options.sort));
        } else {
            rows.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));
        }
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(options.skip)
            .take(limit)
            .map(|e| {
                let json = e.to_json();
                match &options.project {
                    Some(p) => p.apply(json),
                    None => json,
                }
            })
            .collect())
    }

    pub async fn get(&self, local_id: &str) -> DbResult<Option<serde_json::Value>> {
        let filter = Filter::Field {
            path: crate::entity::FIELD_ID.to_string(),
            op: crate::filter::CompareOp::Eq(Value::String(format!("{}/{local_id}", self.namespace))),
        };
        let options = FindOptions::new(filter);
        Ok(self.find(&options).await?.into_iter().next())
    }

    pub async fn create(&self, _entity_type: &str, _data: serde_json::Value) -> DbResult<Entity> {
        Err(Error::ReadOnly)
    }

    pub async fn update(&self, _id: &EntityId, _update: serde_json::Value) -> DbResult<Entity> {
        Err(Error::ReadOnly)
    }

    pub async fn delete(&self, _id: &EntityId) -> DbResult<bool> {
        Err(Error::ReadOnly)
    }

    pub async fn compact(&self, _opts: CompactOptions) -> DbResult<MaintenanceReport> {
        Err(Error::ReadOnly)
    }

    pub async fn vacuum(&self, _opts: VacuumOptions) -> DbResult<MaintenanceReport> {
        Err(Error::ReadOnly)
    }
}

/// A coarse type probe for [`Database::rehydrate_schema`]'s Iceberg path --
/// all that matters is which [`ColumnKind`] the logical-type string maps
/// back onto.
fn type_probe_value(logical_type: &str) -> Value {
    match logical_type {
        "boolean" => Value::Bool(false),
        "long" | "int" => Value::Int(0),
        "double" | "float" => Value::Float(0.0),
        "timestamp" => Value::Instant(Instant::from_micros(0)),
        _ => Value::String(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn database() -> Database {
        Database::new(Arc::new(MemoryBlobStore::new()), "db", DbConfig::default())
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let db = database();
        let entity = db.create("posts", "Post", serde_json::json!({"name": "hello", "age": 3})).await.unwrap();
        let fetched = db.get(&entity.id, false).await.unwrap().unwrap();
        assert_eq!(fetched.data.get("age"), Some(&Value::Int(3)));
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn bulk_create_at_threshold_issues_one_commit() {
        let db = database();
        let docs: Vec<serde_json::Value> = (0..100).map(|i| serde_json::json!({"name": format!("p{i}")})).collect();
        let entities = db.bulk_create("posts", "Post", docs).await.unwrap();
        assert_eq!(entities.len(), 100);
        let found = db.find("posts", &FindOptions::default()).await.unwrap();
        assert_eq!(found.len(), 100);
        assert_eq!(db.current_version("posts").await.unwrap(), Some(0)); // one commit for the whole bulk
    }

    #[tokio::test]
    async fn update_bumps_version_and_sets_updated_at() {
        let db = database();
        let entity = db.create("posts", "Post", serde_json::json!({"name": "a"})).await.unwrap();
        let updated = db.update(&entity.id, serde_json::json!({"$set": {"name": "b"}})).await.unwrap();
        assert_eq!(updated.version, 2);
        assert!(updated.updated_at.as_micros() >= entity.created_at.as_micros());
        assert_eq!(updated.data.get("name"), Some(&Value::String("b".into())));
    }

    #[tokio::test]
    async fn delete_is_soft_and_invisible_by_default() {
        let db = database();
        let entity = db.create("posts", "Post", serde_json::json!({"name": "a"})).await.unwrap();
        assert!(db.delete(&entity.id).await.unwrap());
        assert!(db.get(&entity.id, false).await.unwrap().is_none());
        assert!(db.get(&entity.id, true).await.unwrap().is_some());
        assert!(!db.delete(&entity.id).await.unwrap()); // already deleted
    }

    #[tokio::test]
    async fn find_applies_filter_sort_skip_limit() {
        let db = database();
        for i in 0..5 {
            db.create("posts", "Post", serde_json::json!({"name": format!("p{i}"), "age": i})).await.unwrap();
        }
        let options = FindOptions {
            filter: filter::parse_filter(&serde_json::json!({"age": {"$gte": 1}})).unwrap(),
            sort: vec![("age".to_string(), SortDirection::Desc)],
            skip: 1,
            limit: Some(2),
            ..Default::default()
        };
        let rows = db.find("posts", &options).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["age"], serde_json::json!(2));
        assert_eq!(rows[1]["age"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn snapshot_rejects_mutation() {
        let db = database();
        let entity = db.create("posts", "Post", serde_json::json!({"name": "a"})).await.unwrap();
        let snap = db.snapshot("posts", 0).await.unwrap();
        let err = snap.create("Post", serde_json::json!({"name": "b"})).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly));
        let found = snap.get(&entity.id.local).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn time_travel_snapshot_sees_only_prior_rows() {
        let db = database();
        db.create("posts", "Post", serde_json::json!({"name": "a"})).await.unwrap();
        let v0 = db.current_version("posts").await.unwrap().unwrap();
        db.create("posts", "Post", serde_json::json!({"name": "b"})).await.unwrap();
        let snap = db.snapshot("posts", v0).await.unwrap();
        let rows = snap.find(&FindOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], serde_json::json!("a"));
    }

    #[tokio::test]
    async fn materialized_view_round_trip() {
        let db = database();
        for i in 0..5 {
            db.create("orders", "Order", serde_json::json!({"name": format!("o{i}"), "status": if i < 3 { "active" } else { "closed" }})).await.unwrap();
        }
        db.create_view(
            "active_orders",
            MvDefinition { from: "orders".to_string(), filter: Some(filter::parse_filter(&serde_json::json!({"status": "active"})).unwrap()), select: None, group_by: None, compute: None, expand: None, flatten: None },
        )
        .await
        .unwrap();
        db.refresh_view("active_orders").await.unwrap();

        let decision = db.optimize("orders", &serde_json::json!({"status": "active"}), false, vec![]).await.unwrap();
        assert!(decision.use_mv);
        assert_eq!(decision.selected.as_deref(), Some("active_orders"));
        assert!(matches!(decision.rewritten_filter, Filter::MatchAll));
    }

    #[tokio::test]
    async fn vector_index_insert_and_search() {
        let db = database();
        db.create_vector_index("docs", "embedding", HnswConfig::default()).await;
        db.create("docs", "Doc", serde_json::json!({"name": "a", "embedding": [1.0, 0.0]})).await.unwrap();
        db.create("docs", "Doc", serde_json::json!({"name": "b", "embedding": [0.0, 1.0]})).await.unwrap();
        let result = db.hybrid_search("docs", "embedding", &[1.0, 0.0], 1, HybridOptions::default(), None).await.unwrap();
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].0, format!("docs/{}", {
            let rows = db.find("docs", &FindOptions::new(filter::parse_filter(&serde_json::json!({"name": "a"})).unwrap())).await.unwrap();
            rows[0][crate::entity::FIELD_ID].as_str().unwrap().rsplit('/').next().unwrap().to_string()
        }));
    }

    #[tokio::test]
    async fn schema_incompatible_field_retype_is_rejected() {
        let db = database();
        db.create("posts", "Post", serde_json::json!({"name": "a", "flag": true})).await.unwrap();
        let err = db.create("posts", "Post", serde_json::json!({"name": "b", "flag": "yes"})).await.unwrap_err();
        assert!(matches!(err, Error::SchemaIncompatible(_)));
    }
}
