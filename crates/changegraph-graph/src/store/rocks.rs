use async_trait::async_trait;
use changegraph_core::{
    Change, ChangeGraphError, DependencyEdge, Direction, GraphStore, ReachableSet,
    ReachedResource, Resource, ResourceKey, Result, StoreSnapshot,
};
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const RESOURCES_CF: &str = "resources";
const CHANGES_CF: &str = "changes";
const EDGES_CF: &str = "edges";
const HISTORY_CF: &str = "history";

const SEP: u8 = 0;
const FORWARD: &[u8] = b"f";
const REVERSE: &[u8] = b"r";

/// Durable store on RocksDB. Values are JSON; keys are laid out so that
/// adjacency and history are prefix scans.
///
/// - `resources`: resource key -> `Resource`
/// - `changes`: change id bytes -> `Change`
/// - `edges`: `f\0from\0to\0kind` and `r\0to\0from\0kind` -> `DependencyEdge`
/// - `history`: `key\0millis\0id` -> change id bytes
pub struct RocksDbGraphStore {
    db: DB,
    path: PathBuf,
}

impl RocksDbGraphStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [RESOURCES_CF, CHANGES_CF, EDGES_CF, HISTORY_CF]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path.as_ref(), cfs).map_err(unavailable)?;
        info!(path = %path.as_ref().display(), "rocksdb graph store opened");
        Ok(Self {
            db,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChangeGraphError::StoreUnavailable(format!("column family '{}' missing", name)))
    }

    fn edge_key(prefix: &[u8], a: &ResourceKey, b: &ResourceKey, kind: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + a.as_str().len() + b.as_str().len() + kind.len() + 3);
        key.extend_from_slice(prefix);
        key.push(SEP);
        key.extend_from_slice(a.as_str().as_bytes());
        key.push(SEP);
        key.extend_from_slice(b.as_str().as_bytes());
        key.push(SEP);
        key.extend_from_slice(kind.as_bytes());
        key
    }

    fn scan_prefix<T: DeserializeOwned>(&self, cf: &ColumnFamily, prefix: &[u8]) -> Result<Vec<T>> {
        decode_values(
            self.db
                .iterator_cf(cf, IteratorMode::From(prefix, rocksdb::Direction::Forward)),
            prefix,
        )
    }

    /// Stage `change` and its history entry into `batch`. Returns `false`
    /// when the identical record is already stored.
    fn stage_change(&self, batch: &mut WriteBatch, change: &Change) -> Result<bool> {
        let changes_cf = self.cf(CHANGES_CF)?;
        let history_cf = self.cf(HISTORY_CF)?;
        let id = change.id.as_bytes();

        let encoded = encode(change)?;
        if let Some(existing) = self.db.get_cf(changes_cf, id).map_err(unavailable)? {
            if existing == encoded {
                return Ok(false);
            }
            return Err(ChangeGraphError::Validation(format!(
                "change {} already recorded with different content",
                change.id
            )));
        }

        let mut history_key = change.resource_key.as_str().as_bytes().to_vec();
        history_key.push(SEP);
        history_key.extend_from_slice(&change.timestamp.timestamp_millis().to_be_bytes());
        history_key.push(SEP);
        history_key.extend_from_slice(id);

        batch.put_cf(changes_cf, id, &encoded);
        batch.put_cf(history_cf, history_key, id);
        Ok(true)
    }

    fn neighbors(&self, key: &ResourceKey, direction: Direction) -> Result<Vec<ResourceKey>> {
        let prefix_tag = match direction {
            Direction::Dependencies => FORWARD,
            Direction::Dependents => REVERSE,
        };
        let mut prefix = prefix_tag.to_vec();
        prefix.push(SEP);
        prefix.extend_from_slice(key.as_str().as_bytes());
        prefix.push(SEP);

        let edges: Vec<DependencyEdge> = self.scan_prefix(self.cf(EDGES_CF)?, &prefix)?;
        let mut keys: Vec<ResourceKey> = edges
            .into_iter()
            .map(|e| match direction {
                Direction::Dependencies => e.to,
                Direction::Dependents => e.from,
            })
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn unavailable(err: rocksdb::Error) -> ChangeGraphError {
    ChangeGraphError::StoreUnavailable(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode values from `iter` while keys start with `prefix`.
fn decode_values<T, I>(iter: I, prefix: &[u8]) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    I: Iterator<Item = std::result::Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>>,
{
    let mut out = Vec::new();
    for item in iter {
        let (key, value) = item.map_err(unavailable)?;
        if !key.starts_with(prefix) {
            break;
        }
        out.push(serde_json::from_slice(&value)?);
    }
    Ok(out)
}

#[async_trait]
impl GraphStore for RocksDbGraphStore {
    async fn put_resource(&self, resource: &Resource) -> Result<()> {
        let cf = self.cf(RESOURCES_CF)?;
        self.db
            .put_cf(cf, resource.key.as_str().as_bytes(), encode(resource)?)
            .map_err(unavailable)
    }

    async fn put_change(&self, change: &Change) -> Result<()> {
        let mut batch = WriteBatch::default();
        if self.stage_change(&mut batch, change)? {
            self.db.write(batch).map_err(unavailable)?;
            debug!(change = %change.id, resource = %change.resource_key, "change persisted");
        }
        Ok(())
    }

    async fn put_observation(&self, resource: &Resource, change: &Change) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_change(&mut batch, change)?;
        batch.put_cf(
            self.cf(RESOURCES_CF)?,
            resource.key.as_str().as_bytes(),
            encode(resource)?,
        );
        self.db.write(batch).map_err(unavailable)?;
        debug!(change = %change.id, resource = %change.resource_key, "observation persisted");
        Ok(())
    }

    async fn put_edge(&self, edge: &DependencyEdge) -> Result<()> {
        if edge.from == edge.to {
            return Err(ChangeGraphError::Validation(format!(
                "self-dependency on {} rejected",
                edge.from
            )));
        }
        let cf = self.cf(EDGES_CF)?;
        let kind = edge.kind.to_string();
        let value = encode(edge)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, Self::edge_key(FORWARD, &edge.from, &edge.to, &kind), &value);
        batch.put_cf(cf, Self::edge_key(REVERSE, &edge.to, &edge.from, &kind), &value);
        self.db.write(batch).map_err(unavailable)
    }

    async fn get_reachable(
        &self,
        key: &ResourceKey,
        max_depth: usize,
        direction: Direction,
    ) -> Result<ReachableSet> {
        let mut result = ReachableSet::empty(key.clone(), max_depth);
        let mut visited: HashSet<ResourceKey> = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(key.clone());
        queue.push_back((key.clone(), 0usize));
        result.nodes.push(ReachedResource {
            key: key.clone(),
            depth: 0,
        });

        while let Some((current, depth)) = queue.pop_front() {
            for neighbor in self.neighbors(&current, direction)? {
                if visited.contains(&neighbor) {
                    result.revisits_seen = true;
                    continue;
                }
                if depth >= max_depth {
                    result.depth_limit_hit = true;
                    continue;
                }
                visited.insert(neighbor.clone());
                result.nodes.push(ReachedResource {
                    key: neighbor.clone(),
                    depth: depth + 1,
                });
                queue.push_back((neighbor, depth + 1));
            }
        }
        Ok(result)
    }

    async fn get_history(&self, key: &ResourceKey) -> Result<Vec<Change>> {
        let history_cf = self.cf(HISTORY_CF)?;
        let changes_cf = self.cf(CHANGES_CF)?;
        let mut prefix = key.as_str().as_bytes().to_vec();
        prefix.push(SEP);

        let mut changes = Vec::new();
        let iter = self
            .db
            .iterator_cf(history_cf, IteratorMode::From(&prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (hk, id) = item.map_err(unavailable)?;
            if !hk.starts_with(&prefix) {
                break;
            }
            if let Some(bytes) = self.db.get_cf(changes_cf, &id).map_err(unavailable)? {
                changes.push(serde_json::from_slice::<Change>(&bytes)?);
            }
        }
        // Millisecond keys are ordered; equal instants fall back to id order.
        changes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(changes)
    }

    async fn load_snapshot(&self) -> Result<StoreSnapshot> {
        // Every scan reads the same point in time.
        let snap = self.db.snapshot();
        let resources: Vec<Resource> =
            decode_values(snap.iterator_cf(self.cf(RESOURCES_CF)?, IteratorMode::Start), &[])?;
        let mut forward_prefix = FORWARD.to_vec();
        forward_prefix.push(SEP);
        let edges: Vec<DependencyEdge> = decode_values(
            snap.iterator_cf(
                self.cf(EDGES_CF)?,
                IteratorMode::From(&forward_prefix, rocksdb::Direction::Forward),
            ),
            &forward_prefix,
        )?;
        let mut changes: Vec<Change> =
            decode_values(snap.iterator_cf(self.cf(CHANGES_CF)?, IteratorMode::Start), &[])?;
        changes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        debug!(
            resources = resources.len(),
            edges = edges.len(),
            changes = changes.len(),
            "rocksdb snapshot loaded"
        );
        Ok(StoreSnapshot {
            resources,
            edges,
            changes,
            taken_at: Some(Utc::now()),
        })
    }
}
