//! Persistence contracts for the context store.
//!
//! The engine depends on six repository capabilities plus transaction
//! control, all bundled behind [`Storage`]. Repositories never commit: the
//! facade owns transaction boundaries, repositories only read and stage
//! writes. Any relational backend that can enforce foreign-key integrity and
//! lexicographic prefix search on commit hashes can implement these traits;
//! the crate ships the in-memory reference backend in [`memory`].

pub mod memory;

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::model::{
    AnnotationRecord, BlobRecord, CommitRecord, Priority, RefRecord, RetentionCriteria,
    ToolSchemaRecord,
};

/// Current storage schema version; migrations are forward-only.
pub const SCHEMA_VERSION: u32 = 1;

/// Content-addressed blob rows, deduplicated by hash.
pub trait BlobRepository {
    fn get(&self, content_hash: &str) -> Result<Option<BlobRecord>>;
    /// Store the blob unless a row with the same hash exists. Returns
    /// whether a new row was written.
    fn save_if_absent(&self, blob: BlobRecord) -> Result<bool>;
}

/// Immutable commit rows.
pub trait CommitRepository {
    fn get(&self, commit_hash: &str) -> Result<Option<CommitRecord>>;
    /// Persist a new commit row. Fails when the referenced blob or parent
    /// is missing, or when the hash already exists.
    fn save(&self, row: CommitRecord) -> Result<()>;
    /// Head-first primary-parent chain starting at `head` (inclusive).
    fn get_ancestors(&self, head: &str, limit: Option<usize>) -> Result<Vec<CommitRecord>>;
    /// Resolve a hash prefix. `None` when nothing matches; ambiguity (more
    /// than one match) is an error carrying up to five candidates.
    fn get_by_prefix(&self, prefix: &str, tract_id: Option<&str>) -> Result<Option<CommitRecord>>;
    fn get_by_type(&self, content_type: &str, tract_id: &str) -> Result<Vec<CommitRecord>>;
    /// Commits whose primary parent or extra-parent edges reference `commit_hash`.
    fn get_children(&self, commit_hash: &str) -> Result<Vec<CommitRecord>>;
}

/// Mutable refs: HEAD, branches, and the recovery refs.
pub trait RefRepository {
    fn get_ref(&self, tract_id: &str, name: &str) -> Result<Option<RefRecord>>;
    /// Write a direct (non-symbolic) value for a ref, creating it if absent.
    fn set_ref(&self, tract_id: &str, name: &str, commit_hash: Option<&str>) -> Result<()>;
    /// Resolve HEAD to a commit hash, following a symbolic target when set.
    fn get_head(&self, tract_id: &str) -> Result<Option<String>>;
    /// Move HEAD's effective position: the target branch when HEAD is
    /// symbolic, HEAD itself when detached or uninitialised.
    fn update_head(&self, tract_id: &str, commit_hash: &str) -> Result<()>;
    fn get_branch(&self, tract_id: &str, name: &str) -> Result<Option<String>>;
    fn set_branch(&self, tract_id: &str, name: &str, commit_hash: &str) -> Result<()>;
    /// Returns whether the branch existed.
    fn delete_branch(&self, tract_id: &str, name: &str) -> Result<bool>;
    /// Short branch names with their positions.
    fn list_branches(&self, tract_id: &str) -> Result<Vec<(String, Option<String>)>>;
    /// Point HEAD symbolically at a branch.
    fn attach_head(&self, tract_id: &str, branch: &str) -> Result<()>;
    /// Point HEAD directly at a commit.
    fn detach_head(&self, tract_id: &str, commit_hash: &str) -> Result<()>;
    fn is_detached(&self, tract_id: &str) -> Result<bool>;
    /// Short name of the branch HEAD points at, when attached.
    fn head_branch(&self, tract_id: &str) -> Result<Option<String>>;
}

/// Fields of an annotation before the backend assigns its id.
#[derive(Debug, Clone)]
pub struct NewAnnotation {
    pub tract_id: String,
    pub target_hash: String,
    pub priority: Priority,
    pub reason: Option<String>,
    pub retention: Option<RetentionCriteria>,
    pub created_at: DateTime<Utc>,
}

/// Append-only priority annotations.
pub trait AnnotationRepository {
    fn save(&self, annotation: NewAnnotation) -> Result<AnnotationRecord>;
    /// All annotations for a target, oldest first.
    fn get_history(&self, target_hash: &str) -> Result<Vec<AnnotationRecord>>;
    /// Latest annotation per target in one query (avoids N+1 during
    /// compile), optionally ignoring annotations created after `as_of`.
    fn batch_get_latest(
        &self,
        targets: &[String],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<HashMap<String, AnnotationRecord>>;
}

/// Extra-parent edges of merge commits.
pub trait CommitParentRepository {
    /// Record edges for `parents` at consecutive positions starting at
    /// `starting_position`.
    fn add_parents(
        &self,
        commit_hash: &str,
        parents: &[String],
        starting_position: u32,
    ) -> Result<()>;
    /// Extra parents of a commit, ordered by position.
    fn get_parents(&self, commit_hash: &str) -> Result<Vec<String>>;
}

/// Content-addressed tool schemas and their per-commit links.
pub trait ToolSchemaRepository {
    /// Idempotent insert keyed by schema hash.
    fn store(&self, record: ToolSchemaRecord) -> Result<()>;
    fn get(&self, content_hash: &str) -> Result<Option<ToolSchemaRecord>>;
    fn link_to_commit(&self, commit_hash: &str, tool_hash: &str, position: u32) -> Result<()>;
    /// Tool schema hashes linked to a commit, ordered by position.
    fn get_commit_tool_hashes(&self, commit_hash: &str) -> Result<Vec<String>>;
    /// Full schemas linked to a commit, ordered by position.
    fn get_for_commit(&self, commit_hash: &str) -> Result<Vec<ToolSchemaRecord>>;
}

/// A storage session: repository accessors plus transaction control.
///
/// One session per tract instance; concurrent writers on the same tract are
/// not supported. `begin`/`commit`/`rollback` are called by the facade only.
pub trait Storage: Send {
    fn blobs(&self) -> &dyn BlobRepository;
    fn commits(&self) -> &dyn CommitRepository;
    fn refs(&self) -> &dyn RefRepository;
    fn annotations(&self) -> &dyn AnnotationRepository;
    fn parents(&self) -> &dyn CommitParentRepository;
    fn tools(&self) -> &dyn ToolSchemaRepository;
    fn schema_version(&self) -> Result<u32>;
    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
}

/// Every commit reachable from `head` through primary parents and
/// extra-parent edges, in discovery (BFS) order starting at `head`.
pub fn reachable_commits(storage: &dyn Storage, head: &str) -> Result<Vec<CommitRecord>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    let mut out = Vec::new();
    queue.push_back(head.to_string());
    seen.insert(head.to_string());
    while let Some(hash) = queue.pop_front() {
        let Some(row) = storage.commits().get(&hash)? else {
            continue;
        };
        if let Some(parent) = &row.parent_hash {
            if seen.insert(parent.clone()) {
                queue.push_back(parent.clone());
            }
        }
        for parent in storage.parents().get_parents(&hash)? {
            if seen.insert(parent.clone()) {
                queue.push_back(parent);
            }
        }
        out.push(row);
    }
    Ok(out)
}

/// Hash set of [`reachable_commits`].
pub fn reachable_set(storage: &dyn Storage, head: &str) -> Result<HashSet<String>> {
    Ok(reachable_commits(storage, head)?
        .into_iter()
        .map(|row| row.commit_hash)
        .collect())
}

/// The ancestor subgraph of `head` in deterministic root-first order: a
/// topological sort with ties broken by `(created_at, commit_hash)`. Linear
/// histories reduce to the reversed parent chain.
pub fn topological_order(storage: &dyn Storage, head: &str) -> Result<Vec<CommitRecord>> {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    let reachable = reachable_commits(storage, head)?;
    let by_hash: HashMap<&str, &CommitRecord> = reachable
        .iter()
        .map(|row| (row.commit_hash.as_str(), row))
        .collect();

    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for row in &reachable {
        let mut parents: Vec<String> = row.parent_hash.iter().cloned().collect();
        parents.extend(storage.parents().get_parents(&row.commit_hash)?);
        let in_graph: Vec<&str> = parents
            .iter()
            .filter_map(|p| by_hash.get(p.as_str()).map(|r| r.commit_hash.as_str()))
            .collect();
        indegree.insert(row.commit_hash.as_str(), in_graph.len());
        for parent in in_graph {
            children
                .entry(parent)
                .or_default()
                .push(row.commit_hash.as_str());
        }
    }

    let mut ready: BinaryHeap<Reverse<(DateTime<Utc>, &str)>> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(hash, _)| Reverse((by_hash[hash].created_at, *hash)))
        .collect();
    let mut order: Vec<CommitRecord> = Vec::with_capacity(reachable.len());
    while let Some(Reverse((_, hash))) = ready.pop() {
        order.push(by_hash[hash].clone());
        for child in children.get(hash).map(Vec::as_slice).unwrap_or(&[]) {
            let degree = indegree.get_mut(child).map(|d| {
                *d -= 1;
                *d
            });
            if degree == Some(0) {
                ready.push(Reverse((by_hash[child].created_at, *child)));
            }
        }
    }
    Ok(order)
}
