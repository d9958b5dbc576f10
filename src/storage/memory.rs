//! In-memory reference backend.
//!
//! Table state lives behind one mutex; a transaction snapshots the whole
//! state on `begin` and restores it on `rollback`. Commit rows are kept in a
//! `BTreeMap` so hash-prefix resolution is a range scan, matching the
//! lexicographic index a relational backend would use. Foreign keys are
//! enforced on save.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::errors::{Result, TractError};
use crate::model::{
    AnnotationRecord, BlobRecord, CommitParentRecord, CommitRecord, RefRecord, ToolSchemaRecord,
    branch_ref, BRANCH_PREFIX, HEAD,
};
use crate::storage::{
    AnnotationRepository, BlobRepository, CommitParentRepository, CommitRepository, NewAnnotation,
    RefRepository, SCHEMA_VERSION, Storage, ToolSchemaRepository,
};

#[derive(Debug, Default, Clone)]
struct Tables {
    blobs: HashMap<String, BlobRecord>,
    commits: BTreeMap<String, CommitRecord>,
    refs: HashMap<(String, String), RefRecord>,
    annotations: Vec<AnnotationRecord>,
    annotation_seq: u64,
    parent_edges: HashMap<String, Vec<CommitParentRecord>>,
    tool_schemas: HashMap<String, ToolSchemaRecord>,
    commit_tools: HashMap<String, Vec<(u32, String)>>,
    schema_version: u32,
}

#[derive(Debug, Default)]
struct Cell {
    live: Tables,
    saved: Option<Tables>,
}

#[derive(Debug, Default)]
struct Shared {
    cell: Mutex<Cell>,
}

impl Shared {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> Result<R>) -> Result<R> {
        let cell = self
            .cell
            .lock()
            .map_err(|_| TractError::storage("state lock poisoned"))?;
        f(&cell.live)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let mut cell = self
            .cell
            .lock()
            .map_err(|_| TractError::storage("state lock poisoned"))?;
        f(&mut cell.live)
    }
}

struct MemoryBlobs {
    shared: Arc<Shared>,
}

impl BlobRepository for MemoryBlobs {
    fn get(&self, content_hash: &str) -> Result<Option<BlobRecord>> {
        self.shared
            .read(|t| Ok(t.blobs.get(content_hash).cloned()))
    }

    fn save_if_absent(&self, blob: BlobRecord) -> Result<bool> {
        self.shared.write(|t| {
            if t.blobs.contains_key(&blob.content_hash) {
                return Ok(false);
            }
            t.blobs.insert(blob.content_hash.clone(), blob);
            Ok(true)
        })
    }
}

struct MemoryCommits {
    shared: Arc<Shared>,
}

impl CommitRepository for MemoryCommits {
    fn get(&self, commit_hash: &str) -> Result<Option<CommitRecord>> {
        self.shared
            .read(|t| Ok(t.commits.get(commit_hash).cloned()))
    }

    fn save(&self, row: CommitRecord) -> Result<()> {
        self.shared.write(|t| {
            if t.commits.contains_key(&row.commit_hash) {
                return Err(TractError::storage(format!(
                    "commit {} already exists",
                    row.commit_hash
                )));
            }
            if !t.blobs.contains_key(&row.content_hash) {
                return Err(TractError::storage(format!(
                    "commit {} references missing blob {}",
                    row.commit_hash, row.content_hash
                )));
            }
            if let Some(parent) = &row.parent_hash {
                if !t.commits.contains_key(parent) {
                    return Err(TractError::storage(format!(
                        "commit {} references missing parent {parent}",
                        row.commit_hash
                    )));
                }
            }
            t.commits.insert(row.commit_hash.clone(), row);
            Ok(())
        })
    }

    fn get_ancestors(&self, head: &str, limit: Option<usize>) -> Result<Vec<CommitRecord>> {
        self.shared.read(|t| {
            let mut out = Vec::new();
            let mut cursor = Some(head.to_string());
            while let Some(hash) = cursor {
                let Some(row) = t.commits.get(&hash) else {
                    break;
                };
                out.push(row.clone());
                if limit.is_some_and(|n| out.len() >= n) {
                    break;
                }
                cursor = row.parent_hash.clone();
            }
            Ok(out)
        })
    }

    fn get_by_prefix(&self, prefix: &str, tract_id: Option<&str>) -> Result<Option<CommitRecord>> {
        self.shared.read(|t| {
            let mut matches: Vec<&CommitRecord> = t
                .commits
                .range(prefix.to_string()..)
                .take_while(|(hash, _)| hash.starts_with(prefix))
                .map(|(_, row)| row)
                .filter(|row| tract_id.is_none_or(|id| row.tract_id == id))
                .take(6)
                .collect();
            match matches.len() {
                0 => Ok(None),
                1 => Ok(Some(matches.remove(0).clone())),
                _ => Err(TractError::AmbiguousPrefix {
                    prefix: prefix.to_string(),
                    candidates: matches
                        .iter()
                        .take(5)
                        .map(|row| row.commit_hash.clone())
                        .collect(),
                }),
            }
        })
    }

    fn get_by_type(&self, content_type: &str, tract_id: &str) -> Result<Vec<CommitRecord>> {
        self.shared.read(|t| {
            let mut rows: Vec<CommitRecord> = t
                .commits
                .values()
                .filter(|row| row.tract_id == tract_id && row.content_type == content_type)
                .cloned()
                .collect();
            rows.sort_by(|a, b| {
                (a.created_at, &a.commit_hash).cmp(&(b.created_at, &b.commit_hash))
            });
            Ok(rows)
        })
    }

    fn get_children(&self, commit_hash: &str) -> Result<Vec<CommitRecord>> {
        self.shared.read(|t| {
            let mut child_hashes: HashSet<&str> = t
                .commits
                .values()
                .filter(|row| row.parent_hash.as_deref() == Some(commit_hash))
                .map(|row| row.commit_hash.as_str())
                .collect();
            for (child, edges) in &t.parent_edges {
                if edges.iter().any(|e| e.parent_hash == commit_hash) {
                    child_hashes.insert(child.as_str());
                }
            }
            let mut rows: Vec<CommitRecord> = child_hashes
                .into_iter()
                .filter_map(|hash| t.commits.get(hash).cloned())
                .collect();
            rows.sort_by(|a, b| {
                (a.created_at, &a.commit_hash).cmp(&(b.created_at, &b.commit_hash))
            });
            Ok(rows)
        })
    }
}

struct MemoryRefs {
    shared: Arc<Shared>,
}

impl MemoryRefs {
    fn key(tract_id: &str, name: &str) -> (String, String) {
        (tract_id.to_string(), name.to_string())
    }
}

impl RefRepository for MemoryRefs {
    fn get_ref(&self, tract_id: &str, name: &str) -> Result<Option<RefRecord>> {
        self.shared
            .read(|t| Ok(t.refs.get(&Self::key(tract_id, name)).cloned()))
    }

    fn set_ref(&self, tract_id: &str, name: &str, commit_hash: Option<&str>) -> Result<()> {
        self.shared.write(|t| {
            t.refs.insert(
                Self::key(tract_id, name),
                RefRecord {
                    tract_id: tract_id.to_string(),
                    ref_name: name.to_string(),
                    commit_hash: commit_hash.map(String::from),
                    symbolic_target: None,
                },
            );
            Ok(())
        })
    }

    fn get_head(&self, tract_id: &str) -> Result<Option<String>> {
        self.shared.read(|t| {
            let Some(head) = t.refs.get(&Self::key(tract_id, HEAD)) else {
                return Ok(None);
            };
            if let Some(target) = &head.symbolic_target {
                return Ok(t
                    .refs
                    .get(&Self::key(tract_id, target))
                    .and_then(|r| r.commit_hash.clone()));
            }
            Ok(head.commit_hash.clone())
        })
    }

    fn update_head(&self, tract_id: &str, commit_hash: &str) -> Result<()> {
        self.shared.write(|t| {
            let head_key = Self::key(tract_id, HEAD);
            let target = t
                .refs
                .get(&head_key)
                .and_then(|head| head.symbolic_target.clone());
            match target {
                Some(branch) => {
                    t.refs.insert(
                        Self::key(tract_id, &branch),
                        RefRecord {
                            tract_id: tract_id.to_string(),
                            ref_name: branch.clone(),
                            commit_hash: Some(commit_hash.to_string()),
                            symbolic_target: None,
                        },
                    );
                }
                None => {
                    t.refs.insert(
                        head_key,
                        RefRecord {
                            tract_id: tract_id.to_string(),
                            ref_name: HEAD.to_string(),
                            commit_hash: Some(commit_hash.to_string()),
                            symbolic_target: None,
                        },
                    );
                }
            }
            Ok(())
        })
    }

    fn get_branch(&self, tract_id: &str, name: &str) -> Result<Option<String>> {
        self.shared.read(|t| {
            Ok(t.refs
                .get(&Self::key(tract_id, &branch_ref(name)))
                .and_then(|r| r.commit_hash.clone()))
        })
    }

    fn set_branch(&self, tract_id: &str, name: &str, commit_hash: &str) -> Result<()> {
        self.set_ref(tract_id, &branch_ref(name), Some(commit_hash))
    }

    fn delete_branch(&self, tract_id: &str, name: &str) -> Result<bool> {
        self.shared.write(|t| {
            Ok(t.refs
                .remove(&Self::key(tract_id, &branch_ref(name)))
                .is_some())
        })
    }

    fn list_branches(&self, tract_id: &str) -> Result<Vec<(String, Option<String>)>> {
        self.shared.read(|t| {
            let mut branches: Vec<(String, Option<String>)> = t
                .refs
                .values()
                .filter(|r| r.tract_id == tract_id && r.ref_name.starts_with(BRANCH_PREFIX))
                .map(|r| {
                    (
                        r.ref_name[BRANCH_PREFIX.len()..].to_string(),
                        r.commit_hash.clone(),
                    )
                })
                .collect();
            branches.sort();
            Ok(branches)
        })
    }

    fn attach_head(&self, tract_id: &str, branch: &str) -> Result<()> {
        self.shared.write(|t| {
            t.refs.insert(
                Self::key(tract_id, HEAD),
                RefRecord {
                    tract_id: tract_id.to_string(),
                    ref_name: HEAD.to_string(),
                    commit_hash: None,
                    symbolic_target: Some(branch_ref(branch)),
                },
            );
            Ok(())
        })
    }

    fn detach_head(&self, tract_id: &str, commit_hash: &str) -> Result<()> {
        self.shared.write(|t| {
            t.refs.insert(
                Self::key(tract_id, HEAD),
                RefRecord {
                    tract_id: tract_id.to_string(),
                    ref_name: HEAD.to_string(),
                    commit_hash: Some(commit_hash.to_string()),
                    symbolic_target: None,
                },
            );
            Ok(())
        })
    }

    fn is_detached(&self, tract_id: &str) -> Result<bool> {
        self.shared.read(|t| {
            Ok(t.refs
                .get(&Self::key(tract_id, HEAD))
                .is_some_and(|head| head.symbolic_target.is_none() && head.commit_hash.is_some()))
        })
    }

    fn head_branch(&self, tract_id: &str) -> Result<Option<String>> {
        self.shared.read(|t| {
            Ok(t.refs
                .get(&Self::key(tract_id, HEAD))
                .and_then(|head| head.symbolic_target.as_deref())
                .and_then(|target| target.strip_prefix(BRANCH_PREFIX))
                .map(String::from))
        })
    }
}

struct MemoryAnnotations {
    shared: Arc<Shared>,
}

impl AnnotationRepository for MemoryAnnotations {
    fn save(&self, annotation: NewAnnotation) -> Result<AnnotationRecord> {
        self.shared.write(|t| {
            t.annotation_seq += 1;
            let record = AnnotationRecord {
                id: t.annotation_seq,
                tract_id: annotation.tract_id,
                target_hash: annotation.target_hash,
                priority: annotation.priority,
                reason: annotation.reason,
                retention: annotation.retention,
                created_at: annotation.created_at,
            };
            t.annotations.push(record.clone());
            Ok(record)
        })
    }

    fn get_history(&self, target_hash: &str) -> Result<Vec<AnnotationRecord>> {
        self.shared.read(|t| {
            Ok(t.annotations
                .iter()
                .filter(|a| a.target_hash == target_hash)
                .cloned()
                .collect())
        })
    }

    fn batch_get_latest(
        &self,
        targets: &[String],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<HashMap<String, AnnotationRecord>> {
        self.shared.read(|t| {
            let wanted: HashSet<&str> = targets.iter().map(String::as_str).collect();
            let mut latest: HashMap<String, AnnotationRecord> = HashMap::new();
            for annotation in &t.annotations {
                if !wanted.contains(annotation.target_hash.as_str()) {
                    continue;
                }
                if as_of.is_some_and(|cutoff| annotation.created_at > cutoff) {
                    continue;
                }
                let newer = latest
                    .get(&annotation.target_hash)
                    .is_none_or(|current| {
                        (annotation.created_at, annotation.id) > (current.created_at, current.id)
                    });
                if newer {
                    latest.insert(annotation.target_hash.clone(), annotation.clone());
                }
            }
            Ok(latest)
        })
    }
}

struct MemoryParents {
    shared: Arc<Shared>,
}

impl CommitParentRepository for MemoryParents {
    fn add_parents(
        &self,
        commit_hash: &str,
        parents: &[String],
        starting_position: u32,
    ) -> Result<()> {
        self.shared.write(|t| {
            for (offset, parent) in parents.iter().enumerate() {
                if !t.commits.contains_key(parent) {
                    return Err(TractError::storage(format!(
                        "parent edge references missing commit {parent}"
                    )));
                }
                t.parent_edges
                    .entry(commit_hash.to_string())
                    .or_default()
                    .push(CommitParentRecord {
                        commit_hash: commit_hash.to_string(),
                        parent_hash: parent.clone(),
                        position: starting_position + offset as u32,
                    });
            }
            if let Some(edges) = t.parent_edges.get_mut(commit_hash) {
                edges.sort_by_key(|e| e.position);
            }
            Ok(())
        })
    }

    fn get_parents(&self, commit_hash: &str) -> Result<Vec<String>> {
        self.shared.read(|t| {
            Ok(t.parent_edges
                .get(commit_hash)
                .map(|edges| edges.iter().map(|e| e.parent_hash.clone()).collect())
                .unwrap_or_default())
        })
    }
}

struct MemoryTools {
    shared: Arc<Shared>,
}

impl ToolSchemaRepository for MemoryTools {
    fn store(&self, record: ToolSchemaRecord) -> Result<()> {
        self.shared.write(|t| {
            t.tool_schemas
                .entry(record.content_hash.clone())
                .or_insert(record);
            Ok(())
        })
    }

    fn get(&self, content_hash: &str) -> Result<Option<ToolSchemaRecord>> {
        self.shared
            .read(|t| Ok(t.tool_schemas.get(content_hash).cloned()))
    }

    fn link_to_commit(&self, commit_hash: &str, tool_hash: &str, position: u32) -> Result<()> {
        self.shared.write(|t| {
            if !t.tool_schemas.contains_key(tool_hash) {
                return Err(TractError::storage(format!(
                    "tool link references missing schema {tool_hash}"
                )));
            }
            let links = t.commit_tools.entry(commit_hash.to_string()).or_default();
            links.push((position, tool_hash.to_string()));
            links.sort();
            Ok(())
        })
    }

    fn get_commit_tool_hashes(&self, commit_hash: &str) -> Result<Vec<String>> {
        self.shared.read(|t| {
            Ok(t.commit_tools
                .get(commit_hash)
                .map(|links| links.iter().map(|(_, hash)| hash.clone()).collect())
                .unwrap_or_default())
        })
    }

    fn get_for_commit(&self, commit_hash: &str) -> Result<Vec<ToolSchemaRecord>> {
        let hashes = self.get_commit_tool_hashes(commit_hash)?;
        self.shared.read(|t| {
            Ok(hashes
                .iter()
                .filter_map(|hash| t.tool_schemas.get(hash).cloned())
                .collect())
        })
    }
}

/// The in-memory reference backend.
pub struct MemoryStorage {
    shared: Arc<Shared>,
    blobs: MemoryBlobs,
    commits: MemoryCommits,
    refs: MemoryRefs,
    annotations: MemoryAnnotations,
    parents: MemoryParents,
    tools: MemoryTools,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let storage = MemoryStorage {
            blobs: MemoryBlobs {
                shared: Arc::clone(&shared),
            },
            commits: MemoryCommits {
                shared: Arc::clone(&shared),
            },
            refs: MemoryRefs {
                shared: Arc::clone(&shared),
            },
            annotations: MemoryAnnotations {
                shared: Arc::clone(&shared),
            },
            parents: MemoryParents {
                shared: Arc::clone(&shared),
            },
            tools: MemoryTools {
                shared: Arc::clone(&shared),
            },
            shared,
        };
        storage.migrate();
        storage
    }

    /// Forward-only schema setup; idempotent.
    fn migrate(&self) {
        let _ = self.shared.write(|t| {
            if t.schema_version < SCHEMA_VERSION {
                tracing::debug!(
                    from = t.schema_version,
                    to = SCHEMA_VERSION,
                    "initialising storage schema"
                );
                t.schema_version = SCHEMA_VERSION;
            }
            Ok(())
        });
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        MemoryStorage::new()
    }
}

impl Storage for MemoryStorage {
    fn blobs(&self) -> &dyn BlobRepository {
        &self.blobs
    }

    fn commits(&self) -> &dyn CommitRepository {
        &self.commits
    }

    fn refs(&self) -> &dyn RefRepository {
        &self.refs
    }

    fn annotations(&self) -> &dyn AnnotationRepository {
        &self.annotations
    }

    fn parents(&self) -> &dyn CommitParentRepository {
        &self.parents
    }

    fn tools(&self) -> &dyn ToolSchemaRepository {
        &self.tools
    }

    fn schema_version(&self) -> Result<u32> {
        self.shared.read(|t| Ok(t.schema_version))
    }

    fn begin(&self) -> Result<()> {
        let mut cell = self
            .shared
            .cell
            .lock()
            .map_err(|_| TractError::storage("state lock poisoned"))?;
        if cell.saved.is_some() {
            return Err(TractError::storage("transaction already open"));
        }
        cell.saved = Some(cell.live.clone());
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut cell = self
            .shared
            .cell
            .lock()
            .map_err(|_| TractError::storage("state lock poisoned"))?;
        cell.saved = None;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut cell = self
            .shared
            .cell
            .lock()
            .map_err(|_| TractError::storage("state lock poisoned"))?;
        if let Some(saved) = cell.saved.take() {
            cell.live = saved;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::content_hash;
    use crate::model::{Operation, Priority};
    use serde_json::json;

    fn blob(payload: serde_json::Value) -> BlobRecord {
        let hash = content_hash(&payload);
        BlobRecord {
            content_hash: hash,
            byte_size: 0,
            token_count: 0,
            payload,
            created_at: Utc::now(),
        }
    }

    fn commit_row(hash: &str, parent: Option<&str>, blob_hash: &str) -> CommitRecord {
        CommitRecord {
            commit_hash: hash.to_string(),
            tract_id: "t1".to_string(),
            parent_hash: parent.map(String::from),
            content_hash: blob_hash.to_string(),
            content_type: "dialogue".to_string(),
            operation: Operation::Append,
            edit_target: None,
            message: None,
            token_count: 0,
            metadata: None,
            generation_config: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_blob_dedup() {
        let storage = MemoryStorage::new();
        let b = blob(json!({"text": "x"}));
        assert!(storage.blobs().save_if_absent(b.clone()).unwrap());
        assert!(!storage.blobs().save_if_absent(b.clone()).unwrap());
        assert!(storage.blobs().get(&b.content_hash).unwrap().is_some());
    }

    #[test]
    fn test_commit_fk_enforced() {
        let storage = MemoryStorage::new();
        let row = commit_row(&"a".repeat(64), None, "missing-blob");
        assert!(storage.commits().save(row).is_err());
    }

    #[test]
    fn test_prefix_resolution() {
        let storage = MemoryStorage::new();
        let b = blob(json!({"text": "x"}));
        storage.blobs().save_if_absent(b.clone()).unwrap();
        let h1 = format!("ab12{}", "0".repeat(60));
        let h2 = format!("ab13{}", "0".repeat(60));
        storage.commits().save(commit_row(&h1, None, &b.content_hash)).unwrap();
        storage.commits().save(commit_row(&h2, None, &b.content_hash)).unwrap();

        let found = storage.commits().get_by_prefix("ab12", None).unwrap();
        assert_eq!(found.unwrap().commit_hash, h1);
        assert!(storage.commits().get_by_prefix("zz", None).unwrap().is_none());
        let err = storage.commits().get_by_prefix("ab1", None).unwrap_err();
        assert!(matches!(err, TractError::AmbiguousPrefix { .. }));
    }

    #[test]
    fn test_symbolic_head_resolution() {
        let storage = MemoryStorage::new();
        let b = blob(json!({"text": "x"}));
        storage.blobs().save_if_absent(b.clone()).unwrap();
        let h1 = "a".repeat(64);
        storage.commits().save(commit_row(&h1, None, &b.content_hash)).unwrap();

        storage.refs().attach_head("t1", "main").unwrap();
        assert!(storage.refs().get_head("t1").unwrap().is_none());
        storage.refs().update_head("t1", &h1).unwrap();
        assert_eq!(storage.refs().get_head("t1").unwrap().as_deref(), Some(h1.as_str()));
        assert_eq!(storage.refs().get_branch("t1", "main").unwrap().as_deref(), Some(h1.as_str()));
        assert!(!storage.refs().is_detached("t1").unwrap());

        storage.refs().detach_head("t1", &h1).unwrap();
        assert!(storage.refs().is_detached("t1").unwrap());
        assert!(storage.refs().head_branch("t1").unwrap().is_none());
    }

    #[test]
    fn test_annotation_latest_wins() {
        let storage = MemoryStorage::new();
        let target = "c".repeat(64);
        for (i, priority) in [Priority::Skip, Priority::Pinned].iter().enumerate() {
            storage
                .annotations()
                .save(NewAnnotation {
                    tract_id: "t1".to_string(),
                    target_hash: target.clone(),
                    priority: *priority,
                    reason: None,
                    retention: None,
                    created_at: Utc::now() + chrono::Duration::seconds(i as i64),
                })
                .unwrap();
        }
        let latest = storage
            .annotations()
            .batch_get_latest(&[target.clone()], None)
            .unwrap();
        assert_eq!(latest[&target].priority, Priority::Pinned);
        assert_eq!(storage.annotations().get_history(&target).unwrap().len(), 2);
    }

    #[test]
    fn test_transaction_rollback() {
        let storage = MemoryStorage::new();
        let b = blob(json!({"text": "x"}));
        storage.blobs().save_if_absent(b.clone()).unwrap();

        storage.begin().unwrap();
        let h1 = "a".repeat(64);
        storage.commits().save(commit_row(&h1, None, &b.content_hash)).unwrap();
        storage.refs().set_ref("t1", HEAD, Some(&h1)).unwrap();
        storage.rollback().unwrap();

        assert!(storage.commits().get(&h1).unwrap().is_none());
        assert!(storage.refs().get_head("t1").unwrap().is_none());

        storage.begin().unwrap();
        storage.commits().save(commit_row(&h1, None, &b.content_hash)).unwrap();
        storage.commit().unwrap();
        assert!(storage.commits().get(&h1).unwrap().is_some());
    }

    #[test]
    fn test_tool_links_ordered() {
        let storage = MemoryStorage::new();
        let schema_a = json!({"name": "alpha"});
        let schema_b = json!({"name": "beta"});
        let (ha, hb) = (content_hash(&schema_a), content_hash(&schema_b));
        for (hash, name, schema) in [(&ha, "alpha", schema_a), (&hb, "beta", schema_b)] {
            storage
                .tools()
                .store(ToolSchemaRecord {
                    content_hash: hash.clone(),
                    name: name.to_string(),
                    schema,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let commit = "d".repeat(64);
        storage.tools().link_to_commit(&commit, &hb, 1).unwrap();
        storage.tools().link_to_commit(&commit, &ha, 0).unwrap();
        assert_eq!(
            storage.tools().get_commit_tool_hashes(&commit).unwrap(),
            vec![ha.clone(), hb.clone()]
        );
        let schemas = storage.tools().get_for_commit(&commit).unwrap();
        assert_eq!(schemas[0].name, "alpha");
        assert_eq!(schemas[1].name, "beta");
    }
}
