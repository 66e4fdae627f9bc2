//! The VCS object-store seam used by the branch backend.
//!
//! The engine never walks commit graphs or builds trees itself; it
//! consumes a small content-addressed service: blobs, tree snapshots
//! committed with a parent pointer, and a compare-and-swap ref update.
//! [`MemoryRefDb`] is the in-process implementation used for embedded
//! operation and tests; a real repository adapter implements the same
//! trait over the host's object database.

use keel_core::TicketError;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Content-addressed blob and ref service scoped by repository.
pub trait RefDb: Send + Sync {
    /// Current tip of a ref, if it exists.
    fn read_ref(&self, repo: &str, name: &str) -> Result<Option<String>, TicketError>;

    /// Atomically move a ref from `expected` to `new_tip`. Returns false
    /// when the ref no longer points at `expected` (someone else won).
    fn cas_update_ref(
        &self,
        repo: &str,
        name: &str,
        expected: Option<&str>,
        new_tip: &str,
    ) -> Result<bool, TicketError>;

    /// Store a blob, returning its content id.
    fn put_blob(&self, repo: &str, content: &[u8]) -> Result<String, TicketError>;

    /// Fetch a blob by content id.
    fn get_blob(&self, repo: &str, id: &str) -> Result<Vec<u8>, TicketError>;

    /// The path → blob-id tree snapshot at a commit.
    fn read_tree(&self, repo: &str, tip: &str) -> Result<BTreeMap<String, String>, TicketError>;

    /// Commit a tree snapshot on top of `parent`, returning the commit id.
    fn commit_tree(
        &self,
        repo: &str,
        parent: Option<&str>,
        tree: BTreeMap<String, String>,
        message: &str,
    ) -> Result<String, TicketError>;
}

#[derive(Debug, Clone)]
struct CommitRecord {
    #[allow(dead_code)]
    parent: Option<String>,
    tree: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct RefDbState {
    refs: HashMap<(String, String), String>,
    blobs: HashMap<(String, String), Vec<u8>>,
    commits: HashMap<(String, String), CommitRecord>,
    commit_seq: u64,
}

/// In-process [`RefDb`].
#[derive(Debug, Default)]
pub struct MemoryRefDb {
    state: Mutex<RefDbState>,
}

impl MemoryRefDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RefDb for MemoryRefDb {
    fn read_ref(&self, repo: &str, name: &str) -> Result<Option<String>, TicketError> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state.refs.get(&(repo.to_string(), name.to_string())).cloned())
    }

    fn cas_update_ref(
        &self,
        repo: &str,
        name: &str,
        expected: Option<&str>,
        new_tip: &str,
    ) -> Result<bool, TicketError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let key = (repo.to_string(), name.to_string());
        let current = state.refs.get(&key).map(String::as_str);
        if current != expected {
            return Ok(false);
        }
        state.refs.insert(key, new_tip.to_string());
        Ok(true)
    }

    fn put_blob(&self, repo: &str, content: &[u8]) -> Result<String, TicketError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let id = hex(Sha256::digest(content).as_slice());
        state
            .blobs
            .insert((repo.to_string(), id.clone()), content.to_vec());
        Ok(id)
    }

    fn get_blob(&self, repo: &str, id: &str) -> Result<Vec<u8>, TicketError> {
        let state = self.state.lock().map_err(poisoned)?;
        state
            .blobs
            .get(&(repo.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| TicketError::BackendUnavailable(format!("unknown blob {id}")))
    }

    fn read_tree(&self, repo: &str, tip: &str) -> Result<BTreeMap<String, String>, TicketError> {
        let state = self.state.lock().map_err(poisoned)?;
        state
            .commits
            .get(&(repo.to_string(), tip.to_string()))
            .map(|commit| commit.tree.clone())
            .ok_or_else(|| TicketError::BackendUnavailable(format!("unknown commit {tip}")))
    }

    fn commit_tree(
        &self,
        repo: &str,
        parent: Option<&str>,
        tree: BTreeMap<String, String>,
        message: &str,
    ) -> Result<String, TicketError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        state.commit_seq += 1;
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.as_bytes());
        }
        for (path, blob) in &tree {
            hasher.update(path.as_bytes());
            hasher.update(blob.as_bytes());
        }
        hasher.update(message.as_bytes());
        hasher.update(state.commit_seq.to_string().as_bytes());
        let id = hex(hasher.finalize().as_slice());
        state.commits.insert(
            (repo.to_string(), id.clone()),
            CommitRecord {
                parent: parent.map(String::from),
                tree,
            },
        );
        Ok(id)
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> TicketError {
    TicketError::BackendUnavailable("ref db mutex poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blobs_are_content_addressed() {
        let db = MemoryRefDb::new();
        let a = db.put_blob("r.git", b"same").unwrap();
        let b = db.put_blob("r.git", b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(db.get_blob("r.git", &a).unwrap(), b"same");
    }

    #[test]
    fn cas_ref_update_detects_races() {
        let db = MemoryRefDb::new();
        let tree = BTreeMap::new();
        let c1 = db.commit_tree("r.git", None, tree.clone(), "first").unwrap();
        let c2 = db.commit_tree("r.git", None, tree, "second").unwrap();

        assert!(db.cas_update_ref("r.git", "refs/keel/tickets", None, &c1).unwrap());
        // stale expectation loses
        assert!(!db.cas_update_ref("r.git", "refs/keel/tickets", None, &c2).unwrap());
        assert!(db
            .cas_update_ref("r.git", "refs/keel/tickets", Some(&c1), &c2)
            .unwrap());
        assert_eq!(
            db.read_ref("r.git", "refs/keel/tickets").unwrap(),
            Some(c2)
        );
    }

    #[test]
    fn commits_snapshot_their_tree() {
        let db = MemoryRefDb::new();
        let blob = db.put_blob("r.git", b"[]").unwrap();
        let mut tree = BTreeMap::new();
        tree.insert("tickets/01/1/journal.json".to_string(), blob);
        let tip = db.commit_tree("r.git", None, tree.clone(), "seed").unwrap();
        assert_eq!(db.read_tree("r.git", &tip).unwrap(), tree);
    }

    #[test]
    fn repositories_are_isolated() {
        let db = MemoryRefDb::new();
        let blob = db.put_blob("a.git", b"data").unwrap();
        assert!(db.get_blob("b.git", &blob).is_err());
    }
}
