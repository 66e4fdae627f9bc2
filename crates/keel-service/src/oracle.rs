//! The version-control reachability seam.
//!
//! The reference integrity engine never walks commit graphs itself; it asks
//! a [`ReachabilityOracle`] which commits a tip can reach, what a commit's
//! message says, and what refs currently exist, then computes its set diffs
//! from the answers. [`MemoryGraph`] is the in-process implementation used
//! for embedded operation and tests; a real repository adapter implements
//! the same trait over the host's object database.

use keel_core::TicketError;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

/// Read-mostly view of a repository's commit graph and refs.
///
/// `reachable_commits` returns tip-first order (a breadth-first walk from
/// the tip toward the roots), which the engine relies on to record commit
/// references newest-first.
pub trait ReachabilityOracle: Send + Sync {
    /// All refs of the repository as `(name, tip)` pairs, sorted by name.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] if the graph cannot be read.
    fn refs(&self, repo: &str) -> Result<Vec<(String, String)>, TicketError>;

    /// Current tip of one ref, if it exists.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] if the graph cannot be read.
    fn read_ref(&self, repo: &str, name: &str) -> Result<Option<String>, TicketError>;

    /// Atomically move a ref from `expected` to `new_tip` (`None` deletes
    /// it). Returns false when the ref no longer points at `expected`.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] if the graph cannot be written.
    fn cas_update_ref(
        &self,
        repo: &str,
        name: &str,
        expected: Option<&str>,
        new_tip: Option<&str>,
    ) -> Result<bool, TicketError>;

    /// Every commit reachable from `tip`, tip first.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] for an unknown tip or an
    /// unreadable graph.
    fn reachable_commits(&self, repo: &str, tip: &str) -> Result<Vec<String>, TicketError>;

    /// Full message of one commit.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] for an unknown commit.
    fn commit_message(&self, repo: &str, sha: &str) -> Result<String, TicketError>;

    /// `(insertions, deletions)` of one commit.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] for an unknown commit.
    fn commit_stats(&self, repo: &str, sha: &str) -> Result<(u32, u32), TicketError>;

    /// Name of the integration branch proposals merge to.
    ///
    /// # Errors
    ///
    /// Infallible in the default implementation.
    fn default_branch(&self, repo: &str) -> Result<String, TicketError> {
        let _ = repo;
        Ok("refs/heads/master".to_string())
    }

    /// `(added, removed)` commit sets between two tips of one branch.
    ///
    /// `added` preserves the tip-first order of `reachable_commits`.
    /// Collaborators with a native revision walk may override this.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] if either side cannot be walked.
    fn diff_reachability(
        &self,
        repo: &str,
        old_tip: Option<&str>,
        new_tip: Option<&str>,
    ) -> Result<(Vec<String>, Vec<String>), TicketError> {
        let after = match new_tip {
            Some(tip) => self.reachable_commits(repo, tip)?,
            None => Vec::new(),
        };
        let before = match old_tip {
            Some(tip) => self.reachable_commits(repo, tip)?,
            None => Vec::new(),
        };
        let after_set: BTreeSet<&String> = after.iter().collect();
        let before_set: BTreeSet<&String> = before.iter().collect();
        let added = after
            .iter()
            .filter(|sha| !before_set.contains(sha))
            .cloned()
            .collect();
        let removed = before
            .iter()
            .filter(|sha| !after_set.contains(sha))
            .cloned()
            .collect();
        Ok((added, removed))
    }
}

#[derive(Debug, Clone)]
struct CommitNode {
    parents: Vec<String>,
    message: String,
    insertions: u32,
    deletions: u32,
}

#[derive(Debug, Default)]
struct GraphState {
    commits: HashMap<(String, String), CommitNode>,
    refs: BTreeMap<(String, String), String>,
    commit_seq: u64,
}

/// In-process commit graph, used for embedded operation and tests.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: Mutex<GraphState>,
}

impl MemoryGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a commit with default stats (one insertion, no deletions).
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] if the graph mutex is poisoned.
    pub fn commit(
        &self,
        repo: &str,
        parents: &[&str],
        message: &str,
    ) -> Result<String, TicketError> {
        self.commit_with_stats(repo, parents, message, 1, 0)
    }

    /// Record a commit with explicit diff stats, returning its id.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] if the graph mutex is poisoned.
    pub fn commit_with_stats(
        &self,
        repo: &str,
        parents: &[&str],
        message: &str,
        insertions: u32,
        deletions: u32,
    ) -> Result<String, TicketError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        state.commit_seq += 1;
        let mut hasher = Sha256::new();
        for parent in parents {
            hasher.update(parent.as_bytes());
        }
        hasher.update(message.as_bytes());
        hasher.update(state.commit_seq.to_string().as_bytes());
        let sha = hex(hasher.finalize().as_slice());
        state.commits.insert(
            (repo.to_string(), sha.clone()),
            CommitNode {
                parents: parents.iter().map(|p| (*p).to_string()).collect(),
                message: message.to_string(),
                insertions,
                deletions,
            },
        );
        Ok(sha)
    }

    /// Point a ref at a tip, creating or moving it unconditionally.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] if the graph mutex is poisoned.
    pub fn set_ref(&self, repo: &str, name: &str, tip: &str) -> Result<(), TicketError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        state
            .refs
            .insert((repo.to_string(), name.to_string()), tip.to_string());
        Ok(())
    }

    /// Remove a ref, returning the tip it pointed at.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] if the graph mutex is poisoned.
    pub fn delete_ref(&self, repo: &str, name: &str) -> Result<Option<String>, TicketError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        Ok(state.refs.remove(&(repo.to_string(), name.to_string())))
    }
}

impl ReachabilityOracle for MemoryGraph {
    fn refs(&self, repo: &str) -> Result<Vec<(String, String)>, TicketError> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state
            .refs
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|((_, name), tip)| (name.clone(), tip.clone()))
            .collect())
    }

    fn read_ref(&self, repo: &str, name: &str) -> Result<Option<String>, TicketError> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state
            .refs
            .get(&(repo.to_string(), name.to_string()))
            .cloned())
    }

    fn cas_update_ref(
        &self,
        repo: &str,
        name: &str,
        expected: Option<&str>,
        new_tip: Option<&str>,
    ) -> Result<bool, TicketError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let key = (repo.to_string(), name.to_string());
        if state.refs.get(&key).map(String::as_str) != expected {
            return Ok(false);
        }
        match new_tip {
            Some(tip) => {
                state.refs.insert(key, tip.to_string());
            }
            None => {
                state.refs.remove(&key);
            }
        }
        Ok(true)
    }

    fn reachable_commits(&self, repo: &str, tip: &str) -> Result<Vec<String>, TicketError> {
        let state = self.state.lock().map_err(poisoned)?;
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        let mut frontier = vec![tip.to_string()];
        while let Some(sha) = frontier.pop() {
            if !seen.insert(sha.clone()) {
                continue;
            }
            let node = state
                .commits
                .get(&(repo.to_string(), sha.clone()))
                .ok_or_else(|| {
                    TicketError::BackendUnavailable(format!("unknown commit {sha} in {repo}"))
                })?;
            order.push(sha);
            for parent in &node.parents {
                if !seen.contains(parent) {
                    frontier.push(parent.clone());
                }
            }
        }
        Ok(order)
    }

    fn commit_message(&self, repo: &str, sha: &str) -> Result<String, TicketError> {
        let state = self.state.lock().map_err(poisoned)?;
        state
            .commits
            .get(&(repo.to_string(), sha.to_string()))
            .map(|node| node.message.clone())
            .ok_or_else(|| {
                TicketError::BackendUnavailable(format!("unknown commit {sha} in {repo}"))
            })
    }

    fn commit_stats(&self, repo: &str, sha: &str) -> Result<(u32, u32), TicketError> {
        let state = self.state.lock().map_err(poisoned)?;
        state
            .commits
            .get(&(repo.to_string(), sha.to_string()))
            .map(|node| (node.insertions, node.deletions))
            .ok_or_else(|| {
                TicketError::BackendUnavailable(format!("unknown commit {sha} in {repo}"))
            })
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
    TicketError::BackendUnavailable("commit graph mutex poisoned".into())
}
