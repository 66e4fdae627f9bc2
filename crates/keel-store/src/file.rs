//! Flat-file backend.
//!
//! One journal file per ticket under a hashed directory layout
//! (`<root>/<repo>/tickets/<nn>/<number>/journal.json`), plus a counter
//! file per repository for the allocator. Advisory `fs2` locks around the
//! read-check-write cycle provide the compare-and-swap; journal writes go
//! through a temp file and an atomic rename so a crash never leaves a
//! half-written journal behind.

use crate::store::{self, TicketStore, journal_path};
use fs2::FileExt;
use keel_core::{Change, Label, Milestone, TicketError, journal};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const COUNTER_FILE: &str = "tickets/counter";
const LOCK_WAIT: Duration = Duration::from_secs(2);

/// Local-disk ticket storage.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] if the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TicketError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err)?;
        Ok(Self { root })
    }

    fn repo_dir(&self, repo: &str) -> PathBuf {
        self.root.join(repo)
    }

    fn journal_file(&self, repo: &str, number: u64) -> PathBuf {
        self.repo_dir(repo).join(journal_path(number))
    }

    fn read_journal_file(path: &Path) -> Result<Vec<Change>, TicketError> {
        let mut text = String::new();
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut text))
            .map_err(io_err)?;
        journal::deserialize_journal(&text)
    }

    fn write_atomic(path: &Path, content: &[u8]) -> Result<(), TicketError> {
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp).map_err(io_err)?;
            file.write_all(content).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, path).map_err(io_err)
    }

    fn read_counter(path: &Path) -> Result<u64, TicketError> {
        if !path.exists() {
            return Ok(0);
        }
        let mut text = String::new();
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut text))
            .map_err(io_err)?;
        text.trim()
            .parse()
            .map_err(|_| TicketError::CorruptJournal(format!("bad counter at {}", path.display())))
    }

    fn records_path(&self, repo: &str, which: &str) -> PathBuf {
        self.repo_dir(repo).join(which)
    }

    fn read_records<T: serde::de::DeserializeOwned>(
        path: &Path,
    ) -> Result<Vec<T>, TicketError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut text = String::new();
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut text))
            .map_err(io_err)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write_records<T: serde::Serialize>(path: &Path, records: &[T]) -> Result<(), TicketError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        Self::write_atomic(path, serde_json::to_string_pretty(records)?.as_bytes())
    }

    fn with_records_lock<T>(
        &self,
        repo: &str,
        f: impl FnOnce() -> Result<T, TicketError>,
    ) -> Result<T, TicketError> {
        let lock_path = self.repo_dir(repo).join("tickets/records.lock");
        let _guard = FileLock::acquire(&lock_path, LOCK_WAIT)?;
        f()
    }
}

impl TicketStore for FileStore {
    fn append(
        &self,
        repo: &str,
        number: u64,
        expected_version: u64,
        change: &Change,
    ) -> Result<u64, TicketError> {
        let path = self.journal_file(repo, number);
        let dir = path.parent().expect("journal path has a parent");
        fs::create_dir_all(dir).map_err(io_err)?;

        let _guard = FileLock::acquire(&dir.join("journal.lock"), LOCK_WAIT)?;

        let mut changes = if path.exists() {
            Self::read_journal_file(&path)?
        } else if expected_version == 0 {
            Vec::new()
        } else {
            return Err(TicketError::not_found(repo, number));
        };

        let actual = changes.len() as u64;
        if actual != expected_version {
            return Err(TicketError::VersionConflict {
                expected: expected_version,
                actual,
            });
        }

        changes.push(change.clone());
        Self::write_atomic(&path, journal::serialize_journal(&changes)?.as_bytes())?;
        tracing::debug!(repo, number, version = changes.len(), "appended change");
        Ok(changes.len() as u64)
    }

    fn journal(&self, repo: &str, number: u64) -> Result<Vec<Change>, TicketError> {
        let path = self.journal_file(repo, number);
        if !path.exists() {
            return Err(TicketError::not_found(repo, number));
        }
        Self::read_journal_file(&path)
    }

    fn has_ticket(&self, repo: &str, number: u64) -> bool {
        self.journal_file(repo, number).exists()
    }

    fn ticket_numbers(&self, repo: &str) -> Result<Vec<u64>, TicketError> {
        let tickets_dir = self.repo_dir(repo).join("tickets");
        let mut numbers = Vec::new();
        if !tickets_dir.exists() {
            return Ok(numbers);
        }
        for bucket in fs::read_dir(&tickets_dir).map_err(io_err)? {
            let bucket = bucket.map_err(io_err)?;
            if !bucket.file_type().map_err(io_err)?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(bucket.path()).map_err(io_err)? {
                let entry = entry.map_err(io_err)?;
                if !entry.path().join("journal.json").exists() {
                    continue;
                }
                if let Some(number) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<u64>().ok())
                {
                    numbers.push(number);
                }
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn assign_number(&self, repo: &str) -> Result<u64, TicketError> {
        let counter_path = self.repo_dir(repo).join(COUNTER_FILE);
        if let Some(parent) = counter_path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let _guard = FileLock::acquire(&counter_path.with_extension("lock"), LOCK_WAIT)?;

        let next = Self::read_counter(&counter_path)? + 1;
        Self::write_atomic(&counter_path, next.to_string().as_bytes())?;

        // touch an empty journal to hold the number's place
        let journal = self.journal_file(repo, next);
        let dir = journal.parent().expect("journal path has a parent");
        fs::create_dir_all(dir).map_err(io_err)?;
        File::create(&journal).map_err(io_err)?;

        Ok(next)
    }

    fn reserve_number(&self, repo: &str, number: u64) -> Result<(), TicketError> {
        if number == 0 {
            return Err(TicketError::InvalidChange(
                "ticket numbers start at 1".into(),
            ));
        }
        let counter_path = self.repo_dir(repo).join(COUNTER_FILE);
        if let Some(parent) = counter_path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let _guard = FileLock::acquire(&counter_path.with_extension("lock"), LOCK_WAIT)?;

        // numbers at or below the counter were allocated before, even if
        // their ticket has since been deleted; never resurrect one
        let current = Self::read_counter(&counter_path)?;
        if number <= current || self.has_ticket(repo, number) {
            return Err(TicketError::InvalidChange(format!(
                "ticket number {number} was already allocated"
            )));
        }
        Self::write_atomic(&counter_path, number.to_string().as_bytes())?;

        let journal = self.journal_file(repo, number);
        let dir = journal.parent().expect("journal path has a parent");
        fs::create_dir_all(dir).map_err(io_err)?;
        File::create(&journal).map_err(io_err)?;
        Ok(())
    }

    fn delete_ticket(&self, repo: &str, number: u64) -> Result<bool, TicketError> {
        let path = self.journal_file(repo, number);
        if !path.exists() {
            return Ok(false);
        }
        let dir = path.parent().expect("journal path has a parent");
        fs::remove_dir_all(dir).map_err(io_err)?;
        Ok(true)
    }

    fn delete_all(&self, repo: &str) -> Result<(), TicketError> {
        let dir = self.repo_dir(repo);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(io_err)?;
        }
        Ok(())
    }

    fn milestones(&self, repo: &str) -> Result<Vec<Milestone>, TicketError> {
        Self::read_records(&self.records_path(repo, store::MILESTONES_PATH))
    }

    fn put_milestone(&self, repo: &str, milestone: &Milestone) -> Result<(), TicketError> {
        let path = self.records_path(repo, store::MILESTONES_PATH);
        self.with_records_lock(repo, || {
            let mut records: Vec<Milestone> = Self::read_records(&path)?;
            store::upsert_by_name(&mut records, milestone.clone(), |m| &m.name);
            Self::write_records(&path, &records)
        })
    }

    fn remove_milestone(&self, repo: &str, name: &str) -> Result<bool, TicketError> {
        let path = self.records_path(repo, store::MILESTONES_PATH);
        self.with_records_lock(repo, || {
            let mut records: Vec<Milestone> = Self::read_records(&path)?;
            let before = records.len();
            records.retain(|m| m.name != name);
            Self::write_records(&path, &records)?;
            Ok(records.len() != before)
        })
    }

    fn labels(&self, repo: &str) -> Result<Vec<Label>, TicketError> {
        Self::read_records(&self.records_path(repo, store::LABELS_PATH))
    }

    fn put_label(&self, repo: &str, label: &Label) -> Result<(), TicketError> {
        let path = self.records_path(repo, store::LABELS_PATH);
        self.with_records_lock(repo, || {
            let mut records: Vec<Label> = Self::read_records(&path)?;
            store::upsert_by_name(&mut records, label.clone(), |l| &l.name);
            Self::write_records(&path, &records)
        })
    }

    fn remove_label(&self, repo: &str, name: &str) -> Result<bool, TicketError> {
        let path = self.records_path(repo, store::LABELS_PATH);
        self.with_records_lock(repo, || {
            let mut records: Vec<Label> = Self::read_records(&path)?;
            let before = records.len();
            records.retain(|l| l.name != name);
            Self::write_records(&path, &records)?;
            Ok(records.len() != before)
        })
    }
}

/// RAII advisory lock with a bounded wait.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self, TicketError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        let start = Instant::now();
        loop {
            if file.try_lock_exclusive().is_ok() {
                return Ok(Self { file });
            }
            if start.elapsed() >= timeout {
                return Err(TicketError::BackendUnavailable(format!(
                    "lock timed out after {timeout:?} at {}",
                    path.display()
                )));
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn io_err(err: std::io::Error) -> TicketError {
    TicketError::BackendUnavailable(err.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Field, materialize};
    use std::sync::Arc;

    const REPO: &str = "gb-tickets.git";

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("open store");
        (dir, store)
    }

    fn titled(author: &str, title: &str) -> Change {
        let mut change = Change::new(author);
        change.set_field(Field::Title, title);
        change
    }

    #[test]
    fn append_creates_and_extends_journal() {
        let (_dir, store) = store();
        let number = store.assign_number(REPO).unwrap();
        assert_eq!(number, 1);

        let v1 = store.append(REPO, number, 0, &titled("alice", "one")).unwrap();
        assert_eq!(v1, 1);
        let v2 = store
            .append(REPO, number, 1, &titled("bob", "two"))
            .unwrap();
        assert_eq!(v2, 2);

        let journal = store.journal(REPO, number).unwrap();
        assert_eq!(journal.len(), 2);
        let ticket = materialize(REPO, number, &journal).unwrap();
        assert_eq!(ticket.title, "two");
    }

    #[test]
    fn stale_version_is_rejected() {
        let (_dir, store) = store();
        let number = store.assign_number(REPO).unwrap();
        store.append(REPO, number, 0, &titled("alice", "one")).unwrap();

        let err = store
            .append(REPO, number, 0, &titled("bob", "racing"))
            .unwrap_err();
        assert!(matches!(
            err,
            TicketError::VersionConflict {
                expected: 0,
                actual: 1
            }
        ));
        assert_eq!(store.version(REPO, number).unwrap(), 1);
    }

    #[test]
    fn numbers_are_sequential_from_one() {
        let (_dir, store) = store();
        assert_eq!(store.assign_number(REPO).unwrap(), 1);
        assert_eq!(store.assign_number(REPO).unwrap(), 2);
        assert_eq!(store.assign_number(REPO).unwrap(), 3);
        assert_eq!(store.ticket_numbers(REPO).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_allocation_yields_distinct_numbers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileStore::open(dir.path()).expect("open store"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                (0..4)
                    .map(|_| store.assign_number(REPO).unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread"))
            .collect();
        all.sort_unstable();
        let expected: Vec<u64> = (1..=32).collect();
        assert_eq!(all, expected, "no gaps, no duplicates");
    }

    #[test]
    fn reserved_number_advances_the_counter() {
        let (_dir, store) = store();
        store.reserve_number(REPO, 10).unwrap();
        assert!(store.has_ticket(REPO, 10));
        assert_eq!(store.assign_number(REPO).unwrap(), 11);

        let err = store.reserve_number(REPO, 10).unwrap_err();
        assert!(matches!(err, TicketError::InvalidChange(_)));
    }

    #[test]
    fn reserved_ticket_has_empty_journal() {
        let (_dir, store) = store();
        let number = store.assign_number(REPO).unwrap();
        assert!(store.has_ticket(REPO, number));
        assert!(store.journal(REPO, number).unwrap().is_empty());
        assert_eq!(store.version(REPO, number).unwrap(), 0);
    }

    #[test]
    fn missing_ticket_is_not_found() {
        let (_dir, store) = store();
        assert!(!store.has_ticket(REPO, 99));
        assert!(matches!(
            store.journal(REPO, 99),
            Err(TicketError::NotFound { .. })
        ));
        assert!(matches!(
            store.append(REPO, 99, 2, &titled("alice", "x")),
            Err(TicketError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_ticket_and_delete_all() {
        let (_dir, store) = store();
        let number = store.assign_number(REPO).unwrap();
        store.append(REPO, number, 0, &titled("alice", "gone soon")).unwrap();

        assert!(store.delete_ticket(REPO, number).unwrap());
        assert!(!store.has_ticket(REPO, number));
        assert!(!store.delete_ticket(REPO, number).unwrap());

        store.assign_number(REPO).unwrap();
        store.delete_all(REPO).unwrap();
        assert!(store.ticket_numbers(REPO).unwrap().is_empty());
    }

    #[test]
    fn deleted_numbers_are_never_reissued() {
        let (_dir, store) = store();
        let number = store.assign_number(REPO).unwrap();
        store.append(REPO, number, 0, &titled("alice", "gone")).unwrap();
        assert!(store.delete_ticket(REPO, number).unwrap());

        assert!(store.reserve_number(REPO, number).is_err());
        assert_eq!(store.assign_number(REPO).unwrap(), number + 1);
    }

    #[test]
    fn milestone_and_label_records_roundtrip() {
        let (_dir, store) = store();

        store.put_milestone(REPO, &Milestone::new("M1")).unwrap();
        store.put_milestone(REPO, &Milestone::new("M2")).unwrap();
        let mut m1 = Milestone::new("M1");
        m1.status = keel_core::Status::Resolved;
        store.put_milestone(REPO, &m1).unwrap();

        let milestones = store.milestones(REPO).unwrap();
        assert_eq!(milestones.len(), 2);
        assert_eq!(milestones[0].status, keel_core::Status::Resolved);

        assert!(store.remove_milestone(REPO, "M2").unwrap());
        assert!(!store.remove_milestone(REPO, "M2").unwrap());

        store.put_label(REPO, &Label::new("helpdesk")).unwrap();
        assert_eq!(store.labels(REPO).unwrap().len(), 1);
        assert!(store.remove_label(REPO, "helpdesk").unwrap());
        assert!(store.labels(REPO).unwrap().is_empty());
    }
}
