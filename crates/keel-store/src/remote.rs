//! Remote key-value backend (Redis).
//!
//! Each journal is a Redis list with one serialized change per entry; the
//! compare-and-swap is a `WATCH`/`MULTI`/`EXEC` transaction on the journal
//! key, the allocator is `INCR` on a per-repository counter, and the set
//! of assigned numbers is tracked explicitly so reserved-but-unwritten
//! tickets exist like they do on the other backends. Connections carry
//! read and write timeouts; a timeout surfaces as a retryable
//! [`TicketError::BackendUnavailable`], never as a partial write.

use crate::store::{TicketStore, upsert_by_name};
use keel_core::{Change, Label, Milestone, TicketError, journal};
use redis::{Commands, Connection};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How many `WATCH` rounds to absorb before reporting contention.
const WATCH_ROUNDS: usize = 8;

/// Ticket storage in a remote Redis service.
pub struct RedisStore {
    client: redis::Client,
    timeout: Duration,
}

impl RedisStore {
    /// Connect lazily to `url` (e.g. `redis://localhost:6379/1`).
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] for an unparseable URL.
    pub fn open(url: &str) -> Result<Self, TicketError> {
        Self::open_with_timeout(url, DEFAULT_TIMEOUT)
    }

    /// Connect lazily with an explicit per-operation timeout.
    ///
    /// # Errors
    ///
    /// [`TicketError::BackendUnavailable`] for an unparseable URL.
    pub fn open_with_timeout(url: &str, timeout: Duration) -> Result<Self, TicketError> {
        let client = redis::Client::open(url).map_err(redis_err)?;
        Ok(Self { client, timeout })
    }

    fn connect(&self) -> Result<Connection, TicketError> {
        let con = self.client.get_connection().map_err(redis_err)?;
        con.set_read_timeout(Some(self.timeout)).map_err(redis_err)?;
        con.set_write_timeout(Some(self.timeout)).map_err(redis_err)?;
        Ok(con)
    }

    fn journal_key(repo: &str, number: u64) -> String {
        format!("keel:{repo}:ticket:{number}")
    }

    fn counter_key(repo: &str) -> String {
        format!("keel:{repo}:counter")
    }

    fn numbers_key(repo: &str) -> String {
        format!("keel:{repo}:tickets")
    }

    fn milestones_key(repo: &str) -> String {
        format!("keel:{repo}:milestones")
    }

    fn labels_key(repo: &str) -> String {
        format!("keel:{repo}:labels")
    }

    fn read_record_hash<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Vec<T>, TicketError> {
        let mut con = self.connect()?;
        let raw: HashMap<String, String> = con.hgetall(key).map_err(redis_err)?;
        let mut records = Vec::with_capacity(raw.len());
        for (_, json) in raw {
            records.push(serde_json::from_str(&json)?);
        }
        Ok(records)
    }
}

impl TicketStore for RedisStore {
    fn append(
        &self,
        repo: &str,
        number: u64,
        expected_version: u64,
        change: &Change,
    ) -> Result<u64, TicketError> {
        let key = Self::journal_key(repo, number);
        let numbers = Self::numbers_key(repo);
        let payload = journal::serialize_change(change)?;
        let mut con = self.connect()?;

        for _ in 0..WATCH_ROUNDS {
            redis::cmd("WATCH").arg(&key).exec(&mut con).map_err(redis_err)?;

            let actual: u64 = con.llen(&key).map_err(redis_err)?;
            if actual != expected_version {
                redis::cmd("UNWATCH").exec(&mut con).map_err(redis_err)?;
                if actual == 0 {
                    let assigned: bool = con.sismember(&numbers, number).map_err(redis_err)?;
                    if !assigned {
                        return Err(TicketError::not_found(repo, number));
                    }
                }
                return Err(TicketError::VersionConflict {
                    expected: expected_version,
                    actual,
                });
            }

            let committed: Option<()> = redis::pipe()
                .atomic()
                .rpush(&key, &payload)
                .ignore()
                .sadd(&numbers, number)
                .ignore()
                .query(&mut con)
                .map_err(redis_err)?;
            if committed.is_some() {
                return Ok(actual + 1);
            }
            // the watch fired: someone touched the key; re-check the length
        }

        Err(TicketError::BackendUnavailable(format!(
            "journal contention on {key} persisted past {WATCH_ROUNDS} rounds"
        )))
    }

    fn journal(&self, repo: &str, number: u64) -> Result<Vec<Change>, TicketError> {
        let mut con = self.connect()?;
        let entries: Vec<String> = con
            .lrange(Self::journal_key(repo, number), 0, -1)
            .map_err(redis_err)?;
        if entries.is_empty() {
            let assigned: bool = con
                .sismember(Self::numbers_key(repo), number)
                .map_err(redis_err)?;
            if !assigned {
                return Err(TicketError::not_found(repo, number));
            }
        }
        entries
            .iter()
            .map(|entry| journal::deserialize_change(entry))
            .collect()
    }

    fn version(&self, repo: &str, number: u64) -> Result<u64, TicketError> {
        let mut con = self.connect()?;
        con.llen(Self::journal_key(repo, number)).map_err(redis_err)
    }

    fn has_ticket(&self, repo: &str, number: u64) -> bool {
        self.connect()
            .and_then(|mut con| {
                con.sismember(Self::numbers_key(repo), number)
                    .map_err(redis_err)
            })
            .unwrap_or(false)
    }

    fn ticket_numbers(&self, repo: &str) -> Result<Vec<u64>, TicketError> {
        let mut con = self.connect()?;
        let mut numbers: Vec<u64> = con
            .smembers(Self::numbers_key(repo))
            .map_err(redis_err)?;
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn assign_number(&self, repo: &str) -> Result<u64, TicketError> {
        let mut con = self.connect()?;
        let next: u64 = con.incr(Self::counter_key(repo), 1).map_err(redis_err)?;
        let _: () = con
            .sadd(Self::numbers_key(repo), next)
            .map_err(redis_err)?;
        Ok(next)
    }

    fn reserve_number(&self, repo: &str, number: u64) -> Result<(), TicketError> {
        if number == 0 {
            return Err(TicketError::InvalidChange(
                "ticket numbers start at 1".into(),
            ));
        }
        let counter = Self::counter_key(repo);
        let numbers = Self::numbers_key(repo);
        let mut con = self.connect()?;

        for _ in 0..WATCH_ROUNDS {
            redis::cmd("WATCH")
                .arg(&counter)
                .arg(&numbers)
                .exec(&mut con)
                .map_err(redis_err)?;

            // numbers at or below the counter were allocated before, even
            // if their ticket has since been deleted; never resurrect one
            let taken: bool = con.sismember(&numbers, number).map_err(redis_err)?;
            let current: Option<u64> = con.get(&counter).map_err(redis_err)?;
            if taken || number <= current.unwrap_or(0) {
                redis::cmd("UNWATCH").exec(&mut con).map_err(redis_err)?;
                return Err(TicketError::InvalidChange(format!(
                    "ticket number {number} was already allocated"
                )));
            }

            let committed: Option<()> = redis::pipe()
                .atomic()
                .set(&counter, number)
                .ignore()
                .sadd(&numbers, number)
                .ignore()
                .query(&mut con)
                .map_err(redis_err)?;
            if committed.is_some() {
                return Ok(());
            }
        }

        Err(TicketError::BackendUnavailable(format!(
            "counter contention in {repo} persisted past {WATCH_ROUNDS} rounds"
        )))
    }

    fn delete_ticket(&self, repo: &str, number: u64) -> Result<bool, TicketError> {
        let mut con = self.connect()?;
        let removed: u64 = con
            .srem(Self::numbers_key(repo), number)
            .map_err(redis_err)?;
        let _: () = con
            .del(Self::journal_key(repo, number))
            .map_err(redis_err)?;
        Ok(removed > 0)
    }

    fn delete_all(&self, repo: &str) -> Result<(), TicketError> {
        let mut con = self.connect()?;
        let keys: Vec<String> = con
            .keys(format!("keel:{repo}:*"))
            .map_err(redis_err)?;
        if !keys.is_empty() {
            let _: () = con.del(keys).map_err(redis_err)?;
        }
        Ok(())
    }

    fn milestones(&self, repo: &str) -> Result<Vec<Milestone>, TicketError> {
        let mut records: Vec<Milestone> = self.read_record_hash(&Self::milestones_key(repo))?;
        // hash iteration order is arbitrary; keep listings stable
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn put_milestone(&self, repo: &str, milestone: &Milestone) -> Result<(), TicketError> {
        let mut con = self.connect()?;
        let json = serde_json::to_string(milestone)?;
        let _: () = con
            .hset(Self::milestones_key(repo), &milestone.name, json)
            .map_err(redis_err)?;
        Ok(())
    }

    fn remove_milestone(&self, repo: &str, name: &str) -> Result<bool, TicketError> {
        let mut con = self.connect()?;
        let removed: u64 = con
            .hdel(Self::milestones_key(repo), name)
            .map_err(redis_err)?;
        Ok(removed > 0)
    }

    fn labels(&self, repo: &str) -> Result<Vec<Label>, TicketError> {
        let mut records: Vec<Label> = self.read_record_hash(&Self::labels_key(repo))?;
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn put_label(&self, repo: &str, label: &Label) -> Result<(), TicketError> {
        let mut con = self.connect()?;
        let json = serde_json::to_string(label)?;
        let _: () = con
            .hset(Self::labels_key(repo), &label.name, json)
            .map_err(redis_err)?;
        Ok(())
    }

    fn remove_label(&self, repo: &str, name: &str) -> Result<bool, TicketError> {
        let mut con = self.connect()?;
        let removed: u64 = con
            .hdel(Self::labels_key(repo), name)
            .map_err(redis_err)?;
        Ok(removed > 0)
    }
}

fn redis_err(err: redis::RedisError) -> TicketError {
    TicketError::BackendUnavailable(err.to_string())
}
