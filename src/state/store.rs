//! Durable per-project workflow state on SQLite.
//!
//! One database per project under `.quorum/state/`. The store owns four
//! tables: the workflow records themselves (a JSON payload column plus the
//! columns needed for ordering and terminal-status checks), the single-slot
//! active pointer, the running-workflows registry with heartbeats, and the
//! advisory workflow locks with TTL. Lock acquisition is a compare-and-set
//! inside a transaction, so expired locks are reclaimed in the same atomic
//! step that takes them over.
//!
//! Transient SQLite contention (`database is locked`) is retried internally
//! with bounded exponential backoff; everything else propagates as
//! [`QuorumError::Io`].

use super::workflow::{WorkflowState, WorkflowSummary};
use crate::errors::{QuorumError, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Highest schema version this build understands.
const SCHEMA_VERSION: i64 = 1;

const BUSY_RETRY_LIMIT: u32 = 4;
const BUSY_RETRY_BASE: Duration = Duration::from_millis(10);

/// A running-workflows registry row.
#[derive(Debug, Clone)]
pub struct RunningWorkflow {
    pub workflow_id: String,
    pub heartbeat_at: DateTime<Utc>,
}

/// Handle to one project's state database. Cheap to clone; clones share the
/// connection and the lock-holder identity.
#[derive(Clone, Debug)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    holder: String,
}

impl StateStore {
    /// Open (or create) the state database inside `state_dir` and run
    /// migrations. Refuses databases written by a newer schema.
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| QuorumError::Io(format!("create {}: {e}", state_dir.display())))?;
        let path = state_dir.join("state.db");
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        migrate(&conn)?;
        let nonce = Uuid::new_v4().simple().to_string();
        let holder = format!("{}:{}", std::process::id(), &nonce[..8]);
        debug!(path = %path.display(), %holder, "state store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            holder,
        })
    }

    /// The lock-holder identity this store instance uses.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------
    // Workflow records
    // ------------------------------------------------------------------

    /// Persist a workflow atomically. Stamps `updated_at`. Fails with
    /// `<Conflict>` when the stored copy is already terminal.
    pub fn save(&self, wf: &mut WorkflowState) -> Result<()> {
        self.with_retry(|| {
            let mut conn = self.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            wf.updated_at = Utc::now();
            save_in(&tx, wf)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn load(&self, id: &str) -> Result<Option<WorkflowState>> {
        self.with_retry(|| {
            let conn = self.lock();
            load_in(&conn, id)
        })
    }

    /// Load the workflow the active pointer names, if any.
    pub fn load_active(&self) -> Result<Option<WorkflowState>> {
        match self.get_active()? {
            Some(id) => self.load(&id),
            None => Ok(None),
        }
    }

    /// Summaries sorted by creation time, most recent first.
    pub fn list(&self) -> Result<Vec<WorkflowSummary>> {
        self.with_retry(|| {
            let conn = self.lock();
            let mut stmt =
                conn.prepare("SELECT payload FROM workflows ORDER BY created_ms DESC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut summaries = Vec::new();
            for payload in rows {
                let wf: WorkflowState = serde_json::from_str(&payload?)?;
                summaries.push(wf.summary());
            }
            Ok(summaries)
        })
    }

    /// Remove a workflow that is not running. Deleting an unknown id is a
    /// no-op; deleting a running workflow fails with `<Conflict>`.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.with_retry(|| {
            let mut conn = self.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let running: Option<String> = tx
                .query_row(
                    "SELECT workflow_id FROM running_workflows WHERE workflow_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if running.is_some() {
                return Err(QuorumError::Conflict {
                    workflow_id: id.to_string(),
                    status: "running".to_string(),
                });
            }
            tx.execute("DELETE FROM workflows WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM workflow_locks WHERE workflow_id = ?1", params![id])?;
            tx.execute(
                "DELETE FROM active_workflow WHERE workflow_id = ?1",
                params![id],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// The single exception to terminal immutability: an explicit resume may
    /// reopen a `failed` workflow (the zombie-reclaim recovery path).
    /// Completed and cancelled workflows stay final. Returns the reopened
    /// record with status `paused` and the error cleared; a non-terminal
    /// workflow is returned unchanged.
    pub fn reopen(&self, id: &str) -> Result<WorkflowState> {
        self.with_retry(|| {
            let mut conn = self.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut wf = load_in(&tx, id)?.ok_or_else(|| {
                QuorumError::InvalidArgument(format!("unknown workflow {id}"))
            })?;
            match wf.status {
                crate::state::WorkflowStatus::Failed => {
                    wf.status = crate::state::WorkflowStatus::Paused;
                    wf.error = None;
                    wf.completed_at = None;
                    wf.updated_at = Utc::now();
                    upsert_raw(&tx, &wf)?;
                    tx.commit()?;
                    Ok(wf)
                }
                status if status.is_terminal() => Err(QuorumError::Conflict {
                    workflow_id: id.to_string(),
                    status: status.to_string(),
                }),
                _ => Ok(wf),
            }
        })
    }

    // ------------------------------------------------------------------
    // Active pointer (a view, never a lock)
    // ------------------------------------------------------------------

    pub fn set_active(&self, id: &str) -> Result<()> {
        self.with_retry(|| {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO active_workflow (slot, workflow_id) VALUES (0, ?1)
                 ON CONFLICT(slot) DO UPDATE SET workflow_id = excluded.workflow_id",
                params![id],
            )?;
            Ok(())
        })
    }

    pub fn get_active(&self) -> Result<Option<String>> {
        self.with_retry(|| {
            let conn = self.lock();
            Ok(conn
                .query_row(
                    "SELECT workflow_id FROM active_workflow WHERE slot = 0",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn clear_active(&self) -> Result<()> {
        self.with_retry(|| {
            let conn = self.lock();
            conn.execute("DELETE FROM active_workflow WHERE slot = 0", [])?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Advisory workflow locks
    // ------------------------------------------------------------------

    /// Compare-and-set acquisition: succeeds when the slot is free, expired,
    /// or already held by this store instance. An expired lock is reclaimed
    /// in the same atomic step.
    pub fn acquire_lock(&self, id: &str, ttl: Duration) -> Result<()> {
        self.with_retry(|| {
            let mut conn = self.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now().timestamp_millis();
            let existing: Option<(String, i64)> = tx
                .query_row(
                    "SELECT holder, expires_ms FROM workflow_locks WHERE workflow_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((holder, expires_ms)) = existing {
                if holder != self.holder && expires_ms > now {
                    return Err(QuorumError::Locked {
                        workflow_id: id.to_string(),
                        holder,
                    });
                }
                if holder != self.holder {
                    warn!(workflow_id = id, previous = %holder, "reclaiming expired lock");
                }
            }
            let expires = now + ttl.as_millis() as i64;
            tx.execute(
                "INSERT INTO workflow_locks (workflow_id, holder, expires_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(workflow_id) DO UPDATE
                 SET holder = excluded.holder, expires_ms = excluded.expires_ms",
                params![id, self.holder, expires],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Extend a lock this instance holds by `ttl` from now.
    pub fn refresh_lock(&self, id: &str, ttl: Duration) -> Result<()> {
        self.with_retry(|| {
            let conn = self.lock();
            let expires = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
            let updated = conn.execute(
                "UPDATE workflow_locks SET expires_ms = ?1
                 WHERE workflow_id = ?2 AND holder = ?3",
                params![expires, id, self.holder],
            )?;
            if updated == 0 {
                let holder: Option<String> = conn
                    .query_row(
                        "SELECT holder FROM workflow_locks WHERE workflow_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(QuorumError::Locked {
                    workflow_id: id.to_string(),
                    holder: holder.unwrap_or_else(|| "none".to_string()),
                });
            }
            Ok(())
        })
    }

    /// Release a lock this instance holds. Releasing a lock that is absent
    /// or held elsewhere is a no-op.
    pub fn release_lock(&self, id: &str) -> Result<()> {
        self.with_retry(|| {
            let conn = self.lock();
            conn.execute(
                "DELETE FROM workflow_locks WHERE workflow_id = ?1 AND holder = ?2",
                params![id, self.holder],
            )?;
            Ok(())
        })
    }

    /// Unconditional release, used by the sweeper when reclaiming zombies.
    pub fn force_release_lock(&self, id: &str) -> Result<()> {
        self.with_retry(|| {
            let conn = self.lock();
            conn.execute(
                "DELETE FROM workflow_locks WHERE workflow_id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }

    /// Current holder and expiry of a lock, if present.
    pub fn lock_state(&self, id: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        self.with_retry(|| {
            let conn = self.lock();
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT holder, expires_ms FROM workflow_locks WHERE workflow_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row.map(|(holder, ms)| (holder, millis_to_utc(ms))))
        })
    }

    // ------------------------------------------------------------------
    // Running-workflows registry
    // ------------------------------------------------------------------

    pub fn mark_running(&self, id: &str) -> Result<()> {
        self.with_retry(|| {
            let conn = self.lock();
            mark_running_in(&conn, id)
        })
    }

    pub fn unmark_running(&self, id: &str) -> Result<()> {
        self.with_retry(|| {
            let conn = self.lock();
            unmark_running_in(&conn, id)
        })
    }

    pub fn list_running(&self) -> Result<Vec<RunningWorkflow>> {
        self.with_retry(|| {
            let conn = self.lock();
            list_running_in(&conn)
        })
    }

    pub fn update_heartbeat(&self, id: &str) -> Result<()> {
        self.with_retry(|| {
            let conn = self.lock();
            update_heartbeat_in(&conn, id)
        })
    }

    /// Running workflows whose heartbeat is older than `threshold`.
    pub fn find_zombies(&self, threshold: Duration) -> Result<Vec<String>> {
        self.with_retry(|| {
            let conn = self.lock();
            let cutoff = Utc::now().timestamp_millis() - threshold.as_millis() as i64;
            let mut stmt = conn.prepare(
                "SELECT workflow_id FROM running_workflows WHERE heartbeat_ms < ?1",
            )?;
            let ids = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    // ------------------------------------------------------------------
    // Transactions and snapshots
    // ------------------------------------------------------------------

    /// Run `f` inside one transaction: all reads and writes observe a
    /// consistent snapshot, and any error rolls the whole thing back.
    pub fn execute_atomically<T>(&self, f: impl FnOnce(&mut StoreTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut stx = StoreTx { conn: &tx };
        match f(&mut stx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => Err(err), // tx dropped -> rollback
        }
    }

    /// Write a consistent snapshot of the database to `dest`.
    pub fn backup(&self, dest: &Path) -> Result<()> {
        let conn = self.lock();
        let mut dst = Connection::open(dest)?;
        let bk = rusqlite::backup::Backup::new(&conn, &mut dst)?;
        bk.run_to_completion(64, Duration::from_millis(25), None)?;
        Ok(())
    }

    /// Replace the database contents from a snapshot produced by
    /// [`StateStore::backup`].
    pub fn restore(&self, src: &Path) -> Result<()> {
        if !src.exists() {
            return Err(QuorumError::Io(format!(
                "backup file {} does not exist",
                src.display()
            )));
        }
        let source = Connection::open(src)?;
        let mut conn = self.lock();
        let bk = rusqlite::backup::Backup::new(&source, &mut conn)?;
        bk.run_to_completion(64, Duration::from_millis(25), None)?;
        drop(bk);
        migrate(&conn)?;
        Ok(())
    }

    // ------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the connection does not corrupt SQLite state.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_retry<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = BUSY_RETRY_BASE;
        let mut attempt = 0;
        loop {
            match op() {
                Err(err) if err.is_transient_io() && attempt < BUSY_RETRY_LIMIT => {
                    attempt += 1;
                    debug!(attempt, "state store busy, retrying");
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                other => return other,
            }
        }
    }
}

/// Transactional view handed to `execute_atomically` closures.
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl StoreTx<'_> {
    pub fn load(&self, id: &str) -> Result<Option<WorkflowState>> {
        load_in(self.conn, id)
    }

    pub fn save(&mut self, wf: &mut WorkflowState) -> Result<()> {
        wf.updated_at = Utc::now();
        save_in(self.conn, wf)
    }

    pub fn mark_running(&mut self, id: &str) -> Result<()> {
        mark_running_in(self.conn, id)
    }

    pub fn unmark_running(&mut self, id: &str) -> Result<()> {
        unmark_running_in(self.conn, id)
    }

    pub fn update_heartbeat(&mut self, id: &str) -> Result<()> {
        update_heartbeat_in(self.conn, id)
    }

    pub fn list_running(&self) -> Result<Vec<RunningWorkflow>> {
        list_running_in(self.conn)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if found > SCHEMA_VERSION {
        return Err(QuorumError::Incompatible {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    if found < SCHEMA_VERSION {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workflows (
                 id          TEXT PRIMARY KEY,
                 status      TEXT NOT NULL,
                 phase       TEXT NOT NULL,
                 created_ms  INTEGER NOT NULL,
                 updated_ms  INTEGER NOT NULL,
                 payload     TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS active_workflow (
                 slot        INTEGER PRIMARY KEY CHECK (slot = 0),
                 workflow_id TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS running_workflows (
                 workflow_id  TEXT PRIMARY KEY,
                 heartbeat_ms INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS workflow_locks (
                 workflow_id TEXT PRIMARY KEY,
                 holder      TEXT NOT NULL,
                 expires_ms  INTEGER NOT NULL
             );",
        )?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
    }
    Ok(())
}

fn save_in(conn: &Connection, wf: &WorkflowState) -> Result<()> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT status FROM workflows WHERE id = ?1",
            params![wf.id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(status) = stored {
        if matches!(status.as_str(), "completed" | "failed" | "cancelled") {
            return Err(QuorumError::Conflict {
                workflow_id: wf.id.clone(),
                status,
            });
        }
    }
    upsert_raw(conn, wf)
}

fn upsert_raw(conn: &Connection, wf: &WorkflowState) -> Result<()> {
    let payload = serde_json::to_string(wf)?;
    conn.execute(
        "INSERT INTO workflows (id, status, phase, created_ms, updated_ms, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             phase = excluded.phase,
             updated_ms = excluded.updated_ms,
             payload = excluded.payload",
        params![
            wf.id,
            wf.status.as_str(),
            wf.current_phase.as_str(),
            wf.created_at.timestamp_millis(),
            wf.updated_at.timestamp_millis(),
            payload
        ],
    )?;
    Ok(())
}

fn load_in(conn: &Connection, id: &str) -> Result<Option<WorkflowState>> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload FROM workflows WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match payload {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

fn mark_running_in(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO running_workflows (workflow_id, heartbeat_ms) VALUES (?1, ?2)
         ON CONFLICT(workflow_id) DO UPDATE SET heartbeat_ms = excluded.heartbeat_ms",
        params![id, Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

fn unmark_running_in(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM running_workflows WHERE workflow_id = ?1",
        params![id],
    )?;
    Ok(())
}

fn update_heartbeat_in(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE running_workflows SET heartbeat_ms = ?1 WHERE workflow_id = ?2",
        params![Utc::now().timestamp_millis(), id],
    )?;
    Ok(())
}

fn list_running_in(conn: &Connection) -> Result<Vec<RunningWorkflow>> {
    let mut stmt =
        conn.prepare("SELECT workflow_id, heartbeat_ms FROM running_workflows")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut running = Vec::new();
    for row in rows {
        let (workflow_id, ms) = row?;
        running.push(RunningWorkflow {
            workflow_id,
            heartbeat_at: millis_to_utc(ms),
        });
    }
    Ok(running)
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
