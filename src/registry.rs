//! Instance registry
//!
//! Durable SQLite-backed mapping of active instances and their proxy
//! records; the single source of truth for "what should currently be
//! routable". Mutations are serialized per instance id (single-writer
//! discipline) via a lock table; reads go straight to the connection and
//! see committed state only.
//!
//! State changes are fanned out on a broadcast channel so the terminal
//! bridge can cancel sessions the moment their instance leaves `running`.

use crate::error::{InstancerError, Result};
use crate::instance::{Instance, InstanceState, ProxyRecord};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    instance_id TEXT PRIMARY KEY,
    challenge_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    container_id TEXT NOT NULL,
    challenge_slug TEXT NOT NULL,
    hostname TEXT NOT NULL,
    internal_address TEXT,
    state TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    last_seen_event_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_instances_owner ON instances(challenge_id, owner_id);
CREATE INDEX IF NOT EXISTS idx_instances_container ON instances(container_id);
CREATE INDEX IF NOT EXISTS idx_instances_expires ON instances(expires_at);
CREATE INDEX IF NOT EXISTS idx_instances_hostname ON instances(hostname);

CREATE TABLE IF NOT EXISTS proxy_records (
    hostname TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL,
    target_address TEXT NOT NULL,
    config_path TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_routes_instance ON proxy_records(instance_id);
"#;

/// Broadcast on every transition and removal.
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub instance_id: String,
    pub container_id: String,
    pub state: InstanceState,
}

pub struct Registry {
    conn: Arc<Mutex<Connection>>,
    /// Per-instance writer locks. Compound mutations hold the id lock for
    /// their whole duration, which is what gives strict per-id ordering.
    id_locks: DashMap<String, Arc<Mutex<()>>>,
    events: broadcast::Sender<InstanceEvent>,
}

impl Registry {
    /// Open (or create) the registry at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!("Instance registry opened at {:?}", path);
        Ok(Self::from_conn(conn))
    }

    /// In-memory registry (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_conn(conn))
    }

    fn from_conn(conn: Connection) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            conn: Arc::new(Mutex::new(conn)),
            id_locks: DashMap::new(),
            events,
        }
    }

    fn id_lock(&self, instance_id: &str) -> Arc<Mutex<()>> {
        self.id_locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Subscribe to instance state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, instance_id: &str, container_id: &str, state: InstanceState) {
        let _ = self.events.send(InstanceEvent {
            instance_id: instance_id.to_string(),
            container_id: container_id.to_string(),
            state,
        });
    }

    // ========================================================================
    // INSTANCES
    // ========================================================================

    /// Insert or update an instance row.
    ///
    /// The hostname collision guard runs atomically with the insert, under
    /// both the per-id lock and the connection lock: if the hostname is
    /// already claimed by a different live instance, or is still enabled in
    /// a proxy record, the call fails with `HostnameConflict` and the
    /// existing rows are untouched.
    pub fn upsert_instance(&self, inst: &Instance) -> Result<()> {
        let lock = self.id_lock(&inst.instance_id);
        let _guard = lock.lock();
        let conn = self.conn.lock();

        let holder: Option<String> = conn
            .query_row(
                "SELECT instance_id FROM instances
                 WHERE hostname = ?1 AND instance_id != ?2
                   AND state IN ('pending', 'running')",
                params![inst.hostname, inst.instance_id],
                |row| row.get(0),
            )
            .optional()?;
        let route_holder: Option<String> = conn
            .query_row(
                "SELECT instance_id FROM proxy_records
                 WHERE hostname = ?1 AND instance_id != ?2 AND enabled = 1",
                params![inst.hostname, inst.instance_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(holder) = holder.or(route_holder) {
            return Err(InstancerError::HostnameConflict {
                hostname: inst.hostname.clone(),
                holder,
            });
        }

        conn.execute(
            "INSERT INTO instances
                (instance_id, challenge_id, owner_id, container_id, challenge_slug,
                 hostname, internal_address, state, created_at, expires_at, last_seen_event_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(instance_id) DO UPDATE SET
                container_id = excluded.container_id,
                internal_address = excluded.internal_address,
                expires_at = excluded.expires_at,
                last_seen_event_at = excluded.last_seen_event_at",
            params![
                inst.instance_id,
                inst.challenge_id,
                inst.owner_id,
                inst.container_id,
                inst.challenge_slug,
                inst.hostname,
                inst.internal_address,
                inst.state.as_str(),
                inst.created_at.timestamp_millis(),
                inst.expires_at.timestamp_millis(),
                inst.last_seen_event_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    /// Move an instance along the state graph, failing with
    /// `InvalidTransition` on edges outside it.
    pub fn transition(&self, instance_id: &str, to: InstanceState) -> Result<Instance> {
        let lock = self.id_lock(instance_id);
        let _guard = lock.lock();

        let mut inst = {
            let conn = self.conn.lock();
            Self::get_with_conn(&conn, instance_id)?
                .ok_or_else(|| InstancerError::UnknownInstance(instance_id.to_string()))?
        };
        inst.transition_to(to)?;
        inst.last_seen_event_at = Some(Utc::now());

        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE instances SET state = ?1, last_seen_event_at = ?2 WHERE instance_id = ?3",
                params![
                    inst.state.as_str(),
                    inst.last_seen_event_at.map(|t| t.timestamp_millis()),
                    instance_id
                ],
            )?;
        }

        debug!("Instance {} -> {}", instance_id, to);
        self.emit(instance_id, &inst.container_id, to);
        Ok(inst)
    }

    pub fn get(&self, instance_id: &str) -> Result<Option<Instance>> {
        let conn = self.conn.lock();
        Self::get_with_conn(&conn, instance_id)
    }

    fn get_with_conn(conn: &Connection, instance_id: &str) -> Result<Option<Instance>> {
        Ok(conn
            .query_row(
                &format!("{} WHERE instance_id = ?1", SELECT_INSTANCE),
                params![instance_id],
                row_to_instance,
            )
            .optional()?)
    }

    pub fn get_by_hostname(&self, hostname: &str) -> Result<Option<Instance>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("{} WHERE hostname = ?1", SELECT_INSTANCE),
                params![hostname],
                row_to_instance,
            )
            .optional()?)
    }

    pub fn get_by_container(&self, container_id: &str) -> Result<Option<Instance>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("{} WHERE container_id = ?1", SELECT_INSTANCE),
                params![container_id],
                row_to_instance,
            )
            .optional()?)
    }

    /// Live instance holding the one-per-owner slot, if any.
    pub fn find_active(&self, challenge_id: &str, owner_id: &str) -> Result<Option<Instance>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!(
                    "{} WHERE challenge_id = ?1 AND owner_id = ?2
                         AND state IN ('pending', 'running')",
                    SELECT_INSTANCE
                ),
                params![challenge_id, owner_id],
                row_to_instance,
            )
            .optional()?)
    }

    /// Live instances whose TTL has elapsed. Feed for the expiry sweep.
    pub fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Instance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE expires_at < ?1 AND state IN ('pending', 'running')
                 ORDER BY expires_at ASC",
            SELECT_INSTANCE
        ))?;
        let rows = stmt.query_map(params![now.timestamp_millis()], row_to_instance)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn list_all(&self) -> Result<Vec<Instance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY created_at ASC", SELECT_INSTANCE))?;
        let rows = stmt.query_map([], row_to_instance)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Purge an instance row. Refused while a proxy record for the instance
    /// is still enabled: retraction must be confirmed first.
    pub fn remove(&self, instance_id: &str) -> Result<()> {
        let lock = self.id_lock(instance_id);
        let _guard = lock.lock();

        let container_id = {
            let conn = self.conn.lock();
            let enabled_route: Option<String> = conn
                .query_row(
                    "SELECT hostname FROM proxy_records WHERE instance_id = ?1 AND enabled = 1",
                    params![instance_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(hostname) = enabled_route {
                return Err(InstancerError::RouteActive { hostname });
            }

            let inst = Self::get_with_conn(&conn, instance_id)?;
            conn.execute(
                "DELETE FROM proxy_records WHERE instance_id = ?1",
                params![instance_id],
            )?;
            conn.execute(
                "DELETE FROM instances WHERE instance_id = ?1",
                params![instance_id],
            )?;
            inst.map(|i| i.container_id)
        };

        self.id_locks.remove(instance_id);
        if let Some(container_id) = container_id {
            debug!("Instance {} purged from registry", instance_id);
            self.emit(instance_id, &container_id, InstanceState::Stopped);
        }
        Ok(())
    }

    // ========================================================================
    // PROXY RECORDS
    // ========================================================================

    /// Record a published (enabled) route for an instance.
    pub fn put_route(&self, record: &ProxyRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO proxy_records
                (hostname, instance_id, target_address, config_path, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.hostname,
                record.instance_id,
                record.target_address,
                record.config_path.to_string_lossy(),
                record.enabled as i32,
            ],
        )?;
        Ok(())
    }

    pub fn get_route(&self, hostname: &str) -> Result<Option<ProxyRecord>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT hostname, instance_id, target_address, config_path, enabled
                 FROM proxy_records WHERE hostname = ?1",
                params![hostname],
                row_to_route,
            )
            .optional()?)
    }

    /// Drop the route record after its files are confirmed gone.
    pub fn delete_route(&self, hostname: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM proxy_records WHERE hostname = ?1",
            params![hostname],
        )?;
        Ok(())
    }

    pub fn list_routes(&self) -> Result<Vec<ProxyRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT hostname, instance_id, target_address, config_path, enabled
             FROM proxy_records ORDER BY hostname ASC",
        )?;
        let rows = stmt.query_map([], row_to_route)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

const SELECT_INSTANCE: &str = "SELECT instance_id, challenge_id, owner_id, container_id,
        challenge_slug, hostname, internal_address, state, created_at, expires_at,
        last_seen_event_at FROM instances";

// Timestamps are stored as unix epoch milliseconds so sub-second TTLs
// survive the round trip through SQLite.
fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<Instance> {
    let state: String = row.get(7)?;
    let created_at: i64 = row.get(8)?;
    let expires_at: i64 = row.get(9)?;
    let last_seen: Option<i64> = row.get(10)?;
    Ok(Instance {
        instance_id: row.get(0)?,
        challenge_id: row.get(1)?,
        owner_id: row.get(2)?,
        container_id: row.get(3)?,
        challenge_slug: row.get(4)?,
        hostname: row.get(5)?,
        internal_address: row.get(6)?,
        state: InstanceState::parse(&state).unwrap_or(InstanceState::Error),
        created_at: Utc
            .timestamp_millis_opt(created_at)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH),
        expires_at: Utc
            .timestamp_millis_opt(expires_at)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH),
        last_seen_event_at: last_seen.and_then(|t| Utc.timestamp_millis_opt(t).single()),
    })
}

fn row_to_route(row: &Row<'_>) -> rusqlite::Result<ProxyRecord> {
    let config_path: String = row.get(3)?;
    let enabled: i32 = row.get(4)?;
    Ok(ProxyRecord {
        hostname: row.get(0)?,
        instance_id: row.get(1)?,
        target_address: row.get(2)?,
        config_path: PathBuf::from(config_path),
        enabled: enabled != 0,
    })
}
