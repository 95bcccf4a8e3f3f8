use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use sync_engine::{
    ArchiveOutcome, ArchivedMutation, CanonicalStore, EntityId, EntityKind, EntityVersion,
    MutationRecord, StoreError,
};

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("fieldsync")
}

pub fn default_db_path() -> PathBuf {
    app_data_dir().join("entities.db")
}

/// SQLite-backed canonical store
pub struct EntityDb {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

const VERSION_COLUMNS: &str =
    "entity_id, entity_kind, clock_json, payload_json, conflicts_json, field_writes_json, updated_at";

struct VersionRow {
    entity_id: String,
    entity_kind: String,
    clock_json: String,
    payload_json: String,
    conflicts_json: String,
    field_writes_json: String,
    updated_at: String,
}

impl VersionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_id: row.get(0)?,
            entity_kind: row.get(1)?,
            clock_json: row.get(2)?,
            payload_json: row.get(3)?,
            conflicts_json: row.get(4)?,
            field_writes_json: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn decode(self) -> std::result::Result<EntityVersion, StoreError> {
        let entity = EntityId::new(self.entity_id.as_str());
        let corrupt = |message: String| StoreError::Corrupt {
            entity: entity.clone(),
            message,
        };

        let entity_kind = EntityKind::parse(&self.entity_kind)
            .ok_or_else(|| corrupt(format!("unknown entity kind {:?}", self.entity_kind)))?;
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| corrupt(format!("bad updated_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(EntityVersion {
            entity_id: entity.clone(),
            entity_kind,
            current_clock: serde_json::from_str(&self.clock_json)
                .map_err(|e| corrupt(format!("bad clock: {}", e)))?,
            current_payload: serde_json::from_str(&self.payload_json)
                .map_err(|e| corrupt(format!("bad payload: {}", e)))?,
            pending_conflicts: serde_json::from_str(&self.conflicts_json)
                .map_err(|e| corrupt(format!("bad conflicts: {}", e)))?,
            field_writes: serde_json::from_str(&self.field_writes_json)
                .map_err(|e| corrupt(format!("bad field writes: {}", e)))?,
            updated_at,
        })
    }
}

impl EntityDb {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", &"WAL")?;
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
        conn.pragma_update(None, "foreign_keys", &"ON")?;
        let _ = conn.pragma_update(None, "cache_size", &"-20000"); // ~20MB page cache
        apply_migrations(&conn)?;
        tracing::info!("opened entity store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load_version(&self, entity_id: &str) -> Result<Option<EntityVersion>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM entity_versions WHERE entity_id = ?1 LIMIT 1",
                    VERSION_COLUMNS
                ),
                params![entity_id],
                VersionRow::from_row,
            )
            .optional()?;
        Ok(row.map(VersionRow::decode).transpose()?)
    }

    /// Insert or replace one entity in a single statement
    pub fn save_version(&self, version: &EntityVersion) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO entity_versions(entity_id, entity_kind, clock_json, payload_json, conflicts_json, field_writes_json, contested, deleted, updated_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(entity_id) DO UPDATE SET entity_kind = excluded.entity_kind, clock_json = excluded.clock_json, payload_json = excluded.payload_json, conflicts_json = excluded.conflicts_json, field_writes_json = excluded.field_writes_json, contested = excluded.contested, deleted = excluded.deleted, updated_at = excluded.updated_at",
            params![
                version.entity_id.as_str(),
                version.entity_kind.as_str(),
                serde_json::to_string(&version.current_clock)?,
                serde_json::to_string(&version.current_payload)?,
                serde_json::to_string(&version.pending_conflicts)?,
                serde_json::to_string(&version.field_writes)?,
                !version.pending_conflicts.is_empty(),
                version.is_deleted(),
                version.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_versions(&self) -> Result<Vec<EntityVersion>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entity_versions ORDER BY entity_id",
            VERSION_COLUMNS
        ))?;
        let rows = stmt.query_map([], VersionRow::from_row)?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?.decode()?);
        }
        Ok(versions)
    }

    /// Ids of entities with pending conflicts, without decoding them
    pub fn contested_ids(&self) -> Result<Vec<EntityId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT entity_id FROM entity_versions WHERE contested = 1 ORDER BY entity_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().map(EntityId::new).collect())
    }

    pub fn append_archive(&self, record: &MutationRecord, outcome: ArchiveOutcome) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mutation_archive(mutation_id, entity_id, actor_id, outcome, record_json, archived_at) VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.to_string(),
                record.entity_id.as_str(),
                record.actor_id.as_str(),
                outcome.as_str(),
                serde_json::to_string(record)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_archive(&self, entity_id: &str) -> Result<Vec<ArchivedMutation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT outcome, record_json, archived_at FROM mutation_archive WHERE entity_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut archived = Vec::new();
        for row in rows {
            let (outcome, record_json, archived_at) = row?;
            archived.push(ArchivedMutation {
                outcome: ArchiveOutcome::parse(&outcome)
                    .ok_or_else(|| anyhow!("unknown archive outcome {:?}", outcome))?,
                record: serde_json::from_str(&record_json)?,
                archived_at: DateTime::parse_from_rfc3339(&archived_at)?.with_timezone(&Utc),
            });
        }
        Ok(archived)
    }

    pub fn archive_len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM mutation_archive", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn backend(err: anyhow::Error) -> StoreError {
    err.downcast::<StoreError>()
        .unwrap_or_else(|err| StoreError::Backend(format!("{:#}", err)))
}

impl CanonicalStore for EntityDb {
    fn get(&self, entity_id: &EntityId) -> std::result::Result<Option<EntityVersion>, StoreError> {
        self.load_version(entity_id.as_str()).map_err(backend)
    }

    fn put(&self, version: &EntityVersion) -> std::result::Result<(), StoreError> {
        self.save_version(version).map_err(backend)
    }

    fn list(&self) -> std::result::Result<Vec<EntityVersion>, StoreError> {
        self.list_versions().map_err(backend)
    }

    fn archive(&self, record: &MutationRecord, outcome: ArchiveOutcome) -> std::result::Result<(), StoreError> {
        self.append_archive(record, outcome).map_err(backend)
    }

    fn history(&self, entity_id: &EntityId) -> std::result::Result<Vec<ArchivedMutation>, StoreError> {
        self.load_archive(entity_id.as_str()).map_err(backend)
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../migrations/V0001__entities.sql"))?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0001__entities"],
    )?;
    conn.execute_batch(include_str!("../migrations/V0002__archive.sql"))?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0002__archive"],
    )?;
    Ok(())
}
