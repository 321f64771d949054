//! SQLite-backed [`OmemoStore`].
//!
//! One table per entity class; records are serialized with serde_json.
//! Multi-entity commits run inside a single transaction, which is what makes
//! pre-key consumption atomic with session creation.

use rusqlite::Connection;

use chirp_shared::{BareJid, DeviceId, OmemoDevice};

use crate::error::OmemoError;
use crate::keys::IdentityKeyPair;
use crate::registry::CachedDeviceList;
use crate::session::state::SessionState;
use crate::store::{unix_now, OmemoStore, PreKeyRecord, SignedPreKeyRecord};

const MIGRATIONS: &[(i32, &str)] = &[(1, MIGRATION_001)];

const MIGRATION_001: &str = "
CREATE TABLE IF NOT EXISTS omemo_identity (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    key_pair    BLOB NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS omemo_local_devices (
    owner      TEXT NOT NULL,
    device_id  INTEGER NOT NULL,
    PRIMARY KEY (owner, device_id)
);

CREATE TABLE IF NOT EXISTS omemo_pre_keys (
    key_id     INTEGER PRIMARY KEY,
    record     TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS omemo_pre_key_counter (
    id      INTEGER PRIMARY KEY CHECK (id = 1),
    next_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS omemo_signed_pre_keys (
    key_id     INTEGER PRIMARY KEY,
    record     TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS omemo_sessions (
    owner        TEXT NOT NULL,
    device_id    INTEGER NOT NULL,
    state        TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    last_used_at INTEGER NOT NULL,
    PRIMARY KEY (owner, device_id)
);

CREATE TABLE IF NOT EXISTS omemo_used_bundle_pre_keys (
    owner       TEXT NOT NULL,
    device_id   INTEGER NOT NULL,
    pre_key_id  INTEGER NOT NULL,
    PRIMARY KEY (owner, device_id, pre_key_id)
);

CREATE TABLE IF NOT EXISTS omemo_remote_identities (
    owner         TEXT NOT NULL,
    device_id     INTEGER NOT NULL,
    identity_key  BLOB NOT NULL,
    first_seen_at INTEGER NOT NULL,
    PRIMARY KEY (owner, device_id)
);

CREATE TABLE IF NOT EXISTS omemo_device_lists (
    owner        TEXT PRIMARY KEY,
    list         TEXT NOT NULL,
    refreshed_at INTEGER NOT NULL
);
";

fn run_migrations(conn: &Connection) -> Result<(), OmemoError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _omemo_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _omemo_migrations",
        [],
        |row| row.get(0),
    )?;

    for &(version, sql) in MIGRATIONS {
        if version > current_version {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(sql)?;
            tx.execute("INSERT INTO _omemo_migrations (version) VALUES (?1)", [version])?;
            tx.commit()?;
        }
    }

    Ok(())
}

/// [`OmemoStore`] backed by a SQLite database it owns.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if necessary) the database at `path` and run
    /// migrations.
    pub fn open(path: &std::path::Path) -> Result<Self, OmemoError> {
        let conn = Connection::open(path)?;
        run_migrations(&conn)?;
        Ok(SqliteStore { conn })
    }

    /// In-memory store for tests and throwaway sessions.
    pub fn open_in_memory() -> Result<Self, OmemoError> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(SqliteStore { conn })
    }

    fn write_session(
        conn: &Connection,
        device: &OmemoDevice,
        state: &SessionState,
    ) -> Result<(), OmemoError> {
        let json = serde_json::to_string(state)?;
        let now = unix_now();
        conn.execute(
            "INSERT INTO omemo_sessions (owner, device_id, state, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(owner, device_id) DO UPDATE SET
                 state = excluded.state,
                 last_used_at = excluded.last_used_at",
            rusqlite::params![device.owner.as_str(), device.id.get(), json, now],
        )?;
        Ok(())
    }

    fn write_remote_identity(
        conn: &Connection,
        device: &OmemoDevice,
        identity_key: &[u8],
    ) -> Result<(), OmemoError> {
        conn.execute(
            "INSERT INTO omemo_remote_identities (owner, device_id, identity_key, first_seen_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner, device_id) DO UPDATE SET identity_key = excluded.identity_key",
            rusqlite::params![
                device.owner.as_str(),
                device.id.get(),
                identity_key,
                unix_now()
            ],
        )?;
        Ok(())
    }
}

impl OmemoStore for SqliteStore {
    fn load_identity(&self) -> Result<Option<IdentityKeyPair>, OmemoError> {
        match self.conn.query_row(
            "SELECT key_pair FROM omemo_identity WHERE id = 1",
            [],
            |row| row.get::<_, Vec<u8>>(0),
        ) {
            Ok(bytes) => Ok(Some(IdentityKeyPair::from_bytes(&bytes)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store_identity(&self, identity: &IdentityKeyPair) -> Result<(), OmemoError> {
        let result = self.conn.execute(
            "INSERT INTO omemo_identity (id, key_pair, created_at) VALUES (1, ?1, ?2)",
            rusqlite::params![identity.to_bytes().as_slice(), unix_now()],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(OmemoError::Store("identity already exists".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn local_device_ids(&self, owner: &BareJid) -> Result<Vec<DeviceId>, OmemoError> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id FROM omemo_local_devices WHERE owner = ?1 ORDER BY device_id",
        )?;
        let ids = stmt
            .query_map([owner.as_str()], |row| row.get::<_, u32>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter()
            .map(|id| {
                DeviceId::new(id).map_err(|e| OmemoError::Store(format!("stored device id: {e}")))
            })
            .collect()
    }

    fn add_local_device_id(&self, owner: &BareJid, id: DeviceId) -> Result<(), OmemoError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO omemo_local_devices (owner, device_id) VALUES (?1, ?2)",
            rusqlite::params![owner.as_str(), id.get()],
        )?;
        Ok(())
    }

    fn store_pre_keys(&self, records: &[PreKeyRecord]) -> Result<(), OmemoError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = self.conn.prepare(
                "INSERT INTO omemo_pre_keys (key_id, record, created_at) VALUES (?1, ?2, ?3)",
            )?;
            let now = unix_now();
            for record in records {
                let json = serde_json::to_string(record)?;
                stmt.execute(rusqlite::params![record.id, json, now])?;
            }
        }
        if let Some(max_id) = records.iter().map(|r| r.id).max() {
            tx.execute(
                "INSERT INTO omemo_pre_key_counter (id, next_id) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET next_id = MAX(next_id, excluded.next_id)",
                [max_id + 1],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, OmemoError> {
        match self.conn.query_row(
            "SELECT record FROM omemo_pre_keys WHERE key_id = ?1",
            [id],
            |row| row.get::<_, String>(0),
        ) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_pre_key(&self, id: u32) -> Result<(), OmemoError> {
        self.conn
            .execute("DELETE FROM omemo_pre_keys WHERE key_id = ?1", [id])?;
        Ok(())
    }

    fn pre_key_count(&self) -> Result<u32, OmemoError> {
        let count: u32 =
            self.conn
                .query_row("SELECT COUNT(*) FROM omemo_pre_keys", [], |row| row.get(0))?;
        Ok(count)
    }

    fn all_pre_keys(&self) -> Result<Vec<PreKeyRecord>, OmemoError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM omemo_pre_keys ORDER BY key_id")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(OmemoError::from))
            .collect()
    }

    fn next_pre_key_id(&self) -> Result<u32, OmemoError> {
        match self.conn.query_row(
            "SELECT next_id FROM omemo_pre_key_counter WHERE id = 1",
            [],
            |row| row.get::<_, u32>(0),
        ) {
            Ok(next) => Ok(next),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(1),
            Err(e) => Err(e.into()),
        }
    }

    fn store_signed_pre_key(&self, record: &SignedPreKeyRecord) -> Result<(), OmemoError> {
        let json = serde_json::to_string(record)?;
        self.conn.execute(
            "INSERT INTO omemo_signed_pre_keys (key_id, record, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![record.id, json, record.created_at],
        )?;
        Ok(())
    }

    fn signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, OmemoError> {
        match self.conn.query_row(
            "SELECT record FROM omemo_signed_pre_keys WHERE key_id = ?1",
            [id],
            |row| row.get::<_, String>(0),
        ) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn current_signed_pre_key(&self) -> Result<Option<SignedPreKeyRecord>, OmemoError> {
        match self.conn.query_row(
            "SELECT record FROM omemo_signed_pre_keys ORDER BY created_at DESC, key_id DESC LIMIT 1",
            [],
            |row| row.get::<_, String>(0),
        ) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn next_signed_pre_key_id(&self) -> Result<u32, OmemoError> {
        let next: u32 = self.conn.query_row(
            "SELECT COALESCE(MAX(key_id), 0) + 1 FROM omemo_signed_pre_keys",
            [],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    fn delete_signed_pre_keys_before(&self, cutoff: i64) -> Result<u32, OmemoError> {
        let deleted = self.conn.execute(
            "DELETE FROM omemo_signed_pre_keys
             WHERE created_at < ?1
               AND key_id != (SELECT key_id FROM omemo_signed_pre_keys
                              ORDER BY created_at DESC, key_id DESC LIMIT 1)",
            [cutoff],
        )?;
        Ok(deleted as u32)
    }

    fn load_session(&self, device: &OmemoDevice) -> Result<Option<SessionState>, OmemoError> {
        match self.conn.query_row(
            "SELECT state FROM omemo_sessions WHERE owner = ?1 AND device_id = ?2",
            rusqlite::params![device.owner.as_str(), device.id.get()],
            |row| row.get::<_, String>(0),
        ) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store_session(
        &self,
        device: &OmemoDevice,
        state: &SessionState,
    ) -> Result<(), OmemoError> {
        Self::write_session(&self.conn, device, state)
    }

    fn delete_session(&self, device: &OmemoDevice) -> Result<(), OmemoError> {
        self.conn.execute(
            "DELETE FROM omemo_sessions WHERE owner = ?1 AND device_id = ?2",
            rusqlite::params![device.owner.as_str(), device.id.get()],
        )?;
        Ok(())
    }

    fn session_devices(&self) -> Result<Vec<OmemoDevice>, OmemoError> {
        let mut stmt = self
            .conn
            .prepare("SELECT owner, device_id FROM omemo_sessions ORDER BY owner, device_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(owner, id)| {
                let owner = BareJid::new(&owner)
                    .map_err(|e| OmemoError::Store(format!("stored owner jid: {e}")))?;
                let id = DeviceId::new(id)
                    .map_err(|e| OmemoError::Store(format!("stored device id: {e}")))?;
                Ok(OmemoDevice::new(owner, id))
            })
            .collect()
    }

    fn commit_outbound_session(
        &self,
        device: &OmemoDevice,
        state: &SessionState,
        used_bundle_pre_key_id: u32,
    ) -> Result<(), OmemoError> {
        let tx = self.conn.unchecked_transaction()?;
        Self::write_session(&self.conn, device, state)?;
        Self::write_remote_identity(&self.conn, device, &state.remote_identity)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO omemo_used_bundle_pre_keys (owner, device_id, pre_key_id)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![device.owner.as_str(), device.id.get(), used_bundle_pre_key_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn commit_inbound_session(
        &self,
        device: &OmemoDevice,
        state: &SessionState,
        consumed_pre_key_id: Option<u32>,
    ) -> Result<(), OmemoError> {
        let tx = self.conn.unchecked_transaction()?;
        Self::write_session(&self.conn, device, state)?;
        Self::write_remote_identity(&self.conn, device, &state.remote_identity)?;
        if let Some(id) = consumed_pre_key_id {
            self.conn
                .execute("DELETE FROM omemo_pre_keys WHERE key_id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn bundle_pre_key_used(
        &self,
        device: &OmemoDevice,
        pre_key_id: u32,
    ) -> Result<bool, OmemoError> {
        let used: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM omemo_used_bundle_pre_keys
             WHERE owner = ?1 AND device_id = ?2 AND pre_key_id = ?3",
            rusqlite::params![device.owner.as_str(), device.id.get(), pre_key_id],
            |row| row.get(0),
        )?;
        Ok(used)
    }

    fn store_remote_identity(
        &self,
        device: &OmemoDevice,
        identity_key: &[u8],
    ) -> Result<(), OmemoError> {
        Self::write_remote_identity(&self.conn, device, identity_key)
    }

    fn remote_identity(&self, device: &OmemoDevice) -> Result<Option<Vec<u8>>, OmemoError> {
        match self.conn.query_row(
            "SELECT identity_key FROM omemo_remote_identities WHERE owner = ?1 AND device_id = ?2",
            rusqlite::params![device.owner.as_str(), device.id.get()],
            |row| row.get::<_, Vec<u8>>(0),
        ) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn load_device_list(&self, owner: &BareJid) -> Result<Option<CachedDeviceList>, OmemoError> {
        match self.conn.query_row(
            "SELECT list FROM omemo_device_lists WHERE owner = ?1",
            [owner.as_str()],
            |row| row.get::<_, String>(0),
        ) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store_device_list(
        &self,
        owner: &BareJid,
        list: &CachedDeviceList,
    ) -> Result<(), OmemoError> {
        let json = serde_json::to_string(list)?;
        self.conn.execute(
            "INSERT INTO omemo_device_lists (owner, list, refreshed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(owner) DO UPDATE SET
                 list = excluded.list,
                 refreshed_at = excluded.refreshed_at",
            rusqlite::params![owner.as_str(), json, unix_now()],
        )?;
        Ok(())
    }

    fn device_list_refreshed_at(&self, owner: &BareJid) -> Result<Option<i64>, OmemoError> {
        match self.conn.query_row(
            "SELECT refreshed_at FROM omemo_device_lists WHERE owner = ?1",
            [owner.as_str()],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(at) => Ok(Some(at)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fresh in-memory store for tests.
pub fn init_test_db() -> SqliteStore {
    SqliteStore::open_in_memory().expect("in-memory sqlite store")
}
