//! Durable records of running protocol instances.

use protocol::{CryptoIdentity, ProtocolId, Uid};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::database::unix_now;
use crate::error::{EngineError, Result};

/// A protocol state as persisted: numeric kind plus MessagePack payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub kind: u32,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl StateRecord {
    /// Serializes a typed state.
    pub fn encode<S: Serialize>(kind: u32, state: &S) -> Result<Self> {
        Ok(Self {
            kind,
            payload: rmp_serde::to_vec(state)?,
        })
    }

    /// A state without payload.
    pub fn bare(kind: u32) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    /// Deserializes the payload.
    pub fn decode<S: for<'de> Deserialize<'de>>(&self) -> Result<S> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }
}

/// Key of a protocol instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub owned_identity: CryptoIdentity,
    pub protocol_id: ProtocolId,
    pub instance_uid: Uid,
}

/// A stored protocol instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInstanceRecord {
    pub key: InstanceKey,
    pub state: StateRecord,
    /// Incremented on every update, used to detect concurrent writers.
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Access to the `protocol_instances` table.
pub struct ProtocolInstances;

pub(crate) fn protocol_id_from_row(raw: i64) -> rusqlite::Result<ProtocolId> {
    ProtocolId::from_raw(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Integer, Box::new(e))
    })
}

pub(crate) fn identity_from_row(bytes: Vec<u8>) -> rusqlite::Result<CryptoIdentity> {
    CryptoIdentity::from_slice(&bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e))
    })
}

pub(crate) fn uid_from_row(bytes: Vec<u8>) -> rusqlite::Result<Uid> {
    Uid::from_slice(&bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e))
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ProtocolInstanceRecord> {
    Ok(ProtocolInstanceRecord {
        key: InstanceKey {
            owned_identity: identity_from_row(row.get(0)?)?,
            protocol_id: protocol_id_from_row(row.get(1)?)?,
            instance_uid: uid_from_row(row.get(2)?)?,
        },
        state: StateRecord {
            kind: row.get(3)?,
            payload: row.get(4)?,
        },
        version: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const SELECT_COLUMNS: &str = "owned_identity, protocol_id, instance_uid, state_kind, \
                              state_payload, version, created_at, updated_at";

impl ProtocolInstances {
    /// Get an instance by key.
    pub fn get(conn: &Connection, key: &InstanceKey) -> Result<Option<ProtocolInstanceRecord>> {
        let record = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM protocol_instances \
                     WHERE owned_identity = ?1 AND protocol_id = ?2 AND instance_uid = ?3"
                ),
                params![
                    key.owned_identity.as_bytes().as_slice(),
                    key.protocol_id.raw(),
                    key.instance_uid.as_bytes().as_slice()
                ],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Insert a new instance at version 1.
    pub fn insert(conn: &Connection, key: &InstanceKey, state: &StateRecord) -> Result<()> {
        let now = unix_now();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO protocol_instances \
             (owned_identity, protocol_id, instance_uid, state_kind, state_payload, version, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
            params![
                key.owned_identity.as_bytes().as_slice(),
                key.protocol_id.raw(),
                key.instance_uid.as_bytes().as_slice(),
                state.kind,
                state.payload,
                now
            ],
        )?;
        if inserted == 0 {
            return Err(EngineError::StaleInstance(key.instance_uid));
        }
        Ok(())
    }

    /// Replace the state of an instance, provided nobody updated it since
    /// `expected_version` was read.
    pub fn update(
        conn: &Connection,
        key: &InstanceKey,
        state: &StateRecord,
        expected_version: i64,
    ) -> Result<()> {
        let updated = conn.execute(
            "UPDATE protocol_instances \
             SET state_kind = ?1, state_payload = ?2, version = version + 1, updated_at = ?3 \
             WHERE owned_identity = ?4 AND protocol_id = ?5 AND instance_uid = ?6 AND version = ?7",
            params![
                state.kind,
                state.payload,
                unix_now(),
                key.owned_identity.as_bytes().as_slice(),
                key.protocol_id.raw(),
                key.instance_uid.as_bytes().as_slice(),
                expected_version
            ],
        )?;
        if updated == 0 {
            return Err(EngineError::StaleInstance(key.instance_uid));
        }
        Ok(())
    }

    /// Delete one instance. Returns whether it existed.
    pub fn delete(conn: &Connection, key: &InstanceKey) -> Result<bool> {
        let deleted = conn.execute(
            "DELETE FROM protocol_instances \
             WHERE owned_identity = ?1 AND protocol_id = ?2 AND instance_uid = ?3",
            params![
                key.owned_identity.as_bytes().as_slice(),
                key.protocol_id.raw(),
                key.instance_uid.as_bytes().as_slice()
            ],
        )?;
        Ok(deleted > 0)
    }

    /// Delete every instance with this uid, whatever its protocol.
    pub fn delete_by_uid(conn: &Connection, owned: &CryptoIdentity, instance_uid: &Uid) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM protocol_instances WHERE owned_identity = ?1 AND instance_uid = ?2",
            params![owned.as_bytes().as_slice(), instance_uid.as_bytes().as_slice()],
        )?)
    }

    /// Delete every instance of an owned identity.
    pub fn delete_all_for_owned(conn: &Connection, owned: &CryptoIdentity) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM protocol_instances WHERE owned_identity = ?1",
            params![owned.as_bytes().as_slice()],
        )?)
    }

    /// List every stored instance, oldest first.
    pub fn list(conn: &Connection) -> Result<Vec<ProtocolInstanceRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM protocol_instances ORDER BY created_at, rowid"
        ))?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
