//! Anti-replay store for challenge signatures.
//!
//! Receipts are scoped per owned identity and outlive the protocol instance
//! that recorded them. They are only ever inserted, or purged in bulk when
//! the owned identity goes away.

use protocol::{ChallengeResponse, CryptoIdentity};
use rusqlite::{params, Connection};

use super::database::unix_now;
use crate::error::Result;

/// Access to the `ping_signatures_received` table.
pub struct AntiReplayStore;

impl AntiReplayStore {
    /// Whether this signature was already accepted for `owned`.
    pub fn exists(conn: &Connection, owned: &CryptoIdentity, signature: &ChallengeResponse) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ping_signatures_received WHERE owned_identity = ?1 AND signature = ?2",
            params![owned.as_bytes().as_slice(), signature.as_bytes()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Records a signature. Recording the same signature twice is a no-op.
    pub fn insert(conn: &Connection, owned: &CryptoIdentity, signature: &ChallengeResponse) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO ping_signatures_received (owned_identity, signature, received_at) \
             VALUES (?1, ?2, ?3)",
            params![owned.as_bytes().as_slice(), signature.as_bytes(), unix_now()],
        )?;
        Ok(())
    }

    /// Purges every receipt of an owned identity.
    pub fn delete_all(conn: &Connection, owned: &CryptoIdentity) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM ping_signatures_received WHERE owned_identity = ?1",
            params![owned.as_bytes().as_slice()],
        )?)
    }
}
