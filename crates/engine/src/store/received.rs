//! Queue of received protocol messages.
//!
//! A message stays here until a step consumes it, the dispatcher drops it, or
//! its protocol instance finishes. Messages that match no step in the current
//! state of their instance wait here until the instance moves on. Messages
//! whose instance never shows up are purged once they are old enough.

use protocol::{
    CryptoIdentity, Encoded, GenericProtocolMessage, ReceptionChannelInfo, Uid,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::database::unix_now;
use super::instances::{identity_from_row, protocol_id_from_row, uid_from_row};
use crate::error::{EngineError, Result};

/// Identifier of a received message in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceivedMessageId(pub i64);

impl std::fmt::Display for ReceivedMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A queued message with its reception metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub id: ReceivedMessageId,
    pub owned_identity: CryptoIdentity,
    pub message: GenericProtocolMessage,
    pub reception: ReceptionChannelInfo,
    /// Set for responses to a user dialog.
    pub dialog_uuid: Option<Uuid>,
    pub user_response: Option<Encoded>,
    pub received_at: i64,
}

/// A message to insert in the queue.
#[derive(Debug, Clone)]
pub struct NewReceivedMessage {
    pub owned_identity: CryptoIdentity,
    pub message: GenericProtocolMessage,
    pub reception: ReceptionChannelInfo,
    pub dialog_uuid: Option<Uuid>,
    pub user_response: Option<Encoded>,
}

/// Access to the `received_messages` table.
pub struct ReceivedMessages;

const SELECT_COLUMNS: &str = "id, owned_identity, protocol_id, instance_uid, message_kind, \
                              inputs, reception_channel, dialog_uuid, user_response, received_at";

fn conversion_error(
    column: usize,
    ty: rusqlite::types::Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, ty, Box::new(err))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ReceivedMessage> {
    use rusqlite::types::Type;

    let inputs: Vec<u8> = row.get(5)?;
    let inputs = Encoded::from_bytes(&inputs)
        .and_then(Encoded::into_list)
        .map_err(|e| conversion_error(5, Type::Blob, e))?;

    let reception: Vec<u8> = row.get(6)?;
    let reception = rmp_serde::from_slice(&reception).map_err(|e| conversion_error(6, Type::Blob, e))?;

    let dialog_uuid: Option<String> = row.get(7)?;
    let dialog_uuid = dialog_uuid
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| conversion_error(7, Type::Text, e))?;

    let user_response: Option<Vec<u8>> = row.get(8)?;
    let user_response = user_response
        .map(|b| Encoded::from_bytes(&b))
        .transpose()
        .map_err(|e| conversion_error(8, Type::Blob, e))?;

    Ok(ReceivedMessage {
        id: ReceivedMessageId(row.get(0)?),
        owned_identity: identity_from_row(row.get(1)?)?,
        message: GenericProtocolMessage {
            protocol_id: protocol_id_from_row(row.get(2)?)?,
            instance_uid: uid_from_row(row.get(3)?)?,
            message_kind: row.get(4)?,
            inputs,
        },
        reception,
        dialog_uuid,
        user_response,
        received_at: row.get(9)?,
    })
}

impl ReceivedMessages {
    /// Queue a message and return its id.
    pub fn insert(conn: &Connection, new: &NewReceivedMessage) -> Result<ReceivedMessageId> {
        let inputs = Encoded::List(new.message.inputs.clone()).to_bytes()?;
        let reception = rmp_serde::to_vec(&new.reception)?;
        let user_response = new
            .user_response
            .as_ref()
            .map(Encoded::to_bytes)
            .transpose()?;

        conn.execute(
            "INSERT INTO received_messages \
             (owned_identity, protocol_id, instance_uid, message_kind, inputs, reception_channel, \
              dialog_uuid, user_response, received_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.owned_identity.as_bytes().as_slice(),
                new.message.protocol_id.raw(),
                new.message.instance_uid.as_bytes().as_slice(),
                new.message.message_kind,
                inputs,
                reception,
                new.dialog_uuid.map(|u| u.to_string()),
                user_response,
                unix_now()
            ],
        )?;
        Ok(ReceivedMessageId(conn.last_insert_rowid()))
    }

    /// Get a queued message.
    pub fn get(conn: &Connection, id: ReceivedMessageId) -> Result<Option<ReceivedMessage>> {
        let message = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM received_messages WHERE id = ?1"),
                params![id.0],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Get a queued message that must exist.
    pub fn require(conn: &Connection, id: ReceivedMessageId) -> Result<ReceivedMessage> {
        Self::get(conn, id)?.ok_or(EngineError::MessageNotFound(id.0))
    }

    /// Remove a message from the queue. Returns whether it existed.
    pub fn delete(conn: &Connection, id: ReceivedMessageId) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM received_messages WHERE id = ?1", params![id.0])?;
        Ok(deleted > 0)
    }

    /// Ids of the messages queued for an instance, oldest first.
    pub fn ids_for_instance(
        conn: &Connection,
        owned: &CryptoIdentity,
        instance_uid: &Uid,
    ) -> Result<Vec<ReceivedMessageId>> {
        let mut stmt = conn.prepare(
            "SELECT id FROM received_messages \
             WHERE owned_identity = ?1 AND instance_uid = ?2 ORDER BY id",
        )?;
        let ids = stmt
            .query_map(
                params![owned.as_bytes().as_slice(), instance_uid.as_bytes().as_slice()],
                |row| row.get(0).map(ReceivedMessageId),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Remove every message queued for an instance.
    pub fn delete_for_instance(
        conn: &Connection,
        owned: &CryptoIdentity,
        instance_uid: &Uid,
    ) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM received_messages WHERE owned_identity = ?1 AND instance_uid = ?2",
            params![owned.as_bytes().as_slice(), instance_uid.as_bytes().as_slice()],
        )?)
    }

    /// Remove every message of an owned identity.
    pub fn delete_all_for_owned(conn: &Connection, owned: &CryptoIdentity) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM received_messages WHERE owned_identity = ?1",
            params![owned.as_bytes().as_slice()],
        )?)
    }

    /// Remove messages received before `cutoff` (unix seconds) that have no
    /// live protocol instance.
    pub fn delete_orphans_older_than(conn: &Connection, cutoff: i64) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM received_messages \
             WHERE received_at < ?1 AND NOT EXISTS ( \
                 SELECT 1 FROM protocol_instances AS p \
                 WHERE p.owned_identity = received_messages.owned_identity \
                   AND p.protocol_id = received_messages.protocol_id \
                   AND p.instance_uid = received_messages.instance_uid)",
            params![cutoff],
        )?)
    }

    /// Ids of every queued message, oldest first.
    pub fn pending_ids(conn: &Connection) -> Result<Vec<ReceivedMessageId>> {
        let mut stmt = conn.prepare("SELECT id FROM received_messages ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0).map(ReceivedMessageId))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Every queued message, oldest first.
    pub fn list(conn: &Connection) -> Result<Vec<ReceivedMessage>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM received_messages ORDER BY id"
        ))?;
        let messages = stmt
            .query_map([], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::open_in_memory;
    use crate::store::instances::{InstanceKey, ProtocolInstances, StateRecord};
    use protocol::{OwnedCryptoIdentity, ProtocolId};

    fn new_message(owned: CryptoIdentity, instance_uid: Uid) -> NewReceivedMessage {
        NewReceivedMessage {
            owned_identity: owned,
            message: GenericProtocolMessage {
                protocol_id: ProtocolId::ChannelCreationWithContactDevice,
                instance_uid,
                message_kind: 1,
                inputs: vec![Encoded::bytes(vec![1, 2]), Encoded::Int(4)],
            },
            reception: ReceptionChannelInfo::AsymmetricChannel,
            dialog_uuid: None,
            user_response: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let conn = open_in_memory();
        let owned = *OwnedCryptoIdentity::generate().identity();
        let new = new_message(owned, Uid::generate());

        let id = ReceivedMessages::insert(&conn, &new).unwrap();
        let stored = ReceivedMessages::require(&conn, id).unwrap();

        assert_eq!(stored.id, id);
        assert_eq!(stored.owned_identity, owned);
        assert_eq!(stored.message, new.message);
        assert_eq!(stored.reception, ReceptionChannelInfo::AsymmetricChannel);
        assert!(stored.dialog_uuid.is_none());
    }

    #[test]
    fn test_dialog_response_fields_are_kept() {
        let conn = open_in_memory();
        let mut new = new_message(*OwnedCryptoIdentity::generate().identity(), Uid::generate());
        let uuid = Uuid::new_v4();
        new.dialog_uuid = Some(uuid);
        new.user_response = Some(Encoded::Bool(true));
        new.reception = ReceptionChannelInfo::Local;

        let id = ReceivedMessages::insert(&conn, &new).unwrap();
        let stored = ReceivedMessages::require(&conn, id).unwrap();

        assert_eq!(stored.dialog_uuid, Some(uuid));
        assert_eq!(stored.user_response, Some(Encoded::Bool(true)));
    }

    #[test]
    fn test_missing_message() {
        let conn = open_in_memory();
        assert!(ReceivedMessages::get(&conn, ReceivedMessageId(42)).unwrap().is_none());
        assert!(matches!(
            ReceivedMessages::require(&conn, ReceivedMessageId(42)),
            Err(EngineError::MessageNotFound(42))
        ));
        assert!(!ReceivedMessages::delete(&conn, ReceivedMessageId(42)).unwrap());
    }

    #[test]
    fn test_instance_scoped_queries() {
        let conn = open_in_memory();
        let owned = *OwnedCryptoIdentity::generate().identity();
        let uid = Uid::generate();
        let first = ReceivedMessages::insert(&conn, &new_message(owned, uid)).unwrap();
        let second = ReceivedMessages::insert(&conn, &new_message(owned, uid)).unwrap();
        let unrelated = ReceivedMessages::insert(&conn, &new_message(owned, Uid::generate())).unwrap();

        assert_eq!(
            ReceivedMessages::ids_for_instance(&conn, &owned, &uid).unwrap(),
            vec![first, second]
        );
        assert_eq!(ReceivedMessages::delete_for_instance(&conn, &owned, &uid).unwrap(), 2);
        assert_eq!(ReceivedMessages::pending_ids(&conn).unwrap(), vec![unrelated]);
        assert_eq!(ReceivedMessages::delete_all_for_owned(&conn, &owned).unwrap(), 1);
        assert!(ReceivedMessages::list(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_orphans_past_cutoff_are_deleted() {
        let conn = open_in_memory();
        let owned = *OwnedCryptoIdentity::generate().identity();
        let live_uid = Uid::generate();
        ProtocolInstances::insert(
            &conn,
            &InstanceKey {
                owned_identity: owned,
                protocol_id: ProtocolId::ChannelCreationWithContactDevice,
                instance_uid: live_uid,
            },
            &StateRecord::bare(2),
        )
        .unwrap();

        let held = ReceivedMessages::insert(&conn, &new_message(owned, live_uid)).unwrap();
        let orphan = ReceivedMessages::insert(&conn, &new_message(owned, Uid::generate())).unwrap();
        let recent = ReceivedMessages::insert(&conn, &new_message(owned, Uid::generate())).unwrap();
        conn.execute(
            "UPDATE received_messages SET received_at = 100 WHERE id IN (?1, ?2)",
            params![held.0, orphan.0],
        )
        .unwrap();

        assert_eq!(ReceivedMessages::delete_orphans_older_than(&conn, 1_000).unwrap(), 1);
        assert_eq!(ReceivedMessages::pending_ids(&conn).unwrap(), vec![held, recent]);
        assert_eq!(ReceivedMessages::delete_orphans_older_than(&conn, 1_000).unwrap(), 0);
    }
}
