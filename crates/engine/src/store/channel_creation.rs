//! Running channel creations, indexed by contact device.
//!
//! A row exists from the moment a device commits to a key exchange with a
//! contact device until the channel is confirmed. A fresh handshake with the
//! same device uses it to find and abort the stale instance.

use protocol::{CryptoIdentity, Uid};
use rusqlite::{params, Connection, OptionalExtension};

use super::database::unix_now;
use super::instances::uid_from_row;
use crate::error::Result;

/// Access to the `channel_creation_instances` table.
pub struct ChannelCreationInstances;

impl ChannelCreationInstances {
    /// Instance currently creating a channel with this contact device.
    pub fn get(
        conn: &Connection,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        contact_device_uid: &Uid,
    ) -> Result<Option<Uid>> {
        let uid = conn
            .query_row(
                "SELECT instance_uid FROM channel_creation_instances \
                 WHERE owned_identity = ?1 AND contact_identity = ?2 AND contact_device_uid = ?3",
                params![
                    owned.as_bytes().as_slice(),
                    contact.as_bytes().as_slice(),
                    contact_device_uid.as_bytes().as_slice()
                ],
                |row| uid_from_row(row.get(0)?),
            )
            .optional()?;
        Ok(uid)
    }

    /// Records the instance creating a channel with this contact device.
    pub fn insert(
        conn: &Connection,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        contact_device_uid: &Uid,
        instance_uid: &Uid,
    ) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO channel_creation_instances \
             (owned_identity, contact_identity, contact_device_uid, instance_uid, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                owned.as_bytes().as_slice(),
                contact.as_bytes().as_slice(),
                contact_device_uid.as_bytes().as_slice(),
                instance_uid.as_bytes().as_slice(),
                unix_now()
            ],
        )?;
        Ok(())
    }

    /// Removes the record and returns the instance it pointed to.
    pub fn delete(
        conn: &Connection,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        contact_device_uid: &Uid,
    ) -> Result<Option<Uid>> {
        let uid = Self::get(conn, owned, contact, contact_device_uid)?;
        if uid.is_some() {
            conn.execute(
                "DELETE FROM channel_creation_instances \
                 WHERE owned_identity = ?1 AND contact_identity = ?2 AND contact_device_uid = ?3",
                params![
                    owned.as_bytes().as_slice(),
                    contact.as_bytes().as_slice(),
                    contact_device_uid.as_bytes().as_slice()
                ],
            )?;
        }
        Ok(uid)
    }

    /// Removes every record of an owned identity.
    pub fn delete_all_for_owned(conn: &Connection, owned: &CryptoIdentity) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM channel_creation_instances WHERE owned_identity = ?1",
            params![owned.as_bytes().as_slice()],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::open_in_memory;
    use protocol::OwnedCryptoIdentity;

    #[test]
    fn test_record_lifecycle() {
        let conn = open_in_memory();
        let owned = *OwnedCryptoIdentity::generate().identity();
        let contact = *OwnedCryptoIdentity::generate().identity();
        let device = Uid::generate();
        let first = Uid::generate();
        let second = Uid::generate();

        assert!(ChannelCreationInstances::get(&conn, &owned, &contact, &device)
            .unwrap()
            .is_none());

        ChannelCreationInstances::insert(&conn, &owned, &contact, &device, &first).unwrap();
        ChannelCreationInstances::insert(&conn, &owned, &contact, &device, &second).unwrap();
        assert_eq!(
            ChannelCreationInstances::get(&conn, &owned, &contact, &device).unwrap(),
            Some(second)
        );

        assert_eq!(
            ChannelCreationInstances::delete(&conn, &owned, &contact, &device).unwrap(),
            Some(second)
        );
        assert_eq!(
            ChannelCreationInstances::delete(&conn, &owned, &contact, &device).unwrap(),
            None
        );
    }

    #[test]
    fn test_records_are_per_device() {
        let conn = open_in_memory();
        let owned = *OwnedCryptoIdentity::generate().identity();
        let contact = *OwnedCryptoIdentity::generate().identity();
        let (d1, d2) = (Uid::generate(), Uid::generate());
        ChannelCreationInstances::insert(&conn, &owned, &contact, &d1, &Uid::generate()).unwrap();
        ChannelCreationInstances::insert(&conn, &owned, &contact, &d2, &Uid::generate()).unwrap();

        ChannelCreationInstances::delete(&conn, &owned, &contact, &d1).unwrap();
        assert!(ChannelCreationInstances::get(&conn, &owned, &contact, &d2)
            .unwrap()
            .is_some());
        assert_eq!(
            ChannelCreationInstances::delete_all_for_owned(&conn, &owned).unwrap(),
            1
        );
    }
}
