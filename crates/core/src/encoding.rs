//! Column value codecs
//!
//! Structured entry values (locks, write pointers, rollback markers) are
//! serialized with bincode. Notification markers are addressed by a column in
//! [`NOTIFY_FAMILY`] whose qualifier embeds the observed column.

use crate::error::{SeepError, SeepResult};
use crate::key::{Cell, EntryKind, Key, NOTIFY_FAMILY};
use crate::types::{Bytes, Column, RowColumn};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::Cursor;

/// How a notification is armed and cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    /// Idempotent set; concurrent arms never conflict
    Weak,
    /// Armed by writes to the observed column; processing is conflict checked
    Strong,
}

impl NotificationType {
    /// Single-byte encoding stored as the marker value
    pub fn to_byte(self) -> u8 {
        match self {
            NotificationType::Weak => b'w',
            NotificationType::Strong => b's',
        }
    }

    /// Decode the marker value byte
    pub fn from_byte(b: u8) -> SeepResult<Self> {
        match b {
            b'w' => Ok(NotificationType::Weak),
            b's' => Ok(NotificationType::Strong),
            other => Err(SeepError::Serialization(format!(
                "unknown notification type byte {:#04x}",
                other
            ))),
        }
    }
}

/// A pending notification found by a scan
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    /// Row the observed column changed in
    pub row: Bytes,
    /// Observed column
    pub column: Column,
    /// Timestamp of the newest marker version
    pub ts: u64,
    /// Weak or strong
    pub ntype: NotificationType,
}

impl Notification {
    /// The notified `(row, column)`
    pub fn row_column(&self) -> RowColumn {
        RowColumn::new(self.row.clone(), self.column.clone())
    }

    /// Store key of the marker version this notification was read from
    pub fn marker_key(&self) -> Key {
        Key::new(self.row.clone(), notify_column(&self.column), EntryKind::Notify, self.ts)
    }

    /// Decode a marker entry
    ///
    /// # Errors
    ///
    /// `Serialization` if `cell` is not a well-formed marker.
    pub fn from_marker(cell: &Cell) -> SeepResult<Self> {
        if cell.key.kind != EntryKind::Notify {
            return Err(SeepError::Serialization(format!(
                "{} entry is not a notification marker",
                cell.key.kind.as_str()
            )));
        }
        let ntype = match cell.value.as_slice() {
            [b] => NotificationType::from_byte(*b)?,
            other => {
                return Err(SeepError::Serialization(format!(
                    "notification marker value has {} bytes",
                    other.len()
                )))
            }
        };
        Ok(Notification {
            row: cell.key.row.clone(),
            column: observed_column(&cell.key.column)?,
            ts: cell.key.ts,
            ntype,
        })
    }
}

/// What a lock will become when its transaction commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    /// Commit a new value
    Put,
    /// Commit a delete
    Delete,
    /// Only acknowledge a strong notification
    Ack,
}

/// Value of a `Lock` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockValue {
    /// Primary cell of the owning transaction
    pub primary: RowColumn,
    /// What this lock commits to
    pub lock_type: LockType,
    /// Notification timestamp being acknowledged, for observer triggers
    pub trigger: Option<u64>,
    /// Column is strong-observed; committing must arm a notification
    pub observed: bool,
    /// Owning transactor
    pub transactor: u128,
    /// Wall-clock creation time in milliseconds
    pub created_ms: i64,
}

impl LockValue {
    /// True if this lock sits on the primary cell
    pub fn is_primary(&self, rc: &RowColumn) -> bool {
        &self.primary == rc
    }
}

/// Kind of a committed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    /// Points at a `Data` entry
    Put,
    /// Hides all older versions
    Delete,
}

/// Value of a `Write` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteValue {
    /// Start timestamp of the committing transaction (locates `Data`)
    pub start_ts: u64,
    /// Written for the transaction's primary cell
    pub primary: bool,
    /// Put or delete
    pub kind: WriteKind,
}

/// Value of a `DelLock` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelLockValue {
    /// The rolled back lock was the primary
    pub primary: bool,
}

/// Serialize a structured entry value
pub fn encode<T: Serialize>(value: &T) -> SeepResult<Bytes> {
    Ok(Bytes::new(bincode::serialize(value)?))
}

/// Deserialize a structured entry value
pub fn decode<T: DeserializeOwned>(bytes: &Bytes) -> SeepResult<T> {
    Ok(bincode::deserialize(bytes.as_slice())?)
}

/// `Ack` values carry the commit timestamp of the acknowledging transaction
pub fn encode_ack(commit_ts: u64) -> Bytes {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, commit_ts);
    Bytes::new(buf.to_vec())
}

/// Decode an `Ack` value
pub fn decode_ack(bytes: &Bytes) -> SeepResult<u64> {
    if bytes.len() != 8 {
        return Err(SeepError::Serialization(format!(
            "ack value must be 8 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(BigEndian::read_u64(bytes.as_slice()))
}

/// Column holding notification markers for `observed`
///
/// Qualifier layout: `u32 BE family length | family | qualifier`.
pub fn notify_column(observed: &Column) -> Column {
    let family = observed.family.as_slice();
    let qualifier = observed.qualifier.as_slice();
    let mut buf = Vec::with_capacity(4 + family.len() + qualifier.len());
    // writes into a Vec cannot fail
    let _ = buf.write_u32::<BigEndian>(family.len() as u32);
    buf.extend_from_slice(family);
    buf.extend_from_slice(qualifier);
    Column::new(NOTIFY_FAMILY, buf)
}

/// Recover the observed column from a notification marker column
pub fn observed_column(notify: &Column) -> SeepResult<Column> {
    if notify.family.as_slice() != NOTIFY_FAMILY {
        return Err(SeepError::Serialization(format!(
            "{} is not a notification column",
            notify
        )));
    }
    let raw = notify.qualifier.as_slice();
    let mut cursor = Cursor::new(raw);
    let family_len = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| SeepError::Serialization(format!("notification qualifier: {}", e)))?
        as usize;
    let rest = &raw[4..];
    if family_len > rest.len() {
        return Err(SeepError::Serialization(format!(
            "notification qualifier family length {} exceeds {} remaining bytes",
            family_len,
            rest.len()
        )));
    }
    Ok(Column::new(&rest[..family_len], &rest[family_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_lock_value_codec() {
        let lock = LockValue {
            primary: RowColumn::new("r1", Column::new("stat", "count")),
            lock_type: LockType::Put,
            trigger: Some(7),
            observed: true,
            transactor: 42,
            created_ms: 1_700_000_000_000,
        };
        let bytes = encode(&lock).unwrap();
        let back: LockValue = decode(&bytes).unwrap();
        assert_eq!(back, lock);
    }

    #[test]
    fn test_truncated_write_value_fails() {
        let wv = WriteValue {
            start_ts: 10,
            primary: true,
            kind: WriteKind::Delete,
        };
        let bytes = encode(&wv).unwrap();
        let cut = Bytes::from(&bytes.as_slice()[..2]);
        assert!(decode::<WriteValue>(&cut).is_err());
    }

    #[test]
    fn test_ack_value_must_be_eight_bytes() {
        assert_eq!(decode_ack(&encode_ack(99)).unwrap(), 99);
        assert!(decode_ack(&Bytes::from("short")).is_err());
    }

    #[test]
    fn test_notification_type_byte() {
        assert_eq!(
            NotificationType::from_byte(NotificationType::Weak.to_byte()).unwrap(),
            NotificationType::Weak
        );
        assert!(NotificationType::from_byte(b'x').is_err());
    }

    #[test]
    fn test_marker_decodes_to_notification() {
        let n = Notification {
            row: Bytes::from("r1"),
            column: Column::new("stat", "check"),
            ts: 12,
            ntype: NotificationType::Strong,
        };
        let cell = Cell::new(n.marker_key(), vec![b's']);
        assert_eq!(Notification::from_marker(&cell).unwrap(), n);

        let empty = Cell::new(n.marker_key(), Bytes::EMPTY);
        assert!(Notification::from_marker(&empty).is_err());
    }

    #[test]
    fn test_observed_column_rejects_user_family() {
        assert!(observed_column(&Column::new("stat", "check")).is_err());
    }

    #[test]
    fn test_observed_column_rejects_bad_length() {
        let bad = Column::new(NOTIFY_FAMILY, vec![0, 0, 0, 9, b'a']);
        assert!(observed_column(&bad).is_err());
    }

    proptest! {
        #[test]
        fn prop_notify_column_preserves_observed(
            family in proptest::collection::vec(any::<u8>(), 0..16),
            qualifier in proptest::collection::vec(any::<u8>(), 0..16),
        ) {
            let col = Column::new(family, qualifier);
            let encoded = notify_column(&col);
            prop_assert_eq!(observed_column(&encoded).unwrap(), col);
        }

        #[test]
        fn prop_distinct_families_get_distinct_markers(
            a in "[a-z]{1,4}", b in "[a-z]{1,4}", q in "[a-z]{0,4}",
        ) {
            let ca = notify_column(&Column::new(a.as_str(), q.as_str()));
            let cb = notify_column(&Column::new(b.as_str(), q.as_str()));
            prop_assert_eq!(ca == cb, a == b);
        }
    }
}
