//! Canonical in-memory record representation.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use cairn_codec::{Octets, OctetsReader, Record};
use cairn_common::error::MarshalError;

/// Not owned by any table map.
pub const STATE_UNMANAGED: u8 = 0;
/// The canonical cached value; must not be mutated directly.
pub const STATE_SHARED: u8 = 1;
/// Queued in a modified map awaiting flush.
pub const STATE_DIRTY: u8 = 2;

/// The canonical holder of one record value. There is at most one live
/// cell per (table, key) across the read cache and the modified map;
/// safe wrappers alias it, so a mutation through any alias is visible to
/// all of them.
pub struct RecordCell<V> {
    state: AtomicU8,
    value: RwLock<V>,
}

impl<V: Record> RecordCell<V> {
    pub fn new(value: V, state: u8) -> Self {
        Self {
            state: AtomicU8::new(state),
            value: RwLock::new(value),
        }
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.state() == STATE_DIRTY
    }

    pub fn read(&self) -> RwLockReadGuard<'_, V> {
        self.value.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, V> {
        self.value.write()
    }
}

/// Record value wire layout: a one-byte format marker, then the tagged
/// field stream.
const VALUE_FORMAT: u8 = 0x00;

pub(crate) fn encode_value<V: Record>(value: &V) -> Octets {
    let mut out = Octets::with_capacity(V::init_size() + 1);
    out.marshal_u8(VALUE_FORMAT);
    value.marshal(&mut out);
    out
}

pub(crate) fn decode_value<V: Record>(data: &[u8], table: &str) -> Result<V, MarshalError> {
    let mut r = OctetsReader::new(data);
    let format = r.unmarshal_u8()?;
    if format != VALUE_FORMAT {
        return Err(MarshalError::BadFormat(format!(
            "unknown record value format {format:#04x} in table {table}"
        )));
    }
    let mut value = V::create();
    value.unmarshal(&mut r)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_codec::record::{read_fields, read_int, write_int_field, write_terminator};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Count {
        n: i64,
    }

    impl Record for Count {
        fn type_id() -> u32 {
            1
        }

        fn marshal(&self, out: &mut Octets) {
            write_int_field(out, 1, self.n);
            write_terminator(out);
        }

        fn unmarshal(&mut self, r: &mut OctetsReader<'_>) -> Result<(), MarshalError> {
            read_fields(r, |tag, kind, r| match tag {
                1 => {
                    self.n = read_int(kind, r)?;
                    Ok(true)
                }
                _ => Ok(false),
            })
        }
    }

    #[test]
    fn test_value_roundtrip() {
        let v = Count { n: 7 };
        let enc = encode_value(&v);
        assert_eq!(enc[0], 0x00);
        assert_eq!(decode_value::<Count>(&enc, "t").unwrap(), v);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let err = decode_value::<Count>(&[0x01, 0x00], "t").unwrap_err();
        assert!(matches!(err, MarshalError::BadFormat(_)));
    }

    #[test]
    fn test_cell_state_transitions() {
        let cell = RecordCell::new(Count { n: 1 }, STATE_SHARED);
        assert!(!cell.is_dirty());
        cell.set_state(STATE_DIRTY);
        assert!(cell.is_dirty());
        assert_eq!(cell.read().n, 1);
    }
}
