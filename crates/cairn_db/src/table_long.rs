//! Table specialization for non-negative 64-bit integer keys.
//!
//! Adds the persisted id counter stored under the reserved `0xF1` key
//! prefix, which no legal table-id varuint can start with.

use std::ops::Deref;
use std::sync::Arc;

use cairn_codec::{Octets, OctetsReader, Record};
use cairn_common::error::DbResult;
use cairn_storage::Storage;

use crate::table::Table;

/// Reserved first byte of the id-counter key.
pub const ID_COUNTER_PREFIX: u8 = 0xF1;

/// A table keyed by ids (`i64 ≥ 0`). Dereferences to [`Table<i64, V>`]
/// for all record operations.
pub struct TableLong<V: Record> {
    table: Table<i64, V>,
    storage: Arc<dyn Storage>,
    counter_key: Octets,
}

impl<V: Record> Deref for TableLong<V> {
    type Target = Table<i64, V>;

    fn deref(&self) -> &Table<i64, V> {
        &self.table
    }
}

impl<V: Record> Clone for TableLong<V> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            storage: self.storage.clone(),
            counter_key: self.counter_key.clone(),
        }
    }
}

impl<V: Record> TableLong<V> {
    pub(crate) fn new(table: Table<i64, V>, storage: Arc<dyn Storage>) -> Self {
        let mut counter_key = Octets::with_capacity(6);
        counter_key.marshal_u8(ID_COUNTER_PREFIX);
        counter_key.marshal_uvarint(table.id());
        Self {
            table,
            storage,
            counter_key,
        }
    }

    /// The persisted id counter; 0 when never set.
    pub fn get_id_counter(&self) -> DbResult<i64> {
        match self.storage.get(&self.counter_key)? {
            None => Ok(0),
            Some(bytes) => match OctetsReader::new(&bytes).unmarshal_varint() {
                Ok(v) => Ok(v),
                Err(e) => {
                    tracing::error!(table = self.table.name(), "unmarshal id counter failed: {e}");
                    Ok(0)
                }
            },
        }
    }

    /// Stage a new counter value; it becomes durable with the next
    /// checkpoint. Call only while holding [`Self::counter_lock_id`].
    pub fn set_id_counter(&self, v: i64) -> DbResult<()> {
        if v != self.get_id_counter()? {
            let mut value = Octets::with_capacity(9);
            value.marshal_varint(v);
            self.storage.put(self.counter_key.clone(), value);
        }
        Ok(())
    }

    /// Allocate the next id. Ids start at 1; 0 stays reserved.
    pub fn alloc_id(&self) -> DbResult<i64> {
        let next = (self.get_id_counter()? + 1).max(1);
        self.set_id_counter(next)?;
        Ok(next)
    }

    /// Lock id that serializes counter updates. Shares the pool with
    /// record locks; collisions are harmless.
    pub fn counter_lock_id(&self) -> u32 {
        self.table.lock_id(&0)
    }

    /// Raw bytes of the counter's storage key.
    pub fn counter_key(&self) -> &[u8] {
        &self.counter_key
    }
}
