//! Record (bean) traits and tagged field-stream helpers.
//!
//! Generated record types implement [`Record`]; table key types implement
//! [`RecordKey`]. The free functions here are the encode/decode vocabulary
//! generated code is written against: `write_*_field` emitters that skip
//! default values, a `read_fields` dispatch loop, and skippers that let a
//! decoder step over unknown tags.

use std::collections::BTreeMap;

use cairn_common::error::MarshalError;

use crate::octets::Octets;
use crate::reader::OctetsReader;

/// Field kind: signed varint payload.
pub const KIND_INT: u32 = 0;
/// Field kind: length-prefixed bytes/string payload.
pub const KIND_STR: u32 = 1;
/// Field kind: nested record, zero-terminated.
pub const KIND_BEAN: u32 = 2;
/// Field kind: container, introduced by a one-byte sub-header.
pub const KIND_VAR: u32 = 3;

/// Container sub-headers: `0..5` are lists (3 reserved), `0x80..0xFF` are
/// maps carrying `(key_kind << 3 | value_kind)` in the low bits.
pub const VAR_LIST_INT: u8 = 0;
pub const VAR_LIST_STR: u8 = 1;
pub const VAR_LIST_BEAN: u8 = 2;
pub const VAR_LIST_F32: u8 = 4;
pub const VAR_LIST_F64: u8 = 5;
pub const VAR_MAP_BIT: u8 = 0x80;

/// A typed, serializable record value. Implementations are normally
/// produced by the schema compiler; hand-written ones only need `Default`,
/// field-wise equality and the two marshal hooks.
pub trait Record:
    Default + Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static
{
    /// Stable wire identifier of this record type.
    fn type_id() -> u32;

    /// Initial buffer capacity hint for one encoded value.
    fn init_size() -> usize {
        16
    }

    /// Upper bound on one encoded value, for framing layers that care.
    fn max_size() -> usize {
        usize::MAX
    }

    /// Append the tagged field stream including the zero terminator.
    fn marshal(&self, out: &mut Octets);

    /// Decode fields until the terminator, skipping unknown tags.
    fn unmarshal(&mut self, r: &mut OctetsReader<'_>) -> Result<(), MarshalError>;

    /// Fresh instance with every field at its default.
    fn create() -> Self {
        Self::default()
    }
}

/// A table key type: byte-encodable (order-preserving within a table) and
/// hashable onto the record-lock pool.
pub trait RecordKey:
    Clone + Eq + std::hash::Hash + Ord + std::fmt::Debug + Send + Sync + 'static
{
    /// Append the key bytes. The encoding must preserve the key order
    /// under a bytewise comparison of the result.
    fn marshal_key(&self, out: &mut Octets);

    /// Decode a key from the remainder of `r`.
    fn unmarshal_key(r: &mut OctetsReader<'_>) -> Result<Self, MarshalError>;

    /// Stable hash for lock sharding. Must not vary between runs.
    fn lock_hash(&self) -> u32;
}

impl RecordKey for i32 {
    fn marshal_key(&self, out: &mut Octets) {
        out.marshal_varint(*self as i64);
    }

    fn unmarshal_key(r: &mut OctetsReader<'_>) -> Result<Self, MarshalError> {
        Ok(r.unmarshal_varint()? as i32)
    }

    fn lock_hash(&self) -> u32 {
        *self as u32
    }
}

impl RecordKey for i64 {
    fn marshal_key(&self, out: &mut Octets) {
        out.marshal_varint(*self);
    }

    fn unmarshal_key(r: &mut OctetsReader<'_>) -> Result<Self, MarshalError> {
        r.unmarshal_varint()
    }

    fn lock_hash(&self) -> u32 {
        (*self ^ (*self >> 32)) as u32
    }
}

impl RecordKey for String {
    fn marshal_key(&self, out: &mut Octets) {
        out.append_slice(self.as_bytes());
    }

    fn unmarshal_key(r: &mut OctetsReader<'_>) -> Result<Self, MarshalError> {
        Ok(String::from_utf8_lossy(r.take_remaining()).into_owned())
    }

    fn lock_hash(&self) -> u32 {
        fnv1a(self.as_bytes())
    }
}

impl RecordKey for Octets {
    fn marshal_key(&self, out: &mut Octets) {
        out.append_slice(self);
    }

    fn unmarshal_key(r: &mut OctetsReader<'_>) -> Result<Self, MarshalError> {
        Ok(Octets::from_slice(r.take_remaining()))
    }

    fn lock_hash(&self) -> u32 {
        fnv1a(self)
    }
}

/// FNV-1a, the stable byte hash used for lock sharding.
pub fn fnv1a(data: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in data {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

// ── Field emitters ──────────────────────────────────────────────────────
// Scalar and container fields at their default value are omitted; the
// decoder starts from `create()` so absent fields read back as defaults.

pub fn write_int_field(out: &mut Octets, tag: u32, v: i64) {
    if v != 0 {
        out.marshal_tag(tag, KIND_INT);
        out.marshal_varint(v);
    }
}

pub fn write_str_field(out: &mut Octets, tag: u32, v: &str) {
    if !v.is_empty() {
        out.marshal_tag(tag, KIND_STR);
        out.marshal_str(v);
    }
}

pub fn write_bytes_field(out: &mut Octets, tag: u32, v: &[u8]) {
    if !v.is_empty() {
        out.marshal_tag(tag, KIND_STR);
        out.marshal_bytes(v);
    }
}

pub fn write_bean_field<R: Record>(out: &mut Octets, tag: u32, v: &R) {
    out.marshal_tag(tag, KIND_BEAN);
    v.marshal(out);
}

pub fn write_int_list_field(out: &mut Octets, tag: u32, items: &[i64]) {
    if !items.is_empty() {
        out.marshal_tag(tag, KIND_VAR);
        out.marshal_u8(VAR_LIST_INT);
        out.marshal_uvarint(items.len() as u32);
        for &v in items {
            out.marshal_varint(v);
        }
    }
}

pub fn write_str_list_field(out: &mut Octets, tag: u32, items: &[String]) {
    if !items.is_empty() {
        out.marshal_tag(tag, KIND_VAR);
        out.marshal_u8(VAR_LIST_STR);
        out.marshal_uvarint(items.len() as u32);
        for v in items {
            out.marshal_str(v);
        }
    }
}

pub fn write_bean_list_field<R: Record>(out: &mut Octets, tag: u32, items: &[R]) {
    if !items.is_empty() {
        out.marshal_tag(tag, KIND_VAR);
        out.marshal_u8(VAR_LIST_BEAN);
        out.marshal_uvarint(items.len() as u32);
        for v in items {
            v.marshal(out);
        }
    }
}

pub fn write_f32_list_field(out: &mut Octets, tag: u32, items: &[f32]) {
    if !items.is_empty() {
        out.marshal_tag(tag, KIND_VAR);
        out.marshal_u8(VAR_LIST_F32);
        out.marshal_uvarint(items.len() as u32);
        for &v in items {
            out.marshal_f32(v);
        }
    }
}

pub fn write_f64_list_field(out: &mut Octets, tag: u32, items: &[f64]) {
    if !items.is_empty() {
        out.marshal_tag(tag, KIND_VAR);
        out.marshal_u8(VAR_LIST_F64);
        out.marshal_uvarint(items.len() as u32);
        for &v in items {
            out.marshal_f64(v);
        }
    }
}

pub fn write_int_int_map_field(out: &mut Octets, tag: u32, map: &BTreeMap<i64, i64>) {
    if !map.is_empty() {
        out.marshal_tag(tag, KIND_VAR);
        out.marshal_u8(VAR_MAP_BIT | ((KIND_INT as u8) << 3) | KIND_INT as u8);
        out.marshal_uvarint(map.len() as u32);
        for (k, v) in map {
            out.marshal_varint(*k);
            out.marshal_varint(*v);
        }
    }
}

pub fn write_int_str_map_field(out: &mut Octets, tag: u32, map: &BTreeMap<i64, String>) {
    if !map.is_empty() {
        out.marshal_tag(tag, KIND_VAR);
        out.marshal_u8(VAR_MAP_BIT | ((KIND_INT as u8) << 3) | KIND_STR as u8);
        out.marshal_uvarint(map.len() as u32);
        for (k, v) in map {
            out.marshal_varint(*k);
            out.marshal_str(v);
        }
    }
}

/// Close a record body.
pub fn write_terminator(out: &mut Octets) {
    out.marshal_u8(0);
}

// ── Field readers ───────────────────────────────────────────────────────

/// Drive the decode loop for one record body. `f` returns `Ok(true)` when
/// it consumed the field payload; `Ok(false)` leaves the payload to be
/// skipped as an unknown tag.
pub fn read_fields(
    r: &mut OctetsReader<'_>,
    mut f: impl FnMut(u32, u32, &mut OctetsReader<'_>) -> Result<bool, MarshalError>,
) -> Result<(), MarshalError> {
    loop {
        let head = r.unmarshal_uvarint()?;
        if head == 0 {
            return Ok(());
        }
        let tag = head >> 2;
        let kind = head & 3;
        if !f(tag, kind, r)? {
            skip_field(r, kind)?;
        }
    }
}

fn expect_kind(kind: u32, want: u32) -> Result<(), MarshalError> {
    if kind != want {
        return Err(MarshalError::BadFormat(format!(
            "field kind {kind} where {want} expected"
        )));
    }
    Ok(())
}

pub fn read_int(kind: u32, r: &mut OctetsReader<'_>) -> Result<i64, MarshalError> {
    expect_kind(kind, KIND_INT)?;
    r.unmarshal_varint()
}

pub fn read_str(kind: u32, r: &mut OctetsReader<'_>) -> Result<String, MarshalError> {
    expect_kind(kind, KIND_STR)?;
    r.unmarshal_string()
}

pub fn read_octets(kind: u32, r: &mut OctetsReader<'_>) -> Result<Octets, MarshalError> {
    expect_kind(kind, KIND_STR)?;
    Ok(Octets::from_slice(r.unmarshal_bytes()?))
}

pub fn read_bean<R: Record>(kind: u32, r: &mut OctetsReader<'_>) -> Result<R, MarshalError> {
    expect_kind(kind, KIND_BEAN)?;
    let mut v = R::create();
    v.unmarshal(r)?;
    Ok(v)
}

fn read_var_header(
    kind: u32,
    r: &mut OctetsReader<'_>,
    want_sub: u8,
) -> Result<u32, MarshalError> {
    expect_kind(kind, KIND_VAR)?;
    let sub = r.unmarshal_u8()?;
    if sub != want_sub {
        return Err(MarshalError::BadFormat(format!(
            "container sub-header {sub:#04x} where {want_sub:#04x} expected"
        )));
    }
    r.unmarshal_uvarint()
}

pub fn read_int_list(kind: u32, r: &mut OctetsReader<'_>) -> Result<Vec<i64>, MarshalError> {
    let n = read_var_header(kind, r, VAR_LIST_INT)?;
    let mut items = Vec::with_capacity(n.min(4096) as usize);
    for _ in 0..n {
        items.push(r.unmarshal_varint()?);
    }
    Ok(items)
}

pub fn read_str_list(kind: u32, r: &mut OctetsReader<'_>) -> Result<Vec<String>, MarshalError> {
    let n = read_var_header(kind, r, VAR_LIST_STR)?;
    let mut items = Vec::with_capacity(n.min(4096) as usize);
    for _ in 0..n {
        items.push(r.unmarshal_string()?);
    }
    Ok(items)
}

pub fn read_bean_list<R: Record>(
    kind: u32,
    r: &mut OctetsReader<'_>,
) -> Result<Vec<R>, MarshalError> {
    let n = read_var_header(kind, r, VAR_LIST_BEAN)?;
    let mut items = Vec::with_capacity(n.min(4096) as usize);
    for _ in 0..n {
        let mut v = R::create();
        v.unmarshal(r)?;
        items.push(v);
    }
    Ok(items)
}

pub fn read_f32_list(kind: u32, r: &mut OctetsReader<'_>) -> Result<Vec<f32>, MarshalError> {
    let n = read_var_header(kind, r, VAR_LIST_F32)?;
    let mut items = Vec::with_capacity(n.min(4096) as usize);
    for _ in 0..n {
        items.push(r.unmarshal_f32()?);
    }
    Ok(items)
}

pub fn read_f64_list(kind: u32, r: &mut OctetsReader<'_>) -> Result<Vec<f64>, MarshalError> {
    let n = read_var_header(kind, r, VAR_LIST_F64)?;
    let mut items = Vec::with_capacity(n.min(4096) as usize);
    for _ in 0..n {
        items.push(r.unmarshal_f64()?);
    }
    Ok(items)
}

pub fn read_int_int_map(
    kind: u32,
    r: &mut OctetsReader<'_>,
) -> Result<BTreeMap<i64, i64>, MarshalError> {
    let sub = VAR_MAP_BIT | ((KIND_INT as u8) << 3) | KIND_INT as u8;
    let n = read_var_header(kind, r, sub)?;
    let mut map = BTreeMap::new();
    for _ in 0..n {
        let k = r.unmarshal_varint()?;
        let v = r.unmarshal_varint()?;
        map.insert(k, v);
    }
    Ok(map)
}

pub fn read_int_str_map(
    kind: u32,
    r: &mut OctetsReader<'_>,
) -> Result<BTreeMap<i64, String>, MarshalError> {
    let sub = VAR_MAP_BIT | ((KIND_INT as u8) << 3) | KIND_STR as u8;
    let n = read_var_header(kind, r, sub)?;
    let mut map = BTreeMap::new();
    for _ in 0..n {
        let k = r.unmarshal_varint()?;
        let v = r.unmarshal_string()?;
        map.insert(k, v);
    }
    Ok(map)
}

// ── Skippers ────────────────────────────────────────────────────────────

/// Skip one field payload of the given kind.
pub fn skip_field(r: &mut OctetsReader<'_>, kind: u32) -> Result<(), MarshalError> {
    match kind {
        KIND_INT => {
            r.unmarshal_varint()?;
        }
        KIND_STR => {
            let len = r.unmarshal_uvarint()? as usize;
            r.skip(len)?;
        }
        KIND_BEAN => skip_bean(r)?,
        KIND_VAR => skip_var(r)?,
        _ => unreachable!("kind is two bits"),
    }
    Ok(())
}

fn skip_bean(r: &mut OctetsReader<'_>) -> Result<(), MarshalError> {
    loop {
        let head = r.unmarshal_uvarint()?;
        if head == 0 {
            return Ok(());
        }
        skip_field(r, head & 3)?;
    }
}

fn skip_element(r: &mut OctetsReader<'_>, kind: u8) -> Result<(), MarshalError> {
    match kind {
        VAR_LIST_INT => {
            r.unmarshal_varint()?;
        }
        VAR_LIST_STR => {
            let len = r.unmarshal_uvarint()? as usize;
            r.skip(len)?;
        }
        VAR_LIST_BEAN => skip_bean(r)?,
        VAR_LIST_F32 => r.skip(4)?,
        VAR_LIST_F64 => r.skip(8)?,
        other => {
            return Err(MarshalError::BadFormat(format!(
                "reserved element kind {other:#04x}"
            )))
        }
    }
    Ok(())
}

/// Skip one container payload starting at its sub-header.
pub fn skip_var(r: &mut OctetsReader<'_>) -> Result<(), MarshalError> {
    let sub = r.unmarshal_u8()?;
    if sub & VAR_MAP_BIT != 0 {
        let kk = (sub >> 3) & 0x0F;
        let vk = sub & 0x07;
        let n = r.unmarshal_uvarint()?;
        for _ in 0..n {
            skip_element(r, kk)?;
            skip_element(r, vk)?;
        }
        return Ok(());
    }
    match sub {
        VAR_LIST_INT | VAR_LIST_STR | VAR_LIST_BEAN | VAR_LIST_F32 | VAR_LIST_F64 => {
            let n = r.unmarshal_uvarint()?;
            for _ in 0..n {
                skip_element(r, sub)?;
            }
            Ok(())
        }
        other => Err(MarshalError::BadFormat(format!(
            "reserved container sub-header {other:#04x}"
        ))),
    }
}
