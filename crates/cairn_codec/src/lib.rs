//! Binary codec for record values and wire messages.
//!
//! The encoding is a compact, tag-driven field stream: every field is
//! `uvarint(tag << 2 | kind)` followed by a kind-specific payload, and a
//! record body ends with a single zero byte. Integers use a prefix-length
//! signed varint good for ±2⁵²; lengths use an unsigned varint good for
//! 32 bits. Unknown tags are skippable, so old decoders tolerate new
//! fields.

pub mod octets;
pub mod reader;
pub mod record;

pub use octets::Octets;
pub use reader::OctetsReader;
pub use record::{Record, RecordKey};
