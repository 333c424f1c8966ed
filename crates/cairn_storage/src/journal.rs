//! CRC-framed batch journal.
//!
//! Each frame is one atomic batch: `magic || payload_len || crc32c ||
//! payload`. Recovery reads frames in order and stops at the first torn
//! or corrupt frame, dropping the whole trailing batch — a crash between
//! frames therefore leaves exactly the previously committed state.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use cairn_codec::{Octets, OctetsReader};
use cairn_common::error::StorageError;

pub(crate) const FRAME_MAGIC: [u8; 4] = *b"CARN";
pub(crate) const FRAME_HEADER: usize = 12;

/// Encode a batch of entries into one frame payload.
pub(crate) fn encode_batch<'a>(
    entries: impl ExactSizeIterator<Item = (&'a [u8], Option<&'a [u8]>)>,
) -> Octets {
    let mut payload = Octets::with_capacity(64);
    payload.marshal_uvarint(entries.len() as u32);
    for (key, value) in entries {
        payload.marshal_bytes(key);
        match value {
            Some(v) => {
                payload.marshal_u8(1);
                payload.marshal_bytes(v);
            }
            None => {
                payload.marshal_u8(0);
            }
        }
    }
    payload
}

/// Decode one frame payload back into entries.
pub(crate) fn decode_batch(payload: &[u8]) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>, StorageError> {
    let mut r = OctetsReader::new(payload);
    let count = r
        .unmarshal_uvarint()
        .map_err(|e| StorageError::Corrupt(format!("batch count: {e}")))?;
    let mut entries = Vec::with_capacity(count.min(1 << 16) as usize);
    for _ in 0..count {
        let key = r
            .unmarshal_bytes()
            .map_err(|e| StorageError::Corrupt(format!("batch key: {e}")))?
            .to_vec();
        let tag = r
            .unmarshal_u8()
            .map_err(|e| StorageError::Corrupt(format!("batch tag: {e}")))?;
        let value = match tag {
            0 => None,
            1 => Some(
                r.unmarshal_bytes()
                    .map_err(|e| StorageError::Corrupt(format!("batch value: {e}")))?
                    .to_vec(),
            ),
            other => {
                return Err(StorageError::Corrupt(format!("batch entry tag {other}")));
            }
        };
        entries.push((key, value));
    }
    Ok(entries)
}

/// Append-only frame writer over one file.
pub(crate) struct FrameWriter {
    file: File,
    path: PathBuf,
    bytes: u64,
}

impl FrameWriter {
    pub(crate) fn open(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let bytes = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            bytes,
        })
    }

    pub(crate) fn append_frame(&mut self, payload: &[u8]) -> Result<(), StorageError> {
        let mut header = [0u8; FRAME_HEADER];
        header[0..4].copy_from_slice(&FRAME_MAGIC);
        header[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[8..12].copy_from_slice(&crc32c::crc32c(payload).to_le_bytes());
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.bytes += (FRAME_HEADER + payload.len()) as u64;
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<(), StorageError> {
        self.file.sync_data()?;
        Ok(())
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Drop all frames, e.g. after their contents moved into a snapshot.
    pub(crate) fn reset(&mut self) -> Result<(), StorageError> {
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.file.sync_data()?;
        self.bytes = 0;
        // Back to append mode for subsequent frames.
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

/// Read every intact frame payload from `path`, in order. A torn or
/// corrupt tail ends recovery; a missing file yields no frames.
pub(crate) fn read_frames(path: &Path) -> Result<Vec<Vec<u8>>, StorageError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut frames = Vec::new();
    let mut offset = 0usize;
    while offset + FRAME_HEADER <= data.len() {
        if data[offset..offset + 4] != FRAME_MAGIC {
            tracing::warn!(
                path = %path.display(),
                offset,
                "bad frame magic, dropping journal tail"
            );
            break;
        }
        let len = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;
        let crc = u32::from_le_bytes([
            data[offset + 8],
            data[offset + 9],
            data[offset + 10],
            data[offset + 11],
        ]);
        let start = offset + FRAME_HEADER;
        if start + len > data.len() {
            // Torn write: the crash point.
            tracing::warn!(
                path = %path.display(),
                offset,
                need = len,
                have = data.len() - start,
                "torn frame, dropping journal tail"
            );
            break;
        }
        let payload = &data[start..start + len];
        if crc32c::crc32c(payload) != crc {
            tracing::warn!(
                path = %path.display(),
                offset,
                "frame checksum mismatch, dropping journal tail"
            );
            break;
        }
        frames.push(payload.to_vec());
        offset = start + len;
    }
    if offset < data.len() && offset + FRAME_HEADER > data.len() {
        tracing::warn!(
            path = %path.display(),
            offset,
            trailing = data.len() - offset,
            "truncated frame header at journal tail"
        );
    }
    Ok(frames)
}
