//! Anonymous spill files
//!
//! Records are appended as frames `[CRC: 4][Len: 4][Payload: N]`, big
//! endian, the payload being the bincode encoding of one record. Reads
//! consume the frames in the order they were written and may interleave
//! with appends.

use crate::error::{Result, SqueezeError};
use bytes::{BufMut, BytesMut};
use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;

const FRAME_HEADER_SIZE: usize = 8;

/// FIFO of records in an unnamed temporary file, removed when dropped.
pub(crate) struct SpillFile<T> {
    pub(crate) file: File,
    write_offset: u64,
    read_offset: u64,
    pending: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> SpillFile<T> {
    pub fn create() -> Result<Self> {
        Ok(Self {
            file: tempfile::tempfile()?,
            write_offset: 0,
            read_offset: 0,
            pending: 0,
            _record: PhantomData,
        })
    }

    /// Records written but not read yet.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn append(&mut self, record: &T) -> Result<()> {
        let payload = bincode::serialize(record)?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_u32(crc);
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);

        self.file.seek(SeekFrom::Start(self.write_offset))?;
        self.file.write_all(&frame)?;
        self.write_offset += frame.len() as u64;
        self.pending += 1;
        Ok(())
    }

    pub fn read_next(&mut self) -> Result<Option<T>> {
        if self.pending == 0 {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(self.read_offset))?;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.file.read_exact(&mut header)?;
        let stored_crc = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload)?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return Err(SqueezeError::internal(format!(
                "CRC mismatch in spill file at position {}",
                self.read_offset
            )));
        }

        let record = bincode::deserialize(&payload)?;
        self.read_offset += (FRAME_HEADER_SIZE + len) as u64;
        self.pending -= 1;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_interleave_with_appends() {
        let mut spill = SpillFile::<String>::create().unwrap();
        spill.append(&"a".to_string()).unwrap();
        spill.append(&"b".to_string()).unwrap();
        assert_eq!(spill.read_next().unwrap().as_deref(), Some("a"));

        spill.append(&"c".to_string()).unwrap();
        assert_eq!(spill.pending(), 2);
        assert_eq!(spill.read_next().unwrap().as_deref(), Some("b"));
        assert_eq!(spill.read_next().unwrap().as_deref(), Some("c"));
        assert_eq!(spill.read_next().unwrap(), None);
    }
}
