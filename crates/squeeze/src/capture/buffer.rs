//! Spillable change buffer
//!
//! Decoded events are queued in memory until their accounted size reaches the
//! ceiling; from then on every new event is appended to an anonymous spill
//! file until the buffer has been drained again. Events leave the buffer in
//! the order they arrived, whichever side of the spill boundary they are on.
//!
//! Spilled events use the frame format of [`crate::spill`], one bincode
//! encoded [`ChangeEvent`] per frame.

use super::event::ChangeEvent;
use crate::error::Result;
use crate::spill::SpillFile;
use std::collections::VecDeque;
use tracing::debug;

/// FIFO of captured events, bounded in memory and spilling to disk.
pub struct ChangeBuffer {
    memory: VecDeque<ChangeEvent>,
    memory_bytes: usize,
    ceiling: usize,
    spill: Option<SpillFile<ChangeEvent>>,
    total_spilled: u64,
}

impl ChangeBuffer {
    /// Create a buffer keeping at most `ceiling` accounted bytes in memory.
    pub fn new(ceiling: usize) -> Self {
        Self {
            memory: VecDeque::new(),
            memory_bytes: 0,
            ceiling,
            spill: None,
            total_spilled: 0,
        }
    }

    pub fn push(&mut self, event: ChangeEvent) -> Result<()> {
        let size = event.size();
        let over_ceiling = !self.memory.is_empty() && self.memory_bytes + size > self.ceiling;

        if self.spill.is_none() && over_ceiling {
            debug!(
                "Change buffer reached {} bytes, spilling to disk",
                self.memory_bytes
            );
            self.spill = Some(SpillFile::create()?);
        }

        match self.spill.as_mut() {
            Some(spill) => {
                spill.append(&event)?;
                self.total_spilled += 1;
            }
            None => {
                self.memory_bytes += size;
                self.memory.push_back(event);
            }
        }
        Ok(())
    }

    /// Remove the oldest event.
    pub fn pop(&mut self) -> Result<Option<ChangeEvent>> {
        if let Some(event) = self.memory.pop_front() {
            self.memory_bytes -= event.size();
            return Ok(Some(event));
        }

        let Some(spill) = self.spill.as_mut() else {
            return Ok(None);
        };
        let event = spill.read_next()?;
        if spill.pending() == 0 {
            self.spill = None;
        }
        Ok(event)
    }

    /// Consume the buffered events in arrival order.
    ///
    /// Events not pulled from the stream stay buffered.
    pub fn drain(&mut self) -> ChangeStream<'_> {
        ChangeStream { buffer: self }
    }

    pub fn len(&self) -> usize {
        self.memory.len() + self.spill.as_ref().map_or(0, |s| s.pending())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spilling(&self) -> bool {
        self.spill.is_some()
    }

    /// Events ever written to a spill file.
    pub fn total_spilled(&self) -> u64 {
        self.total_spilled
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }
}

impl std::fmt::Debug for ChangeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBuffer")
            .field("in_memory", &self.memory.len())
            .field("memory_bytes", &self.memory_bytes)
            .field("ceiling", &self.ceiling)
            .field("spilled_pending", &self.spill.as_ref().map_or(0, |s| s.pending()))
            .finish()
    }
}

/// Single-pass iterator over a buffer's events.
pub struct ChangeStream<'a> {
    buffer: &'a mut ChangeBuffer,
}

impl Iterator for ChangeStream<'_> {
    type Item = Result<ChangeEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buffer.pop().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Lsn, Row, Value};
    use std::io::{Seek, SeekFrom, Write};

    fn event(n: u64) -> ChangeEvent {
        ChangeEvent::insert(
            Lsn(n),
            Row::new(vec![Value::Int(n as i64), Value::text("x".repeat(100))]),
        )
    }

    #[test]
    fn test_memory_only() {
        let mut buffer = ChangeBuffer::new(1024 * 1024);
        for n in 0..10 {
            buffer.push(event(n)).unwrap();
        }
        assert!(!buffer.is_spilling());
        assert_eq!(buffer.len(), 10);

        let lsns: Vec<u64> = buffer.drain().map(|e| e.unwrap().lsn.0).collect();
        assert_eq!(lsns, (0..10).collect::<Vec<_>>());
        assert!(buffer.is_empty());
        assert_eq!(buffer.memory_bytes(), 0);
    }

    #[test]
    fn test_order_preserved_across_spill_boundary() {
        let ceiling = event(0).size() * 3;
        let mut buffer = ChangeBuffer::new(ceiling);
        for n in 0..10 {
            buffer.push(event(n)).unwrap();
        }
        assert!(buffer.is_spilling());
        assert_eq!(buffer.total_spilled(), 7);
        assert_eq!(buffer.len(), 10);

        // partially drain, then keep appending while spilled events remain
        let first: Vec<u64> = buffer.drain().take(5).map(|e| e.unwrap().lsn.0).collect();
        assert_eq!(first, vec![0, 1, 2, 3, 4]);
        for n in 10..13 {
            buffer.push(event(n)).unwrap();
        }

        let rest: Vec<u64> = buffer.drain().map(|e| e.unwrap().lsn.0).collect();
        assert_eq!(rest, (5..13).collect::<Vec<_>>());
        assert!(!buffer.is_spilling());

        // back in memory once the spill file is gone
        buffer.push(event(20)).unwrap();
        assert!(!buffer.is_spilling());
    }

    #[test]
    fn test_first_event_always_fits() {
        let mut buffer = ChangeBuffer::new(1);
        buffer.push(event(1)).unwrap();
        assert!(!buffer.is_spilling());
        buffer.push(event(2)).unwrap();
        assert!(buffer.is_spilling());
    }

    #[test]
    fn test_corrupted_frame_detected() {
        let mut buffer = ChangeBuffer::new(1);
        buffer.push(event(1)).unwrap();
        buffer.push(event(2)).unwrap();

        let spill = buffer.spill.as_mut().unwrap();
        spill.file.seek(SeekFrom::Start(12)).unwrap();
        spill.file.write_all(&[0xFF, 0xFF]).unwrap();

        assert!(buffer.pop().unwrap().is_some());
        let err = buffer.pop().unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }
}
