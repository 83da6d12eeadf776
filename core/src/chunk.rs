/// Bounded output buffer and the chunked content-generation loop
///
/// A generator writes one chunk (a header, a row, a trailer) at a time. If a
/// chunk does not fit in what is left of the buffer it is rolled back whole,
/// so the generator must only advance its own state after a chunk fitted.
use crate::error::{MeshmsError, Result};
use crate::status::MeshmsStatus;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::io;
use std::time::Instant;

/// Bounded byte buffer that records, rather than fails, an overrun.
#[derive(Debug)]
pub struct ChunkBuf {
    buf: Vec<u8>,
    capacity: usize,
    /// Bytes written so far, including those that did not fit
    attempted: usize,
}

impl ChunkBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            attempted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn overrun(&self) -> bool {
        self.attempted > self.capacity
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.attempted += bytes.len();
        if self.attempted <= self.capacity {
            self.buf.extend_from_slice(bytes);
        }
    }

    pub fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// JSON string literal, or `null`.
    pub fn push_json_str(&mut self, s: Option<&str>) -> Result<()> {
        match s {
            Some(s) => self.push_json(s),
            None => {
                self.push_str("null");
                Ok(())
            }
        }
    }

    pub fn push_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        serde_json::to_writer(&mut *self, value)?;
        Ok(())
    }

    /// Quoted upper-case hex string.
    pub fn push_json_hex(&mut self, hex: &str) {
        self.push_str("\"");
        self.push_str(hex);
        self.push_str("\"");
    }

    pub fn push_json_bool(&mut self, value: bool) {
        self.push_str(if value { "true" } else { "false" });
    }

    fn rollback(&mut self, mark: usize) {
        self.buf.truncate(mark);
        self.attempted = mark;
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

impl fmt::Write for ChunkBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl io::Write for ChunkBuf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.push_bytes(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Phases shared by the list generators; only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListPhase {
    Header,
    Rows,
    End,
    Done,
}

/// What a generator wants after writing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    More,
    Done,
    /// Nothing more until `Instant` (or an external wake-up)
    Paused(Instant),
}

pub trait ContentGenerator: Send {
    /// Called once before each fill; may reacquire resources released by a pause.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Write at most one chunk into `buf`.
    fn content_chunk(&mut self, buf: &mut ChunkBuf, now: Instant) -> Result<ChunkStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// Buffer full; call again
    More,
    Done,
    Paused(Instant),
    /// The next chunk needs a buffer of at least this many bytes
    Need(usize),
    /// The generator gave up; `Filled::error` says why
    Failed,
}

#[derive(Debug)]
pub struct Filled {
    pub bytes: Bytes,
    pub status: FillStatus,
    pub error: Option<MeshmsError>,
}

impl Filled {
    fn new(buf: ChunkBuf, status: FillStatus) -> Self {
        Self {
            bytes: buf.into_bytes(),
            status,
            error: None,
        }
    }
}

/// Run `generator` chunk by chunk into a buffer of `capacity` bytes.
///
/// A generator error after some chunks have been written does not discard
/// them: the completed chunks come back with [`FillStatus::Failed`] and the
/// error. Only the failing chunk is rolled back.
pub fn fill<G: ContentGenerator + ?Sized>(
    generator: &mut G,
    capacity: usize,
    now: Instant,
) -> Result<Filled> {
    generator.prepare()?;
    let mut buf = ChunkBuf::with_capacity(capacity);
    loop {
        let mark = buf.len();
        let status = match generator.content_chunk(&mut buf, now) {
            Ok(status) => status,
            Err(e) => {
                buf.rollback(mark);
                return Ok(Filled {
                    error: Some(e),
                    ..Filled::new(buf, FillStatus::Failed)
                });
            }
        };
        if buf.overrun() {
            let needed = buf.attempted - mark;
            buf.rollback(mark);
            let status = if buf.is_empty() {
                FillStatus::Need(needed)
            } else {
                FillStatus::More
            };
            return Ok(Filled::new(buf, status));
        }
        let status = match status {
            ChunkStatus::More => continue,
            ChunkStatus::Done => FillStatus::Done,
            ChunkStatus::Paused(wake_at) => FillStatus::Paused(wake_at),
        };
        return Ok(Filled::new(buf, status));
    }
}

/// Drive `generator` to completion with no pauses; test helper and
/// one-shot renderer.
pub fn generate_all<G: ContentGenerator + ?Sized>(
    generator: &mut G,
    capacity: usize,
    now: Instant,
) -> Result<(Vec<u8>, FillStatus)> {
    let mut out = Vec::new();
    let mut capacity = capacity;
    loop {
        let filled = fill(generator, capacity, now)?;
        out.extend_from_slice(&filled.bytes);
        match filled.status {
            FillStatus::More => {}
            FillStatus::Need(needed) => capacity = needed,
            FillStatus::Failed => {
                return Err(filled.error.unwrap_or(MeshmsError::Status(MeshmsStatus::Error)));
            }
            status @ (FillStatus::Done | FillStatus::Paused(_)) => return Ok((out, status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits `rows` fixed-size rows, advancing only when a row fits.
    struct Rows {
        next: usize,
        rows: usize,
    }

    impl ContentGenerator for Rows {
        fn content_chunk(&mut self, buf: &mut ChunkBuf, _now: Instant) -> Result<ChunkStatus> {
            if self.next == self.rows {
                return Ok(ChunkStatus::Done);
            }
            buf.push_str(&format!("[{:04}]", self.next));
            if !buf.overrun() {
                self.next += 1;
            }
            Ok(ChunkStatus::More)
        }
    }

    #[test]
    fn test_overrun_rolls_back_partial_chunk() {
        let mut buf = ChunkBuf::with_capacity(8);
        buf.push_str("12345");
        assert!(!buf.overrun());
        buf.push_str("6789");
        assert!(buf.overrun());
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_fill_stops_at_row_boundary() {
        let mut rows = Rows { next: 0, rows: 5 };
        let filled = fill(&mut rows, 15, Instant::now()).unwrap();
        assert_eq!(&filled.bytes[..], b"[0000][0001]");
        assert_eq!(filled.status, FillStatus::More);

        let filled = fill(&mut rows, 100, Instant::now()).unwrap();
        assert_eq!(&filled.bytes[..], b"[0002][0003][0004]");
        assert_eq!(filled.status, FillStatus::Done);
    }

    #[test]
    fn test_fill_reports_needed_size() {
        let mut rows = Rows { next: 0, rows: 1 };
        let filled = fill(&mut rows, 3, Instant::now()).unwrap();
        assert!(filled.bytes.is_empty());
        assert_eq!(filled.status, FillStatus::Need(6));

        let (out, status) = generate_all(&mut rows, 3, Instant::now()).unwrap();
        assert_eq!(out, b"[0000]");
        assert_eq!(status, FillStatus::Done);
    }

    /// Writes `ok` rows, then half a row, then fails.
    struct BreaksAfter {
        written: usize,
        ok: usize,
    }

    impl ContentGenerator for BreaksAfter {
        fn content_chunk(&mut self, buf: &mut ChunkBuf, _now: Instant) -> Result<ChunkStatus> {
            if self.written == self.ok {
                buf.push_str("[tor");
                return Err(MeshmsError::Status(MeshmsStatus::ProtocolFault));
            }
            buf.push_str(&format!("[{:04}]", self.written));
            self.written += 1;
            Ok(ChunkStatus::More)
        }
    }

    #[test]
    fn test_fill_keeps_chunks_written_before_failure() {
        let mut gen = BreaksAfter { written: 0, ok: 2 };
        let filled = fill(&mut gen, 4096, Instant::now()).unwrap();
        assert_eq!(&filled.bytes[..], b"[0000][0001]");
        assert_eq!(filled.status, FillStatus::Failed);
        assert!(matches!(
            filled.error,
            Some(MeshmsError::Status(MeshmsStatus::ProtocolFault))
        ));

        let mut gen = BreaksAfter { written: 0, ok: 0 };
        assert!(matches!(
            generate_all(&mut gen, 4096, Instant::now()),
            Err(MeshmsError::Status(MeshmsStatus::ProtocolFault))
        ));
    }

    #[test]
    fn test_json_helpers() {
        let mut buf = ChunkBuf::with_capacity(64);
        buf.push_json_str(Some("say \"hi\"\n")).unwrap();
        buf.push_str(",");
        buf.push_json_str(None).unwrap();
        buf.push_str(",");
        buf.push_json_bool(true);
        assert_eq!(&buf.into_bytes()[..], b"\"say \\\"hi\\\"\\n\",null,true");
    }
}
