/// `messagelist.json`: the interleaved message log of one conversation
///
/// Plain mode lists every entry, newest first. Newsince mode lists only
/// entries newer than a resumption token and, once it has caught up, pauses
/// the response until a deadline instead of finishing. While paused the
/// message iterator is closed; it is reopened on the next fill and the
/// newest entry seen at the previous opening becomes the new stopping point,
/// so no row is ever sent twice.
use crate::chunk::{ChunkBuf, ChunkStatus, ContentGenerator, ListPhase};
use crate::error::{MeshmsError, Result};
use crate::sid::Sid;
use crate::status::MeshmsStatus;
use crate::store::{MeshmsStore, MessageEntry, MessageIterator, MessageType, Ply, PlyPair};
use crate::token::MeshmsToken;
use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const HEADERS: [&str; 9] = [
    "type",
    "my_sid",
    "their_sid",
    "offset",
    "token",
    "text",
    "delivered",
    "read",
    "ack_offset",
];

/// A (ply, offset) position in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlyPosition {
    pub ply: Ply,
    pub offset: u64,
}

impl PlyPosition {
    fn of(entry: &MessageEntry) -> Self {
        Self {
            ply: entry.ply,
            offset: entry.offset,
        }
    }

    /// True if `entry` is at or before this position in the same ply.
    fn covers(&self, entry: &MessageEntry) -> bool {
        self.ply == entry.ply && entry.offset <= self.offset
    }
}

#[derive(Debug, Clone, Copy)]
struct Newsince {
    deadline: Instant,
    poll_interval: Duration,
}

pub struct MessageListGenerator {
    store: Arc<dyn MeshmsStore>,
    my_sid: Sid,
    their_sid: Sid,
    /// `None` while closed
    iter: Option<Box<dyn MessageIterator>>,
    finished: bool,
    phase: ListPhase,
    rowcount: usize,
    /// Newest entry seen when the iterator was last opened
    latest: Option<PlyPosition>,
    /// Stop before reaching this position
    token: Option<PlyPosition>,
    /// Persists across reopenings so no ACK row repeats
    highest_ack_offset: u64,
    newsince: Option<Newsince>,
}

impl MessageListGenerator {
    /// Plain listing of the whole conversation.
    pub fn open(store: Arc<dyn MeshmsStore>, my_sid: Sid, their_sid: Sid) -> Result<Self> {
        let mut gen = Self::new(store, my_sid, their_sid);
        gen.reopen()?;
        Ok(gen)
    }

    /// Listing of entries newer than `token`, waiting up to `timeout` from
    /// `now` for some to arrive.
    pub fn open_newsince(
        store: Arc<dyn MeshmsStore>,
        my_sid: Sid,
        their_sid: Sid,
        token: MeshmsToken,
        now: Instant,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let mut gen = Self::new(store, my_sid, their_sid);
        gen.reopen()?;
        let ply = gen
            .iter
            .as_ref()
            .and_then(|iter| iter.plies().which(&token.bundle_id))
            .ok_or_else(|| MeshmsError::NotFound("Unmatched token".to_string()))?;
        gen.token = Some(PlyPosition {
            ply,
            offset: token.offset,
        });
        let deadline = now.checked_add(timeout).ok_or_else(|| {
            MeshmsError::Config(format!("newsince timeout {:?} out of range", timeout))
        })?;
        gen.newsince = Some(Newsince {
            deadline,
            poll_interval,
        });
        Ok(gen)
    }

    fn new(store: Arc<dyn MeshmsStore>, my_sid: Sid, their_sid: Sid) -> Self {
        Self {
            store,
            my_sid,
            their_sid,
            iter: None,
            finished: false,
            phase: ListPhase::Header,
            rowcount: 0,
            latest: None,
            token: None,
            highest_ack_offset: 0,
            newsince: None,
        }
    }

    pub fn phase(&self) -> ListPhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.iter.is_some()
    }

    /// Release the message iterator; the next fill reopens it.
    pub fn close(&mut self) {
        self.iter = None;
    }

    fn reopen(&mut self) -> Result<()> {
        if self.iter.is_some() {
            return Ok(());
        }
        let mut iter = self.store.open_messages(&self.my_sid, &self.their_sid)?;
        let status = iter.prev();
        if status.is_failed() {
            return Err(status.into());
        }
        self.finished = status != MeshmsStatus::Updated;
        if !self.finished {
            self.latest = iter.current().map(PlyPosition::of);
        }
        self.iter = Some(iter);
        Ok(())
    }

    fn write_header(&self, buf: &mut ChunkBuf, plies: &PlyPair) -> Result<()> {
        buf.push_str("{\n");
        if self.newsince.is_none() {
            let _ = write!(
                buf,
                "\"read_offset\":{},\n\"latest_ack_offset\":{},\n",
                plies.read_offset, plies.latest_ack_my_offset
            );
        }
        buf.push_str("\"header\":");
        buf.push_json(&HEADERS)?;
        buf.push_str(",\n\"rows\":[");
        Ok(())
    }
}

/// Write one row; `false` if the entry is an acknowledgement no newer than
/// `highest_ack_offset` and so produces nothing.
fn write_row(
    buf: &mut ChunkBuf,
    entry: &MessageEntry,
    plies: &PlyPair,
    first: bool,
    highest_ack_offset: u64,
) -> Result<bool> {
    let (label, delivered, read, ack_offset) = match entry.kind {
        MessageType::Sent => (">", entry.delivered, false, None),
        MessageType::Received => ("<", true, entry.read, None),
        MessageType::AckReceived => {
            if entry.ack_offset <= highest_ack_offset {
                return Ok(false);
            }
            ("ACK", true, entry.read, Some(entry.ack_offset))
        }
    };
    let token = MeshmsToken::new(*plies.bundle_id(entry.ply), entry.offset);

    if !first {
        buf.push_str(",");
    }
    buf.push_str("\n[");
    buf.push_json(label)?;
    buf.push_str(",");
    buf.push_json_hex(&plies.my_sid.to_hex());
    buf.push_str(",");
    buf.push_json_hex(&plies.their_sid.to_hex());
    let _ = write!(buf, ",{},", entry.offset);
    buf.push_json(&token.encode())?;
    buf.push_str(",");
    buf.push_json_str(entry.text.as_deref())?;
    buf.push_str(",");
    buf.push_json_bool(delivered);
    buf.push_str(",");
    buf.push_json_bool(read);
    match ack_offset {
        Some(offset) => {
            let _ = write!(buf, ",{}]", offset);
        }
        None => buf.push_str(",null]"),
    }
    Ok(true)
}

impl ContentGenerator for MessageListGenerator {
    fn prepare(&mut self) -> Result<()> {
        self.reopen()
    }

    fn content_chunk(&mut self, buf: &mut ChunkBuf, now: Instant) -> Result<ChunkStatus> {
        if self.phase == ListPhase::Header {
            let iter = self
                .iter
                .as_ref()
                .ok_or(MeshmsError::Status(MeshmsStatus::Error))?;
            self.write_header(buf, iter.plies())?;
            if !buf.overrun() {
                self.phase = ListPhase::Rows;
            }
            return Ok(ChunkStatus::More);
        }

        if self.phase == ListPhase::Rows {
            let Some(iter) = self.iter.as_mut() else {
                return Err(MeshmsError::Status(MeshmsStatus::Error));
            };
            let token = self.token;
            let entry = iter
                .current()
                .filter(|entry| !self.finished && !token.is_some_and(|t| t.covers(entry)));

            if let Some(entry) = entry {
                let emitted =
                    write_row(buf, entry, iter.plies(), self.rowcount == 0, self.highest_ack_offset)?;
                if buf.overrun() {
                    return Ok(ChunkStatus::More);
                }
                if emitted {
                    self.rowcount += 1;
                    if entry.kind == MessageType::AckReceived {
                        self.highest_ack_offset = entry.ack_offset;
                    }
                }
                let status = iter.prev();
                if status.is_failed() {
                    return Err(status.into());
                }
                self.finished = status != MeshmsStatus::Updated;
                return Ok(ChunkStatus::More);
            }

            if let Some(wait) = self.newsince {
                if now < wait.deadline {
                    if let Some(latest) = self.latest {
                        self.token = Some(latest);
                    }
                    self.close();
                    let wake_at = now
                        .checked_add(wait.poll_interval)
                        .map_or(wait.deadline, |t| t.min(wait.deadline));
                    debug!(
                        "newsince {} -> {} caught up at {:?}, pausing",
                        self.my_sid, self.their_sid, self.token
                    );
                    return Ok(ChunkStatus::Paused(wake_at));
                }
            }
            self.phase = ListPhase::End;
        }

        if self.phase == ListPhase::End {
            buf.push_str("\n]\n}\n");
            if buf.overrun() {
                return Ok(ChunkStatus::More);
            }
            self.phase = ListPhase::Done;
        }

        Ok(ChunkStatus::Done)
    }
}
