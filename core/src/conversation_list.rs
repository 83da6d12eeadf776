/// `conversationlist.json`: every conversation of one identity as a JSON table
use crate::chunk::{ChunkBuf, ChunkStatus, ContentGenerator, ListPhase};
use crate::error::Result;
use crate::sid::Sid;
use crate::store::{ConversationIter, MeshmsStore};
use std::fmt::Write;
use std::time::Instant;

// my_sid and their_sid are per row so the same table shape can later list
// conversations of several identities at once.
const HEADERS: [&str; 6] = [
    "_id",
    "my_sid",
    "their_sid",
    "read",
    "last_message",
    "read_offset",
];

pub struct ConversationListGenerator {
    my_sid: Sid,
    iter: ConversationIter,
    phase: ListPhase,
    rowcount: usize,
}

impl ConversationListGenerator {
    /// Take the conversation snapshot for `my_sid`; fails before any output
    /// if the store refuses.
    pub fn start(store: &dyn MeshmsStore, my_sid: Sid) -> Result<Self> {
        let conversations = store.conversations(&my_sid)?;
        Ok(Self {
            my_sid,
            iter: ConversationIter::new(conversations),
            phase: ListPhase::Header,
            rowcount: 0,
        })
    }

    pub fn phase(&self) -> ListPhase {
        self.phase
    }
}

impl ContentGenerator for ConversationListGenerator {
    fn content_chunk(&mut self, buf: &mut ChunkBuf, _now: Instant) -> Result<ChunkStatus> {
        if self.phase == ListPhase::Header {
            buf.push_str("{\n\"header\":");
            buf.push_json(&HEADERS)?;
            buf.push_str(",\n\"rows\":[");
            if !buf.overrun() {
                self.phase = ListPhase::Rows;
            }
            return Ok(ChunkStatus::More);
        }

        if self.phase == ListPhase::Rows {
            if let Some(conv) = self.iter.current() {
                if self.rowcount != 0 {
                    buf.push_str(",");
                }
                let _ = write!(buf, "\n[{},", self.rowcount);
                buf.push_json_hex(&self.my_sid.to_hex());
                buf.push_str(",");
                buf.push_json_hex(&conv.them.to_hex());
                buf.push_str(",");
                buf.push_json_bool(conv.is_fully_read());
                let _ = write!(buf, ",{},{}]", conv.their_last_message, conv.read_offset);
                if !buf.overrun() {
                    self.iter.advance();
                    self.rowcount += 1;
                }
                return Ok(ChunkStatus::More);
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
