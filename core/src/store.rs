/// MeshMS message store interface and the in-memory store
///
/// A conversation between two identities is made of two append-only plies,
/// one authored by each party. Readers see the plies interleaved in append
/// order through a [`MessageIterator`] snapshot.
use crate::messenger_types::MeshmsEvent;
use crate::sid::{BundleId, Sid};
use crate::status::MeshmsStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

/// Per-record framing added to the payload length when computing offsets.
const RECORD_OVERHEAD: u64 = 3;

const EVENT_CAPACITY: usize = 64;

/// Which of the two plies an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ply {
    Mine,
    Theirs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Sent,
    Received,
    AckReceived,
}

/// One position of the interleaved conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub ply: Ply,
    /// Record end offset within `ply`.
    pub offset: u64,
    pub kind: MessageType,
    /// Message text; `None` for acknowledgements.
    pub text: Option<String>,
    pub delivered: bool,
    pub read: bool,
    /// Offset of our ply acknowledged by an `AckReceived` entry.
    pub ack_offset: u64,
}

/// Summary of one conversation, as listed for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub them: Sid,
    /// Highest offset of our ply they have acknowledged
    pub their_last_ack: u64,
    /// Highest offset of their ply we have read
    pub read_offset: u64,
    /// Offset of their most recent message
    pub their_last_message: u64,
}

impl Conversation {
    pub fn is_fully_read(&self) -> bool {
        self.read_offset >= self.their_last_message
    }
}

/// Fixed facts about the conversation behind a message iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlyPair {
    pub my_sid: Sid,
    pub their_sid: Sid,
    pub my_ply: BundleId,
    pub their_ply: BundleId,
    pub read_offset: u64,
    pub latest_ack_my_offset: u64,
}

impl PlyPair {
    pub fn bundle_id(&self, ply: Ply) -> &BundleId {
        match ply {
            Ply::Mine => &self.my_ply,
            Ply::Theirs => &self.their_ply,
        }
    }

    /// Which ply a bundle id names, if either.
    pub fn which(&self, bundle_id: &BundleId) -> Option<Ply> {
        if *bundle_id == self.my_ply {
            Some(Ply::Mine)
        } else if *bundle_id == self.their_ply {
            Some(Ply::Theirs)
        } else {
            None
        }
    }
}

/// Cursor over a conversation, stepping from newest to oldest.
pub trait MessageIterator: Send {
    /// Step to the next older entry. Returns `Updated` while positioned on
    /// an entry, `Ok` once exhausted, or a failed status.
    fn prev(&mut self) -> MeshmsStatus;

    fn current(&self) -> Option<&MessageEntry>;

    fn plies(&self) -> &PlyPair;
}

/// The external message store.
pub trait MeshmsStore: Send + Sync {
    /// Snapshot of every conversation `me` takes part in.
    fn conversations(&self, me: &Sid) -> Result<Vec<Conversation>, MeshmsStatus>;

    /// Open a fresh iterator, positioned before the newest entry.
    fn open_messages(
        &self,
        me: &Sid,
        them: &Sid,
    ) -> Result<Box<dyn MessageIterator>, MeshmsStatus>;

    /// Append a message to the sender's ply.
    fn send_message(&self, sender: &Sid, recipient: &Sid, message: &[u8]) -> MeshmsStatus;

    fn subscribe(&self) -> broadcast::Receiver<MeshmsEvent>;
}

/// Forward cursor over a conversation list snapshot.
#[derive(Debug, Clone)]
pub struct ConversationIter {
    conversations: Vec<Conversation>,
    position: usize,
}

impl ConversationIter {
    pub fn new(conversations: Vec<Conversation>) -> Self {
        Self {
            conversations,
            position: 0,
        }
    }

    pub fn current(&self) -> Option<&Conversation> {
        self.conversations.get(self.position)
    }

    pub fn advance(&mut self) {
        if self.position < self.conversations.len() {
            self.position += 1;
        }
    }
}

// ─── Ply records ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordBody {
    Message { text: String },
    /// Acknowledges the other party's ply up to `offset`
    Ack { offset: u64 },
}

/// One record of an append-only ply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlyRecord {
    /// Store-wide append sequence, used to interleave the two plies
    pub seq: u64,
    pub end_offset: u64,
    pub body: RecordBody,
}

impl PlyRecord {
    /// Build the record that follows `ply`.
    pub fn next_in(ply: &[PlyRecord], seq: u64, body: RecordBody) -> Self {
        let start = ply.last().map(|r| r.end_offset).unwrap_or(0);
        let len = match &body {
            RecordBody::Message { text } => text.len() as u64,
            RecordBody::Ack { .. } => 8,
        };
        Self {
            seq,
            end_offset: start + len + RECORD_OVERHEAD,
            body,
        }
    }
}

fn latest_ack(theirs: &[PlyRecord]) -> u64 {
    theirs
        .iter()
        .filter_map(|r| match r.body {
            RecordBody::Ack { offset } => Some(offset),
            RecordBody::Message { .. } => None,
        })
        .max()
        .unwrap_or(0)
}

/// Summarise a conversation from its two plies.
pub fn summarise(them: Sid, theirs: &[PlyRecord], read_offset: u64) -> Conversation {
    let their_last_message = theirs
        .iter()
        .rev()
        .find(|r| matches!(r.body, RecordBody::Message { .. }))
        .map(|r| r.end_offset)
        .unwrap_or(0);
    Conversation {
        them,
        their_last_ack: latest_ack(theirs),
        read_offset,
        their_last_message,
    }
}

/// Interleave both plies, oldest first, from `me`'s point of view.
pub fn assemble_log(
    me: Sid,
    them: Sid,
    mine: &[PlyRecord],
    theirs: &[PlyRecord],
    read_offset: u64,
) -> LogIterator {
    let plies = PlyPair {
        my_sid: me,
        their_sid: them,
        my_ply: BundleId::for_ply(&me, &them),
        their_ply: BundleId::for_ply(&them, &me),
        read_offset,
        latest_ack_my_offset: latest_ack(theirs),
    };

    let mut tagged: Vec<(Ply, &PlyRecord)> = mine
        .iter()
        .map(|r| (Ply::Mine, r))
        .chain(theirs.iter().map(|r| (Ply::Theirs, r)))
        .collect();
    tagged.sort_by_key(|(_, r)| r.seq);

    let entries = tagged
        .into_iter()
        .filter_map(|(ply, record)| {
            let offset = record.end_offset;
            match (ply, &record.body) {
                (Ply::Mine, RecordBody::Message { text }) => Some(MessageEntry {
                    ply,
                    offset,
                    kind: MessageType::Sent,
                    text: Some(text.clone()),
                    delivered: offset <= plies.latest_ack_my_offset,
                    read: false,
                    ack_offset: 0,
                }),
                // our own read receipts are not listed
                (Ply::Mine, RecordBody::Ack { .. }) => None,
                (Ply::Theirs, RecordBody::Message { text }) => Some(MessageEntry {
                    ply,
                    offset,
                    kind: MessageType::Received,
                    text: Some(text.clone()),
                    delivered: true,
                    read: offset <= read_offset,
                    ack_offset: 0,
                }),
                (Ply::Theirs, RecordBody::Ack { offset: acked }) => Some(MessageEntry {
                    ply,
                    offset,
                    kind: MessageType::AckReceived,
                    text: None,
                    delivered: true,
                    read: offset <= read_offset,
                    ack_offset: *acked,
                }),
            }
        })
        .collect();

    LogIterator::new(plies, entries)
}

/// [`MessageIterator`] over an owned snapshot of the interleaved log.
#[derive(Debug, Clone)]
pub struct LogIterator {
    plies: PlyPair,
    /// Oldest first
    entries: Vec<MessageEntry>,
    remaining: usize,
    current: Option<usize>,
}

impl LogIterator {
    pub fn new(plies: PlyPair, entries: Vec<MessageEntry>) -> Self {
        let remaining = entries.len();
        Self {
            plies,
            entries,
            remaining,
            current: None,
        }
    }
}

impl MessageIterator for LogIterator {
    fn prev(&mut self) -> MeshmsStatus {
        if self.remaining == 0 {
            self.current = None;
            return MeshmsStatus::Ok;
        }
        self.remaining -= 1;
        self.current = Some(self.remaining);
        MeshmsStatus::Updated
    }

    fn current(&self) -> Option<&MessageEntry> {
        self.current.and_then(|i| self.entries.get(i))
    }

    fn plies(&self) -> &PlyPair {
        &self.plies
    }
}

// ─── In-memory store ─────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    /// (author, recipient) -> ply
    plies: BTreeMap<(Sid, Sid), Vec<PlyRecord>>,
    /// (reader, author) -> offset read
    read_offsets: HashMap<(Sid, Sid), u64>,
    locked: HashSet<Sid>,
    next_seq: u64,
}

impl MemoryInner {
    fn ply(&self, author: &Sid, recipient: &Sid) -> &[PlyRecord] {
        self.plies
            .get(&(*author, *recipient))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn check_unlocked(&self, sid: &Sid) -> Result<(), MeshmsStatus> {
        if self.locked.contains(sid) {
            Err(MeshmsStatus::SidLocked)
        } else {
            Ok(())
        }
    }
}

/// Process-local store; contents are lost on exit.
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    events: broadcast::Sender<MeshmsEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(MemoryInner::default()),
            events,
        }
    }

    /// Make every operation for `sid` fail with `SidLocked`.
    pub fn lock_identity(&self, sid: Sid) {
        if let Ok(mut inner) = self.inner.write() {
            inner.locked.insert(sid);
        }
    }

    /// Record that `me` has read `them`'s ply up to `offset`.
    pub fn mark_read(&self, me: &Sid, them: &Sid, offset: u64) -> MeshmsStatus {
        let Ok(mut inner) = self.inner.write() else {
            return MeshmsStatus::Error;
        };
        if let Err(status) = inner.check_unlocked(me) {
            return status;
        }
        let entry = inner.read_offsets.entry((*me, *them)).or_insert(0);
        if offset <= *entry {
            return MeshmsStatus::Ok;
        }
        *entry = offset;
        MeshmsStatus::Updated
    }

    /// Append an acknowledgement of `them`'s ply up to `offset` to `me`'s ply.
    pub fn acknowledge(&self, me: &Sid, them: &Sid, offset: u64) -> MeshmsStatus {
        let status = self.append(me, them, RecordBody::Ack { offset });
        if status == MeshmsStatus::Updated {
            let _ = self.events.send(MeshmsEvent::AckAppended {
                sender: *me,
                recipient: *them,
            });
        }
        status
    }

    fn append(&self, author: &Sid, recipient: &Sid, body: RecordBody) -> MeshmsStatus {
        let Ok(mut inner) = self.inner.write() else {
            return MeshmsStatus::Error;
        };
        if let Err(status) = inner.check_unlocked(author) {
            return status;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let ply = inner.plies.entry((*author, *recipient)).or_default();
        let record = PlyRecord::next_in(ply, seq, body);
        debug!("Appending {:?} to ply {} -> {}", record, author, recipient);
        ply.push(record);
        MeshmsStatus::Updated
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshmsStore for MemoryStore {
    fn conversations(&self, me: &Sid) -> Result<Vec<Conversation>, MeshmsStatus> {
        let inner = self.inner.read().map_err(|_| MeshmsStatus::Error)?;
        inner.check_unlocked(me)?;

        let counterparts: BTreeSet<Sid> = inner
            .plies
            .keys()
            .filter_map(|(author, recipient)| {
                if author == me {
                    Some(*recipient)
                } else if recipient == me {
                    Some(*author)
                } else {
                    None
                }
            })
            .collect();

        Ok(counterparts
            .into_iter()
            .map(|them| {
                let read_offset = inner.read_offsets.get(&(*me, them)).copied().unwrap_or(0);
                summarise(them, inner.ply(&them, me), read_offset)
            })
            .collect())
    }

    fn open_messages(
        &self,
        me: &Sid,
        them: &Sid,
    ) -> Result<Box<dyn MessageIterator>, MeshmsStatus> {
        let inner = self.inner.read().map_err(|_| MeshmsStatus::Error)?;
        inner.check_unlocked(me)?;
        let read_offset = inner.read_offsets.get(&(*me, *them)).copied().unwrap_or(0);
        Ok(Box::new(assemble_log(
            *me,
            *them,
            inner.ply(me, them),
            inner.ply(them, me),
            read_offset,
        )))
    }

    fn send_message(&self, sender: &Sid, recipient: &Sid, message: &[u8]) -> MeshmsStatus {
        let text = String::from_utf8_lossy(message).into_owned();
        let status = self.append(sender, recipient, RecordBody::Message { text });
        if status == MeshmsStatus::Updated {
            let _ = self.events.send(MeshmsEvent::MessageAppended {
                sender: *sender,
                recipient: *recipient,
            });
        }
        status
    }

    fn subscribe(&self) -> broadcast::Receiver<MeshmsEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(byte: u8) -> Sid {
        Sid::from_bytes([byte; 32])
    }

    fn drain(iter: &mut dyn MessageIterator) -> Vec<MessageEntry> {
        let mut out = Vec::new();
        while iter.prev() == MeshmsStatus::Updated {
            out.push(iter.current().cloned().unwrap());
        }
        out
    }

    #[test]
    fn test_interleaved_newest_first() {
        let store = MemoryStore::new();
        let (alice, bob) = (sid(1), sid(2));
        assert_eq!(store.send_message(&alice, &bob, b"hello"), MeshmsStatus::Updated);
        assert_eq!(store.send_message(&bob, &alice, b"hi there"), MeshmsStatus::Updated);
        assert_eq!(store.acknowledge(&bob, &alice, 8), MeshmsStatus::Updated);

        let mut iter = store.open_messages(&alice, &bob).unwrap();
        let entries = drain(iter.as_mut());
        let kinds: Vec<_> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageType::AckReceived, MessageType::Received, MessageType::Sent]
        );
        assert_eq!(entries[0].ack_offset, 8);
        assert_eq!(entries[0].text, None);
        assert_eq!(entries[2].offset, 8);
        assert!(entries[2].delivered);
        assert_eq!(iter.plies().latest_ack_my_offset, 8);
        assert_eq!(iter.prev(), MeshmsStatus::Ok);
        assert!(iter.current().is_none());
    }

    #[test]
    fn test_offsets_are_per_ply() {
        let store = MemoryStore::new();
        let (alice, bob) = (sid(1), sid(2));
        store.send_message(&alice, &bob, b"12345");
        store.send_message(&bob, &alice, b"1");
        store.send_message(&alice, &bob, b"1234567");

        let mut iter = store.open_messages(&alice, &bob).unwrap();
        let offsets: Vec<_> = drain(iter.as_mut()).iter().map(|e| (e.ply, e.offset)).collect();
        assert_eq!(
            offsets,
            vec![(Ply::Mine, 18), (Ply::Theirs, 4), (Ply::Mine, 8)]
        );
    }

    #[test]
    fn test_conversation_summary() {
        let store = MemoryStore::new();
        let (alice, bob, carol) = (sid(1), sid(2), sid(3));
        store.send_message(&bob, &alice, b"ping");
        store.send_message(&alice, &carol, b"yo");

        let convs = store.conversations(&alice).unwrap();
        assert_eq!(convs.len(), 2);
        assert_eq!(convs[0].them, bob);
        assert_eq!(convs[0].their_last_message, 7);
        assert!(!convs[0].is_fully_read());
        assert_eq!(convs[1].them, carol);
        assert!(convs[1].is_fully_read());

        assert_eq!(store.mark_read(&alice, &bob, 7), MeshmsStatus::Updated);
        assert_eq!(store.mark_read(&alice, &bob, 7), MeshmsStatus::Ok);
        assert!(store.conversations(&alice).unwrap()[0].is_fully_read());
    }

    #[test]
    fn test_locked_identity() {
        let store = MemoryStore::new();
        let (alice, bob) = (sid(1), sid(2));
        store.lock_identity(alice);
        assert_eq!(store.conversations(&alice).unwrap_err(), MeshmsStatus::SidLocked);
        assert!(store.open_messages(&alice, &bob).is_err());
        assert_eq!(store.send_message(&alice, &bob, b"x"), MeshmsStatus::SidLocked);
    }

    #[test]
    fn test_send_publishes_event() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        let (alice, bob) = (sid(1), sid(2));
        store.send_message(&alice, &bob, b"hello");
        let event = rx.try_recv().unwrap();
        assert!(event.concerns(&bob, &alice));
        assert!(!event.concerns(&alice, &sid(3)));
    }

    #[test]
    fn test_ply_pair_which() {
        let store = MemoryStore::new();
        let (alice, bob) = (sid(1), sid(2));
        let iter = store.open_messages(&alice, &bob).unwrap();
        let plies = iter.plies();
        assert_eq!(plies.which(&BundleId::for_ply(&alice, &bob)), Some(Ply::Mine));
        assert_eq!(plies.which(&BundleId::for_ply(&bob, &alice)), Some(Ply::Theirs));
        assert_eq!(plies.which(&BundleId::for_ply(&alice, &sid(3))), None);
    }
}
