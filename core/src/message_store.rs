/// Persistent MeshMS plies stored in sled
/// Frugal: one tree of ply records keyed by (author, recipient, seq), one of read offsets
use crate::error::{MeshmsError, Result};
use crate::messenger_types::MeshmsEvent;
use crate::sid::{Sid, SID_SIZE};
use crate::status::MeshmsStatus;
use crate::store::{
    assemble_log, summarise, Conversation, MeshmsStore, MessageIterator, PlyRecord, RecordBody,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const PLY_KEY_LEN: usize = 2 * SID_SIZE;

pub struct SledStore {
    db: sled::Db,
    plies: sled::Tree,
    read_offsets: sled::Tree,
    /// Serialises appends so record offsets stay contiguous
    append_lock: Mutex<()>,
    events: broadcast::Sender<MeshmsEvent>,
}

fn pair_key(a: &Sid, b: &Sid) -> [u8; PLY_KEY_LEN] {
    let mut key = [0u8; PLY_KEY_LEN];
    key[..SID_SIZE].copy_from_slice(a.as_bytes());
    key[SID_SIZE..].copy_from_slice(b.as_bytes());
    key
}

fn storage_failure(e: impl std::fmt::Display) -> MeshmsStatus {
    error!("MeshMS store failure: {}", e);
    MeshmsStatus::Error
}

/// Stored read offset; absent or malformed reads as zero.
fn decode_offset(value: Option<&[u8]>) -> u64 {
    value
        .and_then(|v| <[u8; 8]>::try_from(v).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

impl SledStore {
    /// Open (or create) the store under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("meshms.db");
        let db = sled::open(&db_path)
            .map_err(|e| MeshmsError::Storage(format!("Failed to open MeshMS DB: {}", e)))?;
        let plies = db.open_tree("plies")?;
        let read_offsets = db.open_tree("read_offsets")?;
        let (events, _) = broadcast::channel(64);

        info!("MeshMS store opened at {:?}", db_path);
        Ok(Self {
            db,
            plies,
            read_offsets,
            append_lock: Mutex::new(()),
            events,
        })
    }

    fn read_ply(&self, author: &Sid, recipient: &Sid) -> std::result::Result<Vec<PlyRecord>, MeshmsStatus> {
        let mut records = Vec::new();
        for entry in self.plies.scan_prefix(pair_key(author, recipient)) {
            let (_, value) = entry.map_err(storage_failure)?;
            records.push(serde_json::from_slice(&value).map_err(storage_failure)?);
        }
        Ok(records)
    }

    fn read_offset(&self, me: &Sid, them: &Sid) -> std::result::Result<u64, MeshmsStatus> {
        let value = self
            .read_offsets
            .get(pair_key(me, them))
            .map_err(storage_failure)?;
        Ok(decode_offset(value.as_deref()))
    }

    /// Record that `me` has read `them`'s ply up to `offset`. Never moves
    /// the offset backwards, however marks interleave.
    pub fn mark_read(&self, me: &Sid, them: &Sid, offset: u64) -> MeshmsStatus {
        let previous = self.read_offsets.fetch_and_update(pair_key(me, them), |old| {
            let merged = decode_offset(old).max(offset);
            Some(merged.to_be_bytes().to_vec())
        });
        match previous {
            Ok(old) if decode_offset(old.as_deref()) < offset => MeshmsStatus::Updated,
            Ok(_) => MeshmsStatus::Ok,
            Err(e) => storage_failure(e),
        }
    }

    /// Append an acknowledgement of `them`'s ply up to `offset` to `me`'s ply
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
        let Ok(_guard) = self.append_lock.lock() else {
            return MeshmsStatus::Error;
        };
        let prefix = pair_key(author, recipient);
        let last = match self.plies.scan_prefix(prefix).next_back() {
            Some(Ok((_, value))) => match serde_json::from_slice::<PlyRecord>(&value) {
                Ok(record) => Some(record),
                Err(e) => return storage_failure(e),
            },
            Some(Err(e)) => return storage_failure(e),
            None => None,
        };
        let seq = match self.db.generate_id() {
            Ok(id) => id,
            Err(e) => return storage_failure(e),
        };
        let record = PlyRecord::next_in(last.as_slice(), seq, body);
        let value = match serde_json::to_vec(&record) {
            Ok(v) => v,
            Err(e) => return storage_failure(e),
        };

        let mut key = Vec::with_capacity(PLY_KEY_LEN + 8);
        key.extend_from_slice(&prefix);
        key.extend_from_slice(&seq.to_be_bytes());
        if let Err(e) = self.plies.insert(key, value) {
            return storage_failure(e);
        }
        if let Err(e) = self.plies.flush() {
            return storage_failure(e);
        }
        debug!("Appended record at offset {} to ply {} -> {}", record.end_offset, author, recipient);
        MeshmsStatus::Updated
    }

}

impl MeshmsStore for SledStore {
    fn conversations(&self, me: &Sid) -> std::result::Result<Vec<Conversation>, MeshmsStatus> {
        let mut counterparts = BTreeSet::new();
        for key in self.plies.iter().keys() {
            let key = key.map_err(storage_failure)?;
            if key.len() < PLY_KEY_LEN {
                continue;
            }
            let (author, recipient) = key[..PLY_KEY_LEN].split_at(SID_SIZE);
            if author == me.as_bytes() {
                counterparts.insert(recipient.to_vec());
            } else if recipient == me.as_bytes() {
                counterparts.insert(author.to_vec());
            }
        }

        let mut conversations = Vec::with_capacity(counterparts.len());
        for raw in counterparts {
            let mut bytes = [0u8; SID_SIZE];
            bytes.copy_from_slice(&raw);
            let them = Sid::from_bytes(bytes);
            let theirs = self.read_ply(&them, me)?;
            conversations.push(summarise(them, &theirs, self.read_offset(me, &them)?));
        }
        Ok(conversations)
    }

    fn open_messages(
        &self,
        me: &Sid,
        them: &Sid,
    ) -> std::result::Result<Box<dyn MessageIterator>, MeshmsStatus> {
        let mine = self.read_ply(me, them)?;
        let theirs = self.read_ply(them, me)?;
        let read_offset = self.read_offset(me, them)?;
        Ok(Box::new(assemble_log(*me, *them, &mine, &theirs, read_offset)))
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
