/// Shared types for the MeshMS layer
use crate::sid::Sid;
use serde::{Deserialize, Serialize};

/// Store change notifications, used to wake waiting newsince requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshmsEvent {
    /// A message was appended to the ply `sender` -> `recipient`
    MessageAppended { sender: Sid, recipient: Sid },
    /// `sender` acknowledged messages from `recipient`
    AckAppended { sender: Sid, recipient: Sid },
}

impl MeshmsEvent {
    /// True if the event changes the conversation between `a` and `b`.
    pub fn concerns(&self, a: &Sid, b: &Sid) -> bool {
        let (sender, recipient) = match self {
            MeshmsEvent::MessageAppended { sender, recipient }
            | MeshmsEvent::AckAppended { sender, recipient } => (sender, recipient),
        };
        (sender == a && recipient == b) || (sender == b && recipient == a)
    }
}
