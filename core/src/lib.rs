/// MeshMS RESTful core
///
/// Streaming JSON listings of MeshMS conversations and messages, the
/// long-polling "newsince" message list, the resumption token codec and the
/// send-message form, served over HTTP.

pub mod error;
pub mod config;
pub mod sid;
pub mod status;
pub mod token;
pub mod messenger_types;
pub mod store;
pub mod message_store;
pub mod chunk;
pub mod conversation_list;
pub mod message_list;
pub mod multipart;
pub mod send_message;
pub mod route;
pub mod restful_api;

pub use error::{MeshmsError, Result};
pub use config::Config;
pub use sid::Sid;
pub use status::{MeshmsResponse, MeshmsStatus};
pub use store::{MemoryStore, MeshmsStore};
pub use message_store::SledStore;
pub use token::MeshmsToken;
