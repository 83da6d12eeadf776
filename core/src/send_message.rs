/// `sendmessage`: validate a single-field form submission and append it to
/// the sender's ply
use crate::multipart::{FormHandler, MimePartHeaders};
use crate::sid::Sid;
use crate::status::MeshmsResponse;
use crate::store::MeshmsStore;
use http::StatusCode;
use thiserror::Error;
use tracing::debug;

const PART_MESSAGE: &str = "message";

/// Rejections of the submitted form. Every one is a 400.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormError {
    #[error("Missing \"message\" form part")]
    MissingMessage,

    #[error("Duplicate \"message\" form part")]
    DuplicateMessage,

    #[error("Unsupported \"{0}\" form part")]
    UnsupportedPart(String),

    #[error("Invalid (empty) \"message\" form part")]
    EmptyMessage,

    #[error("Overflow in \"message\" form part")]
    Overflow,

    #[error("Unsupported Content-Disposition: {0}")]
    UnsupportedDisposition(String),

    #[error("Missing Content-Type")]
    MissingContentType,

    #[error("Unsupported Content-Type: {0}")]
    UnsupportedContentType(String),

    #[error("Missing charset in Content-Type")]
    MissingCharset,

    #[error("Unsupported charset in Content-Type: {0}")]
    UnsupportedCharset(String),

    #[error("Invalid UTF-8 in \"message\" form part")]
    InvalidUtf8,

    #[error("Malformed multipart/form-data: {0}")]
    Malformed(String),
}

/// Form parts this endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormPart {
    Message,
}

/// Accumulates the `message` part as the multipart parser reports it.
#[derive(Debug)]
pub struct SendMessageForm {
    max_len: usize,
    current: Option<FormPart>,
    message: Vec<u8>,
    received_message: bool,
}

impl SendMessageForm {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            current: None,
            message: Vec::new(),
            received_message: false,
        }
    }

    /// The validated message, once the whole body has been seen.
    pub fn finish(self) -> Result<Vec<u8>, FormError> {
        if !self.received_message {
            return Err(FormError::MissingMessage);
        }
        Ok(self.message)
    }
}

impl FormHandler for SendMessageForm {
    fn part_start(&mut self) -> Result<(), FormError> {
        self.current = None;
        Ok(())
    }

    fn part_header(&mut self, headers: &MimePartHeaders) -> Result<(), FormError> {
        if headers.disposition_type != "form-data" {
            return Err(FormError::UnsupportedDisposition(
                headers.disposition_type.clone(),
            ));
        }
        if headers.disposition_name != PART_MESSAGE {
            return Err(FormError::UnsupportedPart(headers.disposition_name.clone()));
        }
        if self.received_message {
            return Err(FormError::DuplicateMessage);
        }
        self.current = Some(FormPart::Message);
        self.message.clear();

        let content_type = match &headers.content_type {
            Some(ct) if !ct.kind.is_empty() && !ct.subtype.is_empty() => ct,
            _ => return Err(FormError::MissingContentType),
        };
        if content_type.kind != "text" || content_type.subtype != "plain" {
            return Err(FormError::UnsupportedContentType(format!(
                "{}/{}",
                content_type.kind, content_type.subtype
            )));
        }
        match content_type.charset.as_deref() {
            None | Some("") => Err(FormError::MissingCharset),
            Some("utf-8") => Ok(()),
            Some(other) => Err(FormError::UnsupportedCharset(other.to_string())),
        }
    }

    fn part_body(&mut self, body: &[u8]) -> Result<(), FormError> {
        match self.current {
            Some(FormPart::Message) => {
                if self.message.len() + body.len() > self.max_len {
                    return Err(FormError::Overflow);
                }
                self.message.extend_from_slice(body);
                Ok(())
            }
            None => Err(FormError::Malformed("body outside a form part".to_string())),
        }
    }

    fn part_end(&mut self) -> Result<(), FormError> {
        match self.current.take() {
            Some(FormPart::Message) => {
                if self.message.is_empty() {
                    return Err(FormError::EmptyMessage);
                }
                let text =
                    std::str::from_utf8(&self.message).map_err(|_| FormError::InvalidUtf8)?;
                debug!("received {} = {:?}", PART_MESSAGE, text);
                self.received_message = true;
                Ok(())
            }
            None => Err(FormError::Malformed("part ended before it started".to_string())),
        }
    }
}

/// Append `message` to the ply `sender` -> `recipient` and describe the
/// outcome.
pub fn send_message(
    store: &dyn MeshmsStore,
    sender: &Sid,
    recipient: &Sid,
    message: &[u8],
) -> MeshmsResponse {
    let status = store.send_message(sender, recipient, message);
    if status.is_failed() {
        debug!("send {} -> {} refused: {}", sender, recipient, status);
        return MeshmsResponse::from_status(status, None, None);
    }
    MeshmsResponse::from_status(status, Some(StatusCode::CREATED), Some("Message sent"))
}
