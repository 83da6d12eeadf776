/// MeshMS RESTful API: HTTP server for the conversation and message endpoints
///
/// Endpoints (all under /restful/meshms/):
///   GET  <sid>/conversationlist.json
///   GET  <sid>/<sid>/messagelist.json
///   GET  <sid>/<sid>/newsince/<token>/messagelist.json   long-poll
///   POST <sid>/<sid>/sendmessage                        multipart/form-data, part "message"
///
/// List bodies are generated chunk by chunk and streamed; a newsince body
/// stays open until its timeout, waking early whenever the store reports a
/// change.
use crate::chunk::{fill, ContentGenerator, FillStatus};
use crate::config::Config;
use crate::conversation_list::ConversationListGenerator;
use crate::error::{MeshmsError, Result};
use crate::message_list::MessageListGenerator;
use crate::messenger_types::MeshmsEvent;
use crate::multipart;
use crate::route::{self, Route, MESHMS_PATH_PREFIX};
use crate::send_message::{send_message, FormError, SendMessageForm};
use crate::sid::Sid;
use crate::status::{MeshmsResponse, MeshmsStatus};
use crate::store::MeshmsStore;
use crate::token::MeshmsToken;
use bytes::Bytes;
use futures_util::stream::unfold;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

/// Domain status annotation carried on every MeshMS response
pub const MESHMS_STATUS_HEADER: &str = "Serval-Meshms-Status-Code";

// ─── Type alias ──────────────────────────────────────────────────────────────

type Body = http_body_util::combinators::UnsyncBoxBody<Bytes, MeshmsError>;
type Resp = Response<Body>;

/// Everything a request handler needs
pub struct RestfulState {
    pub config: Arc<Config>,
    pub store: Arc<dyn MeshmsStore>,
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

fn json_resp(status: StatusCode, body: Vec<u8>, meshms_status: Option<i32>) -> Resp {
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json");
    if let Some(code) = meshms_status {
        builder = builder.header(MESHMS_STATUS_HEADER, code.to_string());
    }
    builder
        .body(full(body))
        .unwrap_or_else(|_| Response::new(full(Bytes::new())))
}

/// A complete `{"http_status_code":..}` response.
fn meshms_resp(resp: &MeshmsResponse) -> Resp {
    match resp.to_json() {
        Ok(body) => json_resp(resp.http_status, body, resp.meshms_status_code),
        Err(e) => {
            error!("Failed to serialise response: {}", e);
            json_resp(StatusCode::INTERNAL_SERVER_ERROR, Vec::new(), None)
        }
    }
}

fn error_resp(e: &MeshmsError) -> Resp {
    let resp = e.to_response();
    if resp.http_status.is_server_error() {
        error!("MeshMS request failed: {}", e);
    } else {
        debug!("MeshMS request rejected: {}", e);
    }
    meshms_resp(&resp)
}

/// Stream the output of `generator`, pausing when it asks to.
fn generated_resp(
    generator: Box<dyn ContentGenerator>,
    capacity: usize,
    events: Option<broadcast::Receiver<MeshmsEvent>>,
) -> Resp {
    let driver = ChunkDriver {
        generator,
        capacity,
        events,
        wake_at: None,
        failure: None,
        done: false,
    };
    let frames = unfold(driver, |mut driver| async move {
        let chunk = driver.next_chunk().await?;
        Some((chunk.map(Frame::data), driver))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .header(MESHMS_STATUS_HEADER, MeshmsStatus::Ok.code().to_string())
        .body(StreamBody::new(frames).boxed_unsync())
        .unwrap_or_else(|_| Response::new(full(Bytes::new())))
}

// ─── Chunk driver ────────────────────────────────────────────────────────────

/// Runs a generator into successive body chunks. Owns the scheduling of
/// paused generators: it sleeps until the requested wake time or until the
/// store reports a change, whichever comes first.
struct ChunkDriver {
    generator: Box<dyn ContentGenerator>,
    capacity: usize,
    /// Subscribed before the first chunk so no change is missed
    events: Option<broadcast::Receiver<MeshmsEvent>>,
    wake_at: Option<Instant>,
    /// Sent after the bytes that preceded it
    failure: Option<MeshmsError>,
    done: bool,
}

impl ChunkDriver {
    async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        loop {
            if let Some(wake_at) = self.wake_at.take() {
                self.wait(wake_at).await;
            }
            if let Some(e) = self.failure.take() {
                return Some(Err(e));
            }
            if self.done {
                return None;
            }

            let mut filled = match fill(self.generator.as_mut(), self.capacity, Instant::now()) {
                Ok(filled) => filled,
                Err(e) => {
                    // the status line has gone out, all we can do is cut the body short
                    error!("MeshMS content generation failed: {}", e);
                    self.done = true;
                    return Some(Err(e));
                }
            };
            match filled.status {
                FillStatus::Need(needed) => {
                    debug!("Growing chunk buffer {} -> {}", self.capacity, needed);
                    self.capacity = needed;
                }
                FillStatus::More => {}
                FillStatus::Done => self.done = true,
                FillStatus::Paused(wake_at) => self.wake_at = Some(wake_at),
                FillStatus::Failed => {
                    let e = filled
                        .error
                        .take()
                        .unwrap_or(MeshmsError::Status(MeshmsStatus::Error));
                    error!("MeshMS content generation failed: {}", e);
                    self.failure = Some(e);
                    self.done = true;
                }
            }
            if !filled.bytes.is_empty() {
                return Some(Ok(filled.bytes));
            }
        }
    }

    async fn wait(&mut self, wake_at: Instant) {
        let deadline = tokio::time::Instant::from_std(wake_at);
        let Some(events) = self.events.as_mut() else {
            tokio::time::sleep_until(deadline).await;
            return;
        };
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            received = events.recv() => match received {
                Ok(event) => debug!("Woken by {:?}", event),
                Err(RecvError::Lagged(n)) => debug!("Woken after {} missed events", n),
                Err(RecvError::Closed) => {
                    warn!("MeshMS event channel closed, polling only");
                    self.events = None;
                    tokio::time::sleep_until(deadline).await;
                }
            },
        }
    }
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn start_restful_api(config: Config, store: Arc<dyn MeshmsStore>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(MeshmsError::Io)?;
    info!("MeshMS RESTful API started on http://{}", config.listen_addr);

    let state = Arc::new(RestfulState {
        config: Arc::new(config),
        store,
    });
    serve(listener, state).await
}

/// Accept connections on `listener` forever.
pub async fn serve(listener: TcpListener, state: Arc<RestfulState>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("MeshMS API connection from {}", peer);
                let io = TokioIo::new(stream);
                let state = state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // Ignore client disconnects, normal while long-polling
                        if !e.is_incomplete_message() {
                            debug!("MeshMS API connection closed: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("MeshMS API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, state: Arc<RestfulState>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    let Some(remainder) = path.strip_prefix(MESHMS_PATH_PREFIX) else {
        return error_resp(&MeshmsError::NotFound("Not found".to_string()));
    };
    if !state.config.restful_enabled {
        return error_resp(&MeshmsError::Forbidden(
            "MeshMS RESTful interface disabled".to_string(),
        ));
    }

    let result = match route::resolve(&method, remainder) {
        Ok(Route::ConversationList { me }) => get_conversation_list(&state, me),
        Ok(Route::MessageList { me, them }) => get_message_list(&state, me, them),
        Ok(Route::NewsinceMessageList { me, them, token }) => {
            get_newsince_message_list(&state, me, them, token)
        }
        Ok(Route::SendMessage { me, them }) => post_send_message(req, &state, me, them).await,
        Err(e) => Err(e),
    };
    result.unwrap_or_else(|e| error_resp(&e))
}

// ─── Handlers ────────────────────────────────────────────────────────────────

fn get_conversation_list(state: &RestfulState, me: Sid) -> Result<Resp> {
    let generator = ConversationListGenerator::start(state.store.as_ref(), me)?;
    Ok(generated_resp(
        Box::new(generator),
        state.config.chunk_size,
        None,
    ))
}

fn get_message_list(state: &RestfulState, me: Sid, them: Sid) -> Result<Resp> {
    let generator = MessageListGenerator::open(state.store.clone(), me, them)?;
    Ok(generated_resp(
        Box::new(generator),
        state.config.chunk_size,
        None,
    ))
}

fn get_newsince_message_list(
    state: &RestfulState,
    me: Sid,
    them: Sid,
    token: MeshmsToken,
) -> Result<Resp> {
    let events = state.store.subscribe();
    let generator = MessageListGenerator::open_newsince(
        state.store.clone(),
        me,
        them,
        token,
        Instant::now(),
        state.config.newsince_timeout,
        state.config.newsince_poll_interval,
    )?;
    Ok(generated_resp(
        Box::new(generator),
        state.config.chunk_size,
        Some(events),
    ))
}

async fn post_send_message(
    req: Request<hyper::body::Incoming>,
    state: &RestfulState,
    me: Sid,
    them: Sid,
) -> Result<Resp> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let boundary = multipart::boundary(&content_type).ok_or_else(|| {
        FormError::Malformed(format!("unsupported request Content-Type: {}", content_type))
    })?;
    let body = read_body(req).await?;

    let mut form = SendMessageForm::new(state.config.message_max_len);
    multipart::parse_form_data(&boundary, &body, &mut form)?;
    let message = form.finish()?;
    Ok(meshms_resp(&send_message(
        state.store.as_ref(),
        &me,
        &them,
        &message,
    )))
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_body(req: Request<hyper::body::Incoming>) -> Result<Bytes> {
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| MeshmsError::Http(e.to_string()))
}
