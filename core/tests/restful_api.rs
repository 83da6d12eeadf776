/// RESTful API tests
/// Real HTTP requests against a server on an ephemeral port

extern crate meshms_core;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{HeaderMap, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use meshms_core::restful_api::{serve, RestfulState, MESHMS_STATUS_HEADER};
use meshms_core::sid::BundleId;
use meshms_core::{Config, MemoryStore, MeshmsStore, MeshmsToken, Sid};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};

const BOUNDARY: &str = "XyZzY";

fn alice() -> Sid {
    Sid::from_bytes([0xa1; 32])
}

fn bob() -> Sid {
    Sid::from_bytes([0xb0; 32])
}

fn carol() -> Sid {
    Sid::from_bytes([0xc4; 32])
}

async fn start(config: Config) -> (SocketAddr, Arc<MemoryStore>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let store = Arc::new(MemoryStore::new());
    let state = Arc::new(RestfulState {
        config: Arc::new(config),
        store: store.clone(),
    });
    tokio::spawn(serve(listener, state));
    (addr, store)
}

async fn connect(addr: SocketAddr) -> hyper::client::conn::http1::SendRequest<Full<Bytes>> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender
}

fn build(method: Method, path: &str, content_type: Option<&str>, body: Vec<u8>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, "127.0.0.1");
    if let Some(ct) = content_type {
        builder = builder.header(CONTENT_TYPE, ct);
    }
    builder.body(Full::new(Bytes::from(body))).unwrap()
}

async fn request(
    addr: SocketAddr,
    method: Method,
    path: &str,
    content_type: Option<&str>,
    body: Vec<u8>,
) -> (StatusCode, HeaderMap, serde_json::Value) {
    let mut sender = connect(addr).await;
    let resp = sender
        .send_request(build(method, path, content_type, body))
        .await
        .unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap();
    (status, headers, json)
}

async fn get(addr: SocketAddr, path: &str) -> (StatusCode, HeaderMap, serde_json::Value) {
    request(addr, Method::GET, path, None, Vec::new()).await
}

fn form(name: &str, content_type: &str, text: &str) -> Vec<u8> {
    format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"{name}\"\r\nContent-Type: {ct}\r\n\r\n{text}\r\n--{b}--\r\n",
        b = BOUNDARY,
        name = name,
        ct = content_type,
        text = text
    )
    .into_bytes()
}

async fn post_message(addr: SocketAddr, me: Sid, them: Sid, body: Vec<u8>) -> (StatusCode, HeaderMap, serde_json::Value) {
    let ct = format!("multipart/form-data; boundary={}", BOUNDARY);
    let path = format!("/restful/meshms/{}/{}/sendmessage", me, them);
    request(addr, Method::POST, &path, Some(&ct), body).await
}

fn meshms_status(headers: &HeaderMap) -> Option<&str> {
    headers.get(MESHMS_STATUS_HEADER).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn test_conversation_list() {
    let (addr, store) = start(Config::default()).await;
    store.send_message(&alice(), &bob(), b"hi bob");
    store.send_message(&carol(), &alice(), b"hi alice");

    let (status, headers, v) = get(addr, &format!("/restful/meshms/{}/conversationlist.json", alice())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(meshms_status(&headers), Some("0"));
    assert_eq!(
        v["header"],
        serde_json::json!(["_id", "my_sid", "their_sid", "read", "last_message", "read_offset"])
    );
    let rows = v["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], 0);
    assert_eq!(rows[1][0], 1);
    for row in rows {
        assert_eq!(row[1], alice().to_hex());
    }
}

#[tokio::test]
async fn test_send_then_list() {
    let (addr, _store) = start(Config::default()).await;

    let (status, headers, v) = post_message(addr, alice(), bob(), form("message", "text/plain; charset=utf-8", "hello")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(meshms_status(&headers), Some("1"));
    assert_eq!(
        v,
        serde_json::json!({
            "http_status_code": 201,
            "http_status_message": "Message sent",
            "meshms_status_code": 1
        })
    );

    let path = format!("/restful/meshms/{}/{}/messagelist.json", alice(), bob());
    let (status, _, v) = get(addr, &path).await;
    assert_eq!(status, StatusCode::OK);
    let rows = v["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], ">");
    assert_eq!(rows[0][5], "hello");
    let token = MeshmsToken::new(BundleId::for_ply(&alice(), &bob()), rows[0][3].as_u64().unwrap());
    assert_eq!(rows[0][4], token.encode());

    // the other side sees it as received
    let path = format!("/restful/meshms/{}/{}/messagelist.json", bob(), alice());
    let (_, _, v) = get(addr, &path).await;
    assert_eq!(v["rows"][0][0], "<");
}

#[tokio::test]
async fn test_send_rejections() {
    let (addr, store) = start(Config::default()).await;
    let cases = vec![
        (
            form("message", "text/plain; charset=utf-8", ""),
            "Invalid (empty) \"message\" form part",
        ),
        (
            form("subject", "text/plain; charset=utf-8", "x"),
            "Unsupported \"subject\" form part",
        ),
        (
            form("message", "text/html; charset=utf-8", "x"),
            "Unsupported Content-Type: text/html",
        ),
        (form("message", "text/plain", "x"), "Missing charset in Content-Type"),
        (
            format!("--{}--\r\n", BOUNDARY).into_bytes(),
            "Missing \"message\" form part",
        ),
        (
            form("message", "text/plain; charset=utf-8", &"x".repeat(4096)),
            "Overflow in \"message\" form part",
        ),
    ];
    for (body, expected) in cases {
        let (status, headers, v) = post_message(addr, alice(), bob(), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", expected);
        assert_eq!(v["http_status_message"], expected);
        assert!(v.get("meshms_status_code").is_none());
        assert_eq!(meshms_status(&headers), None);
    }
    // nothing reached the store
    assert!(store.conversations(&alice()).unwrap().is_empty());
}

#[tokio::test]
async fn test_not_found_and_method_not_allowed() {
    let (addr, _store) = start(Config::default()).await;
    let base = format!("/restful/meshms/{}/{}", alice(), bob());

    let (status, _, _) = get(addr, "/restful/meshms/nobody/conversationlist.json").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = get(addr, "/elsewhere").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = get(addr, &format!("{}/newsince/garbage/messagelist.json", base)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, v) = get(addr, &format!("{}/sendmessage", base)).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(v["http_status_code"], 405);

    let (status, _, _) = request(addr, Method::POST, &format!("{}/messagelist.json", base), None, Vec::new()).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_unmatched_token() {
    let (addr, _store) = start(Config::default()).await;
    let token = MeshmsToken::new(BundleId::for_ply(&alice(), &carol()), 0);
    let path = format!("/restful/meshms/{}/{}/newsince/{}/messagelist.json", alice(), bob(), token);
    let (status, _, v) = get(addr, &path).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(v["http_status_message"], "Unmatched token");
}

#[tokio::test]
async fn test_disabled_interface() {
    let config = Config {
        restful_enabled: false,
        ..Config::default()
    };
    let (addr, _store) = start(config).await;
    let (status, _, _) = get(addr, &format!("/restful/meshms/{}/conversationlist.json", alice())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_locked_identity() {
    let (addr, store) = start(Config::default()).await;
    store.lock_identity(alice());
    let (status, headers, v) = get(addr, &format!("/restful/meshms/{}/conversationlist.json", alice())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(meshms_status(&headers), Some("2"));
    assert_eq!(v["http_status_message"], "Identity unknown");
    assert_eq!(v["meshms_status_code"], 2);
}

#[tokio::test]
async fn test_newsince_times_out_empty() {
    let config = Config {
        newsince_timeout: Duration::from_millis(300),
        newsince_poll_interval: Duration::from_millis(100),
        ..Config::default()
    };
    let (addr, store) = start(config).await;
    store.send_message(&alice(), &bob(), b"old");
    let token = MeshmsToken::new(BundleId::for_ply(&alice(), &bob()), 6);
    let path = format!("/restful/meshms/{}/{}/newsince/{}/messagelist.json", alice(), bob(), token);

    let started = Instant::now();
    let (status, _, v) = get(addr, &path).await;
    assert_eq!(status, StatusCode::OK);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(v["rows"], serde_json::json!([]));
    assert!(v.get("read_offset").is_none());
}

#[tokio::test]
async fn test_newsince_woken_by_send() {
    let config = Config {
        newsince_timeout: Duration::from_secs(30),
        newsince_poll_interval: Duration::from_secs(30),
        ..Config::default()
    };
    let (addr, store) = start(config).await;
    store.send_message(&alice(), &bob(), b"one");
    let token = MeshmsToken::new(BundleId::for_ply(&alice(), &bob()), 6);
    let path = format!("/restful/meshms/{}/{}/newsince/{}/messagelist.json", alice(), bob(), token);

    let mut sender = connect(addr).await;
    let resp = sender
        .send_request(build(Method::GET, &path, None, Vec::new()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let mut body = resp.into_body();

    let sender_store = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        sender_store.send_message(&bob(), &alice(), b"two");
    });

    let started = Instant::now();
    let mut received = Vec::new();
    while !String::from_utf8_lossy(&received).contains("\"two\"") {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("no row before the poll interval")
            .unwrap()
            .unwrap();
        if let Ok(data) = frame.into_data() {
            received.extend_from_slice(&data);
        }
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    let text = String::from_utf8_lossy(&received);
    assert!(text.contains("\"rows\":["));
    assert!(!text.contains("\"one\""));
}
