//! Request/response wrappers handed to tenant handlers
//!
//! `ResponseAdapter` turns hyper's "return a response" model into a writable
//! response: the head is delivered to the connection on the first body
//! write (or `end`), after which status and headers are frozen. Writes after
//! the response ended are ignored so error paths can finalize blindly.

use futures::channel::mpsc;
use futures::SinkExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode, Uri};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::Rejection;

pub type RequestBody = BoxBody<Bytes, hyper::Error>;
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

pub const TEXT_PLAIN: &str = "text/plain; charset=UTF-8";
pub const TEXT_HTML: &str = "text/html; charset=UTF-8";
pub const APPLICATION_JSON: &str = "application/json; charset=UTF-8";

/// Chunks buffered between a streaming writer and the connection
const CHUNK_BUFFER: usize = 8;

fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Errors from reading a buffered request body
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("failed to read request body: {0}")]
    Read(String),
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("request body is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("request body stream was already taken")]
    Consumed,
}

/// Read side of a single request
pub struct RequestAdapter {
    parts: Parts,
    body: Option<RequestBody>,
    buffered: Option<Bytes>,
    max_body_bytes: usize,
}

impl RequestAdapter {
    pub fn new(req: Request<RequestBody>, max_body_bytes: usize) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            parts,
            body: Some(body),
            buffered: None,
            max_body_bytes,
        }
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Case-insensitive header lookup; non-ASCII values are treated as absent
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    /// Path and query exactly as received
    pub fn url(&self) -> &str {
        self.parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    /// Take the raw body stream. Returns `None` once the body has been
    /// taken or buffered.
    pub fn take_body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }

    /// Buffer the whole body, up to the configured limit. Repeated calls
    /// return the same bytes.
    pub async fn bytes(&mut self) -> Result<Bytes, BodyError> {
        if let Some(buffered) = &self.buffered {
            return Ok(buffered.clone());
        }
        let body = self.body.take().ok_or(BodyError::Consumed)?;
        let collected = Limited::new(body, self.max_body_bytes)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    BodyError::TooLarge {
                        limit: self.max_body_bytes,
                    }
                } else {
                    BodyError::Read(e.to_string())
                }
            })?;
        let bytes = collected.to_bytes();
        self.buffered = Some(bytes.clone());
        Ok(bytes)
    }

    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T, BodyError> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

enum Stage {
    Open,
    Streaming(mpsc::Sender<Result<Frame<Bytes>, Infallible>>),
    /// HEAD response being written: bytes are counted, not sent, and the
    /// head goes out on `end` with the total as Content-Length
    Counting(usize),
    Ended,
}

/// Receives the response head once the writer commits it
pub struct ResponseReceiver {
    rx: oneshot::Receiver<Response<ResponseBody>>,
}

impl ResponseReceiver {
    /// Fails if the writer was dropped without ever sending a head
    pub async fn recv(self) -> Result<Response<ResponseBody>, oneshot::error::RecvError> {
        self.rx.await
    }
}

/// Write side of a single request
pub struct ResponseAdapter {
    method: Method,
    status: StatusCode,
    headers: HeaderMap,
    stage: Stage,
    head_tx: Option<oneshot::Sender<Response<ResponseBody>>>,
}

impl ResponseAdapter {
    /// Create a writer for a response to `method`. The `Server` header is
    /// set before anything else.
    pub fn new(method: Method, server_identity: &str) -> (Self, ResponseReceiver) {
        let (tx, rx) = oneshot::channel();
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(server_identity) {
            Ok(value) => {
                headers.insert(header::SERVER, value);
            }
            Err(_) => warn!(server_identity, "Server identity is not a valid header value"),
        }
        let adapter = Self {
            method,
            status: StatusCode::OK,
            headers,
            stage: Stage::Open,
            head_tx: Some(tx),
        };
        (adapter, ResponseReceiver { rx })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn headers_sent(&self) -> bool {
        !matches!(self.stage, Stage::Open)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.stage, Stage::Ended)
    }

    /// Returns false (and changes nothing) once headers were sent
    pub fn set_status(&mut self, status: StatusCode) -> bool {
        if self.headers_sent() {
            debug!(%status, "Ignoring status change after headers were sent");
            return false;
        }
        self.status = status;
        true
    }

    /// Returns false (and changes nothing) once headers were sent
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> bool {
        if self.headers_sent() {
            debug!(header = %name, "Ignoring header change after headers were sent");
            return false;
        }
        self.headers.insert(name, value);
        true
    }

    pub fn send_text(&mut self, text: impl Into<String>) {
        self.send(TEXT_PLAIN, Bytes::from(text.into()));
    }

    pub fn send_html(&mut self, html: impl Into<String>) {
        self.send(TEXT_HTML, Bytes::from(html.into()));
    }

    pub fn send_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        self.send(APPLICATION_JSON, Bytes::from(body));
        Ok(())
    }

    /// Send a complete body and end the response. Content-Length is the
    /// encoded byte length; HEAD responses carry the length but no bytes.
    pub fn send(&mut self, content_type: &'static str, body: Bytes) {
        if self.headers_sent() {
            debug!("Ignoring body write to a response that was already started");
            return;
        }
        self.apply_empty_options_rule(body.len());
        if self.status != StatusCode::NO_CONTENT {
            self.headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            self.headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        let body: ResponseBody = if self.suppress_body() {
            empty_body()
        } else {
            Full::new(body).map_err(|never| match never {}).boxed()
        };
        self.commit(body);
        self.stage = Stage::Ended;
    }

    /// Stream one chunk. The first call commits status and headers, except
    /// for HEAD, where the head waits for `end` so it can carry the length.
    pub async fn write(&mut self, chunk: Bytes) {
        match self.stage {
            Stage::Open if self.method == Method::HEAD => {
                self.stage = Stage::Counting(chunk.len());
                return;
            }
            Stage::Counting(ref mut written) => {
                *written += chunk.len();
                return;
            }
            _ => {}
        }

        if let Stage::Open = self.stage {
            let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
            let body: ResponseBody = if self.suppress_body() {
                empty_body()
            } else {
                StreamBody::new(rx).map_err(|never| match never {}).boxed()
            };
            self.commit(body);
            self.stage = Stage::Streaming(tx);
        }

        if self.suppress_body() {
            return;
        }

        if let Stage::Streaming(tx) = &mut self.stage {
            if tx.send(Ok(Frame::data(chunk))).await.is_err() {
                debug!("Client went away while streaming response body");
                self.stage = Stage::Ended;
            }
        }
    }

    /// Finish the response. Idempotent.
    pub fn end(&mut self) {
        match self.stage {
            Stage::Open => {
                self.apply_empty_options_rule(0);
                if self.status != StatusCode::NO_CONTENT {
                    self.headers
                        .insert(header::CONTENT_LENGTH, HeaderValue::from(0usize));
                }
                self.commit(empty_body());
            }
            Stage::Counting(written) => {
                if self.status != StatusCode::NO_CONTENT && self.status != StatusCode::NOT_MODIFIED {
                    self.headers
                        .insert(header::CONTENT_LENGTH, HeaderValue::from(written));
                }
                self.commit(empty_body());
            }
            Stage::Streaming(_) => {}
            Stage::Ended => return,
        }
        // Dropping the chunk sender terminates the streamed body
        self.stage = Stage::Ended;
    }

    /// Finalize after a handler failure: a 500 if nothing was sent yet,
    /// otherwise just end what was started.
    pub fn fail(&mut self) {
        match self.stage {
            Stage::Open => {
                let server = self.headers.get(header::SERVER).cloned();
                self.headers.clear();
                if let Some(server) = server {
                    self.headers.insert(header::SERVER, server);
                }
                self.status = Rejection::Internal.status_code();
                self.send_text(Rejection::Internal.body());
            }
            Stage::Streaming(_) | Stage::Counting(_) => self.end(),
            Stage::Ended => {}
        }
    }

    /// OPTIONS with nothing to say answers 204 rather than 200
    fn apply_empty_options_rule(&mut self, body_len: usize) {
        if self.method == Method::OPTIONS && body_len == 0 && self.status == StatusCode::OK {
            self.status = StatusCode::NO_CONTENT;
        }
    }

    fn suppress_body(&self) -> bool {
        self.method == Method::HEAD
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
    }

    fn commit(&mut self, body: ResponseBody) {
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        if let Some(tx) = self.head_tx.take() {
            // Receiver gone means the connection was dropped
            let _ = tx.send(response);
        }
    }
}
