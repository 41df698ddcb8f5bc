use crate::error::{ChatError, ErrorPayload};
use crate::provider::STREAM_BUFFER;
use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response as HttpResponse};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const SSE_DONE: &str = "data: [DONE]\n\n";
const CORS_ALLOW_METHODS: &str = "GET,POST,OPTIONS,HEAD,PUT,PATCH,DELETE";

/// A request body that can arrive over any transport and be normalized once decoded.
pub trait InitRequest: DeserializeOwned + Send + 'static {
    fn init(self) -> Self;
}

/// Decodes a request body and applies its `init` step.
pub fn decode_request<T: InitRequest>(body: &[u8]) -> Result<T, ChatError> {
    serde_json::from_slice::<T>(body)
        .map(InitRequest::init)
        .map_err(|err| ChatError::MalformedRequest(err.to_string()))
}

pub fn cors_headers() -> [(HeaderName, HeaderValue); 3] {
    [
        (
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ),
        (
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("*"),
        ),
        (
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(CORS_ALLOW_METHODS),
        ),
    ]
}

pub fn apply_cors(headers: &mut HeaderMap) {
    for (name, value) in cors_headers() {
        headers.insert(name, value);
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    /// Written verbatim.
    Raw(String),
    Json(Value),
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, ChatError> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    fn encode(self) -> String {
        match self {
            Self::Raw(text) => text,
            Self::Json(value) => value.to_string(),
        }
    }
}

type ClosedCallback = Box<dyn FnOnce() + Send>;

struct SseTransport {
    init: Once,
    head: Mutex<Option<oneshot::Sender<HeaderMap>>>,
    body: Mutex<Option<mpsc::Sender<Bytes>>>,
}

struct WsTransport {
    tx: tokio::sync::Mutex<SplitSink<WebSocket, WsMessage>>,
}

enum Transport {
    Sse(SseTransport),
    WebSocket(WsTransport),
}

/// One connection's outbound half. Writes go out in call order; close runs once.
pub struct StreamSink {
    transport: Transport,
    cors: bool,
    closed: AtomicBool,
    done: CancellationToken,
    on_closed: Mutex<Option<ClosedCallback>>,
}

/// The HTTP response of an SSE sink, available once the first write emits the head.
pub struct SseResponse {
    head: oneshot::Receiver<HeaderMap>,
    body: mpsc::Receiver<Bytes>,
}

impl SseResponse {
    pub async fn into_http(self) -> HttpResponse {
        let Ok(headers) = self.head.await else {
            return StatusCode::NO_CONTENT.into_response();
        };
        let stream = ReceiverStream::new(self.body).map(Ok::<_, Infallible>);
        let mut resp = Body::from_stream(stream).into_response();
        *resp.headers_mut() = headers;
        resp
    }
}

impl StreamSink {
    fn with_transport(transport: Transport, cors: bool) -> Arc<Self> {
        Arc::new(Self {
            transport,
            cors,
            closed: AtomicBool::new(false),
            done: CancellationToken::new(),
            on_closed: Mutex::new(None),
        })
    }

    /// Creates an SSE sink. Must be called inside a Tokio runtime: a watcher
    /// task closes the sink as soon as the client drops the response body.
    pub fn sse(cors: bool) -> (Arc<Self>, SseResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(STREAM_BUFFER);
        let peer = body_tx.clone();
        let sink = Self::with_transport(
            Transport::Sse(SseTransport {
                init: Once::new(),
                head: Mutex::new(Some(head_tx)),
                body: Mutex::new(Some(body_tx)),
            }),
            cors,
        );
        tokio::spawn(watch_sse_peer(peer, sink.done.clone(), Arc::downgrade(&sink)));
        (
            sink,
            SseResponse {
                head: head_rx,
                body: body_rx,
            },
        )
    }

    /// Reads the single request frame of a WebSocket session and starts the
    /// drain task that closes the sink when the peer goes away.
    pub async fn accept_websocket<T: InitRequest>(
        socket: WebSocket,
        cors: bool,
    ) -> Result<(Arc<Self>, T), ChatError> {
        let (tx, mut rx) = socket.split();
        let sink = Self::with_transport(
            Transport::WebSocket(WsTransport {
                tx: tokio::sync::Mutex::new(tx),
            }),
            cors,
        );

        let decoded = loop {
            break match rx.next().await {
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Text(text))) => decode_request::<T>(text.as_str().as_bytes()),
                Some(Ok(WsMessage::Binary(data))) => decode_request::<T>(&data),
                Some(Ok(other)) => Err(ChatError::MalformedRequest(format!(
                    "expected a request frame, got {other:?}"
                ))),
                Some(Err(err)) => Err(ChatError::Upgrade(err.to_string())),
                None => Err(ChatError::Upgrade(
                    "peer closed before sending a request".to_string(),
                )),
            };
        };

        match decoded {
            Ok(req) => {
                tokio::spawn(drain_inbound(rx, sink.clone()));
                Ok((sink, req))
            }
            Err(err) => {
                let _ = sink.write_error(&err, err.status().as_u16()).await;
                sink.close().await;
                Err(err)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registers the teardown hook. Runs it right away if the sink already closed.
    pub fn set_on_closed(&self, cb: impl FnOnce() + Send + 'static) {
        if let Ok(mut slot) = self.on_closed.lock() {
            *slot = Some(Box::new(cb));
        }
        if self.is_closed() {
            self.run_on_closed();
        }
    }

    pub async fn write(&self, payload: Payload) -> Result<(), ChatError> {
        if self.is_closed() {
            return Err(ChatError::SinkClosed);
        }
        let text = payload.encode();
        match &self.transport {
            Transport::Sse(sse) => {
                self.init_sse(sse);
                let tx = sse
                    .body
                    .lock()
                    .ok()
                    .and_then(|guard| guard.clone())
                    .ok_or(ChatError::SinkClosed)?;
                tx.send(Bytes::from(format!("data: {text}\n\n")))
                    .await
                    .map_err(|_| ChatError::SinkClosed)
            }
            Transport::WebSocket(ws) => ws
                .tx
                .lock()
                .await
                .send(WsMessage::Text(text.into()))
                .await
                .map_err(|_| ChatError::SinkClosed),
        }
    }

    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), ChatError> {
        self.write(Payload::json(value)?).await
    }

    pub async fn write_error(
        &self,
        err: impl std::fmt::Display,
        code: u16,
    ) -> Result<(), ChatError> {
        self.write_json(&ErrorPayload::new(err, code)).await
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.transport {
            Transport::Sse(sse) => {
                // Dropping an unsent head turns the response into 204.
                if let Ok(mut head) = sse.head.lock() {
                    head.take();
                }
                let body = sse.body.lock().ok().and_then(|mut guard| guard.take());
                if sse.init.is_completed()
                    && let Some(tx) = body
                {
                    let _ = tx.send(Bytes::from_static(SSE_DONE.as_bytes())).await;
                }
            }
            Transport::WebSocket(ws) => {
                let mut tx = ws.tx.lock().await;
                let _ = tx.send(WsMessage::Close(None)).await;
                let _ = tx.close().await;
            }
        }
        self.done.cancel();
        self.run_on_closed();
    }

    fn init_sse(&self, sse: &SseTransport) {
        sse.init.call_once(|| {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            if self.cors {
                apply_cors(&mut headers);
            }
            if let Some(head) = sse.head.lock().ok().and_then(|mut h| h.take()) {
                let _ = head.send(headers);
            }
        });
    }

    fn run_on_closed(&self) {
        let cb = self.on_closed.lock().ok().and_then(|mut slot| slot.take());
        if let Some(cb) = cb {
            cb();
        }
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

async fn watch_sse_peer(
    body: mpsc::Sender<Bytes>,
    done: CancellationToken,
    sink: Weak<StreamSink>,
) {
    tokio::select! {
        _ = done.cancelled() => {}
        _ = body.closed() => {
            if let Some(sink) = sink.upgrade() {
                tracing::debug!("sse client went away");
                sink.close().await;
            }
        }
    }
}

async fn drain_inbound(mut rx: SplitStream<WebSocket>, sink: Arc<StreamSink>) {
    loop {
        let next = tokio::select! {
            _ = sink.done.cancelled() => return,
            next = rx.next() => next,
        };
        match next {
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Err(err)) => {
                tracing::debug!("websocket read failed: {err}");
                break;
            }
            Some(Ok(_)) => {}
        }
    }
    sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Request;
    use http_body_util::BodyExt;
    use std::sync::atomic::AtomicUsize;

    async fn body_text(resp: HttpResponse) -> String {
        let bytes = resp
            .into_body()
            .collect()
            .await
            .expect("collect")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[tokio::test]
    async fn sse_frames_then_done() {
        let (sink, sse) = StreamSink::sse(false);
        sink.write(Payload::Raw("a".to_string())).await.expect("write");
        sink.write_json(&serde_json::json!({"text": "b"}))
            .await
            .expect("write");
        sink.close().await;

        let resp = sse.into_http().await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(&b"text/event-stream"[..])
        );
        assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert_eq!(
            body_text(resp).await,
            "data: a\n\ndata: {\"text\":\"b\"}\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn cors_headers_ride_on_the_head() {
        let (sink, sse) = StreamSink::sse(true);
        sink.write(Payload::Raw("x".to_string())).await.expect("write");
        sink.close().await;
        let resp = sse.into_http().await;
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_METHODS)
                .map(|v| v.as_bytes()),
            Some(CORS_ALLOW_METHODS.as_bytes())
        );
    }

    #[tokio::test]
    async fn unwritten_sse_sink_closes_with_no_content() {
        let (sink, sse) = StreamSink::sse(false);
        sink.close().await;
        let resp = sse.into_http().await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn concurrent_close_finishes_once() {
        let (sink, sse) = StreamSink::sse(false);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            sink.set_on_closed(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        sink.write(Payload::Raw("only".to_string())).await.expect("write");

        let closers: Vec<_> = (0..16)
            .map(|_| {
                let sink = sink.clone();
                tokio::spawn(async move { sink.close().await })
            })
            .collect();
        for closer in closers {
            closer.await.expect("join");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let body = body_text(sse.into_http().await).await;
        assert_eq!(body.matches("[DONE]").count(), 1);
    }

    #[tokio::test]
    async fn dropped_sse_body_closes_the_sink() {
        let (sink, sse) = StreamSink::sse(false);
        let (fired_tx, fired_rx) = oneshot::channel();
        sink.set_on_closed(move || {
            let _ = fired_tx.send(());
        });
        sink.write(Payload::Raw("first".to_string())).await.expect("write");

        drop(sse.into_http().await);
        tokio::time::timeout(std::time::Duration::from_secs(5), fired_rx)
            .await
            .expect("close observed")
            .expect("callback ran");
        assert!(sink.is_closed());
    }

    #[test]
    fn unserializable_payload_is_an_error() {
        let mut map = std::collections::BTreeMap::new();
        map.insert((1u8, 2u8), 3u8);
        assert!(matches!(Payload::json(&map), Err(ChatError::Encode(_))));
    }

    #[tokio::test]
    async fn writes_after_close_are_rejected() {
        let (sink, _sse) = StreamSink::sse(false);
        sink.close().await;
        assert!(matches!(
            sink.write(Payload::Raw("late".to_string())).await,
            Err(ChatError::SinkClosed)
        ));
    }

    #[tokio::test]
    async fn late_callback_runs_immediately() {
        let (sink, _sse) = StreamSink::sse(false);
        sink.close().await;
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        sink.set_on_closed(move || flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn error_payload_shape() {
        let (sink, sse) = StreamSink::sse(false);
        sink.write_error(&ChatError::ContextExceedLimit, 400)
            .await
            .expect("write");
        sink.close().await;
        let body = body_text(sse.into_http().await).await;
        let first = body
            .strip_prefix("data: ")
            .and_then(|rest| rest.split("\n\n").next())
            .expect("frame");
        let payload: ErrorPayload = serde_json::from_str(first).expect("decode");
        assert_eq!(payload.code, 400);
        assert!(payload.error.contains("context length"));
    }

    #[test]
    fn decode_runs_init() {
        let req: Request = decode_request(br#"{"model":"azure:gpt-4","n":7,"messages":[]}"#)
            .expect("decode");
        assert_eq!(req.model, "gpt-4");
        assert_eq!(req.room_id, 7);
        assert!(matches!(
            decode_request::<Request>(b"{not json"),
            Err(ChatError::MalformedRequest(_))
        ));
    }
}
