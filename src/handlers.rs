use crate::app::AppState;
use crate::chat::Request;
use crate::error::{AppError, ChatError};
use crate::normalize::{has_image, to_log_entry, uploaded_file};
use crate::openai::select_best_model;
use crate::provider::ChatProvider;
use crate::sink::{StreamSink, apply_cors, decode_request};
use crate::tokenizer::count_text_tokens;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn create_chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let req = match decode_request::<Request>(&body) {
        Ok(req) => req,
        Err(err) => return error_response(&state, err.into()),
    };
    metrics::counter!("chatgate_requests_total", "mode" => "sse").increment(1);

    let conn_id = Uuid::new_v4();
    let (sink, sse) = StreamSink::sse(state.runtime.cors);
    let span = tracing::info_span!("chat", %conn_id, mode = "sse");
    tokio::spawn(serve_chat(state, sink, req).instrument(span));
    sse.into_http().await
}

pub async fn chat_websocket(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let err = ChatError::Upgrade(rejection.body_text());
            let app = AppError::new(rejection.status(), err.code(), err.to_string());
            return error_response(&state, app);
        }
    };
    metrics::counter!("chatgate_requests_total", "mode" => "websocket").increment(1);

    let cors = state.runtime.cors;
    let conn_id = Uuid::new_v4();
    let mut resp = ws.on_upgrade(move |socket| {
        async move {
            match StreamSink::accept_websocket::<Request>(socket, cors).await {
                Ok((sink, mut req)) => {
                    req.websocket = true;
                    serve_chat(state, sink, req).await;
                }
                Err(err) => {
                    metrics::counter!("chatgate_errors_total", "code" => err.code()).increment(1);
                    tracing::warn!(code = err.code(), "websocket request rejected: {err}");
                }
            }
        }
        .instrument(tracing::info_span!("chat", %conn_id, mode = "websocket"))
    });
    if cors {
        apply_cors(resp.headers_mut());
    }
    resp
}

fn error_response(state: &AppState, err: AppError) -> Response {
    metrics::counter!("chatgate_errors_total", "code" => err.code.clone()).increment(1);
    let mut resp = err.into_response();
    if state.runtime.cors {
        apply_cors(resp.headers_mut());
    }
    resp
}

/// Runs one conversation to completion on `sink` and closes it.
pub async fn serve_chat(state: AppState, sink: Arc<StreamSink>, req: Request) {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        sink.set_on_closed(move || cancel.cancel());
    }

    if let Err(err) = run_chat(&state, &sink, req, &cancel).await {
        metrics::counter!("chatgate_errors_total", "code" => err.code()).increment(1);
        match err {
            ChatError::SinkClosed => tracing::debug!("client went away"),
            err => {
                tracing::warn!(code = err.code(), "chat failed: {err}");
                let _ = sink.write_error(&err, err.status().as_u16()).await;
            }
        }
    }
    sink.close().await;
}

async fn run_chat(
    state: &AppState,
    sink: &StreamSink,
    req: Request,
    cancel: &CancellationToken,
) -> Result<(), ChatError> {
    req.ensure_conversation()?;
    if let Some(file) = req.messages.last().and_then(uploaded_file) {
        tracing::debug!(file = %file.name, "file parts are not forwarded upstream");
    }
    let chat = &state.config.chat;
    let (mut req, input_tokens) = req.purification().fix(
        state.router.as_ref(),
        chat.max_context_messages,
        chat.max_input_tokens,
    )?;
    if chat.auto_select_model {
        req.model = select_best_model(&req.model, input_tokens);
    }
    tracing::debug!(
        model = %req.model,
        room_id = req.room_id,
        websocket = req.websocket,
        input_tokens,
        has_image = has_image(&req.messages),
        messages = ?to_log_entry(&req.messages),
        "dispatching chat"
    );

    let model = req.model.clone();
    if !req.stream {
        let mut resp = state.router.complete(req).await?;
        if resp.input_tokens == 0 {
            resp.input_tokens = input_tokens;
        }
        if resp.output_tokens == 0 {
            resp.output_tokens = count_text_tokens(&resp.text, &model);
        }
        return sink.write_json(&resp).await;
    }

    let mut events = state.router.complete_stream(req, cancel.clone()).await?;
    let mut completion = String::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = events.recv() => next,
        };
        let Some(mut event) = next else {
            return Ok(());
        };
        completion.push_str(&event.text);
        if event.finish_reason.is_some() {
            event.input_tokens = input_tokens;
            event.output_tokens = count_text_tokens(&completion, &model);
        }
        sink.write_json(&event).await?;
    }
}
