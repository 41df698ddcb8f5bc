use crate::chat::{Message, PART_IMAGE_URL, PART_TEXT, Request, Response};
use crate::error::ChatError;
use crate::provider::{ChatProvider, ResponseStream, STREAM_BUFFER, forward_event};
use crate::upstream::{self, UpstreamAuth, UpstreamCallError};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const FINISH_CONTENT_FILTER: &str = "content_filter";

const VISION_MODEL: &str = "gpt-4-vision-preview";
const VISION_DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_MAX_CONTEXT: i64 = 3500;

static DEPLOYMENT_STRIP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[.:]").unwrap_or_else(|err| panic!("deployment pattern: {err}"))
});

/// Largest prompt each model accepts, leaving room for the completion.
pub fn model_max_context_size(model: &str) -> i64 {
    match model {
        "gpt-3.5-turbo" | "gpt-3.5-turbo-0613" | "gpt-3.5-turbo-instruct" => 3500,
        "gpt-3.5-turbo-16k" | "gpt-3.5-turbo-16k-0613" => 3500 * 4,
        "gpt-4" | "gpt-4-0613" => 7500,
        "gpt-4-32k" | "gpt-4-32k-0613" => 3500 * 8,
        "gpt-3.5-turbo-1106" => 16385 - 4096,
        "gpt-4-1106-preview" | "gpt-4-vision-preview" => 128000 - 4096,
        m if m.starts_with("gpt-4o") => 128000 - 4096,
        _ => DEFAULT_MAX_CONTEXT,
    }
}

/// Picks the smaller sibling of a long-context model when the prompt fits it.
pub fn select_best_model(model: &str, token_count: i64) -> String {
    if model.starts_with("gpt-3.5-turbo-16k") && token_count <= 4000 {
        return "gpt-3.5-turbo".to_string();
    }
    if model.starts_with("gpt-4-32k") && token_count <= 8000 {
        return "gpt-4".to_string();
    }
    model.to_string()
}

/// Maps a public model id to the Azure deployment that serves it.
pub fn azure_deployment(model: &str) -> String {
    match model {
        "gpt-3.5-turbo" | "gpt-3.5-turbo-0613" => "gpt35-turbo".to_string(),
        "gpt-3.5-turbo-16k" | "gpt-3.5-turbo-16k-0613" => "gpt35-turbo-16k".to_string(),
        "gpt-4" | "gpt-4-0613" => "gpt4".to_string(),
        "gpt-4-32k" | "gpt-4-32k-0613" => "gpt4-32k".to_string(),
        other => DEPLOYMENT_STRIP.replace_all(other, "").into_owned(),
    }
}

#[derive(Debug, Clone)]
enum Routing {
    Plain,
    Azure { api_version: String },
}

/// One authenticated (server, key) pair speaking the OpenAI chat API.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    server: String,
    auth: UpstreamAuth,
    routing: Routing,
}

impl OpenAiClient {
    pub fn new(
        http: reqwest::Client,
        server: impl Into<String>,
        key: impl Into<String>,
        organization: Option<String>,
    ) -> Self {
        Self {
            http,
            server: server.into(),
            auth: UpstreamAuth::Bearer {
                key: key.into(),
                organization,
            },
            routing: Routing::Plain,
        }
    }

    pub fn azure(
        http: reqwest::Client,
        server: impl Into<String>,
        key: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            http,
            server: server.into(),
            auth: UpstreamAuth::ApiKeyHeader(key.into()),
            routing: Routing::Azure {
                api_version: api_version.into(),
            },
        }
    }

    fn endpoint(&self, model: &str) -> String {
        match &self.routing {
            Routing::Plain => upstream::join_url(&self.server, "/chat/completions"),
            Routing::Azure { api_version } => format!(
                "{}?api-version={}",
                upstream::join_url(
                    &self.server,
                    &format!("/openai/deployments/{}/chat/completions", azure_deployment(model)),
                ),
                api_version
            ),
        }
    }
}

fn build_body(req: &Request, stream: bool) -> Value {
    let mut max_tokens = req.max_tokens;
    if req.model == VISION_MODEL && max_tokens.is_none() {
        max_tokens = Some(VISION_DEFAULT_MAX_TOKENS);
    }

    let mut body = json!({
        "model": req.model,
        "messages": req.messages.iter().map(encode_message).collect::<Vec<_>>(),
        "stream": stream,
    });
    if let Some(max_tokens) = max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

fn encode_message(message: &Message) -> Value {
    let mut out = json!({ "role": message.role.as_str() });
    if message.multipart_contents.is_empty() {
        out["content"] = json!(message.content);
    } else {
        let parts: Vec<Value> = message
            .multipart_contents
            .iter()
            .filter_map(|part| match part.kind.as_str() {
                PART_TEXT => Some(json!({ "type": "text", "text": part.text })),
                PART_IMAGE_URL => part.image_url.as_ref().map(|img| {
                    let mut image = json!({ "url": img.url });
                    if !img.detail.is_empty() {
                        image["detail"] = json!(img.detail);
                    }
                    json!({ "type": "image_url", "image_url": image })
                }),
                _ => None,
            })
            .collect();
        out["content"] = Value::Array(parts);
    }
    if let Some(name) = message.name.as_deref().filter(|n| !n.is_empty()) {
        out["name"] = json!(name);
    }
    out
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

/// Error envelope an upstream may send in place of a chunk mid-stream.
#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

fn decode_completion(completion: ChatCompletion) -> Result<Response, ChatError> {
    let text = completion
        .choices
        .iter()
        .filter_map(|choice| choice.message.as_ref()?.content.as_deref())
        .collect::<Vec<_>>()
        .join("\n");
    let finish_reason = completion
        .choices
        .first()
        .and_then(|choice| choice.finish_reason.clone());
    if finish_reason.as_deref() == Some(FINISH_CONTENT_FILTER) {
        return Err(ChatError::ContentFilter(text));
    }
    let (input_tokens, output_tokens) = completion
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();
    Ok(Response {
        text,
        finish_reason,
        input_tokens,
        output_tokens,
        ..Response::default()
    })
}

/// Turns one upstream chunk into the events the gateway emits for it.
fn decode_chunk(chunk: ChatCompletionChunk) -> Option<Response> {
    if let Some(err) = chunk.error {
        if err.code.as_ref().and_then(Value::as_str) == Some(FINISH_CONTENT_FILTER) {
            return Some(Response::from_error(&ChatError::ContentFilter(err.message)));
        }
        return Some(read_failed(err.message));
    }
    let choice = chunk.choices.into_iter().next()?;
    let text = choice
        .delta
        .and_then(|d| d.content)
        .unwrap_or_default();
    if choice.finish_reason.as_deref() == Some(FINISH_CONTENT_FILTER) {
        return Some(Response::from_error(&ChatError::ContentFilter(text)));
    }
    if text.is_empty() && choice.finish_reason.is_none() {
        return None;
    }
    Some(Response {
        text,
        finish_reason: choice.finish_reason,
        ..Response::default()
    })
}

fn read_failed(err: impl std::fmt::Display) -> Response {
    Response::from_error(&ChatError::StreamRead(err.to_string()))
}

fn map_upstream_error(err: UpstreamCallError) -> ChatError {
    if err.code.as_deref() == Some(FINISH_CONTENT_FILTER) {
        return ChatError::ContentFilter(err.message);
    }
    ChatError::Transport(err)
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    async fn complete(&self, req: Request) -> Result<Response, ChatError> {
        let body = build_body(&req, false);
        let url = self.endpoint(&req.model);
        tracing::debug!(server = %self.server, model = %req.model, "chat completion");
        let completion: ChatCompletion = upstream::post_json(&self.http, &url, &self.auth, &body)
            .await
            .map_err(map_upstream_error)?;
        decode_completion(completion)
    }

    async fn complete_stream(
        &self,
        req: Request,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, ChatError> {
        let body = build_body(&req, true);
        let url = self.endpoint(&req.model);
        tracing::debug!(server = %self.server, model = %req.model, "chat completion stream");
        let resp = upstream::post_json_raw(&self.http, &url, &self.auth, &body)
            .await
            .map_err(map_upstream_error)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut events = resp.bytes_stream().eventsource();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    next = events.next() => next,
                };
                let event = match next {
                    None => return,
                    Some(Err(err)) => {
                        tracing::warn!("upstream stream read failed: {err}");
                        forward_event(&tx, &cancel, read_failed(err)).await;
                        return;
                    }
                    Some(Ok(event)) => event,
                };
                if event.data.trim() == "[DONE]" {
                    return;
                }
                let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        tracing::warn!("upstream chunk decode failed: {err}");
                        forward_event(&tx, &cancel, read_failed(err)).await;
                        return;
                    }
                };
                let Some(out) = decode_chunk(chunk) else {
                    continue;
                };
                let terminal = out.is_error();
                if !forward_event(&tx, &cancel, out).await || terminal {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn max_context_length(&self, model: &str) -> i64 {
        model_max_context_size(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MultipartContent;

    fn client(azure: bool) -> OpenAiClient {
        let http = reqwest::Client::new();
        if azure {
            OpenAiClient::azure(http, "https://res.openai.azure.com/", "k", "2023-05-15")
        } else {
            OpenAiClient::new(http, "https://api.openai.com/v1", "k", None)
        }
    }

    #[test]
    fn deployment_table_and_sanitizing() {
        assert_eq!(azure_deployment("gpt-3.5-turbo-0613"), "gpt35-turbo");
        assert_eq!(azure_deployment("gpt-4-32k"), "gpt4-32k");
        assert_eq!(azure_deployment("gpt-4.5:preview"), "gpt-45preview");
    }

    #[test]
    fn endpoints_follow_routing_style() {
        assert_eq!(
            client(false).endpoint("gpt-4"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            client(true).endpoint("gpt-4"),
            concat!(
                "https://res.openai.azure.com/openai/deployments/gpt4/chat/completions",
                "?api-version=2023-05-15"
            )
        );
    }

    #[test]
    fn context_table_has_conservative_default() {
        assert_eq!(model_max_context_size("gpt-4"), 7500);
        assert_eq!(model_max_context_size("gpt-4-1106-preview"), 123904);
        assert_eq!(model_max_context_size("something-new"), 3500);
    }

    #[test]
    fn best_model_downgrades_short_prompts() {
        assert_eq!(select_best_model("gpt-3.5-turbo-16k", 100), "gpt-3.5-turbo");
        assert_eq!(select_best_model("gpt-4-32k-0613", 9000), "gpt-4-32k-0613");
        assert_eq!(select_best_model("gpt-4", 10), "gpt-4");
    }

    #[test]
    fn body_encodes_multipart_and_vision_default() {
        let req = Request {
            model: VISION_MODEL.to_string(),
            messages: vec![Message {
                multipart_contents: vec![
                    MultipartContent::text("what"),
                    MultipartContent::image("https://x/a.png", Some("low")),
                ],
                ..Message::user("")
            }],
            ..Request::default()
        };
        let body = build_body(&req, true);
        assert_eq!(body["max_tokens"], json!(4096));
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["messages"][0]["content"][0], json!({"type": "text", "text": "what"}));
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"],
            json!({"url": "https://x/a.png", "detail": "low"})
        );
    }

    #[test]
    fn completion_content_filter_is_an_error() {
        let completion: ChatCompletion = serde_json::from_value(json!({
            "choices": [{"message": {"content": ""}, "finish_reason": "content_filter"}]
        }))
        .expect("decode");
        assert!(matches!(
            decode_completion(completion),
            Err(ChatError::ContentFilter(_))
        ));
    }

    #[test]
    fn completion_reads_usage() {
        let completion: ChatCompletion = serde_json::from_value(json!({
            "choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }))
        .expect("decode");
        let resp = decode_completion(completion).expect("ok");
        assert_eq!(resp.text, "hi");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!((resp.input_tokens, resp.output_tokens), (12, 3));
    }

    #[test]
    fn chunks_without_content_are_skipped() {
        let role_only: ChatCompletionChunk =
            serde_json::from_value(json!({"choices": [{"delta": {"role": "assistant"}}]}))
                .expect("decode");
        assert!(decode_chunk(role_only).is_none());

        let last: ChatCompletionChunk =
            serde_json::from_value(json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}))
                .expect("decode");
        assert_eq!(
            decode_chunk(last).and_then(|r| r.finish_reason),
            Some("stop".to_string())
        );
    }

    #[test]
    fn mid_stream_error_envelope_ends_the_stream() {
        let chunk: ChatCompletionChunk = serde_json::from_value(
            json!({"error": {"message": "server overloaded", "type": "server_error"}}),
        )
        .expect("decode");
        let event = decode_chunk(chunk).expect("error event");
        assert!(event.is_error());
        assert_eq!(event.error_code.as_deref(), Some("READ_STREAM_FAILED"));
        assert!(event.error.as_deref().unwrap_or_default().contains("server overloaded"));

        let filtered: ChatCompletionChunk = serde_json::from_value(
            json!({"error": {"message": "blocked", "code": "content_filter"}}),
        )
        .expect("decode");
        assert_eq!(
            decode_chunk(filtered).and_then(|e| e.error_code),
            Some("content_filter".to_string())
        );
    }

    #[test]
    fn upstream_content_filter_code_is_mapped() {
        let err = UpstreamCallError::new(
            upstream::UpstreamErrorKind::Http,
            Some(axum::http::StatusCode::BAD_REQUEST),
            "blocked".to_string(),
        )
        .with_code(Some("content_filter".to_string()));
        assert!(matches!(map_upstream_error(err), ChatError::ContentFilter(_)));
    }
}
