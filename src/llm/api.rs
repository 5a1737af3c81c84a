//! OpenAI-compatible streaming chat client.
//!
//! Works with any server implementing `POST /v1/chat/completions` with
//! `stream: true`: OpenAI itself, Ollama, vLLM, llama.cpp server, etc.

use super::sse::SseLineParser;
use super::{ChatClient, ChatMessage, ChatRequest, DeltaStream, StreamEvent, ToolCall};
use crate::config::LlmConfig;
use crate::error::{KgError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use tracing::{debug, info};

/// Streaming chat client over HTTP.
pub struct ApiChatClient {
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for ApiChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiChatClient")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl ApiChatClient {
    /// Create a client for the server configured in `config`.
    pub fn new(config: &LlmConfig) -> Self {
        let url = chat_completions_url(&config.api_url);
        info!(url = %url, model = %config.api_model, "API chat client configured");
        Self {
            url,
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
        }
    }
}

/// Normalize a base URL (with or without `/v1`) to the completions endpoint.
pub fn chat_completions_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    format!("{base}/v1/chat/completions")
}

/// Build the JSON body for a streaming completion.
pub fn build_request_body(request: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request.messages.iter().map(message_to_json).collect();
    let mut body = serde_json::json!({
        "model": request.model,
        "messages": messages,
        "stream": true,
        "max_tokens": request.max_tokens,
    });
    if !request.tools.is_empty() {
        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }
    body
}

fn message_to_json(msg: &ChatMessage) -> serde_json::Value {
    let mut value = serde_json::json!({
        "role": msg.role.as_str(),
        "content": msg.content,
    });
    if !msg.tool_calls.is_empty() {
        let calls: Vec<serde_json::Value> = msg
            .tool_calls
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments },
                })
            })
            .collect();
        value["tool_calls"] = serde_json::Value::Array(calls);
    }
    if let Some(id) = &msg.tool_call_id {
        value["tool_call_id"] = serde_json::Value::String(id.clone());
    }
    value
}

/// Pull `error.message` out of an OpenAI error body, falling back to the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}

#[async_trait]
impl ChatClient for ApiChatClient {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        let body = build_request_body(request);
        debug!(model = %request.model, messages = request.messages.len(), "opening chat stream");

        let mut req = self.client.post(&self.url).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| KgError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(KgError::Llm(format!(
                "HTTP {}: {}",
                status.as_u16(),
                extract_error_message(&text)
            )));
        }

        Ok(Box::pin(event_stream(response.bytes_stream())))
    }
}

/// Collects tool-call fragments streamed under a per-call index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u64, ToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one streamed fragment.
    pub fn push(
        &mut self,
        index: u64,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        let call = self.calls.entry(index).or_insert_with(|| ToolCall {
            id: String::new(),
            name: String::new(),
            arguments: String::new(),
        });
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            call.id = id.to_owned();
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            call.name = name.to_owned();
        }
        if let Some(args) = arguments {
            call.arguments.push_str(args);
        }
    }

    /// Completed calls in index order. Leaves the accumulator empty.
    pub fn finish(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls).into_values().collect()
    }
}

/// Parse one `data:` payload into stream events.
///
/// Unparseable payloads are skipped. Tool calls are only emitted once the
/// provider reports a finish reason.
pub fn parse_chunk(data: &str, accumulator: &mut ToolCallAccumulator) -> Vec<StreamEvent> {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
        return Vec::new();
    };
    if let Some(message) = parsed
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
    {
        return vec![StreamEvent::Error(message.to_owned())];
    }

    let mut events = Vec::new();
    let Some(choices) = parsed.get("choices").and_then(|c| c.as_array()) else {
        return events;
    };
    for choice in choices {
        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(|c| c.as_str())
                && !content.is_empty()
            {
                events.push(StreamEvent::Delta(content.to_owned()));
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
                for tc in calls {
                    let index = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                    let function = tc.get("function");
                    accumulator.push(
                        index,
                        tc.get("id").and_then(|i| i.as_str()),
                        function.and_then(|f| f.get("name")).and_then(|n| n.as_str()),
                        function
                            .and_then(|f| f.get("arguments"))
                            .and_then(|a| a.as_str()),
                    );
                }
            }
        }
        if choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .is_some()
        {
            events.extend(accumulator.finish().into_iter().map(StreamEvent::ToolCall));
            events.push(StreamEvent::Done);
        }
    }
    events
}

struct EventStreamState {
    bytes: Pin<Box<dyn Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send>>,
    parser: SseLineParser,
    accumulator: ToolCallAccumulator,
    buffer: VecDeque<StreamEvent>,
    finished: bool,
}

impl EventStreamState {
    fn enqueue(&mut self, events: Vec<StreamEvent>) {
        self.buffer.extend(events);
    }

    fn finish_events(&mut self) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = self
            .accumulator
            .finish()
            .into_iter()
            .map(StreamEvent::ToolCall)
            .collect();
        events.push(StreamEvent::Done);
        events
    }
}

/// Turn an SSE byte stream into [`StreamEvent`]s.
///
/// The stream ends right after the first `Done` or `Error` event.
pub(crate) fn event_stream(
    bytes: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
) -> impl Stream<Item = StreamEvent> + Send {
    futures_util::stream::unfold(
        EventStreamState {
            bytes: Box::pin(bytes),
            parser: SseLineParser::new(),
            accumulator: ToolCallAccumulator::new(),
            buffer: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.buffer.pop_front() {
                    if matches!(event, StreamEvent::Done | StreamEvent::Error(_)) {
                        state.finished = true;
                        state.buffer.clear();
                    }
                    return Some((event, state));
                }
                if state.finished {
                    return None;
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        let mut events = Vec::new();
                        for sse in state.parser.push(&chunk) {
                            if sse.is_done() {
                                events.extend(state.finish_events());
                                break;
                            }
                            events.extend(parse_chunk(&sse.data, &mut state.accumulator));
                        }
                        state.enqueue(events);
                    }
                    Some(Err(e)) => {
                        state.enqueue(vec![StreamEvent::Error(format!("stream read error: {e}"))]);
                    }
                    None => {
                        let mut events = Vec::new();
                        if let Some(sse) = state.parser.flush()
                            && !sse.is_done()
                        {
                            events.extend(parse_chunk(&sse.data, &mut state.accumulator));
                        }
                        events.extend(state.finish_events());
                        state.enqueue(events);
                    }
                }
            }
        },
    )
}
