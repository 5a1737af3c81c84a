//! Stream-reading task: model deltas in, completed sentences out.
//!
//! Runs the chat request, feeds every delta through a
//! [`SentenceSegmenter`] and publishes completed sentences to the playback
//! side. Tool calls are answered in an explicit loop bounded by
//! `max_tool_rounds`. When the response completes and chat saving is on,
//! the exchange is appended to [`ChatHistory`] exactly once.

use super::messages::ReaderSummary;
use super::segmenter::{SentenceSegmenter, SentenceWriter};
use crate::config::LlmConfig;
use crate::error::{KgError, Result};
use crate::history::ChatHistory;
use crate::llm::tools::ToolRegistry;
use crate::llm::{ChatClient, ChatMessage, ChatRequest, DeltaStream, StreamEvent};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a completed exchange is remembered.
#[derive(Debug, Clone)]
pub struct RememberTarget {
    pub history: Arc<ChatHistory>,
    pub device_id: String,
    pub transcript: String,
}

/// Reads one model response into a sentence feed.
pub struct StreamReader {
    client: Arc<dyn ChatClient>,
    tools: Arc<ToolRegistry>,
    model: String,
    fallback_model: Option<String>,
    max_tokens: u32,
    stream_timeout: Option<Duration>,
    max_tool_rounds: u32,
    remember: Option<RememberTarget>,
    opened: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("client", &self.client.name())
            .field("model", &self.model)
            .field("max_tool_rounds", &self.max_tool_rounds)
            .finish_non_exhaustive()
    }
}

impl StreamReader {
    pub fn new(client: Arc<dyn ChatClient>, tools: Arc<ToolRegistry>, config: &LlmConfig) -> Self {
        Self {
            client,
            tools,
            model: config.api_model.clone(),
            fallback_model: config.fallback_model.clone(),
            max_tokens: config.max_tokens,
            stream_timeout: config.stream_timeout(),
            max_tool_rounds: config.max_tool_rounds,
            remember: None,
            opened: None,
        }
    }

    /// Append the exchange to `target` once the response completes.
    #[must_use]
    pub fn remember_in(mut self, target: RememberTarget) -> Self {
        self.remember = Some(target);
        self
    }

    /// Signal `opened` once the model has accepted the first request.
    ///
    /// The sender is dropped unsent if the reader ends before that.
    #[must_use]
    pub fn notify_opened(mut self, opened: oneshot::Sender<()>) -> Self {
        self.opened = Some(opened);
        self
    }

    /// Read the response to `messages`, publishing sentences to `writer`.
    ///
    /// The writer is always settled on return: finished on success, failed
    /// otherwise.
    ///
    /// # Errors
    ///
    /// - [`KgError::Llm`] if the request is rejected.
    /// - [`KgError::Stream`] if the stream reports an error.
    /// - [`KgError::Timeout`] if no event arrives within the stream timeout.
    /// - [`KgError::Tool`] if the model keeps calling tools past the limit.
    /// - [`KgError::Cancelled`] if `cancel` fires.
    pub async fn run(
        mut self,
        mut messages: Vec<ChatMessage>,
        writer: SentenceWriter,
        cancel: CancellationToken,
    ) -> Result<ReaderSummary> {
        let mut segmenter = SentenceSegmenter::new();
        let mut tool_rounds = 0u32;

        loop {
            let opened = tokio::select! {
                opened = self.open(&messages) => opened,
                _ = cancel.cancelled() => {
                    return Err(fail(&mut segmenter, &writer, KgError::Cancelled));
                }
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => return Err(fail(&mut segmenter, &writer, e)),
            };
            if let Some(opened) = self.opened.take() {
                let _ = opened.send(());
            }

            let mut round_text = String::new();
            let mut calls = Vec::new();
            loop {
                let event = tokio::select! {
                    event = next_event(&mut stream, self.stream_timeout) => event,
                    _ = cancel.cancelled() => {
                        return Err(fail(&mut segmenter, &writer, KgError::Cancelled));
                    }
                };
                match event {
                    Ok(Some(StreamEvent::Delta(delta))) => {
                        round_text.push_str(&delta);
                        segmenter.feed(&delta);
                        writer.publish(&mut segmenter);
                    }
                    Ok(Some(StreamEvent::ToolCall(call))) => {
                        debug!(tool = %call.name, "model requested tool");
                        calls.push(call);
                    }
                    Ok(Some(StreamEvent::Done)) | Ok(None) => break,
                    Ok(Some(StreamEvent::Error(e))) => {
                        return Err(fail(&mut segmenter, &writer, KgError::Stream(e)));
                    }
                    Err(e) => return Err(fail(&mut segmenter, &writer, e)),
                }
            }

            if calls.is_empty() {
                break;
            }
            tool_rounds += 1;
            if tool_rounds > self.max_tool_rounds {
                let err = KgError::Tool(format!(
                    "model kept calling tools after {} rounds",
                    self.max_tool_rounds
                ));
                return Err(fail(&mut segmenter, &writer, err));
            }

            messages.push(ChatMessage::assistant_tool_calls(round_text, calls.clone()));
            for call in &calls {
                let output = self.tools.execute(call).unwrap_or_else(|e| {
                    warn!(tool = %call.name, error = %e, "tool call failed");
                    format!("Error: {e}")
                });
                messages.push(ChatMessage::tool_result(call.id.clone(), output));
            }
            info!(round = tool_rounds, calls = calls.len(), "answered tool calls, reopening stream");
        }

        segmenter.finish();
        writer.publish(&mut segmenter);

        let summary = ReaderSummary {
            response_text: segmenter.full_text(),
            sentences: segmenter.completed().len(),
            tool_rounds,
            model: self.model.clone(),
        };
        info!(
            sentences = summary.sentences,
            tool_rounds,
            model = %summary.model,
            "response complete"
        );

        if let Some(target) = &self.remember
            && let Err(e) = target
                .history
                .append(&target.device_id, &target.transcript, &summary.response_text)
                .await
        {
            warn!(device_id = %target.device_id, error = %e, "failed to save chat history");
        }

        Ok(summary)
    }

    /// Open a stream, switching to the fallback model once if the configured
    /// model does not exist.
    async fn open(&mut self, messages: &[ChatMessage]) -> Result<DeltaStream> {
        let request = self.request(messages);
        match self.client.open_stream(&request).await {
            Ok(stream) => Ok(stream),
            Err(e) if e.is_model_not_found() => {
                let Some(fallback) = self.fallback_model.take().filter(|f| *f != self.model)
                else {
                    return Err(e);
                };
                warn!(model = %self.model, fallback = %fallback, "model not found, retrying with fallback");
                self.model = fallback;
                self.client.open_stream(&self.request(messages)).await
            }
            Err(e) => Err(e),
        }
    }

    fn request(&self, messages: &[ChatMessage]) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            max_tokens: self.max_tokens,
            tools: self.tools.specs(),
        }
    }
}

async fn next_event(
    stream: &mut DeltaStream,
    timeout: Option<Duration>,
) -> Result<Option<StreamEvent>> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next())
            .await
            .map_err(|_| KgError::Timeout(format!("no stream event within {limit:?}"))),
        None => Ok(stream.next().await),
    }
}

fn fail(segmenter: &mut SentenceSegmenter, writer: &SentenceWriter, err: KgError) -> KgError {
    segmenter.fail(err.to_string());
    writer.publish(segmenter);
    err
}
