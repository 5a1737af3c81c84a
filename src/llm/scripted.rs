//! Chat client that replays canned responses.
//!
//! Used by the CLI's `--script` mode to exercise a robot without a model
//! server, and by the pipeline tests.

use super::{ChatClient, ChatRequest, DeltaStream, StreamEvent};
use crate::error::{KgError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Scripted {
    Events(Vec<StreamEvent>),
    Reject(String),
}

/// Replays one queued response per `open_stream` call and records every request.
#[derive(Debug, Default)]
pub struct ScriptedChatClient {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ChatRequest>>,
    delay: Duration,
}

impl ScriptedChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client with a single response made of `deltas` followed by `Done`.
    pub fn from_deltas<S: AsRef<str>>(deltas: &[S]) -> Self {
        let client = Self::new();
        client.push_deltas(deltas);
        client
    }

    /// Wait `delay` before each event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue a response of text deltas terminated by `Done`.
    pub fn push_deltas<S: AsRef<str>>(&self, deltas: &[S]) {
        let mut events: Vec<StreamEvent> = deltas
            .iter()
            .map(|d| StreamEvent::Delta(d.as_ref().to_owned()))
            .collect();
        events.push(StreamEvent::Done);
        self.push_events(events);
    }

    /// Queue a raw event sequence.
    pub fn push_events(&self, events: Vec<StreamEvent>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Scripted::Events(events));
        }
    }

    /// Queue a rejection of the next `open_stream` call.
    pub fn push_rejection(&self, message: impl Into<String>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Scripted::Reject(message.into()));
        }
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatClient for ScriptedChatClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| KgError::Llm("scripted client poisoned".to_owned()))?
            .pop_front();

        match next {
            Some(Scripted::Events(events)) => {
                let delay = self.delay;
                let stream = futures_util::stream::iter(events).then(move |event| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    event
                });
                Ok(Box::pin(stream))
            }
            Some(Scripted::Reject(message)) => Err(KgError::Llm(message)),
            None => Err(KgError::Llm("no scripted response left".to_owned())),
        }
    }
}
