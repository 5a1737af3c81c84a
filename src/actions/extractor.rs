//! Splits text into actions by resolving `{{command||parameter}}` spans.

use super::{Action, CommandRegistry};
use std::sync::Arc;
use tracing::warn;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const PARAM_SEPARATOR: &str = "||";

/// Resolves embedded command spans against a [`CommandRegistry`].
///
/// Text outside spans becomes [`Action::SayText`] (trimmed, empty pieces
/// dropped). Unknown commands are dropped with a warning. An opening `{{`
/// without a matching `}}` is discarded and the text after it is spoken.
/// Extraction never fails.
#[derive(Debug, Clone)]
pub struct ActionExtractor {
    registry: Arc<CommandRegistry>,
}

impl ActionExtractor {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Extract actions from `text` in source order.
    pub fn extract(&self, text: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut rest = text;

        loop {
            let Some(open) = rest.find(OPEN) else {
                push_speech(&mut actions, rest);
                break;
            };
            push_speech(&mut actions, &rest[..open]);
            let after_open = &rest[open + OPEN.len()..];

            let Some(close) = after_open.find(CLOSE) else {
                push_speech(&mut actions, after_open);
                break;
            };
            let span = &after_open[..close];

            // A second opener before the closer: the first one is unterminated.
            if let Some(inner) = span.find(OPEN) {
                push_speech(&mut actions, &span[..inner]);
                rest = &after_open[inner..];
                continue;
            }

            if let Some(action) = self.resolve(span) {
                actions.push(action);
            }
            rest = &after_open[close + CLOSE.len()..];
        }

        actions
    }

    fn resolve(&self, span: &str) -> Option<Action> {
        let (command, parameter) = match span.split_once(PARAM_SEPARATOR) {
            Some((command, parameter)) => (command.trim(), parameter.trim()),
            None => (span.trim(), ""),
        };
        match self.registry.get(command) {
            Some(def) => Some(Action::from_kind(def.kind, parameter)),
            None => {
                warn!(command, parameter, "model used a command that does not exist, dropping it");
                None
            }
        }
    }
}

fn push_speech(actions: &mut Vec<Action>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        actions.push(Action::SayText(text.to_owned()));
    }
}
