//! Message types passed between the tasks of a turn.

use uuid::Uuid;

/// What a [`SentenceReader`](super::segmenter::SentenceReader) yields next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    /// The next completed sentence, in completion order.
    Sentence {
        /// Position in the completed sequence.
        index: usize,
        text: String,
    },
    /// The response ended and every sentence has been read.
    End,
    /// The response failed. No further sentences will arrive.
    Failed(String),
}

/// Result of the stream-reading task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderSummary {
    /// Completed sentences joined with a single space.
    pub response_text: String,
    /// Number of sentences completed.
    pub sentences: usize,
    /// Tool round trips made before the final response.
    pub tool_rounds: u32,
    /// Model that produced the response.
    pub model: String,
}

/// Result of a full turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub turn_id: Uuid,
    pub device_id: String,
    /// Text the model produced, as remembered in history.
    pub response_text: String,
    /// Sentences handed to the player.
    pub sentences_played: usize,
    /// Actions executed on the robot.
    pub actions_played: usize,
}
