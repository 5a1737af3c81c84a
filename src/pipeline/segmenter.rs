//! Sentence segmentation of streamed model output.
//!
//! [`SentenceSegmenter`] accumulates deltas and completes a sentence as soon
//! as a terminal marker is seen. Completed sentences are handed to the
//! playback side through a [`SentenceWriter`] / [`SentenceReader`] pair: an
//! append-only sequence behind a `tokio::sync::watch` channel. The reader
//! consumes by index and parks on the channel when it has caught up, so a
//! wake-up is never lost, only coalesced.

use super::messages::FeedItem;
use std::sync::Arc;
use tokio::sync::watch;

/// Sentence terminal markers, in priority order.
///
/// Where several markers match at the same position the first listed wins,
/// so multi-character markers come before their single-character prefixes.
pub const SENTENCE_MARKERS: &[&str] = &[
    "...", "…", ".'", ".\"", ".", "?", "!", "。", "？", "！", "，",
];

/// Find the end (exclusive byte offset) of the first complete sentence.
///
/// Scans left to right and stops at the earliest marker. When `more_coming`
/// is set and the text from that marker to the end of the buffer could still
/// grow into a longer marker (`"."` or `".."` becoming `"..."`), returns
/// `None` so the decision waits for the next delta.
pub fn find_sentence_end(text: &str, more_coming: bool) -> Option<usize> {
    for (pos, _) in text.char_indices() {
        let rest = &text[pos..];
        let Some(marker) = SENTENCE_MARKERS.iter().find(|m| rest.starts_with(**m)) else {
            continue;
        };
        if more_coming
            && SENTENCE_MARKERS
                .iter()
                .any(|longer| longer.len() > rest.len() && longer.starts_with(rest))
        {
            return None;
        }
        return Some(pos + marker.len());
    }
    None
}

/// Turns a delta stream into completed sentences.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    pending: String,
    completed: Vec<String>,
    polled: usize,
    done: bool,
    error: Option<String>,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and complete every sentence it closes.
    ///
    /// Ignored once the segmenter is done or failed.
    pub fn feed(&mut self, delta: &str) {
        if self.done || self.error.is_some() {
            return;
        }
        self.pending.push_str(delta);
        while let Some(end) = find_sentence_end(&self.pending, true) {
            let sentence = self.pending[..end].trim().to_owned();
            self.pending.drain(..end);
            if !sentence.is_empty() {
                self.completed.push(sentence);
            }
        }
    }

    /// End of stream: flush any residual text as a final sentence.
    pub fn finish(&mut self) {
        if self.done || self.error.is_some() {
            return;
        }
        let residual = std::mem::take(&mut self.pending);
        let residual = residual.trim();
        if !residual.is_empty() {
            self.completed.push(residual.to_owned());
        }
        self.done = true;
    }

    /// Upstream failure. Pending text is discarded and nothing else completes.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.done || self.error.is_some() {
            return;
        }
        self.pending.clear();
        self.error = Some(error.into());
    }

    /// Sentences completed since the previous poll.
    pub fn poll_completed(&mut self) -> Vec<String> {
        let fresh = self.completed[self.polled..].to_vec();
        self.polled = self.completed.len();
        fresh
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn err(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every sentence completed so far.
    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// Completed sentences joined with a single space.
    pub fn full_text(&self) -> String {
        self.completed.join(" ")
    }
}

#[derive(Debug, Default)]
struct FeedState {
    sentences: Vec<String>,
    done: bool,
    error: Option<String>,
}

impl FeedState {
    fn is_settled(&self) -> bool {
        self.done || self.error.is_some()
    }
}

/// Create a connected writer/reader pair.
pub fn sentence_feed() -> (SentenceWriter, SentenceReader) {
    let (tx, rx) = watch::channel(FeedState::default());
    (
        SentenceWriter { tx: Arc::new(tx) },
        SentenceReader { rx, next: 0 },
    )
}

/// Single writer of the completed-sentence sequence.
///
/// Dropping every writer without calling [`finish`](Self::finish) or
/// [`fail`](Self::fail) makes the reader report a failure.
#[derive(Debug, Clone)]
pub struct SentenceWriter {
    tx: Arc<watch::Sender<FeedState>>,
}

impl SentenceWriter {
    /// Append sentences. Ignored after the feed has settled.
    pub fn extend(&self, sentences: Vec<String>) {
        if sentences.is_empty() {
            return;
        }
        self.tx.send_if_modified(|state| {
            if state.is_settled() {
                return false;
            }
            state.sentences.extend(sentences);
            true
        });
    }

    /// Mark the sequence complete.
    pub fn finish(&self) {
        self.tx.send_if_modified(|state| {
            if state.is_settled() {
                return false;
            }
            state.done = true;
            true
        });
    }

    /// Mark the sequence failed.
    pub fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        self.tx.send_if_modified(|state| {
            if state.is_settled() {
                return false;
            }
            state.error = Some(error);
            true
        });
    }

    /// Forward whatever `segmenter` has newly completed and mirror its terminal state.
    pub fn publish(&self, segmenter: &mut SentenceSegmenter) {
        self.extend(segmenter.poll_completed());
        if let Some(err) = segmenter.err() {
            self.fail(err);
        } else if segmenter.is_done() {
            self.finish();
        }
    }
}

/// Index-based consumer of the completed-sentence sequence.
#[derive(Debug)]
pub struct SentenceReader {
    rx: watch::Receiver<FeedState>,
    next: usize,
}

impl SentenceReader {
    /// Reader over a fixed text, already split and finished.
    pub fn from_text(text: &str) -> Self {
        let mut segmenter = SentenceSegmenter::new();
        segmenter.feed(text);
        segmenter.finish();
        let (writer, reader) = sentence_feed();
        writer.publish(&mut segmenter);
        reader
    }

    /// Index of the next unread sentence.
    pub fn position(&self) -> usize {
        self.next
    }

    /// Wait for the next sentence, the end, or a failure.
    ///
    /// A failure is reported as soon as it is observed, even if unread
    /// sentences remain.
    pub async fn next(&mut self) -> FeedItem {
        let index = self.next;
        let state = self
            .rx
            .wait_for(|s| s.error.is_some() || s.done || s.sentences.len() > index)
            .await;
        let Ok(state) = state else {
            return FeedItem::Failed("sentence stream closed before completion".to_owned());
        };

        if let Some(err) = &state.error {
            return FeedItem::Failed(err.clone());
        }
        match state.sentences.get(index) {
            Some(text) => {
                let text = text.clone();
                drop(state);
                self.next += 1;
                FeedItem::Sentence { index, text }
            }
            None => FeedItem::End,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn segment(deltas: &[&str]) -> Vec<String> {
        let mut seg = SentenceSegmenter::new();
        for d in deltas {
            seg.feed(d);
        }
        seg.finish();
        seg.completed().to_vec()
    }

    #[test]
    fn ellipsis_is_not_split_as_period() {
        assert_eq!(segment(&["Wait... really?"]), vec!["Wait...", "really?"]);
    }

    #[test]
    fn ellipsis_split_across_deltas() {
        assert_eq!(segment(&["Wait.", ".", ". really?"]), vec!["Wait...", "really?"]);
    }

    #[test]
    fn one_delta_can_complete_several_sentences() {
        let mut seg = SentenceSegmenter::new();
        seg.feed("Hi! How are you? I am");
        assert_eq!(seg.poll_completed(), vec!["Hi!", "How are you?"]);
        assert!(seg.poll_completed().is_empty());
        seg.feed(" fine.");
        assert!(seg.poll_completed().is_empty());
        seg.finish();
        assert_eq!(seg.poll_completed(), vec!["I am fine."]);
        assert!(seg.is_done());
    }

    #[test]
    fn quoted_endings_keep_the_quote() {
        assert_eq!(
            segment(&["He said 'hi.' Then \"bye.\" Done"]),
            vec!["He said 'hi.'", "Then \"bye.\"", "Done"]
        );
    }

    #[test]
    fn cjk_punctuation() {
        assert_eq!(
            segment(&["你好！", "今天天气很好。", "你呢？"]),
            vec!["你好！", "今天天气很好。", "你呢？"]
        );
        assert_eq!(segment(&["好的，我知道了"]), vec!["好的，", "我知道了"]);
    }

    #[test]
    fn no_characters_lost() {
        let deltas = ["The weather", " is sunny", " today. Bring", " a hat! Or not..."];
        let joined: String = deltas.concat();
        let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        assert_eq!(strip(&segment(&deltas).concat()), strip(&joined));
    }

    #[test]
    fn weather_stream_is_one_sentence() {
        assert_eq!(
            segment(&["The weather", " is sunny", " today."]),
            vec!["The weather is sunny today."]
        );
    }

    #[test]
    fn empty_residual_is_not_flushed() {
        assert_eq!(segment(&["Done.", "   "]), vec!["Done."]);
        assert!(segment(&[]).is_empty());
    }

    #[test]
    fn error_stops_completion() {
        let mut seg = SentenceSegmenter::new();
        seg.feed("First. Second");
        seg.fail("connection reset");
        seg.feed(" more. text.");
        seg.finish();
        assert_eq!(seg.completed(), &["First.".to_owned()]);
        assert_eq!(seg.err(), Some("connection reset"));
        assert!(!seg.is_done());
    }

    #[test]
    fn full_text_joins_with_spaces() {
        let mut seg = SentenceSegmenter::new();
        seg.feed("One. Two.");
        seg.finish();
        assert_eq!(seg.full_text(), "One. Two.");
    }

    #[test]
    fn boundary_deferred_only_while_more_is_coming() {
        assert_eq!(find_sentence_end("Hi.", true), None);
        assert_eq!(find_sentence_end("Hi.", false), Some(3));
        assert_eq!(find_sentence_end("Hi. x", true), Some(3));
        assert_eq!(find_sentence_end("Hi?", true), Some(3));
        assert_eq!(find_sentence_end("no marker", false), None);
    }

    #[tokio::test]
    async fn reader_waits_for_new_sentences() {
        let (writer, mut reader) = sentence_feed();
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                match reader.next().await {
                    FeedItem::Sentence { index, text } => seen.push((index, text)),
                    FeedItem::End => return seen,
                    FeedItem::Failed(e) => panic!("unexpected failure: {e}"),
                }
            }
        });

        let mut seg = SentenceSegmenter::new();
        for delta in ["One. ", "Two", ". Three"] {
            seg.feed(delta);
            writer.publish(&mut seg);
            tokio::task::yield_now().await;
        }
        seg.finish();
        writer.publish(&mut seg);

        let seen = handle.await.unwrap();
        assert_eq!(
            seen,
            vec![
                (0, "One.".to_owned()),
                (1, "Two.".to_owned()),
                (2, "Three".to_owned())
            ]
        );
    }

    #[tokio::test]
    async fn reader_reports_failure() {
        let (writer, mut reader) = sentence_feed();
        writer.extend(vec!["Unread.".to_owned()]);
        writer.fail("stream error");
        assert_eq!(reader.next().await, FeedItem::Failed("stream error".to_owned()));
    }

    #[tokio::test]
    async fn dropped_writer_is_a_failure() {
        let (writer, mut reader) = sentence_feed();
        drop(writer);
        assert!(matches!(reader.next().await, FeedItem::Failed(_)));
    }

    #[tokio::test]
    async fn reader_from_text() {
        let mut reader = SentenceReader::from_text("Hello there. How are you?");
        assert_eq!(
            reader.next().await,
            FeedItem::Sentence {
                index: 0,
                text: "Hello there.".to_owned()
            }
        );
        assert!(matches!(reader.next().await, FeedItem::Sentence { index: 1, .. }));
        assert_eq!(reader.next().await, FeedItem::End);
        assert_eq!(reader.position(), 2);
    }
}
