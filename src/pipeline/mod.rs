//! The turn pipeline: model stream to sentences to robot actions.

pub mod coordinator;
pub mod messages;
pub mod reader;
pub mod segmenter;
