//! kgsim: streams language-model responses into robot speech and animation.
//!
//! A turn takes one user transcript and drives a physical robot while the
//! model is still answering:
//! transcript → LLM stream → sentences → actions → robot
//!
//! # Architecture
//!
//! - **LLM**: streams a chat completion via an OpenAI-compatible API (`reqwest` + SSE)
//! - **Segmenter**: cuts the growing response into complete sentences
//! - **Extractor**: resolves `{{command||parameter}}` spans into actions
//! - **Control**: acquires and releases the robot's behavior-control lease
//! - **Player**: speaks and animates sentences in order, with an idle loop until the first one
//! - **History**: remembers recent exchanges per device, persisted as JSON

pub mod actions;
pub mod config;
pub mod error;
pub mod history;
pub mod kg_dirs;
pub mod llm;
pub mod pipeline;
pub mod robot;

pub use config::KgConfig;
pub use error::{KgError, Result};
pub use pipeline::coordinator::TurnCoordinator;
pub use pipeline::messages::TurnOutcome;
