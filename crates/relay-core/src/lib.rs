//! Query resolution for Relay.
//!
//! The [`Orchestrator`] alternates between the model and the tool executor
//! until the model answers in plain text or a limit is reached.

pub mod orchestrator;

pub use orchestrator::{
    LoopEvent, LoopLimits, Orchestrator, Outcome, Resolution, partial_answer,
};
