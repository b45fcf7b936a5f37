//! Query progress events.
//!
//! The orchestrator reports what happens during a query to a
//! [`QueryObserver`] supplied by the caller instead of writing to a global
//! logger. A CLI can print these as they arrive; tests can record them.

use std::fmt;

use serde_json::{Map, Value};

use crate::errors::FlowError;

#[derive(Debug)]
pub enum QueryEvent<'a> {
    TurnStarted { turn: usize, max_turns: usize },
    ModelText { text: &'a str },
    ToolRequested { name: &'a str, args: &'a Map<String, Value> },
    ToolSucceeded { name: &'a str, service: &'a str, snippet: String },
    ToolFailed { name: &'a str, error: &'a FlowError },
    ToolNotFound { name: &'a str },
    GatewayFailed { error: &'a FlowError },
    NoCandidates,
    NoFurtherOutput,
    MaxTurnsReached { max_turns: usize },
    Cancelled,
}

impl fmt::Display for QueryEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryEvent::TurnStarted { turn, max_turns } => write!(f, "Turn {}/{}", turn, max_turns),
            QueryEvent::ModelText { text } => write!(f, "LLM: {}", text.trim()),
            QueryEvent::ToolRequested { name, args } => {
                if args.is_empty() {
                    write!(f, "LLM wants to call: {}()", name)
                } else {
                    write!(f, "LLM wants to call: {}({})", name, Value::Object(Map::clone(args)))
                }
            }
            QueryEvent::ToolSucceeded { name, snippet, .. } => {
                write!(f, "Tool {} executed. Result snippet: {}", name, snippet)
            }
            QueryEvent::ToolFailed { name, error } => write!(f, "[Error calling tool '{}': {}]", name, error.detail()),
            QueryEvent::ToolNotFound { name } => write!(f, "[Tool '{}' not found.]", name),
            QueryEvent::GatewayFailed { error } => write!(f, "[Error communicating with AI model: {}]", error.detail()),
            QueryEvent::NoCandidates => write!(f, "[AI model returned no response candidates.]"),
            QueryEvent::NoFurtherOutput => write!(f, "[AI model provided no further text or actions.]"),
            QueryEvent::MaxTurnsReached { max_turns } => {
                write!(f, "[Max interaction turns ({}) reached.]", max_turns)
            }
            QueryEvent::Cancelled => write!(f, "[Query cancelled.]"),
        }
    }
}

pub trait QueryObserver: Send + Sync {
    fn on_event(&self, event: &QueryEvent<'_>);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl QueryObserver for LogObserver {
    fn on_event(&self, event: &QueryEvent<'_>) {
        match event {
            QueryEvent::TurnStarted { .. } | QueryEvent::ModelText { .. } => log::info!("{}", event),
            QueryEvent::ToolRequested { .. } => log::info!("{}", event),
            QueryEvent::ToolSucceeded { service, .. } => log::info!("{} (service '{}')", event, service),
            QueryEvent::ToolFailed { .. } | QueryEvent::GatewayFailed { .. } => log::error!("{}", event),
            QueryEvent::ToolNotFound { .. }
            | QueryEvent::NoCandidates
            | QueryEvent::NoFurtherOutput
            | QueryEvent::MaxTurnsReached { .. }
            | QueryEvent::Cancelled => log::warn!("{}", event),
        }
    }
}
