use clap::ValueEnum;
use log::LevelFilter;
use mcpflow_core::trace::{LogObserver, QueryEvent, QueryObserver};

/// How much the CLI prints while a query runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum ConsoleLevel {
    Quiet,
    User,
    Normal,
    Verbose,
}

impl ConsoleLevel {
    /// Level used for stderr logging when no log file is written.
    pub fn log_filter(self) -> LevelFilter {
        match self {
            ConsoleLevel::Quiet => LevelFilter::Off,
            ConsoleLevel::User => LevelFilter::Warn,
            ConsoleLevel::Normal => LevelFilter::Info,
            ConsoleLevel::Verbose => LevelFilter::Debug,
        }
    }
}

/// Prints query progress to stderr so stdout carries only answers.
/// Every event is also forwarded to the log.
pub struct ConsoleObserver {
    level: ConsoleLevel,
    log: LogObserver,
}

impl ConsoleObserver {
    pub fn new(level: ConsoleLevel) -> Self {
        Self {
            level,
            log: LogObserver,
        }
    }
}

impl QueryObserver for ConsoleObserver {
    fn on_event(&self, event: &QueryEvent<'_>) {
        self.log.on_event(event);

        let min_level = match event {
            QueryEvent::TurnStarted { .. } => ConsoleLevel::Normal,
            QueryEvent::ToolSucceeded { .. } => ConsoleLevel::Normal,
            _ => ConsoleLevel::User,
        };
        if self.level == ConsoleLevel::Quiet || self.level < min_level {
            return;
        }
        match event {
            QueryEvent::ToolSucceeded { service, .. } if self.level == ConsoleLevel::Verbose => {
                eprintln!("  {} [{}]", event, service)
            }
            _ => eprintln!("  {}", event),
        }
    }
}
