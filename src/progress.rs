//! Progress Monitor
//!
//! The solver's status utility prints a line such as
//! `Fortschritt der Simulation: 42.5 %`. Polls run in suppressed mode: only
//! that value travels to the client, as a `progress` event.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

static PROGRESS_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Extract the percentage from a line of status output
pub fn parse_progress(line: &str) -> Option<String> {
    PROGRESS_RE
        .get_or_init(|| Regex::new(r"Fortschritt der Simulation:\s*([\d.]+)\s*%").ok())
        .as_ref()?
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Scans a stdout stream for progress lines. Chunks may split lines
/// anywhere, so partial lines are held until completed.
#[derive(Debug, Default)]
pub struct ProgressFilter {
    buffer: String,
}

impl ProgressFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the progress values of every completed line
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut found = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            found.extend(parse_progress(&line));
        }
        found
    }

    /// Flush the trailing unterminated line at end of stream
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        parse_progress(&rest)
    }
}

/// Timer for the periodic poll. The first tick fires one full period after
/// start; ticks missed while the runtime was busy are not replayed.
pub fn progress_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
