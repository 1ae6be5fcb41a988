//! Declarative console grammar.
//!
//! Each tool integration supplies an ordered table of (matcher, effect)
//! markers. Parsing rescans the whole console text on every call: counters are
//! recomputed from the text, progress carries forward as the highest value
//! ever seen, and events are only emitted for lines that were not complete on
//! the previous call.
//!
//! Independently of the table, any line starting with `Error:` / `Error ` or
//! containing `unhandled exception` (case-insensitive) is fatal. The error
//! message is that line plus every line after it, verbatim.

use crate::types::{ConsoleEvent, ToolState};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("invalid marker pattern {pattern}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, MarkerError>;

/// How a marker recognises a line. Lines are trimmed before matching.
#[derive(Debug, Clone)]
pub enum Matcher {
    Prefix(String),
    Contains(String),
    Regex(Regex),
}

impl Matcher {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn contains(needle: impl Into<String>) -> Self {
        Self::Contains(needle.into())
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|source| MarkerError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    /// Capture groups for a matching line; index 0 is the whole match.
    fn captures<'t>(&self, line: &'t str) -> Option<Vec<Option<&'t str>>> {
        match self {
            Self::Prefix(prefix) => line.starts_with(prefix.as_str()).then(|| vec![Some(line)]),
            Self::Contains(needle) => line.contains(needle.as_str()).then(|| vec![Some(line)]),
            Self::Regex(re) => re
                .captures(line)
                .map(|caps| caps.iter().map(|m| m.map(|m| m.as_str())).collect()),
        }
    }
}

/// What a matched line does to the parse state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Effect {
    SetProgress(f32),
    /// Capture group holding a percentage.
    ProgressFromGroup(usize),
    /// Capture groups holding "units done" and "units total".
    ProgressFraction { done: usize, total: usize },
    UnitProcessed,
    UnitFailed,
    Warning,
    /// Fatal: captures this line and the rest of the stream.
    Error,
    State(ToolState),
    /// Capture group holding a free-text state label.
    StateFromGroup(usize),
    /// The tool announced how the run ends (`Complete`, `NoData`).
    Terminal(ToolState),
}

#[derive(Debug, Clone)]
pub struct Marker {
    pub matcher: Matcher,
    pub effect: Effect,
}

/// Everything derived from one scan of a console stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParseState {
    /// Highest percentage seen across all calls.
    pub percent_complete: f32,
    pub units_processed: u64,
    pub units_total: Option<u64>,
    pub units_failed: u64,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub tool_state: ToolState,
    pub state_label: Option<String>,
    pub terminal: Option<ToolState>,
    /// Complete lines consumed so far.
    pub lines_seen: usize,
}

/// Ordered marker table for one tool. First matching marker wins.
#[derive(Debug, Clone)]
pub struct MarkerTable {
    markers: Vec<Marker>,
    generic_errors: bool,
}

enum LineOutcome {
    Event(ConsoleEvent),
    Fatal,
    Unmatched,
}

impl Default for MarkerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerTable {
    pub fn new() -> Self {
        Self {
            markers: Vec::new(),
            generic_errors: true,
        }
    }

    pub fn with(mut self, matcher: Matcher, effect: Effect) -> Self {
        self.markers.push(Marker { matcher, effect });
        self
    }

    /// Disable the generic `Error:` / `unhandled exception` detection.
    pub fn without_generic_errors(mut self) -> Self {
        self.generic_errors = false;
        self
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Parse the complete lines of `text`. A trailing line without a newline
    /// is left for the next call.
    pub fn parse(&self, text: &str, previous: &ParseState) -> (Vec<ConsoleEvent>, ParseState) {
        self.scan(text, previous, false)
    }

    /// Parse all of `text`, including a trailing unterminated line. Used once
    /// the process has exited.
    pub fn parse_final(
        &self,
        text: &str,
        previous: &ParseState,
    ) -> (Vec<ConsoleEvent>, ParseState) {
        self.scan(text, previous, true)
    }

    fn scan(
        &self,
        text: &str,
        previous: &ParseState,
        include_partial: bool,
    ) -> (Vec<ConsoleEvent>, ParseState) {
        let lines = split_lines(text, include_partial);
        let mut state = ParseState {
            percent_complete: previous.percent_complete,
            ..ParseState::default()
        };
        let mut events = Vec::new();

        for (index, raw) in lines.iter().enumerate() {
            let fresh = index >= previous.lines_seen;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            match self.apply_line(line, &mut state) {
                LineOutcome::Event(event) => {
                    if fresh {
                        events.push(event);
                    }
                }
                LineOutcome::Fatal => {
                    let message = lines[index..]
                        .iter()
                        .map(|l| l.trim_end())
                        .collect::<Vec<_>>()
                        .join("\n");
                    state.tool_state = ToolState::Error;
                    state.error = Some(message.clone());
                    if fresh {
                        events.push(ConsoleEvent::Error(message));
                    }
                    break;
                }
                LineOutcome::Unmatched => {
                    if fresh {
                        events.push(ConsoleEvent::Unrecognized(line.to_string()));
                    }
                }
            }
        }

        // Files that are rewritten in place (status files) must not reset counters.
        state.units_processed = state.units_processed.max(previous.units_processed);
        state.units_failed = state.units_failed.max(previous.units_failed);
        if state.units_total.is_none() {
            state.units_total = previous.units_total;
        }
        for warning in &previous.warnings {
            if !state.warnings.contains(warning) {
                state.warnings.push(warning.clone());
            }
        }
        state.lines_seen = lines.len();

        (events, state)
    }

    fn apply_line(&self, line: &str, state: &mut ParseState) -> LineOutcome {
        for marker in &self.markers {
            let Some(groups) = marker.matcher.captures(line) else {
                continue;
            };

            return match marker.effect {
                Effect::SetProgress(percent) => progress(state, percent),
                Effect::ProgressFromGroup(group) => match group_value::<f32>(&groups, group) {
                    Some(percent) => progress(state, percent),
                    None => LineOutcome::Unmatched,
                },
                Effect::ProgressFraction { done, total } => {
                    let done = group_value::<u64>(&groups, done);
                    let total = group_value::<u64>(&groups, total);
                    match (done, total) {
                        (Some(done), Some(total)) if total > 0 => {
                            state.units_processed = state.units_processed.max(done);
                            state.units_total = Some(total);
                            progress(state, done as f32 / total as f32 * 100.0)
                        }
                        _ => LineOutcome::Unmatched,
                    }
                }
                Effect::UnitProcessed => {
                    state.units_processed += 1;
                    LineOutcome::Event(ConsoleEvent::UnitProcessed(state.units_processed))
                }
                Effect::UnitFailed => {
                    state.units_failed += 1;
                    LineOutcome::Event(ConsoleEvent::UnitFailed(line.to_string()))
                }
                Effect::Warning => {
                    if !state.warnings.iter().any(|w| w == line) {
                        state.warnings.push(line.to_string());
                    }
                    LineOutcome::Event(ConsoleEvent::Warning(line.to_string()))
                }
                Effect::Error => LineOutcome::Fatal,
                Effect::State(tool_state) => {
                    state.tool_state = tool_state;
                    LineOutcome::Event(ConsoleEvent::StateChange(tool_state))
                }
                Effect::StateFromGroup(group) => match groups.get(group).copied().flatten() {
                    Some(label) => {
                        let tool_state = ToolState::from_label(label);
                        state.tool_state = tool_state;
                        state.state_label = Some(label.trim().to_string());
                        LineOutcome::Event(ConsoleEvent::StateChange(tool_state))
                    }
                    None => LineOutcome::Unmatched,
                },
                Effect::Terminal(tool_state) => {
                    state.tool_state = tool_state;
                    state.terminal = Some(tool_state);
                    LineOutcome::Event(ConsoleEvent::StateChange(tool_state))
                }
            };
        }

        if self.generic_errors && is_generic_error(line) {
            return LineOutcome::Fatal;
        }
        LineOutcome::Unmatched
    }
}

fn progress(state: &mut ParseState, percent: f32) -> LineOutcome {
    if percent.is_finite() {
        let clamped = percent.clamp(0.0, 100.0);
        if clamped > state.percent_complete {
            state.percent_complete = clamped;
        }
    }
    LineOutcome::Event(ConsoleEvent::ProgressUpdate(state.percent_complete))
}

fn group_value<T: std::str::FromStr>(groups: &[Option<&str>], index: usize) -> Option<T> {
    groups
        .get(index)
        .copied()
        .flatten()
        .and_then(|value| value.trim().parse().ok())
}

/// `Error:` / `Error ` at the start of a line, or `unhandled exception` anywhere.
pub fn is_generic_error(line: &str) -> bool {
    let lower = line.trim_start().to_ascii_lowercase();
    if let Some(rest) = lower.strip_prefix("error") {
        if rest.starts_with(|c: char| c == ':' || c.is_whitespace()) {
            return true;
        }
    }
    lower.contains("unhandled exception")
}

/// Split into lines; the segment after the last newline only counts when
/// `include_partial` is set.
fn split_lines(text: &str, include_partial: bool) -> Vec<&str> {
    let mut lines: Vec<&str> = text.split('\n').collect();
    let last = lines.pop();
    if include_partial {
        if let Some(last) = last.filter(|l| !l.is_empty()) {
            lines.push(last);
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percent_table() -> MarkerTable {
        MarkerTable::new()
            .with(
                Matcher::regex(r"(?i)^percent complete:\s*([\d.]+)\s*%").unwrap(),
                Effect::ProgressFromGroup(1),
            )
            .with(Matcher::prefix("Warning"), Effect::Warning)
            .with(
                Matcher::regex(r"(?i)no data points found").unwrap(),
                Effect::UnitFailed,
            )
            .with(Matcher::contains("Nothing to align"), Effect::Terminal(ToolState::NoData))
    }

    #[test]
    fn progress_is_monotonic_across_growing_text() {
        let table = percent_table();
        let mut text = String::new();
        let mut state = ParseState::default();
        let mut observed = Vec::new();

        for percent in [5, 3, 8, 8, 12] {
            text.push_str(&format!("Percent complete: {percent}%\n"));
            let (_, next) = table.parse(&text, &state);
            observed.push(next.percent_complete);
            state = next;
        }

        assert_eq!(observed, vec![5.0, 5.0, 8.0, 8.0, 12.0]);
    }

    #[test]
    fn events_only_for_new_lines() {
        let table = percent_table();
        let text = "Percent complete: 10%\nWarning: low signal\n";
        let (events, state) = table.parse(text, &ParseState::default());
        assert_eq!(events.len(), 2);

        let grown = format!("{text}Percent complete: 20%\n");
        let (events, state) = table.parse(&grown, &state);
        assert_eq!(events, vec![ConsoleEvent::ProgressUpdate(20.0)]);
        assert_eq!(state.warnings, vec!["Warning: low signal".to_string()]);
        assert_eq!(state.lines_seen, 3);
    }

    #[test]
    fn rescans_do_not_double_count_units() {
        let table = percent_table();
        let text = "scan 1: no data points found\nscan 2: no data points found\n";
        let (_, state) = table.parse(text, &ParseState::default());
        let (_, state) = table.parse(text, &state);
        let (_, state) = table.parse(text, &state);
        assert_eq!(state.units_failed, 2);
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let table = percent_table();
        let (events, state) = table.parse("Percent complete: 4", &ParseState::default());
        assert!(events.is_empty());
        assert_eq!(state.lines_seen, 0);

        let (events, state) = table.parse_final("Percent complete: 40%", &state);
        assert_eq!(events, vec![ConsoleEvent::ProgressUpdate(40.0)]);
        assert_eq!(state.percent_complete, 40.0);
    }

    #[test]
    fn generic_error_slurps_remaining_lines() {
        let table = percent_table();
        let text = "Percent complete: 10%\nError: could not open file\n  at Reader.Open()\n  at Main()\n";
        let (events, state) = table.parse(text, &ParseState::default());

        let expected = "Error: could not open file\n  at Reader.Open()\n  at Main()";
        assert_eq!(state.error.as_deref(), Some(expected));
        assert_eq!(state.tool_state, ToolState::Error);
        assert!(events.contains(&ConsoleEvent::Error(expected.to_string())));
    }

    #[test]
    fn unhandled_exception_is_case_insensitive() {
        assert!(is_generic_error("System.IO: Unhandled Exception occurred"));
        assert!(is_generic_error("ERROR: bad things"));
        assert!(is_generic_error("error reading header"));
        assert!(!is_generic_error("Errors found: 0"));
        assert!(!is_generic_error("Warning: error count = 0"));
    }

    #[test]
    fn table_markers_take_precedence_over_generic_errors() {
        let table = MarkerTable::new().with(
            Matcher::regex(r"(?i)^error: no data points found").unwrap(),
            Effect::UnitFailed,
        );
        let (_, state) = table.parse(
            "Error: no data points found in scan 4\n",
            &ParseState::default(),
        );
        assert!(state.error.is_none());
        assert_eq!(state.units_failed, 1);
    }

    #[test]
    fn generic_errors_can_be_disabled() {
        let table = MarkerTable::new().without_generic_errors();
        let (_, state) = table.parse("Error: ignored\n", &ParseState::default());
        assert!(state.error.is_none());
    }

    #[test]
    fn fraction_sets_units_and_progress() {
        let table = MarkerTable::new().with(
            Matcher::regex(r"(?i)^processing scan (\d+) of (\d+)").unwrap(),
            Effect::ProgressFraction { done: 1, total: 2 },
        );
        let (_, state) = table.parse("Processing scan 25 of 200\n", &ParseState::default());
        assert_eq!(state.units_processed, 25);
        assert_eq!(state.units_total, Some(200));
        assert!((state.percent_complete - 12.5).abs() < f32::EPSILON);
    }

    #[test]
    fn rewritten_status_file_keeps_counters() {
        let table = MarkerTable::new().with(
            Matcher::regex(r"(?i)^processing scan (\d+) of (\d+)").unwrap(),
            Effect::ProgressFraction { done: 1, total: 2 },
        );
        let (_, state) = table.parse("Processing scan 50 of 100\n", &ParseState::default());
        let (_, state) = table.parse("Status: writing\n", &state);
        assert_eq!(state.units_processed, 50);
        assert_eq!(state.units_total, Some(100));
        assert!((state.percent_complete - 50.0).abs() < f32::EPSILON);
    }

    #[test]
    fn state_label_is_mapped_and_kept() {
        let table = MarkerTable::new().with(
            Matcher::regex(r"(?i)^status:\s*(.+)$").unwrap(),
            Effect::StateFromGroup(1),
        );
        let (events, state) = table.parse("Status: Analyzing\n", &ParseState::default());
        assert_eq!(events, vec![ConsoleEvent::StateChange(ToolState::Processing)]);
        assert_eq!(state.state_label.as_deref(), Some("Analyzing"));
    }

    #[test]
    fn terminal_marker_is_recorded() {
        let table = percent_table();
        let (_, state) = table.parse("Nothing to align\n", &ParseState::default());
        assert_eq!(state.terminal, Some(ToolState::NoData));
    }

    #[test]
    fn invalid_regex_is_reported() {
        assert!(matches!(
            Matcher::regex("(unclosed"),
            Err(MarkerError::InvalidPattern { .. })
        ));
    }
}
