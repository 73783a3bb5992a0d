use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::MonitorConfig;
use crate::utils::term::strip_ansi_control_codes;

/// Lines from the end of a capture that the heuristics look at.
const TAIL_LINES: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
  Idle,
  Working,
  WaitingForInput,
  Unknown,
}

impl ActivityState {
  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Idle => "idle",
      Self::Working => "working",
      Self::WaitingForInput => "waiting_for_input",
      Self::Unknown => "unknown",
    }
  }
}

impl fmt::Display for ActivityState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One captured pane as seen by a classifier.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
  pub session: &'a str,
  /// Captured pane text with ANSI control codes removed.
  pub content: &'a str,
  /// How long the content has been unchanged, counted from first sight
  /// when no change has been observed yet.
  pub quiet_for: Duration,
  /// Whether the monitor has ever seen this pane's content change.
  pub seen_change: bool,
}

pub trait Classifier: Send + Sync {
  fn classify(&self, obs: &Observation<'_>) -> ActivityState;
}

/// Pattern and timing based classification.
///
/// A pending question wins; otherwise content that changed within the quiet
/// window means working, and a prompt marker or a quiet pane means idle.
/// A pane seen too briefly to judge counts as working.
pub struct HeuristicClassifier {
  idle_markers: Vec<Regex>,
  waiting_patterns: Vec<Regex>,
  quiet: Duration,
}

fn compile(kind: &str, patterns: &[String]) -> Result<Vec<Regex>> {
  patterns
    .iter()
    .map(|p| Regex::new(p).with_context(|| format!("invalid {kind} pattern {p:?}")))
    .collect()
}

impl HeuristicClassifier {
  pub fn from_config(cfg: &MonitorConfig) -> Result<Self> {
    Ok(Self {
      idle_markers: compile("monitor.idle_markers", &cfg.idle_markers)?,
      waiting_patterns: compile("monitor.waiting_patterns", &cfg.waiting_patterns)?,
      quiet: Duration::from_millis(cfg.quiet_ms),
    })
  }

  fn is_waiting(&self, tail: &[&str]) -> bool {
    tail
      .iter()
      .any(|line| self.waiting_patterns.iter().any(|re| re.is_match(line)))
  }

  fn has_idle_marker(&self, tail: &[&str]) -> bool {
    tail
      .last()
      .is_some_and(|line| self.idle_markers.iter().any(|re| re.is_match(line)))
  }
}

impl Classifier for HeuristicClassifier {
  fn classify(&self, obs: &Observation<'_>) -> ActivityState {
    let lines: Vec<&str> = obs
      .content
      .lines()
      .map(str::trim_end)
      .filter(|l| !l.is_empty())
      .collect();
    let tail = &lines[lines.len().saturating_sub(TAIL_LINES)..];

    if self.is_waiting(tail) {
      return ActivityState::WaitingForInput;
    }
    if obs.seen_change && obs.quiet_for < self.quiet {
      ActivityState::Working
    } else if self.has_idle_marker(tail) || obs.quiet_for >= self.quiet {
      ActivityState::Idle
    } else {
      ActivityState::Working
    }
  }
}

/// Remembers when a session's pane content last changed.
#[derive(Debug)]
pub(crate) struct ChangeTracker {
  digest: u64,
  last_change: Instant,
  seen_change: bool,
  last_output_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ChangeTracker {
  pub(crate) fn new(now: Instant, content: &str) -> Self {
    Self {
      digest: digest(content),
      last_change: now,
      seen_change: false,
      last_output_at: None,
    }
  }

  /// Record a capture and return how long the content has been unchanged.
  pub(crate) fn observe(&mut self, now: Instant, content: &str) -> Duration {
    let d = digest(content);
    if d != self.digest {
      self.digest = d;
      self.last_change = now;
      self.seen_change = true;
      self.last_output_at = Some(chrono::Utc::now());
    }
    now.duration_since(self.last_change)
  }

  pub(crate) fn seen_change(&self) -> bool {
    self.seen_change
  }

  pub(crate) fn last_output_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
    self.last_output_at
  }
}

fn digest(content: &str) -> u64 {
  use std::hash::{Hash, Hasher};
  let mut h = std::collections::hash_map::DefaultHasher::new();
  content.hash(&mut h);
  h.finish()
}

/// Strip control codes and surrounding blank lines from a capture.
#[must_use]
pub fn clean_capture(raw: &str) -> String {
  strip_ansi_control_codes(raw).trim_end().to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier() -> HeuristicClassifier {
    let cfg = MonitorConfig {
      poll_interval_ms: 100,
      quiet_ms: 1000,
      idle_markers: vec![r"^\s*[>›❯]\s*$".into(), r"\$\s*$".into()],
      waiting_patterns: vec![r"(?i)do you want to proceed".into(), r"(?i)\[y/n\]".into()],
    };
    HeuristicClassifier::from_config(&cfg).unwrap()
  }

  fn classify(content: &str, quiet_for: Duration, seen_change: bool) -> ActivityState {
    classifier().classify(&Observation {
      session: "s",
      content,
      quiet_for,
      seen_change,
    })
  }

  #[test]
  fn pending_question_wins_over_everything() {
    let text = "Edit src/main.rs?\nDo you want to proceed?\n❯ 1. Yes\n";
    assert_eq!(classify(text, Duration::ZERO, true), ActivityState::WaitingForInput);
    assert_eq!(classify("overwrite? [y/N]", Duration::ZERO, false), ActivityState::WaitingForInput);
  }

  #[test]
  fn recent_change_means_working() {
    let text = "compiling crate...\n";
    assert_eq!(classify(text, Duration::from_millis(200), true), ActivityState::Working);
    // A prompt that just appeared still counts as output in progress.
    assert_eq!(classify("done\n> ", Duration::from_millis(200), true), ActivityState::Working);
  }

  #[test]
  fn quiet_pane_is_idle() {
    assert_eq!(classify("done.\n", Duration::from_secs(5), true), ActivityState::Idle);
    assert_eq!(classify("done.\n", Duration::from_secs(5), false), ActivityState::Idle);
  }

  #[test]
  fn prompt_marker_decides_first_sight() {
    assert_eq!(classify("output\n> \n\n", Duration::ZERO, false), ActivityState::Idle);
    assert_eq!(classify("user@host:~$ ", Duration::ZERO, false), ActivityState::Idle);
    assert_eq!(classify("streaming tokens", Duration::ZERO, false), ActivityState::Working);
  }

  #[test]
  fn old_questions_scrolled_out_are_ignored() {
    let mut text = String::from("Do you want to proceed?\n");
    for i in 0..TAIL_LINES {
      text.push_str(&format!("line {i}\n"));
    }
    assert_eq!(classify(&text, Duration::from_secs(5), true), ActivityState::Idle);
  }

  #[test]
  fn invalid_pattern_is_reported_with_its_key() {
    let cfg = MonitorConfig {
      idle_markers: vec!["(".into()],
      ..MonitorConfig::default()
    };
    let err = HeuristicClassifier::from_config(&cfg).err().expect("bad regex");
    assert!(format!("{err:#}").contains("monitor.idle_markers"));
  }

  #[test]
  fn tracker_measures_quiet_time_since_last_change() {
    let t0 = Instant::now();
    let mut tracker = ChangeTracker::new(t0, "a");
    assert!(tracker.last_output_at().is_none());
    assert!(!tracker.seen_change());
    assert_eq!(tracker.observe(t0 + Duration::from_secs(2), "a"), Duration::from_secs(2));
    assert_eq!(tracker.observe(t0 + Duration::from_secs(3), "b"), Duration::ZERO);
    assert!(tracker.last_output_at().is_some());
    assert!(tracker.seen_change());
    assert_eq!(tracker.observe(t0 + Duration::from_secs(4), "b"), Duration::from_secs(1));
  }

  #[test]
  fn clean_capture_strips_codes_and_trailing_blank_lines() {
    assert_eq!(clean_capture("\x1b[1mhi\x1b[0m\n\n\n"), "hi");
  }
}
