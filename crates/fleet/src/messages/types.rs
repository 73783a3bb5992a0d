//! Data types for scheduled messages and their delivery log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
  Seconds,
  Minutes,
  Hours,
  Days,
}

impl DelayUnit {
  #[must_use]
  pub fn seconds(self) -> i64 {
    match self {
      Self::Seconds => 1,
      Self::Minutes => 60,
      Self::Hours => 3600,
      Self::Days => 86_400,
    }
  }

  fn suffix(self) -> char {
    match self {
      Self::Seconds => 's',
      Self::Minutes => 'm',
      Self::Hours => 'h',
      Self::Days => 'd',
    }
  }
}

impl fmt::Display for DelayUnit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Seconds => "seconds",
      Self::Minutes => "minutes",
      Self::Hours => "hours",
      Self::Days => "days",
    };
    f.write_str(name)
  }
}

impl FromStr for DelayUnit {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "s" | "sec" | "secs" | "second" | "seconds" => Ok(Self::Seconds),
      "m" | "min" | "mins" | "minute" | "minutes" => Ok(Self::Minutes),
      "h" | "hour" | "hours" => Ok(Self::Hours),
      "d" | "day" | "days" => Ok(Self::Days),
      other => Err(format!("unknown delay unit '{other}', expected seconds/minutes/hours/days")),
    }
  }
}

/// Parse a compact delay such as `30s`, `5m`, `2h` or `1d`.
pub fn parse_delay(s: &str) -> Result<(u32, DelayUnit), String> {
  let s = s.trim();
  let split = s
    .find(|c: char| !c.is_ascii_digit())
    .ok_or_else(|| format!("missing unit in '{s}', expected e.g. 30s, 5m, 2h, 1d"))?;
  let (digits, unit) = s.split_at(split);
  if digits.is_empty() {
    return Err(format!("missing amount in '{s}'"));
  }
  let amount: u32 = digits
    .parse()
    .map_err(|_| format!("number too large: {digits}"))?;
  if amount == 0 {
    return Err("delay must be greater than zero".into());
  }
  Ok((amount, unit.parse()?))
}

#[must_use]
pub fn format_delay(amount: u32, unit: DelayUnit) -> String {
  format!("{amount}{}", unit.suffix())
}

/// Caller-supplied fields of a scheduled message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSpec {
  pub name: String,
  #[serde(alias = "targetTeam")]
  pub target_session: String,
  #[serde(default)]
  pub target_project: Option<String>,
  pub message: String,
  pub delay_amount: u32,
  pub delay_unit: DelayUnit,
  #[serde(default)]
  pub is_recurring: bool,
  #[serde(default = "default_true")]
  pub is_active: bool,
}

fn default_true() -> bool {
  true
}

impl MessageSpec {
  pub fn validate(&self) -> FleetResult<()> {
    let problem = if self.name.trim().is_empty() {
      Some("name is empty")
    } else if self.target_session.trim().is_empty() {
      Some("target session is empty")
    } else if self.message.trim().is_empty() {
      Some("message is empty")
    } else if self.delay_amount == 0 {
      Some("delay must be greater than zero")
    } else {
      None
    };
    match problem {
      Some(p) => Err(FleetError::InvalidMessage(p.to_string())),
      None => Ok(()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessage {
  pub id: String,
  pub name: String,
  #[serde(alias = "targetTeam")]
  pub target_session: String,
  #[serde(default)]
  pub target_project: Option<String>,
  pub message: String,
  pub delay_amount: u32,
  pub delay_unit: DelayUnit,
  pub is_recurring: bool,
  pub is_active: bool,
  #[serde(default)]
  pub last_run: Option<DateTime<Utc>>,
  #[serde(default)]
  pub next_run: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl ScheduledMessage {
  #[must_use]
  pub fn from_spec(spec: MessageSpec, now: DateTime<Utc>) -> Self {
    let mut msg = Self {
      id: uuid::Uuid::new_v4().to_string(),
      name: String::new(),
      target_session: String::new(),
      target_project: None,
      message: String::new(),
      delay_amount: 1,
      delay_unit: DelayUnit::Seconds,
      is_recurring: false,
      is_active: false,
      last_run: None,
      next_run: None,
      created_at: now,
      updated_at: now,
    };
    msg.apply(spec, now);
    msg
  }

  /// Overwrite the caller-owned fields and re-arm from `now` when active.
  pub fn apply(&mut self, spec: MessageSpec, now: DateTime<Utc>) {
    self.name = spec.name;
    self.target_session = spec.target_session;
    self.target_project = spec.target_project;
    self.message = spec.message;
    self.delay_amount = spec.delay_amount;
    self.delay_unit = spec.delay_unit;
    self.is_recurring = spec.is_recurring;
    self.updated_at = now;
    self.set_active(spec.is_active, now);
  }

  pub fn set_active(&mut self, active: bool, now: DateTime<Utc>) {
    self.is_active = active;
    self.next_run = active.then(|| now + self.delay());
    self.updated_at = now;
  }

  #[must_use]
  pub fn delay(&self) -> Duration {
    Duration::seconds(i64::from(self.delay_amount) * self.delay_unit.seconds())
  }

  #[must_use]
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.is_active && self.next_run.is_some_and(|n| n <= now)
  }

  /// Record a scheduled firing at `at`: recurring entries advance by one
  /// delay from this run, one-shots complete whatever the outcome.
  pub fn record_fire(&mut self, at: DateTime<Utc>) {
    self.last_run = Some(at);
    self.updated_at = at;
    if self.is_recurring {
      self.next_run = Some(at + self.delay());
    } else {
      self.is_active = false;
      self.next_run = None;
    }
  }

  #[must_use]
  pub fn to_spec(&self) -> MessageSpec {
    MessageSpec {
      name: self.name.clone(),
      target_session: self.target_session.clone(),
      target_project: self.target_project.clone(),
      message: self.message.clone(),
      delay_amount: self.delay_amount,
      delay_unit: self.delay_unit,
      is_recurring: self.is_recurring,
      is_active: self.is_active,
    }
  }
}

/// Append-only record of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryLogEntry {
  pub id: String,
  pub scheduled_message_id: String,
  pub message_name: String,
  #[serde(alias = "targetTeam")]
  pub target_session: String,
  #[serde(default)]
  pub target_project: Option<String>,
  pub message: String,
  pub sent_at: DateTime<Utc>,
  pub success: bool,
  #[serde(default)]
  pub error: Option<String>,
}

/// Outcome of one delivery, returned by `run_now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
  pub scheduled_message_id: String,
  pub log_entry_id: String,
  pub sent_at: DateTime<Utc>,
  pub success: bool,
  pub error: Option<String>,
}

impl From<&DeliveryLogEntry> for DeliveryResult {
  fn from(entry: &DeliveryLogEntry) -> Self {
    Self {
      scheduled_message_id: entry.scheduled_message_id.clone(),
      log_entry_id: entry.id.clone(),
      sent_at: entry.sent_at,
      success: entry.success,
      error: entry.error.clone(),
    }
  }
}
