//! Read-only view of the team registry file maintained by the API layer.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
  #[serde(default)]
  pub teams: Vec<Team>,
  #[serde(default)]
  pub orchestrator: Option<Orchestrator>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub members: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
  pub id: String,
  #[serde(default)]
  pub name: String,
  pub session_name: String,
  #[serde(default)]
  pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Orchestrator {
  pub session_name: String,
}

/// A member together with the team it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct MemberRef<'a> {
  pub team: &'a Team,
  pub member: &'a Member,
}

impl Registry {
  /// Every member across all teams, in file order.
  pub fn members(&self) -> impl Iterator<Item = MemberRef<'_>> {
    self
      .teams
      .iter()
      .flat_map(|team| team.members.iter().map(move |member| MemberRef { team, member }))
  }

  #[must_use]
  pub fn member_by_session(&self, session: &str) -> Option<MemberRef<'_>> {
    self.members().find(|m| m.member.session_name == session)
  }

  #[must_use]
  pub fn orchestrator_session(&self) -> Option<&str> {
    self.orchestrator.as_ref().map(|o| o.session_name.as_str())
  }
}

/// Parse registry JSON. Unknown keys are ignored.
pub fn parse_registry(path: &Path, data: &str) -> FleetResult<Registry> {
  serde_json::from_str(data).map_err(|e| FleetError::MalformedRegistry {
    path: path.to_path_buf(),
    reason: e.to_string(),
  })
}

/// Read and parse the registry at `path`. A missing or empty file is malformed
/// from the reader's point of view, since the writer may be mid-save.
pub fn load_registry(path: &Path) -> FleetResult<Registry> {
  let data = fs::read_to_string(path).map_err(|e| FleetError::MalformedRegistry {
    path: path.to_path_buf(),
    reason: e.to_string(),
  })?;
  if data.trim().is_empty() {
    return Err(FleetError::MalformedRegistry {
      path: path.to_path_buf(),
      reason: "file is empty".to_string(),
    });
  }
  parse_registry(path, &data)
}
