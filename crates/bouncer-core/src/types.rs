use std::fmt;

use serde::{Deserialize, Serialize};

use crate::duration::parse_seconds;
use crate::ids::DecisionId;

/// What a decision applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Scope {
    Ip,
    Range,
    Other(String),
}

/// The remediation a decision asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DecisionType {
    Ban,
    Captcha,
    Other(String),
}

impl From<String> for Scope {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("ip") {
            Scope::Ip
        } else if value.eq_ignore_ascii_case("range") {
            Scope::Range
        } else {
            Scope::Other(value)
        }
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Ip => "Ip".to_string(),
            Scope::Range => "Range".to_string(),
            Scope::Other(value) => value,
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Ip
    }
}

impl From<String> for DecisionType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ban" => DecisionType::Ban,
            "captcha" => DecisionType::Captcha,
            _ => DecisionType::Other(value),
        }
    }
}

impl From<DecisionType> for String {
    fn from(kind: DecisionType) -> Self {
        match kind {
            DecisionType::Ban => "ban".to_string(),
            DecisionType::Captcha => "captcha".to_string(),
            DecisionType::Other(value) => value,
        }
    }
}

impl Default for DecisionType {
    fn default() -> Self {
        DecisionType::Ban
    }
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from(self.clone()))
    }
}

/// One access-control fact issued by the authority.
///
/// Fields the authority sends but the bouncer has no use for (`simulated`,
/// `until`, ...) are ignored on decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub id: DecisionId,
    pub value: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(rename = "type", default)]
    pub kind: DecisionType,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
}

impl Decision {
    /// Remaining lifetime in whole seconds, `0` when the authority sent none
    /// or sent something unparseable. Expired decisions report a negative value.
    pub fn duration_seconds(&self) -> i64 {
        self.duration
            .as_deref()
            .and_then(|raw| parse_seconds(raw).ok())
            .map(|secs| secs.trunc() as i64)
            .unwrap_or(0)
    }
}

/// Decisions to enforce and to lift, in authority response order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaBatch {
    pub to_add: Vec<Decision>,
    pub to_remove: Vec<Decision>,
}

impl DeltaBatch {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Del,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Del => "del",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single decision transition handed to the enforcement program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementEvent {
    pub action: Action,
    pub id: DecisionId,
    pub value: String,
    #[serde(rename = "type")]
    pub kind: DecisionType,
    pub scope: Scope,
    pub origin: String,
    pub scenario: String,
    pub duration: Option<String>,
    pub uuid: Option<String>,
}

impl EnforcementEvent {
    pub fn new(action: Action, decision: &Decision) -> Self {
        Self {
            action,
            id: decision.id,
            value: decision.value.clone(),
            kind: decision.kind.clone(),
            scope: decision.scope.clone(),
            origin: decision.origin.clone(),
            scenario: decision.scenario.clone(),
            duration: decision.duration.clone(),
            uuid: decision.uuid.clone(),
        }
    }

    pub fn duration_seconds(&self) -> i64 {
        self.duration
            .as_deref()
            .and_then(|raw| parse_seconds(raw).ok())
            .map(|secs| secs.trunc() as i64)
            .unwrap_or(0)
    }
}
