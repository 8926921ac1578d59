#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Tool name every action plan must carry.
pub const PLAN_TOOL: &str = "mcp_safe_exec";
/// The single diagnostic action the privileged tool accepts.
pub const PLAN_ACTION: &str = "run_diagnostic";
/// Sentinel target a refusing planner may emit; the executor is never
/// invoked for it.
pub const REFUSED_TARGET: &str = "REFUSED";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Untrusted,
}

impl TrustLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Untrusted => "untrusted",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Block,
    RequireVerification,
}

impl Decision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::RequireVerification => "require_verification",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Vulnerable,
    Defended,
}

impl RunMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vulnerable => "vulnerable",
            Self::Defended => "defended",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "vulnerable" => Some(Self::Vulnerable),
            "defended" => Some(Self::Defended),
            _ => None,
        }
    }
}

/// A single note in shared memory. Immutable once persisted; ids are
/// assigned by the store, strictly increasing and 1-based.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemoryRecord {
    pub id: i64,
    pub content: String,
    pub tags: Vec<String>,
    pub trust_level: TrustLevel,
    pub provenance: String,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    pub created_at: String,
}

/// Retrieval output handed to the policy gate and planner.
///
/// `effective_trust` is `Trusted` iff at least one note is trusted, so a
/// single mis-tagged note taints the whole pack upward.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContextPack {
    pub notes: Vec<MemoryRecord>,
    pub effective_trust: TrustLevel,
    pub citations: Vec<String>,
}

impl ContextPack {
    #[must_use]
    pub fn from_notes(notes: Vec<MemoryRecord>) -> Self {
        let effective_trust = if notes
            .iter()
            .any(|note| note.trust_level == TrustLevel::Trusted)
        {
            TrustLevel::Trusted
        } else {
            TrustLevel::Untrusted
        };
        let citations = notes.iter().map(|note| format!("memory:{}", note.id)).collect();
        Self {
            notes,
            effective_trust,
            citations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PolicyDecision {
    pub decision: Decision,
    pub reasons: Vec<String>,
    pub enforced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActionPlan {
    pub tool: String,
    pub action: String,
    pub target: String,
    pub justification: String,
    #[serde(default)]
    pub source_memory_ids: Vec<i64>,
}

impl ActionPlan {
    /// Reject plans whose tool/action literals drifted from the only
    /// supported diagnostic call.
    ///
    /// # Errors
    /// Returns an error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.tool != PLAN_TOOL {
            return Err(anyhow!("unsupported plan tool '{}'", self.tool));
        }
        if self.action != PLAN_ACTION {
            return Err(anyhow!("unsupported plan action '{}'", self.action));
        }
        Ok(())
    }
}

/// Outcome of the planning stage. `Fallback` records that the provider
/// output was unusable and the canned plan was substituted, so tests can
/// tell the two paths apart without exception semantics.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PlanOutcome {
    Planned { plan: ActionPlan },
    Fallback { plan: ActionPlan, error: String },
}

impl PlanOutcome {
    #[must_use]
    pub fn plan(&self) -> &ActionPlan {
        match self {
            Self::Planned { plan } | Self::Fallback { plan, .. } => plan,
        }
    }

    #[must_use]
    pub fn plan_mut(&mut self) -> &mut ActionPlan {
        match self {
            Self::Planned { plan } | Self::Fallback { plan, .. } => plan,
        }
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct McpPayload {
    pub action: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum McpStatus {
    Ok,
    Rejected,
}

impl McpStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct McpResponse {
    pub status: McpStatus,
    pub message: String,
    #[serde(default)]
    pub artifacts_written: Vec<String>,
}

/// One line of the append-only run trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub ts: String,
    pub agent_name: String,
    pub task_name: String,
    pub inputs: Value,
    pub outputs: Value,
    #[serde(default)]
    pub memory_ops: Vec<Value>,
    #[serde(default)]
    pub tool_calls: Vec<Value>,
    #[serde(default)]
    pub obfuscation_method: Option<String>,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Format a timestamp as RFC 3339.
///
/// # Errors
/// Returns an error if the value cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

/// RFC 3339 string for "now", for `created_at` fields and artifact
/// timestamps.
///
/// # Errors
/// Returns an error if formatting fails.
pub fn timestamp_now() -> Result<String> {
    format_rfc3339(now_utc())
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Pull the first balanced `{...}` block out of provider output, tolerating
/// prose before and after it. Returns the input unchanged when no block is
/// found; the caller's JSON parse surfaces the real failure.
#[must_use]
pub fn extract_json_block(raw: &str) -> &str {
    let text = raw.trim();
    if text.starts_with('{') && text.ends_with('}') {
        return text;
    }
    let Some(start) = text.find('{') else {
        return text;
    };
    let mut depth = 0_i32;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return &text[start..=start + offset];
                }
            }
            _ => {}
        }
    }
    text
}
