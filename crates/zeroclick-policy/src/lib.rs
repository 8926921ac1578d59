#![forbid(unsafe_code)]

//! Decides whether a retrieved context pack may authorize a privileged
//! action. In the vulnerable configuration the gate is a modelled-absent
//! control; in the defended configuration provenance outranks the stored
//! trust label, which is what closes the trust-elevation hole even when an
//! earlier stage mis-tagged a record.

use zeroclick_detector::POISON_MARKER;
use zeroclick_domain::{ContextPack, Decision, PolicyDecision, RunMode, TrustLevel};

/// Service identifiers a diagnostic target may legitimately name.
pub const TARGET_ALLOWLIST: &[&str] = &["serviceA", "serviceB"];

/// Provenance prefix marking content that arrived from the untrusted web
/// ingestion path.
pub const WEB_FIXTURE_PROVENANCE: &str = "web_fixture";

const TARGET_MARKER: &str = "target to:";

#[derive(Debug, Clone)]
pub struct PolicyGate {
    mode: RunMode,
}

impl PolicyGate {
    #[must_use]
    pub fn new(mode: RunMode) -> Self {
        Self { mode }
    }

    /// Evaluate a context pack. Blocking is a decision outcome, never an
    /// error.
    #[must_use]
    pub fn evaluate(&self, context_pack: &ContextPack) -> PolicyDecision {
        if self.mode == RunMode::Vulnerable {
            return PolicyDecision {
                decision: Decision::Allow,
                reasons: vec!["policy gate disabled in vulnerable mode".to_string()],
                enforced: false,
            };
        }

        let mut reasons: Vec<String> = Vec::new();

        for note in &context_pack.notes {
            if note.provenance.starts_with(WEB_FIXTURE_PROVENANCE) {
                reasons.push("provenance is web_fixture -> treat as untrusted".to_string());
            }
            if note.content.contains(POISON_MARKER) {
                reasons.push("suspicious token detected in memory content".to_string());
            }
            if let Some(target) = extract_target(&note.content) {
                if !TARGET_ALLOWLIST.contains(&target) {
                    reasons.push(format!("target '{target}' not in allowlist"));
                }
            }
        }

        if context_pack.effective_trust == TrustLevel::Untrusted {
            reasons.push("effective_trust is untrusted".to_string());
        }

        let decision = if reasons.is_empty() {
            Decision::Allow
        } else {
            Decision::Block
        };

        if reasons.is_empty() {
            reasons.push("policy checks passed".to_string());
        }

        PolicyDecision {
            decision,
            reasons,
            enforced: true,
        }
    }
}

/// Pull the destination named after a `target to:` marker, case-insensitive,
/// up to end of line. Returns `None` when the marker is absent or names
/// nothing.
#[must_use]
pub fn extract_target(content: &str) -> Option<&str> {
    let lowered = content.to_lowercase();
    let start = lowered.find(TARGET_MARKER)? + TARGET_MARKER.len();
    let rest = content.get(start..)?;
    let line = rest.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}
