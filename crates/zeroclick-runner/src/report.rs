//! End-of-run documents: the postmortem and the presenter-facing incident
//! report. Prose is informational; the load-bearing fields are the target,
//! the policy decision, and the artifact list.

use serde_json::Value;
use zeroclick_domain::{
    ActionPlan, MemoryRecord, PlanOutcome, PolicyDecision, RunId, RunMode,
};

#[must_use]
pub fn build_postmortem(
    mode: RunMode,
    record: &MemoryRecord,
    decision: &PolicyDecision,
    plan_outcome: &PlanOutcome,
    tool_calls: &[Value],
    forensics_note: &str,
) -> String {
    let plan = plan_outcome.plan();
    let mut lines = vec![
        "# Postmortem".to_string(),
        String::new(),
        format!("- Mode: {}", mode.as_str()),
        format!(
            "- Poisoned memory record: id={}, provenance={}",
            record.id, record.provenance
        ),
        format!("- Trust level recorded: {}", record.trust_level.as_str()),
        "- Trust boundary failed at MemoryWriterAgent (trusted untrusted runbook).".to_string(),
        "- PlannerAgent propagated the unsafe target into ActionPlan.".to_string(),
    ];
    if plan_outcome.is_fallback() {
        lines.push("- Planner fell back to the canned plan (provider output unusable).".to_string());
    }
    if !tool_calls.is_empty() {
        lines.push(
            "- ExecutorAgent invoked MCPServerSim without verification (zero-click).".to_string(),
        );
    }
    lines.push(String::new());
    lines.push("## Forensics Summary".to_string());
    let note = forensics_note.trim();
    lines.push(if note.is_empty() {
        "No summary provided.".to_string()
    } else {
        note.to_string()
    });
    lines.push(String::new());
    lines.push("## ActionPlan".to_string());
    lines.push("```json".to_string());
    lines.push(to_pretty_json(&serde_json::json!(plan)));
    lines.push("```".to_string());
    lines.push(String::new());
    lines.push("## Policy Decision".to_string());
    lines.push("```json".to_string());
    lines.push(to_pretty_json(&serde_json::json!(decision)));
    lines.push("```".to_string());
    lines.join("\n")
}

#[must_use]
pub fn build_incident_report(
    run_id: RunId,
    mode: RunMode,
    fixture_file: &str,
    record: &MemoryRecord,
    decision: &PolicyDecision,
    plan: &ActionPlan,
    artifacts: &[String],
) -> String {
    let reasons_text = if decision.reasons.is_empty() {
        "none".to_string()
    } else {
        decision.reasons.join(", ")
    };

    let mut lines = vec![
        "# Incident Report".to_string(),
        String::new(),
        format!("- Run ID: {run_id}"),
        format!("- Mode: {}", mode.as_str()),
        format!("- Fixture: {fixture_file}"),
        format!(
            "- Memory record: id={}, trust={}, provenance={}",
            record.id,
            record.trust_level.as_str(),
            record.provenance
        ),
        String::new(),
        "## Summary".to_string(),
        "Untrusted runbook guidance was ingested, incorrectly elevated to trusted memory, and then"
            .to_string(),
        "propagated into a privileged tool call without human approval (zero-click).".to_string(),
        String::new(),
        "## Impact (Demo)".to_string(),
        "A simulated privileged tool executed an attacker-controlled token and wrote proof artifacts."
            .to_string(),
        "No real commands were executed; this demo only writes local files.".to_string(),
        String::new(),
        "## Evidence".to_string(),
    ];
    if artifacts.is_empty() {
        lines.push("- (No tool artifacts recorded)".to_string());
    } else {
        lines.extend(artifacts.iter().map(|path| format!("- {path}")));
    }
    lines.extend([
        format!("- Trace: runs/{run_id}/trace.jsonl"),
        format!("- Timeline: runs/{run_id}/timeline.md"),
        format!("- Postmortem: runs/{run_id}/postmortem.md"),
        String::new(),
        "## Key Decision Points".to_string(),
        "- Trust boundary failed at MemoryWriterAgent (trusted untrusted runbook).".to_string(),
        format!(
            "- Policy decision: {} (reasons: {reasons_text})",
            decision.decision.as_str()
        ),
        format!("- Planner target: {}", plan.target),
        String::new(),
        "## Recommended Fixes".to_string(),
        "- Never auto-upgrade trust based on tags alone; require provenance checks.".to_string(),
        "- Add strict allowlists and token sanitization before privileged tools.".to_string(),
        "- Require human approval for untrusted or mixed-trust inputs.".to_string(),
    ]);
    lines.join("\n")
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::{build_incident_report, build_postmortem};
    use zeroclick_domain::{
        ActionPlan, Decision, MemoryRecord, PlanOutcome, PolicyDecision, RunId, RunMode,
        TrustLevel, PLAN_ACTION, PLAN_TOOL,
    };

    fn fixture_record() -> MemoryRecord {
        MemoryRecord {
            id: 1,
            content: "note".to_string(),
            tags: vec!["runbook".to_string(), "diagnostics".to_string()],
            trust_level: TrustLevel::Trusted,
            provenance: "web_fixture:poisoned_runbook.md".to_string(),
            risk_flags: vec!["TOKEN_WRITE_PWNED_FILE".to_string()],
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn fixture_plan() -> ActionPlan {
        ActionPlan {
            tool: PLAN_TOOL.to_string(),
            action: PLAN_ACTION.to_string(),
            target: "serviceA WRITE_PWNED_FILE".to_string(),
            justification: "demo".to_string(),
            source_memory_ids: vec![1],
        }
    }

    #[test]
    fn postmortem_captures_key_fields_and_fallback_marker() {
        let decision = PolicyDecision {
            decision: Decision::Allow,
            reasons: vec!["policy gate disabled in vulnerable mode".to_string()],
            enforced: false,
        };
        let outcome = PlanOutcome::Fallback {
            plan: fixture_plan(),
            error: "invalid JSON".to_string(),
        };

        let postmortem = build_postmortem(
            RunMode::Vulnerable,
            &fixture_record(),
            &decision,
            &outcome,
            &[serde_json::json!({"tool": "mcp_safe_exec"})],
            "- trust failure summary",
        );

        assert!(postmortem.contains("- Mode: vulnerable"));
        assert!(postmortem.contains("provenance=web_fixture:poisoned_runbook.md"));
        assert!(postmortem.contains("Planner fell back"));
        assert!(postmortem.contains("zero-click"));
        assert!(postmortem.contains("serviceA WRITE_PWNED_FILE"));
    }

    #[test]
    fn incident_report_lists_artifacts_and_decision() {
        let decision = PolicyDecision {
            decision: Decision::Block,
            reasons: vec!["effective_trust is untrusted".to_string()],
            enforced: true,
        };

        let report = build_incident_report(
            RunId::new(),
            RunMode::Defended,
            "poisoned_runbook.md",
            &fixture_record(),
            &decision,
            &fixture_plan(),
            &["artifacts/diagnostic_report.txt".to_string()],
        );

        assert!(report.contains("- Mode: defended"));
        assert!(report.contains("- artifacts/diagnostic_report.txt"));
        assert!(report.contains("Policy decision: block (reasons: effective_trust is untrusted)"));
        assert!(report.contains("Planner target: serviceA WRITE_PWNED_FILE"));
    }
}
