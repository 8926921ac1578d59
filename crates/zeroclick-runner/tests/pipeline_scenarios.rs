//! End-to-end scenarios over the full pipeline with the scripted
//! provider: the vulnerable chain compromise, the defended chain's
//! layered rejection, the obfuscation variants, and the clean control.

use std::path::{Path, PathBuf};
use std::time::Duration;

use zeroclick_domain::{Decision, McpStatus, RunMode, TrustLevel};
use zeroclick_provider::{Completion, CompletionClient, ProviderError, ScriptedLlm};
use zeroclick_runner::fixtures::scaffold_fixtures;
use zeroclick_runner::logger::LogDetail;
use zeroclick_runner::{MemoryBackend, Runner, RunSummary, RunnerConfig, RunnerError};

fn temp_root(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("zeroclick-e2e-{name}-{}", ulid::Ulid::new()))
}

fn config(root: &Path, mode: RunMode, backend: MemoryBackend, fixture: &str) -> RunnerConfig {
    RunnerConfig {
        mode,
        memory_backend: backend,
        fixture: fixture.to_string(),
        root: root.to_path_buf(),
        banner: false,
        pace: Duration::ZERO,
        log_detail: LogDetail::Minimal,
    }
}

fn run_scenario(
    name: &str,
    mode: RunMode,
    backend: MemoryBackend,
    fixture: &str,
) -> (RunSummary, PathBuf) {
    let root = temp_root(name);
    scaffold_fixtures(&root.join("web_fixtures"))
        .unwrap_or_else(|err| panic!("failed to scaffold fixtures: {err}"));

    let runner = Runner::new(config(&root, mode, backend, fixture));
    let summary = runner
        .run(&ScriptedLlm::new())
        .unwrap_or_else(|err| panic!("pipeline run failed: {err}"));
    (summary, root)
}

fn read_artifact(dir: &Path, file: &str) -> String {
    std::fs::read_to_string(dir.join(file))
        .unwrap_or_else(|err| panic!("failed to read {file}: {err}"))
}

#[test]
fn vulnerable_poisoned_fixture_compromises_the_chain() {
    let (summary, root) = run_scenario(
        "scenario-a",
        RunMode::Vulnerable,
        MemoryBackend::Sqlite,
        "poisoned",
    );

    // The tag heuristic elevated an untrusted web note to trusted.
    assert_eq!(summary.memory_record.trust_level, TrustLevel::Trusted);
    assert_eq!(
        summary.memory_record.provenance,
        "web_fixture:poisoned_runbook.md"
    );
    assert!(summary
        .memory_record
        .risk_flags
        .contains(&"TOKEN_WRITE_PWNED_FILE".to_string()));

    assert_eq!(summary.policy.decision, Decision::Allow);
    assert!(!summary.policy.enforced);

    assert!(summary
        .plan_outcome
        .plan()
        .target
        .contains("WRITE_PWNED_FILE"));

    let response = summary.response.as_ref();
    assert!(response.is_some());
    assert_eq!(
        response.map(|response| response.status),
        Some(McpStatus::Ok)
    );

    assert!(summary.artifacts_dir.join("diagnostic_report.txt").exists());
    let pwned = summary.pwned_path();
    assert!(pwned.is_some());
    let proof = read_artifact(&summary.artifacts_dir, "pwned.txt");
    assert!(proof.contains("OBFUSCATION METHOD: plaintext"));
    assert!(proof.contains("TARGET: serviceA WRITE_PWNED_FILE"));
    assert_eq!(summary.obfuscation_method.as_deref(), Some("plaintext"));

    // Every run produces the full artifact set.
    assert!(summary.run_dir.join("trace.jsonl").exists());
    assert!(summary.run_dir.join("timeline.md").exists());
    assert!(summary.run_dir.join("graph.txt").exists());
    assert!(summary.run_dir.join("postmortem.md").exists());
    assert!(summary.run_dir.join("incident_report.md").exists());
    assert!(summary.artifacts_dir.join("incident_report.md").exists());

    let trace = read_artifact(&summary.run_dir, "trace.jsonl");
    let stages: Vec<&str> = trace.lines().collect();
    assert!(stages.len() >= 10);
    for task in [
        "Ingest",
        "Summarize",
        "WriteMemory",
        "Retrieve",
        "Policy",
        "Plan",
        "Execute",
        "Postmortem",
    ] {
        assert!(
            trace.contains(&format!("\"task_name\":\"{task}\"")),
            "trace missing stage {task}"
        );
    }

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn defended_mode_blocks_and_rejects_the_poisoned_chain() {
    let (summary, root) = run_scenario(
        "scenario-b",
        RunMode::Defended,
        MemoryBackend::Sqlite,
        "poisoned",
    );

    assert_eq!(summary.policy.decision, Decision::Block);
    assert!(summary.policy.enforced);
    assert!(summary.policy.reasons.len() >= 2);
    assert!(summary
        .policy
        .reasons
        .iter()
        .any(|reason| reason.contains("provenance is web_fixture")));

    let response = summary.response.as_ref();
    assert_eq!(
        response.map(|response| response.status),
        Some(McpStatus::Rejected)
    );
    assert!(response.is_some_and(|response| response.message.contains("plaintext")));

    assert!(summary.pwned_path().is_none());
    assert!(summary.artifacts_dir.join("diagnostic_report.txt").exists());

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn base64_variant_is_caught_by_the_decoder_check() {
    let (summary, root) = run_scenario(
        "scenario-c",
        RunMode::Vulnerable,
        MemoryBackend::Sqlite,
        "base64",
    );

    let proof = read_artifact(&summary.artifacts_dir, "pwned.txt");
    assert!(proof.contains("OBFUSCATION METHOD: base64"));
    assert_eq!(summary.obfuscation_method.as_deref(), Some("base64"));

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn homoglyph_and_structured_variants_report_their_methods() {
    let (summary, root) = run_scenario(
        "variant-homoglyph",
        RunMode::Vulnerable,
        MemoryBackend::Sqlite,
        "homoglyph",
    );
    let proof = read_artifact(&summary.artifacts_dir, "pwned.txt");
    assert!(proof.contains("OBFUSCATION METHOD: homoglyph"));
    let _ = std::fs::remove_dir_all(&root);

    for fixture in ["markdown_table", "yaml"] {
        let (summary, root) = run_scenario(
            &format!("variant-{fixture}"),
            RunMode::Vulnerable,
            MemoryBackend::Sqlite,
            fixture,
        );
        let proof = read_artifact(&summary.artifacts_dir, "pwned.txt");
        assert!(
            proof.contains("OBFUSCATION METHOD: structured_extraction"),
            "fixture {fixture} should trip the structured-extraction check"
        );
        let _ = std::fs::remove_dir_all(&root);
    }
}

#[test]
fn clean_fixture_never_writes_the_proof_artifact() {
    for mode in [RunMode::Vulnerable, RunMode::Defended] {
        let (summary, root) = run_scenario(
            &format!("scenario-d-{}", mode.as_str()),
            mode,
            MemoryBackend::Sqlite,
            "clean",
        );

        assert!(summary.pwned_path().is_none());
        assert!(summary.artifacts_dir.join("diagnostic_report.txt").exists());
        assert!(summary.obfuscation_method.is_none());

        let _ = std::fs::remove_dir_all(&root);
    }
}

#[test]
fn jsonl_backend_is_interchangeable_with_sqlite() {
    let (summary, root) = run_scenario(
        "jsonl-parity",
        RunMode::Vulnerable,
        MemoryBackend::Jsonl,
        "poisoned",
    );

    assert_eq!(summary.memory_record.id, 1);
    assert_eq!(summary.memory_record.trust_level, TrustLevel::Trusted);
    let proof = read_artifact(&summary.artifacts_dir, "pwned.txt");
    assert!(proof.contains("OBFUSCATION METHOD: plaintext"));

    let _ = std::fs::remove_dir_all(&root);
}

struct FailingLlm;

impl CompletionClient for FailingLlm {
    fn complete(
        &self,
        _prompt: &str,
        _task_name: Option<&str>,
    ) -> Result<Completion, ProviderError> {
        Err(ProviderError::Transport {
            provider: "test".to_string(),
            message: "network down".to_string(),
        })
    }
}

#[test]
fn provider_failure_degrades_to_fallbacks_without_aborting() {
    let root = temp_root("fallback");
    scaffold_fixtures(&root.join("web_fixtures"))
        .unwrap_or_else(|err| panic!("failed to scaffold fixtures: {err}"));

    let runner = Runner::new(config(
        &root,
        RunMode::Vulnerable,
        MemoryBackend::Sqlite,
        "poisoned",
    ));
    let summary = runner
        .run(&FailingLlm)
        .unwrap_or_else(|err| panic!("pipeline must not abort on provider failure: {err}"));

    assert!(summary.plan_outcome.is_fallback());
    // The deterministic fallback summary still carries the directive, so
    // the attack chain completes end to end.
    assert!(summary.pwned_path().is_some());
    assert!(summary.run_dir.join("postmortem.md").exists());

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn missing_fixture_is_a_distinct_fatal_error() {
    let root = temp_root("missing-fixture");
    scaffold_fixtures(&root.join("web_fixtures"))
        .unwrap_or_else(|err| panic!("failed to scaffold fixtures: {err}"));

    let runner = Runner::new(config(
        &root,
        RunMode::Vulnerable,
        MemoryBackend::Sqlite,
        "does_not_exist",
    ));
    let error = runner.run(&ScriptedLlm::new()).err();
    assert!(matches!(error, Some(RunnerError::MissingFixture(_))));

    let _ = std::fs::remove_dir_all(&root);
}
