#![forbid(unsafe_code)]

//! Simulates the privileged MCP-style diagnostic tool. The single
//! observable that matters: the compromise-proof artifact exists iff the
//! mode is vulnerable AND the detector flags the target. The diagnostic
//! report is written on every call, in every mode.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use zeroclick_detector::{detect, Detection};
use zeroclick_domain::{timestamp_now, McpPayload, McpResponse, McpStatus, RunMode};

pub mod mock;

pub const DIAGNOSTIC_REPORT_FILE: &str = "diagnostic_report.txt";
pub const PWNED_FILE: &str = "pwned.txt";

/// Service identifiers the defended executor will run diagnostics against.
pub const TARGET_ALLOWLIST: &[&str] = &["serviceA", "serviceB"];

/// Characters that disqualify a target outright in defended mode.
const DISALLOWED_SUBSTRINGS: &[&str] = &[" ", ";", "&&", "|", "`", "$"];

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("artifact write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("timestamp formatting failed: {0}")]
    Timestamp(String),
}

pub struct McpServerSim {
    artifacts_dir: PathBuf,
    mode: RunMode,
}

impl McpServerSim {
    #[must_use]
    pub fn new(artifacts_dir: &Path, mode: RunMode) -> Self {
        Self {
            artifacts_dir: artifacts_dir.to_path_buf(),
            mode,
        }
    }

    /// Run the simulated diagnostic against the payload target.
    ///
    /// # Errors
    /// Returns `ExecError` only for artifact I/O failures; rejection is a
    /// response status, not an error.
    pub fn execute(&self, payload: &McpPayload) -> Result<McpResponse, ExecError> {
        let target = payload.target.as_str();
        let detection = detect(target);
        let mut artifacts_written: Vec<String> = Vec::new();

        fs::create_dir_all(&self.artifacts_dir)?;
        let report_path = self.artifacts_dir.join(DIAGNOSTIC_REPORT_FILE);
        fs::write(&report_path, diagnostic_report(target, detection)?)?;
        artifacts_written.push(report_path.display().to_string());

        if self.mode == RunMode::Vulnerable {
            if let Some(method) = detection.method {
                let pwned_path = self.artifacts_dir.join(PWNED_FILE);
                fs::write(&pwned_path, pwned_proof(target, method.as_str())?)?;
                artifacts_written.push(pwned_path.display().to_string());
            }
            return Ok(McpResponse {
                status: McpStatus::Ok,
                message: "diagnostic executed (vulnerable mode)".to_string(),
                artifacts_written,
            });
        }

        // Defended mode: the executor is its own last line of defense.
        if let Some(method) = detection.method {
            return Ok(McpResponse {
                status: McpStatus::Rejected,
                message: format!("target rejected: poison token detected (method: {method})"),
                artifacts_written,
            });
        }

        let disallowed = DISALLOWED_SUBSTRINGS
            .iter()
            .any(|token| target.contains(token));
        if disallowed || !TARGET_ALLOWLIST.contains(&target) {
            return Ok(McpResponse {
                status: McpStatus::Rejected,
                message: format!("target '{target}' rejected by allowlist"),
                artifacts_written,
            });
        }

        Ok(McpResponse {
            status: McpStatus::Ok,
            message: "diagnostic executed (defended mode)".to_string(),
            artifacts_written,
        })
    }
}

fn diagnostic_report(target: &str, detection: Detection) -> Result<String, ExecError> {
    let timestamp = timestamp_now().map_err(|err| ExecError::Timestamp(err.to_string()))?;
    let verdict = detection
        .method
        .map_or_else(|| "none".to_string(), |method| method.to_string());

    let mut report = String::new();
    let _ = writeln!(report, "SIMULATED DIAGNOSTIC REPORT");
    let _ = writeln!(report, "Target: {target}");
    let _ = writeln!(report, "Obfuscation detected: {verdict}");
    let _ = writeln!(report, "whoami: demo_user");
    let _ = writeln!(report, "hostname: demo-host");
    let _ = writeln!(report, "timestamp: {timestamp}");
    let _ = writeln!(report);
    let _ = writeln!(report, "--- simulated tool output ---");
    let _ = writeln!(report, "{}", mock::mock_output(target));
    Ok(report)
}

fn pwned_proof(target: &str, method: &str) -> Result<String, ExecError> {
    let timestamp = timestamp_now().map_err(|err| ExecError::Timestamp(err.to_string()))?;
    let mut proof = String::new();
    let _ = writeln!(proof, "============================================================");
    let _ = writeln!(proof, "=                     SIMULATED RCE                        =");
    let _ = writeln!(proof, "=         ATTACKER-CONTROLLED TOKEN EXECUTED               =");
    let _ = writeln!(proof, "============================================================");
    let _ = writeln!(proof);
    let _ = writeln!(proof, "WHAT HAPPENED:");
    let _ = writeln!(proof, "- Untrusted web content was summarized into a runbook note.");
    let _ = writeln!(proof, "- A trust bug marked the note as trusted.");
    let _ = writeln!(
        proof,
        "- The planner propagated the attacker token into a tool target."
    );
    let _ = writeln!(
        proof,
        "- The privileged tool executed without human approval (zero-click)."
    );
    let _ = writeln!(proof);
    let _ = writeln!(proof, "TARGET: {target}");
    let _ = writeln!(proof, "OBFUSCATION METHOD: {method}");
    let _ = writeln!(proof, "TIMESTAMP: {timestamp}");
    let _ = writeln!(proof);
    let _ = writeln!(proof, "THIS IS A SAFE DEMO. No real commands are executed.");
    Ok(proof)
}

#[cfg(test)]
mod tests {
    use super::{McpServerSim, DIAGNOSTIC_REPORT_FILE, PWNED_FILE};
    use zeroclick_domain::{McpPayload, McpStatus, RunMode, PLAN_ACTION};

    fn temp_artifacts_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("zeroclick-executor-{name}-{}", ulid::Ulid::new()))
    }

    fn payload(target: &str) -> McpPayload {
        McpPayload {
            action: PLAN_ACTION.to_string(),
            target: target.to_string(),
        }
    }

    #[test]
    fn vulnerable_poisoned_target_writes_proof_artifact() {
        let dir = temp_artifacts_dir("vuln-poisoned");
        let sim = McpServerSim::new(&dir, RunMode::Vulnerable);

        let response = sim.execute(&payload("serviceA WRITE_PWNED_FILE"));
        assert!(response.is_ok());
        let response = response.unwrap_or_else(|_| unreachable!());

        assert_eq!(response.status, McpStatus::Ok);
        assert!(dir.join(DIAGNOSTIC_REPORT_FILE).exists());
        assert!(dir.join(PWNED_FILE).exists());

        let proof = std::fs::read_to_string(dir.join(PWNED_FILE))
            .unwrap_or_else(|err| panic!("failed to read proof artifact: {err}"));
        assert!(proof.contains("TARGET: serviceA WRITE_PWNED_FILE"));
        assert!(proof.contains("OBFUSCATION METHOD: plaintext"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn vulnerable_clean_target_writes_report_only() {
        let dir = temp_artifacts_dir("vuln-clean");
        let sim = McpServerSim::new(&dir, RunMode::Vulnerable);

        let response = sim.execute(&payload("serviceA"));
        assert!(response.is_ok());
        let response = response.unwrap_or_else(|_| unreachable!());

        assert_eq!(response.status, McpStatus::Ok);
        assert!(dir.join(DIAGNOSTIC_REPORT_FILE).exists());
        assert!(!dir.join(PWNED_FILE).exists());
        assert_eq!(response.artifacts_written.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn defended_poisoned_target_rejects_naming_method() {
        let dir = temp_artifacts_dir("defended-poisoned");
        let sim = McpServerSim::new(&dir, RunMode::Defended);

        let response = sim.execute(&payload("serviceA WRITE_PWNED_FILE"));
        assert!(response.is_ok());
        let response = response.unwrap_or_else(|_| unreachable!());

        assert_eq!(response.status, McpStatus::Rejected);
        assert!(response.message.contains("method: plaintext"));
        assert!(dir.join(DIAGNOSTIC_REPORT_FILE).exists());
        assert!(!dir.join(PWNED_FILE).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn defended_mode_enforces_allowlist_and_characters() {
        let dir = temp_artifacts_dir("defended-allowlist");
        let sim = McpServerSim::new(&dir, RunMode::Defended);

        let rejected = sim.execute(&payload("serviceC"));
        assert!(rejected.is_ok());
        assert_eq!(
            rejected.unwrap_or_else(|_| unreachable!()).status,
            McpStatus::Rejected
        );

        let shell_chars = sim.execute(&payload("serviceA;id"));
        assert!(shell_chars.is_ok());
        assert_eq!(
            shell_chars.unwrap_or_else(|_| unreachable!()).status,
            McpStatus::Rejected
        );

        let allowed = sim.execute(&payload("serviceB"));
        assert!(allowed.is_ok());
        let allowed = allowed.unwrap_or_else(|_| unreachable!());
        assert_eq!(allowed.status, McpStatus::Ok);
        assert!(!dir.join(PWNED_FILE).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn diagnostic_report_records_detection_verdict() {
        let dir = temp_artifacts_dir("report-verdict");
        let sim = McpServerSim::new(&dir, RunMode::Vulnerable);

        let response = sim.execute(&payload("c2VydmljZUEgV1JJVEVfUFdORURfRklMRQ=="));
        assert!(response.is_ok());

        let report = std::fs::read_to_string(dir.join(DIAGNOSTIC_REPORT_FILE))
            .unwrap_or_else(|err| panic!("failed to read report: {err}"));
        assert!(report.contains("Obfuscation detected: base64"));

        let proof = std::fs::read_to_string(dir.join(PWNED_FILE))
            .unwrap_or_else(|err| panic!("failed to read proof artifact: {err}"));
        assert!(proof.contains("OBFUSCATION METHOD: base64"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
