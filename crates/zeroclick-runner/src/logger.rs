//! Console narration plus the append-only structured trace. Every stage
//! emits one `TraceEvent` line into `trace.jsonl` and one colored console
//! line; a markdown timeline is collected along the way and flushed at run
//! end.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use zeroclick_domain::{timestamp_now, Decision, TraceEvent, TrustLevel};

use crate::agents::AgentProfile;
use crate::RunnerError;

mod colors {
    pub const RESET: &str = "\u{1b}[0m";
    pub const RED: &str = "\u{1b}[31m";
    pub const GREEN: &str = "\u{1b}[32m";
    pub const YELLOW: &str = "\u{1b}[33m";
    pub const BLUE: &str = "\u{1b}[34m";
    pub const MAGENTA: &str = "\u{1b}[35m";
    pub const CYAN: &str = "\u{1b}[36m";
    pub const BOLD: &str = "\u{1b}[1m";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDetail {
    Minimal,
    Rich,
}

impl LogDetail {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(Self::Minimal),
            "rich" => Some(Self::Rich),
            _ => None,
        }
    }
}

/// One pipeline step to narrate and trace.
pub struct StepLog<'a> {
    pub agent: &'a str,
    pub stage: &'a str,
    pub trust: TrustLevel,
    pub message: String,
    pub inputs: Value,
    pub outputs: Value,
    pub memory_ops: Vec<Value>,
    pub tool_calls: Vec<Value>,
    pub agent_profile: Option<&'a AgentProfile>,
    pub obfuscation_method: Option<String>,
}

impl<'a> StepLog<'a> {
    #[must_use]
    pub fn new(agent: &'a str, stage: &'a str, trust: TrustLevel, message: String) -> Self {
        Self {
            agent,
            stage,
            trust,
            message,
            inputs: Value::Null,
            outputs: Value::Null,
            memory_ops: Vec::new(),
            tool_calls: Vec::new(),
            agent_profile: None,
            obfuscation_method: None,
        }
    }
}

pub struct RunLogger {
    trace_path: PathBuf,
    timeline_path: PathBuf,
    pace: Duration,
    detail: LogDetail,
    max_detail_chars: usize,
    timeline_entries: Vec<String>,
    seen_agents: BTreeSet<String>,
}

impl RunLogger {
    /// # Errors
    /// Returns an error when the run directory cannot be created.
    pub fn new(run_dir: &Path, pace: Duration, detail: LogDetail) -> Result<Self, RunnerError> {
        std::fs::create_dir_all(run_dir)?;
        Ok(Self {
            trace_path: run_dir.join("trace.jsonl"),
            timeline_path: run_dir.join("timeline.md"),
            pace,
            detail,
            max_detail_chars: 800,
            timeline_entries: Vec::new(),
            seen_agents: BTreeSet::new(),
        })
    }

    pub fn banner(&self, title: &str) {
        println!(
            "{}{}=== {title} ==={}",
            colors::MAGENTA,
            colors::BOLD,
            colors::RESET
        );
        self.maybe_pause();
    }

    /// Narrate one step and append its trace event.
    ///
    /// # Errors
    /// Returns an error when the trace line cannot be appended.
    pub fn step(&mut self, step: StepLog<'_>) -> Result<(), RunnerError> {
        let trust_color = if step.trust == TrustLevel::Trusted {
            colors::GREEN
        } else {
            colors::YELLOW
        };
        let obf_tag = step.obfuscation_method.as_ref().map_or_else(String::new, |method| {
            format!(" {}[obf:{method}]{}", colors::RED, colors::RESET)
        });
        println!(
            "{}[{}]{} {}[{}]{} {trust_color}[{}]{}{obf_tag} {}",
            colors::CYAN,
            step.agent,
            colors::RESET,
            colors::BLUE,
            step.stage,
            colors::RESET,
            step.trust.as_str(),
            colors::RESET,
            step.message
        );
        self.maybe_pause();

        if self.detail == LogDetail::Rich {
            if let Some(profile) = step.agent_profile {
                if !self.seen_agents.contains(step.agent) {
                    println!(
                        "{}{}--- {} profile ---{}",
                        colors::MAGENTA,
                        colors::BOLD,
                        step.agent,
                        colors::RESET
                    );
                    self.print_detail("agent_profile", &serde_json::json!(profile));
                    self.seen_agents.insert(step.agent.to_string());
                }
            }
        }

        let event = TraceEvent {
            ts: timestamp_now().map_err(|err| RunnerError::Trace(err.to_string()))?,
            agent_name: step.agent.to_string(),
            task_name: step.stage.to_string(),
            inputs: step.inputs.clone(),
            outputs: step.outputs.clone(),
            memory_ops: step.memory_ops.clone(),
            tool_calls: step.tool_calls.clone(),
            obfuscation_method: step.obfuscation_method.clone(),
        };
        self.append_trace(&event)?;

        let mut timeline_entry = format!("- **{}**: {}", step.agent, step.message);
        if let Some(method) = &step.obfuscation_method {
            timeline_entry.push_str(&format!(" (obfuscation: {method})"));
        }
        self.timeline_entries.push(timeline_entry);

        if self.detail == LogDetail::Rich {
            self.print_detail("inputs", &step.inputs);
            self.print_detail("outputs", &step.outputs);
            self.print_detail("memory_ops", &Value::Array(step.memory_ops));
            self.print_detail("tool_calls", &Value::Array(step.tool_calls));
        }

        Ok(())
    }

    pub fn decision(&self, agent: &str, decision: Decision, reasons: &[String]) {
        let color = if decision == Decision::Allow {
            colors::GREEN
        } else {
            colors::RED
        };
        println!(
            "{}[{agent}]{} {color}{}{} {}",
            colors::CYAN,
            colors::RESET,
            decision.as_str().to_uppercase(),
            colors::RESET,
            reasons.join("; ")
        );
        self.maybe_pause();
    }

    /// Flush the collected timeline to `timeline.md`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written.
    pub fn write_timeline(&self) -> Result<(), RunnerError> {
        let mut body = String::from("# Timeline\n\n");
        for entry in &self.timeline_entries {
            body.push_str(entry);
            body.push('\n');
        }
        std::fs::write(&self.timeline_path, body)?;
        Ok(())
    }

    fn append_trace(&self, event: &TraceEvent) -> Result<(), RunnerError> {
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.trace_path)?;
        writeln!(
            handle,
            "{}",
            serde_json::to_string(event).map_err(|err| RunnerError::Trace(err.to_string()))?
        )?;
        Ok(())
    }

    fn print_detail(&self, label: &str, data: &Value) {
        if data.is_null() || data.as_array().is_some_and(Vec::is_empty) {
            return;
        }
        let rendered = serde_json::to_string_pretty(&truncate_value(data, self.max_detail_chars))
            .unwrap_or_else(|_| data.to_string());
        println!("{}{label}:{}", colors::YELLOW, colors::RESET);
        println!("{rendered}");
        self.maybe_pause();
    }

    fn maybe_pause(&self) {
        if !self.pace.is_zero() {
            std::thread::sleep(self.pace);
        }
    }
}

fn truncate_value(data: &Value, max_chars: usize) -> Value {
    match data {
        Value::String(text) => {
            if text.chars().count() > max_chars {
                let clipped: String = text.chars().take(max_chars).collect();
                Value::String(format!("{clipped}... (truncated)"))
            } else {
                data.clone()
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| truncate_value(item, max_chars))
                .collect(),
        ),
        Value::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), truncate_value(value, max_chars)))
                .collect(),
        ),
        _ => data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::{truncate_value, LogDetail, RunLogger, StepLog};
    use serde_json::json;
    use std::time::Duration;
    use zeroclick_domain::{TraceEvent, TrustLevel};

    #[test]
    fn log_detail_parsing_accepts_both_levels() {
        assert_eq!(LogDetail::parse("rich"), Some(LogDetail::Rich));
        assert_eq!(LogDetail::parse(" MINIMAL "), Some(LogDetail::Minimal));
        assert_eq!(LogDetail::parse("verbose"), None);
    }

    #[test]
    fn steps_append_trace_lines_and_timeline_entries() {
        let run_dir = std::env::temp_dir().join(format!("zeroclick-logger-{}", ulid::Ulid::new()));
        let logger = RunLogger::new(&run_dir, Duration::ZERO, LogDetail::Minimal);
        assert!(logger.is_ok());
        let mut logger = logger.unwrap_or_else(|_| unreachable!());

        let mut step = StepLog::new(
            "ExecutorAgent",
            "Execute",
            TrustLevel::Untrusted,
            "Tool executed with status ok".to_string(),
        );
        step.outputs = json!({"status": "ok"});
        step.obfuscation_method = Some("plaintext".to_string());
        assert!(logger.step(step).is_ok());
        assert!(logger.write_timeline().is_ok());

        let trace = std::fs::read_to_string(run_dir.join("trace.jsonl"))
            .unwrap_or_else(|err| panic!("failed to read trace: {err}"));
        let event: Result<TraceEvent, _> = serde_json::from_str(trace.trim());
        assert!(event.is_ok());
        let event = event.unwrap_or_else(|_| unreachable!());
        assert_eq!(event.agent_name, "ExecutorAgent");
        assert_eq!(event.obfuscation_method.as_deref(), Some("plaintext"));

        let timeline = std::fs::read_to_string(run_dir.join("timeline.md"))
            .unwrap_or_else(|err| panic!("failed to read timeline: {err}"));
        assert!(timeline.contains("**ExecutorAgent**"));
        assert!(timeline.contains("(obfuscation: plaintext)"));

        let _ = std::fs::remove_dir_all(&run_dir);
    }

    #[test]
    fn long_strings_are_truncated_in_rich_detail() {
        let long = "x".repeat(2000);
        let truncated = truncate_value(&json!({ "value": long }), 800);
        let rendered = truncated
            .get("value")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        assert!(rendered.ends_with("... (truncated)"));
        assert!(rendered.len() < 900);
    }
}
