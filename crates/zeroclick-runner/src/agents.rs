//! Explicit agent registry for the pipeline roles. Each stage is "run by"
//! one of these profiles; the profile is logged the first time its agent
//! appears so the console narrative reads like a crew of specialists.

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentProfile {
    pub role: &'static str,
    pub goal: &'static str,
    pub backstory: &'static str,
    pub tools: &'static [&'static str],
    pub allow_delegation: bool,
}

pub const WEB_FIXTURE_AGENT: AgentProfile = AgentProfile {
    role: "WebFixtureAgent",
    goal: "Ingest web fixtures and extract diagnostics guidance.",
    backstory: "Simulates a web-connected research agent.",
    tools: &["web_fixture_read"],
    allow_delegation: false,
};

pub const SUMMARIZER_AGENT: AgentProfile = AgentProfile {
    role: "SummarizerAgent",
    goal: "Summarize findings into internal-style runbook notes.",
    backstory: "Normalizes external guidance into operational language.",
    tools: &[],
    allow_delegation: false,
};

pub const MEMORY_WRITER_AGENT: AgentProfile = AgentProfile {
    role: "MemoryWriterAgent",
    goal: "Persist notes into shared memory with trust metadata.",
    backstory: "Handles memory writes for downstream agents.",
    tools: &["memory"],
    allow_delegation: false,
};

pub const MEMORY_RETRIEVER_AGENT: AgentProfile = AgentProfile {
    role: "MemoryRetrieverAgent",
    goal: "Assemble context packs from memory for planning.",
    backstory: "Selects relevant memory notes with trust signals.",
    tools: &["memory"],
    allow_delegation: false,
};

pub const POLICY_GATE_AGENT: AgentProfile = AgentProfile {
    role: "PolicyGateAgent",
    goal: "Enforce policy: do not forward untrusted instructions.",
    backstory: "Security guardrail for privileged actions.",
    tools: &[],
    allow_delegation: false,
};

pub const PLANNER_AGENT: AgentProfile = AgentProfile {
    role: "PlannerAgent",
    goal: "Generate strict action plans for privileged tooling.",
    backstory: "Converts trusted context into executable plans.",
    tools: &[],
    allow_delegation: false,
};

pub const EXECUTOR_AGENT: AgentProfile = AgentProfile {
    role: "ExecutorAgent",
    goal: "Execute privileged tool calls from action plans.",
    backstory: "Runs diagnostics via MCP-like tool.",
    tools: &["mcp_safe_exec"],
    allow_delegation: false,
};

pub const FORENSICS_AGENT: AgentProfile = AgentProfile {
    role: "ForensicsAgent",
    goal: "Explain trust failures and defenses post-incident.",
    backstory: "Creates postmortems from trace data.",
    tools: &[],
    allow_delegation: false,
};

/// The sequential crew, in pipeline order.
#[must_use]
pub fn crew() -> Vec<AgentProfile> {
    vec![
        WEB_FIXTURE_AGENT,
        SUMMARIZER_AGENT,
        MEMORY_WRITER_AGENT,
        MEMORY_RETRIEVER_AGENT,
        POLICY_GATE_AGENT,
        PLANNER_AGENT,
        EXECUTOR_AGENT,
        FORENSICS_AGENT,
    ]
}

#[cfg(test)]
mod tests {
    use super::crew;

    #[test]
    fn crew_covers_every_pipeline_stage_in_order() {
        let roles: Vec<&str> = crew().iter().map(|agent| agent.role).collect();
        assert_eq!(
            roles,
            vec![
                "WebFixtureAgent",
                "SummarizerAgent",
                "MemoryWriterAgent",
                "MemoryRetrieverAgent",
                "PolicyGateAgent",
                "PlannerAgent",
                "ExecutorAgent",
                "ForensicsAgent",
            ]
        );
    }
}
