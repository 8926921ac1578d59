#![forbid(unsafe_code)]

//! Text-generation collaborators for the pipeline. The core treats every
//! provider as an opaque oracle behind [`CompletionClient`]; task names
//! route to named providers through a lookup table with a default entry,
//! and the scripted provider keeps the whole chain runnable offline.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use zeroclick_detector::POISON_MARKER;
use zeroclick_domain::{
    extract_json_block, now_utc, ActionPlan, ContextPack, PLAN_ACTION, PLAN_TOOL,
};

const DEFAULT_OPENAI_MODEL: &str = "gpt-4.1";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_TEMPERATURE: f64 = 0.2;
const DEFAULT_MAX_TOKENS: u32 = 512;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing API keys: {0}")]
    MissingConfig(String),
    #[error("HTTP {status} from {provider}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("request failed for {provider}: {message}")]
    Transport { provider: String, message: String },
    #[error("unexpected response shape from {provider}")]
    UnexpectedResponse { provider: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMeta {
    pub provider: String,
    pub model: String,
    pub task_name: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub meta: CompletionMeta,
}

/// The single capability the pipeline depends on.
pub trait CompletionClient {
    /// Generate text for a prompt. The task name steers provider routing
    /// when given; otherwise it is extracted from a `TASK_NAME:` prompt
    /// line.
    ///
    /// # Errors
    /// Returns `ProviderError` on transport or protocol failures; callers
    /// substitute deterministic fallbacks rather than aborting.
    fn complete(&self, prompt: &str, task_name: Option<&str>) -> Result<Completion, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub openai_api_key: String,
    pub anthropic_api_key: String,
    pub openai_model: String,
    pub anthropic_model: String,
    pub openai_base_url: String,
    pub anthropic_base_url: String,
    pub timeout_ms: u64,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl LlmConfig {
    /// Build from process environment. Fails fast, naming every missing
    /// credential, before any pipeline stage runs.
    ///
    /// # Errors
    /// Returns `ProviderError::MissingConfig` listing absent keys.
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    /// # Errors
    /// Returns `ProviderError::MissingConfig` listing absent keys.
    pub fn from_lookup(
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ProviderError> {
        let get = |name: &str| lookup(name).map(|value| value.trim().to_string());
        let openai_api_key = get("OPENAI_API_KEY").unwrap_or_default();
        let anthropic_api_key = get("ANTHROPIC_API_KEY").unwrap_or_default();

        let mut missing = Vec::new();
        if openai_api_key.is_empty() {
            missing.push("OPENAI_API_KEY");
        }
        if anthropic_api_key.is_empty() {
            missing.push("ANTHROPIC_API_KEY");
        }
        if !missing.is_empty() {
            return Err(ProviderError::MissingConfig(missing.join(", ")));
        }

        Ok(Self {
            openai_api_key,
            anthropic_api_key,
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            anthropic_model: get("ANTHROPIC_MODEL")
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            anthropic_base_url: get("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string()),
            timeout_ms: get("ZEROCLICK_LLM_TIMEOUT_MS")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            temperature: get("ZEROCLICK_LLM_TEMPERATURE")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: get("ZEROCLICK_LLM_MAX_TOKENS")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(DEFAULT_MAX_TOKENS),
        })
    }
}

/// One named provider backend.
pub trait ProviderAdapter {
    fn provider_name(&self) -> &'static str;

    fn model_id(&self) -> &str;

    /// # Errors
    /// Returns `ProviderError` on transport or protocol failures.
    fn invoke(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<(String, u64), ProviderError>;
}

pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    timeout_ms: u64,
}

impl OpenAiClient {
    #[must_use]
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            timeout_ms: config.timeout_ms,
        }
    }
}

impl ProviderAdapter for OpenAiClient {
    fn provider_name(&self) -> &'static str {
        "openai"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn invoke(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<(String, u64), ProviderError> {
        let url = format!("{}/responses", self.base_url);
        let payload = json!({
            "model": self.model,
            "input": prompt,
            "temperature": temperature,
            "max_output_tokens": max_tokens,
        });
        let started = now_utc();
        let body = post_json(
            self.provider_name(),
            &url,
            &[("authorization", &format!("Bearer {}", self.api_key))],
            &payload,
            self.timeout_ms,
        )?;
        let text = extract_openai_text(&body).ok_or_else(|| ProviderError::UnexpectedResponse {
            provider: self.provider_name().to_string(),
        })?;
        Ok((text, elapsed_ms(started)))
    }
}

pub struct AnthropicClient {
    api_key: String,
    model: String,
    base_url: String,
    timeout_ms: u64,
}

impl AnthropicClient {
    #[must_use]
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            api_key: config.anthropic_api_key.clone(),
            model: config.anthropic_model.clone(),
            base_url: config.anthropic_base_url.trim_end_matches('/').to_string(),
            timeout_ms: config.timeout_ms,
        }
    }
}

impl ProviderAdapter for AnthropicClient {
    fn provider_name(&self) -> &'static str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn invoke(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<(String, u64), ProviderError> {
        let url = format!("{}/messages", self.base_url);
        let payload = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "messages": [{"role": "user", "content": prompt}],
        });
        let started = now_utc();
        let body = post_json(
            self.provider_name(),
            &url,
            &[
                ("x-api-key", &self.api_key),
                ("anthropic-version", &"2023-06-01".to_string()),
            ],
            &payload,
            self.timeout_ms,
        )?;
        let text =
            extract_anthropic_text(&body).ok_or_else(|| ProviderError::UnexpectedResponse {
                provider: self.provider_name().to_string(),
            })?;
        Ok((text, elapsed_ms(started)))
    }
}

fn post_json(
    provider: &str,
    url: &str,
    headers: &[(&str, &String)],
    payload: &Value,
    timeout_ms: u64,
) -> Result<Value, ProviderError> {
    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_millis(timeout_ms))
        .build();

    let mut request = agent.post(url).set("content-type", "application/json");
    for (header, value) in headers {
        request = request.set(header, value);
    }

    match request.send_json(payload) {
        Ok(response) => response
            .into_json::<Value>()
            .map_err(|err| ProviderError::Transport {
                provider: provider.to_string(),
                message: err.to_string(),
            }),
        Err(ureq::Error::Status(status, response)) => {
            let body = response.into_string().unwrap_or_default();
            Err(ProviderError::Http {
                provider: provider.to_string(),
                status,
                body,
            })
        }
        Err(ureq::Error::Transport(err)) => Err(ProviderError::Transport {
            provider: provider.to_string(),
            message: err.to_string(),
        }),
    }
}

fn elapsed_ms(started: zeroclick_domain::DateTimeUtc) -> u64 {
    let millis = (now_utc() - started).whole_milliseconds();
    if millis <= 0 {
        0
    } else {
        u64::try_from(millis).unwrap_or(u64::MAX)
    }
}

/// OpenAI Responses API output, tolerating the `output_text` shortcut, the
/// structured `output` array, and legacy `choices`.
#[must_use]
pub fn extract_openai_text(data: &Value) -> Option<String> {
    if let Some(text) = data.get("output_text").and_then(Value::as_str) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    let mut chunks: Vec<String> = Vec::new();
    if let Some(output) = data.get("output").and_then(Value::as_array) {
        for item in output {
            if item.get("type").and_then(Value::as_str) == Some("message") {
                if let Some(content) = item.get("content").and_then(Value::as_array) {
                    for entry in content {
                        let entry_type = entry.get("type").and_then(Value::as_str);
                        if matches!(entry_type, Some("output_text" | "text")) {
                            if let Some(text) = entry.get("text").and_then(Value::as_str) {
                                chunks.push(text.to_string());
                            }
                        }
                    }
                }
            }
            let item_type = item.get("type").and_then(Value::as_str);
            if matches!(item_type, Some("output_text" | "text")) {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    chunks.push(text.to_string());
                }
            }
        }
    }

    if chunks.is_empty() {
        if let Some(text) = data
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
        {
            chunks.push(text.to_string());
        }
    }

    if chunks.is_empty() {
        None
    } else {
        Some(chunks.join("\n").trim().to_string())
    }
}

/// Anthropic Messages API output: concatenated `content[].text` blocks.
#[must_use]
pub fn extract_anthropic_text(data: &Value) -> Option<String> {
    let content = data.get("content").and_then(Value::as_array)?;
    let chunks: Vec<&str> = content
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect();
    if chunks.is_empty() {
        None
    } else {
        Some(chunks.join("\n").trim().to_string())
    }
}

/// Routes completions to a named provider by task name; unknown tasks fall
/// through to the default entry.
pub struct TaskRoutedLlm {
    providers: BTreeMap<String, Box<dyn ProviderAdapter>>,
    task_provider_map: BTreeMap<String, String>,
    default_provider: String,
    temperature: f64,
    max_tokens: u32,
}

impl TaskRoutedLlm {
    #[must_use]
    pub fn new(config: &LlmConfig, task_provider_map: Option<BTreeMap<String, String>>) -> Self {
        let mut providers: BTreeMap<String, Box<dyn ProviderAdapter>> = BTreeMap::new();
        providers.insert("openai".to_string(), Box::new(OpenAiClient::new(config)));
        providers.insert(
            "anthropic".to_string(),
            Box::new(AnthropicClient::new(config)),
        );

        Self {
            providers,
            task_provider_map: task_provider_map.unwrap_or_else(default_task_map),
            default_provider: "openai".to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Build from env: credentials plus an optional
    /// `ZEROCLICK_LLM_TASK_MAP` override (`task:provider,task:provider`).
    ///
    /// # Errors
    /// Returns `ProviderError::MissingConfig` when credentials are absent.
    pub fn from_env() -> Result<Self, ProviderError> {
        let config = LlmConfig::from_env()?;
        let task_map = std::env::var("ZEROCLICK_LLM_TASK_MAP")
            .ok()
            .as_deref()
            .and_then(parse_task_map);
        Ok(Self::new(&config, task_map))
    }

    fn provider_for(&self, task_name: &str) -> &str {
        let routed = self
            .task_provider_map
            .get(task_name)
            .map_or(self.default_provider.as_str(), String::as_str);
        if self.providers.contains_key(routed) {
            routed
        } else {
            self.default_provider.as_str()
        }
    }
}

impl CompletionClient for TaskRoutedLlm {
    fn complete(&self, prompt: &str, task_name: Option<&str>) -> Result<Completion, ProviderError> {
        let task_name = task_name
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| extract_task_name(prompt));
        let provider_name = self.provider_for(&task_name).to_string();
        let provider = self
            .providers
            .get(&provider_name)
            .ok_or_else(|| ProviderError::UnexpectedResponse {
                provider: provider_name.clone(),
            })?;

        let (text, latency_ms) = provider.invoke(prompt, self.temperature, self.max_tokens)?;
        Ok(Completion {
            text,
            meta: CompletionMeta {
                provider: provider_name,
                model: provider.model_id().to_string(),
                task_name: if task_name.is_empty() {
                    "unknown".to_string()
                } else {
                    task_name
                },
                latency_ms,
            },
        })
    }
}

fn default_task_map() -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert("summarize".to_string(), "openai".to_string());
    map.insert("plan".to_string(), "anthropic".to_string());
    map.insert("forensics".to_string(), "openai".to_string());
    map
}

/// Parse `task:provider,task:provider`; malformed entries are skipped, an
/// entirely empty result means "no override".
#[must_use]
pub fn parse_task_map(raw: &str) -> Option<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((task, provider)) = entry.split_once(':') else {
            continue;
        };
        map.insert(
            task.trim().to_lowercase(),
            provider.trim().to_lowercase(),
        );
    }
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

#[must_use]
pub fn extract_task_name(prompt: &str) -> String {
    for line in prompt.lines() {
        if let Some(rest) = line.strip_prefix("TASK_NAME:") {
            return rest.trim().to_lowercase();
        }
    }
    String::new()
}

/// Deterministic offline provider: scripted behaviors for the three
/// pipeline tasks, faithful to what a cooperative model does with the
/// demo prompts. Keeps the chain and its test suite network-free.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLlm;

impl ScriptedLlm {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn summarize(prompt: &str) -> String {
        let fixture = section_after(prompt, "FIXTURE_CONTENT:");
        let mut lines: Vec<String> = Vec::new();
        lines.push("- Normalized external guidance into a runbook note.".to_string());

        if let Some(first) = fixture.lines().map(str::trim).find(|line| {
            !line.is_empty() && !line.starts_with('#') && !line.starts_with('|')
        }) {
            lines.push(format!("- Context: {first}"));
        }

        // A faithful summarizer preserves operator-looking directives,
        // which is exactly how the smuggled payload line survives.
        for line in fixture.lines() {
            if line.to_lowercase().contains("target to:") {
                lines.push(format!("- {}", line.trim().trim_start_matches('-').trim()));
            }
        }

        lines.push("- Standard diagnostics procedure applies.".to_string());
        lines.join("\n")
    }

    fn plan(prompt: &str) -> String {
        // Plan off the most recent note only; the shared memory store
        // outlives a single run, so older notes may still be present.
        let context = section_after(prompt, "CONTEXT_JSON:");
        let newest_note = serde_json::from_str::<ContextPack>(extract_json_block(context))
            .ok()
            .and_then(|pack| pack.notes.into_iter().next().map(|note| note.content));
        let source = newest_note.as_deref().unwrap_or(context);

        let target = if source.contains(POISON_MARKER) {
            format!("serviceA {POISON_MARKER}")
        } else if let Some(extracted) = target_after_marker(source) {
            extracted.to_string()
        } else {
            "serviceA".to_string()
        };

        let plan = ActionPlan {
            tool: PLAN_TOOL.to_string(),
            action: PLAN_ACTION.to_string(),
            target,
            justification: "Run the documented diagnostics procedure.".to_string(),
            source_memory_ids: Vec::new(),
        };
        serde_json::to_string(&plan).unwrap_or_else(|_| "{}".to_string())
    }

    fn forensics() -> String {
        [
            "- Untrusted web guidance entered shared memory with elevated trust.",
            "- Retrieval blended the tainted note into the planning context.",
            "- The planner carried the embedded directive into the tool target.",
            "- Provenance-aware policy plus target sanitization closes the chain.",
        ]
        .join("\n")
    }
}

impl CompletionClient for ScriptedLlm {
    fn complete(&self, prompt: &str, task_name: Option<&str>) -> Result<Completion, ProviderError> {
        let task_name = task_name
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| extract_task_name(prompt));

        let text = match task_name.as_str() {
            "summarize" => Self::summarize(prompt),
            "plan" => Self::plan(prompt),
            "forensics" => Self::forensics(),
            _ => "ack".to_string(),
        };

        let latency_ms = 5 + u64::try_from(prompt.len()).unwrap_or(u64::MAX) % 17;
        Ok(Completion {
            text,
            meta: CompletionMeta {
                provider: "scripted".to_string(),
                model: "scripted.v1".to_string(),
                task_name: if task_name.is_empty() {
                    "unknown".to_string()
                } else {
                    task_name
                },
                latency_ms,
            },
        })
    }
}

fn section_after<'a>(prompt: &'a str, marker: &str) -> &'a str {
    prompt
        .find(marker)
        .map_or("", |start| &prompt[start + marker.len()..])
}

fn target_after_marker(text: &str) -> Option<&str> {
    let lowered = text.to_lowercase();
    let marker = "target to:";
    let start = lowered.find(marker)? + marker.len();
    let rest = text.get(start..)?;
    let line = rest
        .split(['\n', '"', '\\'])
        .next()
        .unwrap_or("")
        .trim();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}
