#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Config, ProviderConfig};
use crate::error::AgentqError;
use crate::task::model::FailureReason;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl Usage {
    #[must_use]
    pub fn plus(self, other: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cost_usd: match (self.cost_usd, other.cost_usd) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SessionStarted {
        session_id: String,
    },
    /// One normalized step; the engine's budget counter ticks on these.
    StepStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
    },
    StepProgress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },
    StepCompleted,
    RunCompleted {
        /// Totals for this invocation; replaces the sum of progress usage.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_steps_reported: Option<u32>,
    },
    RunError {
        message: String,
        /// Set when the provider itself knows the category, e.g. its own
        /// turn limit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<FailureReason>,
    },
    Output {
        text: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub prompt: &'a str,
    pub work_dir: &'a Path,
    pub resume: Option<&'a str>,
    pub model: Option<&'a str>,
    pub max_steps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
}

pub trait EventAdapter: Send {
    fn translate(&mut self, line: &str) -> Vec<Event>;
}

pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn invocation(&self, req: &RunRequest<'_>) -> Invocation;

    fn adapter(&self) -> Box<dyn EventAdapter>;
}

pub fn provider_for(name: &str, cfg: &Config) -> Result<Box<dyn Provider>, AgentqError> {
    let section = cfg.providers.get(name).cloned().unwrap_or_default();
    match name {
        "claude" => Ok(Box::new(ClaudeProvider::new(section))),
        "codex" => Ok(Box::new(CodexProvider::new(section))),
        "gemini" => Ok(Box::new(GeminiProvider::new(section))),
        _ if section.executable.is_some() => Ok(Box::new(CommandProvider::new(name, section))),
        _ => Err(AgentqError::UnknownProvider(name.to_owned())),
    }
}

fn parse_json(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn as_u64(v: &Value, key: &str) -> u64 {
    v.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn raw_output(line: &str) -> Vec<Event> {
    if line.trim().is_empty() {
        Vec::new()
    } else {
        vec![Event::Output {
            text: line.to_owned(),
        }]
    }
}

#[derive(Debug, Clone)]
pub struct ClaudeProvider {
    section: ProviderConfig,
}

impl ClaudeProvider {
    #[must_use]
    pub fn new(section: ProviderConfig) -> Self {
        Self { section }
    }
}

impl Provider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
    }

    fn invocation(&self, req: &RunRequest<'_>) -> Invocation {
        let mut args: Vec<String> = ["-p", "-", "--output-format", "stream-json", "--verbose"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        if let Some(session) = req.resume {
            args.extend(["--resume".to_owned(), session.to_owned()]);
        }
        if let Some(model) = req.model {
            args.extend(["--model".to_owned(), model.to_owned()]);
        }
        args.extend(self.section.args.iter().cloned());
        args.extend(["--max-turns".to_owned(), req.max_steps.to_string()]);
        Invocation {
            program: self
                .section
                .executable
                .clone()
                .unwrap_or_else(|| "claude".to_owned()),
            args,
            stdin: Some(req.prompt.to_owned()),
        }
    }

    fn adapter(&self) -> Box<dyn EventAdapter> {
        Box::<ClaudeAdapter>::default()
    }
}

/// Claude's stream-json: each distinct assistant message id is one step.
#[derive(Debug, Default)]
pub struct ClaudeAdapter {
    seen_messages: HashSet<String>,
}

impl EventAdapter for ClaudeAdapter {
    fn translate(&mut self, line: &str) -> Vec<Event> {
        let Some(v) = parse_json(line) else {
            return raw_output(line);
        };
        let mut out = Vec::new();
        match v.get("type").and_then(Value::as_str) {
            Some("system") => {
                if let Some(id) = v.get("session_id").and_then(Value::as_str) {
                    out.push(Event::SessionStarted {
                        session_id: id.to_owned(),
                    });
                }
            }
            Some("assistant") => {
                let message = v.get("message").cloned().unwrap_or(Value::Null);
                let msg_id = message.get("id").and_then(Value::as_str).map(str::to_owned);
                let is_new = msg_id
                    .as_ref()
                    .is_none_or(|id| self.seen_messages.insert(id.clone()));
                if is_new {
                    out.push(Event::StepStarted {
                        step_id: msg_id.clone(),
                    });
                    if let Some(u) = message.get("usage") {
                        out.push(Event::StepProgress {
                            usage: Some(Usage {
                                input_tokens: as_u64(u, "input_tokens")
                                    + as_u64(u, "cache_creation_input_tokens")
                                    + as_u64(u, "cache_read_input_tokens"),
                                output_tokens: as_u64(u, "output_tokens"),
                                cost_usd: None,
                            }),
                            tool: None,
                        });
                    }
                }
                let content = message
                    .get("content")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for item in content {
                    match item.get("type").and_then(Value::as_str) {
                        Some("tool_use") => out.push(Event::StepProgress {
                            usage: None,
                            tool: Some(
                                item.get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown")
                                    .to_owned(),
                            ),
                        }),
                        Some("text") => {
                            if let Some(text) = item.get("text").and_then(Value::as_str) {
                                out.push(Event::Output {
                                    text: text.to_owned(),
                                });
                            }
                        }
                        _ => {}
                    }
                }
            }
            Some("result") => {
                let subtype = v.get("subtype").and_then(Value::as_str).unwrap_or("");
                if subtype == "error_max_turns" {
                    out.push(Event::RunError {
                        message: "provider turn limit reached".to_owned(),
                        reason: Some(FailureReason::MaxSteps),
                    });
                } else if v.get("is_error").and_then(Value::as_bool) == Some(true) {
                    out.push(Event::RunError {
                        message: v
                            .get("result")
                            .and_then(Value::as_str)
                            .unwrap_or(subtype)
                            .to_owned(),
                        reason: None,
                    });
                } else if let Some(text) = v.get("result").and_then(Value::as_str) {
                    out.push(Event::Output {
                        text: text.to_owned(),
                    });
                }
                let usage = v.get("usage").map(|u| Usage {
                    input_tokens: as_u64(u, "input_tokens")
                        + as_u64(u, "cache_creation_input_tokens")
                        + as_u64(u, "cache_read_input_tokens"),
                    output_tokens: as_u64(u, "output_tokens"),
                    cost_usd: v.get("total_cost_usd").and_then(Value::as_f64),
                });
                out.push(Event::RunCompleted {
                    usage,
                    session_id: v
                        .get("session_id")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    num_steps_reported: v
                        .get("num_turns")
                        .and_then(Value::as_u64)
                        .and_then(|n| u32::try_from(n).ok()),
                });
            }
            _ => {}
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct CodexProvider {
    section: ProviderConfig,
}

impl CodexProvider {
    #[must_use]
    pub fn new(section: ProviderConfig) -> Self {
        Self { section }
    }
}

impl Provider for CodexProvider {
    fn name(&self) -> &str {
        "codex"
    }

    fn invocation(&self, req: &RunRequest<'_>) -> Invocation {
        let mut args: Vec<String> = vec!["exec".to_owned()];
        if let Some(session) = req.resume {
            args.extend(["resume".to_owned(), "--json".to_owned(), session.to_owned()]);
        } else {
            args.extend([
                "--json".to_owned(),
                "--dangerously-bypass-approvals-and-sandbox".to_owned(),
            ]);
        }
        if let Some(model) = req.model {
            args.extend(["-m".to_owned(), model.to_owned()]);
        }
        args.extend(self.section.args.iter().cloned());
        args.push("-".to_owned());
        Invocation {
            program: self
                .section
                .executable
                .clone()
                .unwrap_or_else(|| "codex".to_owned()),
            args,
            stdin: Some(req.prompt.to_owned()),
        }
    }

    fn adapter(&self) -> Box<dyn EventAdapter> {
        Box::<CodexAdapter>::default()
    }
}

/// Codex has one coarse turn per run, so every completed item is a step.
#[derive(Debug, Default)]
pub struct CodexAdapter;

impl EventAdapter for CodexAdapter {
    fn translate(&mut self, line: &str) -> Vec<Event> {
        let Some(v) = parse_json(line) else {
            return raw_output(line);
        };
        let mut out = Vec::new();
        match v.get("type").and_then(Value::as_str) {
            Some("thread.started") => {
                if let Some(id) = v.get("thread_id").and_then(Value::as_str) {
                    out.push(Event::SessionStarted {
                        session_id: id.to_owned(),
                    });
                }
            }
            Some("item.completed") => {
                let item = v.get("item").cloned().unwrap_or(Value::Null);
                out.push(Event::StepStarted {
                    step_id: item.get("id").and_then(Value::as_str).map(str::to_owned),
                });
                match item.get("type").and_then(Value::as_str) {
                    Some("command_execution") => out.push(Event::StepProgress {
                        usage: None,
                        tool: Some("Bash".to_owned()),
                    }),
                    Some("file_change") => out.push(Event::StepProgress {
                        usage: None,
                        tool: Some("Edit".to_owned()),
                    }),
                    Some("agent_message") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            out.push(Event::Output {
                                text: text.to_owned(),
                            });
                        }
                    }
                    _ => {}
                }
                out.push(Event::StepCompleted);
            }
            Some("turn.completed") => {
                if let Some(u) = v.get("usage") {
                    out.push(Event::StepProgress {
                        usage: Some(Usage {
                            input_tokens: as_u64(u, "input_tokens"),
                            output_tokens: as_u64(u, "output_tokens"),
                            cost_usd: None,
                        }),
                        tool: None,
                    });
                }
            }
            Some("turn.failed" | "error") => {
                let message = v
                    .pointer("/error/message")
                    .or_else(|| v.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("codex reported an error")
                    .to_owned();
                out.push(Event::RunError {
                    message,
                    reason: None,
                });
            }
            _ => {}
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    section: ProviderConfig,
}

impl GeminiProvider {
    #[must_use]
    pub fn new(section: ProviderConfig) -> Self {
        Self { section }
    }
}

impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn invocation(&self, req: &RunRequest<'_>) -> Invocation {
        let mut args: Vec<String> = vec![
            "-p".to_owned(),
            req.prompt.to_owned(),
            "--output-format".to_owned(),
            "stream-json".to_owned(),
            "--yolo".to_owned(),
        ];
        if let Some(session) = req.resume {
            args.extend(["--resume".to_owned(), session.to_owned()]);
        }
        if let Some(model) = req.model {
            args.extend(["-m".to_owned(), model.to_owned()]);
        }
        args.extend(self.section.args.iter().cloned());
        Invocation {
            program: self
                .section
                .executable
                .clone()
                .unwrap_or_else(|| "gemini".to_owned()),
            args,
            stdin: None,
        }
    }

    fn adapter(&self) -> Box<dyn EventAdapter> {
        Box::<GeminiAdapter>::default()
    }
}

/// Gemini's stream-json: a complete assistant message opens a step, and a
/// tool call outside any step opens one too. A user message closes it.
#[derive(Debug, Default)]
pub struct GeminiAdapter {
    in_step: bool,
    step_has_text: bool,
}

impl GeminiAdapter {
    fn open_step(&mut self, out: &mut Vec<Event>) {
        if self.in_step {
            out.push(Event::StepCompleted);
        }
        out.push(Event::StepStarted { step_id: None });
        self.in_step = true;
        self.step_has_text = false;
    }
}

impl EventAdapter for GeminiAdapter {
    fn translate(&mut self, line: &str) -> Vec<Event> {
        let Some(v) = parse_json(line) else {
            return raw_output(line);
        };
        let mut out = Vec::new();
        match v.get("type").and_then(Value::as_str) {
            Some("init") => {
                if let Some(id) = v.get("session_id").and_then(Value::as_str) {
                    out.push(Event::SessionStarted {
                        session_id: id.to_owned(),
                    });
                }
            }
            Some("message") => match v.get("role").and_then(Value::as_str) {
                Some("user") => {
                    if self.in_step {
                        out.push(Event::StepCompleted);
                    }
                    self.in_step = false;
                }
                Some("assistant") => {
                    let content = v.get("content").and_then(Value::as_str).unwrap_or("");
                    let delta = v.get("delta").and_then(Value::as_bool) == Some(true);
                    if !content.is_empty() && !delta {
                        if !self.in_step || self.step_has_text {
                            self.open_step(&mut out);
                        }
                        self.step_has_text = true;
                        out.push(Event::Output {
                            text: content.to_owned(),
                        });
                    }
                }
                _ => {}
            },
            Some("tool_use") => {
                if !self.in_step {
                    self.open_step(&mut out);
                }
                out.push(Event::StepProgress {
                    usage: None,
                    tool: Some(
                        v.get("tool_name")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_owned(),
                    ),
                });
            }
            Some("result") => {
                if self.in_step {
                    out.push(Event::StepCompleted);
                    self.in_step = false;
                }
                if v.get("status").and_then(Value::as_str) == Some("error") {
                    out.push(Event::RunError {
                        message: v
                            .pointer("/error/message")
                            .and_then(Value::as_str)
                            .unwrap_or("gemini reported an error")
                            .to_owned(),
                        reason: None,
                    });
                }
                let usage = v.get("stats").map(|s| Usage {
                    input_tokens: as_u64(s, "input_tokens"),
                    output_tokens: as_u64(s, "output_tokens"),
                    cost_usd: None,
                });
                out.push(Event::RunCompleted {
                    usage,
                    session_id: None,
                    num_steps_reported: None,
                });
            }
            _ => {}
        }
        out
    }
}

/// Any executable that already speaks the normalized event shape, one JSON
/// object per line. Other lines are kept as plain output.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    name: String,
    section: ProviderConfig,
}

impl CommandProvider {
    #[must_use]
    pub fn new(name: &str, section: ProviderConfig) -> Self {
        Self {
            name: name.to_owned(),
            section,
        }
    }
}

impl Provider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn invocation(&self, req: &RunRequest<'_>) -> Invocation {
        let mut args = self.section.args.clone();
        if let Some(session) = req.resume {
            args.extend(["--resume".to_owned(), session.to_owned()]);
        }
        Invocation {
            program: self
                .section
                .executable
                .clone()
                .unwrap_or_else(|| self.name.clone()),
            args,
            stdin: Some(req.prompt.to_owned()),
        }
    }

    fn adapter(&self) -> Box<dyn EventAdapter> {
        Box::new(CommandAdapter)
    }
}

#[derive(Debug, Default)]
pub struct CommandAdapter;

impl EventAdapter for CommandAdapter {
    fn translate(&mut self, line: &str) -> Vec<Event> {
        match serde_json::from_str::<Event>(line.trim()) {
            Ok(event) => vec![event],
            Err(_) => raw_output(line),
        }
    }
}
