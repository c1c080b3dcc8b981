// src/agent/mod.rs
//! Agent-routed tasks
//!
//! An agent task asks the LLM collaborator for a structured answer on
//! behalf of one of a fixed set of agent profiles. Every call is bracketed
//! by the budget ledger:
//!
//! ```text
//! reserve(estimate) ──denied──→ quota-exceeded
//!        │ granted
//!        ▼
//! llm.complete ──ok──→ commit(prompt + completion tokens)
//!        └──err/cancel──→ commit(0)
//! ```

pub mod ledger;
pub mod llm;

pub use ledger::{BudgetDecision, BudgetGrant, BudgetLedger, InMemoryLedger};
pub use llm::{ChatMessage, Completion, CompletionOptions, HttpLlmClient, LlmClient};

use crate::runtime::contract::Payload;
use crate::utils::config::AgentConfig;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Characters of a UTF-8 context file quoted into the prompt
const FILE_SNIPPET_CHARS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Code,
    Test,
    Design,
    Debug,
    Security,
    Doc,
}

impl AgentKind {
    pub const ALL: [AgentKind; 6] = [
        AgentKind::Code,
        AgentKind::Test,
        AgentKind::Design,
        AgentKind::Debug,
        AgentKind::Security,
        AgentKind::Doc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Code => "code",
            AgentKind::Test => "test",
            AgentKind::Design => "design",
            AgentKind::Debug => "debug",
            AgentKind::Security => "security",
            AgentKind::Doc => "doc",
        }
    }

    pub fn profile(&self) -> AgentProfile {
        const RESPONSE_SHAPE: &str = "Answer with a single JSON object {\"summary\": string, \"insights\": [string], \"actions\": [{\"type\": \"message\" | \"file_patch\" | \"file_write\" | \"command\", ...}]}.";

        let (name, description, role, capabilities): (&str, &str, &str, &[&str]) = match self {
            AgentKind::Code => (
                "Code Agent",
                "Writes and refactors application code.",
                "You are a senior software engineer making precise, reviewable code changes.",
                &["code_generation", "refactoring", "analysis"],
            ),
            AgentKind::Test => (
                "Test Agent",
                "Designs automated tests and reviews coverage.",
                "You are a test engineer focused on reliable, high-signal automated tests.",
                &["test_design", "coverage_analysis", "ci_recommendation"],
            ),
            AgentKind::Design => (
                "Design Agent",
                "Reviews user experience, layout and accessibility.",
                "You review interfaces for usability, accessibility and visual consistency.",
                &["ux_feedback", "component_layout", "theme_guidance"],
            ),
            AgentKind::Debug => (
                "Debug Agent",
                "Finds root causes of defects from logs and traces.",
                "You diagnose failures from logs, stack traces and reproduction steps.",
                &["log_analysis", "failure_triage", "fix_recommendation"],
            ),
            AgentKind::Security => (
                "Security Agent",
                "Audits code and dependencies for vulnerabilities.",
                "You are an application security reviewer proposing concrete mitigations.",
                &["threat_analysis", "dependency_review", "mitigation_plan"],
            ),
            AgentKind::Doc => (
                "Documentation Agent",
                "Writes technical documentation and changelogs.",
                "You write accurate, concise technical documentation.",
                &["api_docs", "changelog", "guides"],
            ),
        };

        AgentProfile {
            kind: *self,
            name: name.to_string(),
            description: description.to_string(),
            system_prompt: format!("{} {}", role, RESPONSE_SHAPE),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub kind: AgentKind,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContextFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub title: String,
    pub content: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContext {
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub files: Vec<AgentContextFile>,
}

impl AgentContext {
    pub fn total_bytes(&self) -> Result<usize> {
        let mut total = self.notes.iter().map(|n| n.len()).sum::<usize>();
        for file in &self.files {
            total = total.saturating_add(file.content.byte_len()?);
        }
        Ok(total)
    }
}

/// A request for an agent task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent: AgentKind,
    pub objective: String,
    #[serde(default)]
    pub context: AgentContext,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub parameters: Option<CompletionOptions>,
}

impl AgentRequest {
    pub fn new(agent: AgentKind, objective: impl Into<String>) -> Self {
        Self {
            agent,
            objective: objective.into(),
            context: AgentContext::default(),
            model: None,
            metadata: None,
            parameters: None,
        }
    }

    pub fn validate(&self, max_context_bytes: usize) -> Result<()> {
        if self.objective.trim().is_empty() {
            return Err(EngineError::InvalidParameters("objective must not be empty".into()));
        }
        let size = self.context.total_bytes()?;
        if size > max_context_bytes {
            return Err(EngineError::SizeExceeded {
                size: size as u64,
                limit: max_context_bytes as u64,
            });
        }
        Ok(())
    }

    pub fn summary(&self) -> Value {
        json!({
            "agent": self.agent,
            "objective": self.objective,
            "model": self.model,
            "notes": self.context.notes.len(),
            "files": self.context.files.len(),
        })
    }
}

/// Follow-up an agent proposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentAction {
    Message {
        title: String,
        body: String,
    },
    FilePatch {
        path: String,
        patch: String,
    },
    FileWrite {
        path: String,
        content: Payload,
    },
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub summary: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub actions: Vec<AgentAction>,
    pub model: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Deserialize)]
struct StructuredAnswer {
    summary: String,
    #[serde(default)]
    insights: Vec<String>,
    #[serde(default)]
    actions: Vec<AgentAction>,
}

/// Runs agent requests against the LLM and ledger collaborators
pub struct AgentRunner {
    config: AgentConfig,
    llm: Arc<dyn LlmClient>,
    ledger: Arc<dyn BudgetLedger>,
}

impl AgentRunner {
    pub fn new(config: AgentConfig, llm: Arc<dyn LlmClient>, ledger: Arc<dyn BudgetLedger>) -> Self {
        Self {
            config,
            llm,
            ledger,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn profiles(&self) -> Vec<AgentProfile> {
        AgentKind::ALL.iter().map(|kind| kind.profile()).collect()
    }

    pub fn validate(&self, request: &AgentRequest) -> Result<()> {
        request.validate(self.config.max_context_bytes)
    }

    pub async fn run(
        &self,
        user_id: &str,
        request: AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome> {
        self.validate(&request)?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let profile = request.agent.profile();
        let model = request
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model.clone());
        let options = request.parameters.clone().unwrap_or_default();
        let messages = vec![
            ChatMessage::system(profile.system_prompt.clone()),
            ChatMessage::user(build_prompt(&request)),
        ];

        let estimate = llm::estimate_tokens(messages.iter().map(|m| m.content.len()).sum())
            + u64::from(options.max_tokens.unwrap_or(0));
        let grant = match self.ledger.reserve(user_id, estimate).await? {
            BudgetDecision::Granted(grant) => grant,
            BudgetDecision::Denied { remaining } => {
                return Err(EngineError::QuotaExceeded(format!(
                    "token budget of '{}' has {} left, {} estimated",
                    user_id, remaining, estimate
                )));
            }
        };
        let mut charge = PendingCharge::new(Arc::clone(&self.ledger), grant);

        debug!(agent = %request.agent, model = %model, estimate, "agent request reserved");

        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                charge.settle(0).await;
                return Err(EngineError::Cancelled);
            }
            result = self.llm.complete(&model, &messages, &options) => result,
        };

        let completion = match completion {
            Ok(completion) => {
                charge.settle(completion.total_tokens()).await;
                completion
            }
            Err(err) => {
                charge.settle(0).await;
                return Err(err);
            }
        };

        Ok(parse_outcome(request.agent, model, completion))
    }
}

/// Commits zero if dropped unsettled (e.g. the watchdog aborted the call)
struct PendingCharge {
    ledger: Arc<dyn BudgetLedger>,
    grant: Option<BudgetGrant>,
}

impl PendingCharge {
    fn new(ledger: Arc<dyn BudgetLedger>, grant: BudgetGrant) -> Self {
        Self {
            ledger,
            grant: Some(grant),
        }
    }

    async fn settle(&mut self, actual: u64) {
        if let Some(grant) = self.grant.take() {
            if let Err(err) = self.ledger.commit(&grant, actual).await {
                warn!(user_id = %grant.user_id, error = %err, "ledger commit failed");
            }
        }
    }
}

impl Drop for PendingCharge {
    fn drop(&mut self) {
        if let Some(grant) = self.grant.take() {
            let ledger = Arc::clone(&self.ledger);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(err) = ledger.commit(&grant, 0).await {
                        warn!(user_id = %grant.user_id, error = %err, "ledger release failed");
                    }
                });
            }
        }
    }
}

fn build_prompt(request: &AgentRequest) -> String {
    let mut prompt = format!("Objective:\n{}\n\n", request.objective.trim());

    if !request.context.notes.is_empty() {
        prompt.push_str("Context notes:\n");
        for (idx, note) in request.context.notes.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", idx + 1, note.trim()));
        }
        prompt.push('\n');
    }

    if !request.context.files.is_empty() {
        prompt.push_str("Files:\n");
        for file in &request.context.files {
            prompt.push_str(&format!("- {}\n", file.title));
            if let Some(path) = &file.path {
                prompt.push_str(&format!("  path: {}\n", path));
            }
            match &file.content {
                Payload::Utf8(text) => {
                    let snippet: String = text.chars().take(FILE_SNIPPET_CHARS).collect();
                    prompt.push_str("  content:\n");
                    prompt.push_str(&snippet);
                    prompt.push('\n');
                }
                Payload::Base64(_) => prompt.push_str("  binary content omitted\n"),
            }
        }
        prompt.push('\n');
    }

    if let Some(metadata) = &request.metadata {
        prompt.push_str("Metadata:\n");
        prompt.push_str(&metadata.to_string());
        prompt.push('\n');
    }
    prompt
}

fn parse_outcome(agent: AgentKind, model: String, completion: Completion) -> AgentOutcome {
    let usage = TokenUsage {
        prompt_tokens: completion.prompt_tokens,
        completion_tokens: completion.completion_tokens,
    };
    let (summary, insights, actions) =
        match serde_json::from_str::<StructuredAnswer>(completion.text.trim()) {
            Ok(answer) => (answer.summary, answer.insights, answer.actions),
            Err(err) => {
                debug!(agent = %agent, error = %err, "unstructured agent answer");
                (completion.text.trim().to_string(), Vec::new(), Vec::new())
            }
        };
    let summary = if summary.trim().is_empty() {
        "agent completed without summary".to_string()
    } else {
        summary
    };

    AgentOutcome {
        summary,
        insights,
        actions,
        model,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct ScriptedLlm {
        reply: Result<String>,
        delay: Duration,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<Completion> {
            tokio::time::sleep(self.delay).await;
            match &self.reply {
                Ok(text) => Ok(Completion {
                    text: text.clone(),
                    prompt_tokens: 10,
                    completion_tokens: 5,
                }),
                Err(err) => Err(EngineError::ExecutionFailed(err.to_string())),
            }
        }

        fn description(&self) -> String {
            "scripted".into()
        }
    }

    fn runner(reply: Result<String>, delay: Duration, ledger: Arc<InMemoryLedger>) -> AgentRunner {
        AgentRunner::new(
            AgentConfig::default(),
            Arc::new(ScriptedLlm { reply, delay }),
            ledger,
        )
    }

    #[tokio::test]
    async fn test_structured_answer_and_commit() {
        let ledger = Arc::new(InMemoryLedger::new(10_000));
        let reply = r#"{"summary":"done","insights":["a"],"actions":[{"type":"command","command":"cargo","args":["test"]}]}"#;
        let runner = runner(Ok(reply.into()), Duration::ZERO, Arc::clone(&ledger));

        let outcome = runner
            .run("alice", AgentRequest::new(AgentKind::Code, "add tests"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.summary, "done");
        assert_eq!(outcome.insights, vec!["a".to_string()]);
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.model, "default");
        assert_eq!(ledger.available("alice"), 10_000 - 15);
    }

    #[tokio::test]
    async fn test_plain_text_becomes_summary() {
        let ledger = Arc::new(InMemoryLedger::new(10_000));
        let runner = runner(Ok("  just text ".into()), Duration::ZERO, ledger);
        let outcome = runner
            .run("bob", AgentRequest::new(AgentKind::Doc, "write docs"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.summary, "just text");
        assert!(outcome.actions.is_empty());
    }

    #[tokio::test]
    async fn test_failed_call_commits_zero() {
        let ledger = Arc::new(InMemoryLedger::new(10_000));
        let runner = runner(
            Err(EngineError::ExecutionFailed("down".into())),
            Duration::ZERO,
            Arc::clone(&ledger),
        );
        let result = runner
            .run("carol", AgentRequest::new(AgentKind::Debug, "why"), &CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert_eq!(ledger.available("carol"), 10_000);
    }

    #[tokio::test]
    async fn test_denied_budget_is_quota_error() {
        let ledger = Arc::new(InMemoryLedger::new(1));
        let runner = runner(Ok("x".into()), Duration::ZERO, ledger);
        let result = runner
            .run("dave", AgentRequest::new(AgentKind::Test, "tests"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EngineError::QuotaExceeded(_))));
    }

    #[tokio::test]
    async fn test_cancel_releases_hold() {
        let ledger = Arc::new(InMemoryLedger::new(10_000));
        let runner = runner(Ok("x".into()), Duration::from_secs(30), Arc::clone(&ledger));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = runner
            .run("erin", AgentRequest::new(AgentKind::Security, "audit"), &cancel)
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(ledger.available("erin"), 10_000);
    }

    #[test]
    fn test_validation() {
        let empty = AgentRequest::new(AgentKind::Code, "   ");
        assert!(matches!(empty.validate(1024), Err(EngineError::InvalidParameters(_))));

        let mut big = AgentRequest::new(AgentKind::Code, "go");
        big.context.notes.push("x".repeat(2048));
        assert!(matches!(big.validate(1024), Err(EngineError::SizeExceeded { .. })));
    }

    #[test]
    fn test_prompt_includes_context() {
        let mut request = AgentRequest::new(AgentKind::Code, "fix bug");
        request.context.notes.push("flaky on CI".into());
        request.context.files.push(AgentContextFile {
            path: Some("src/lib.rs".into()),
            title: "lib".into(),
            content: Payload::text("pub fn f() {}"),
        });
        let prompt = build_prompt(&request);
        assert!(prompt.contains("1. flaky on CI"));
        assert!(prompt.contains("path: src/lib.rs"));
        assert!(prompt.contains("pub fn f() {}"));
    }

    #[test]
    fn test_every_kind_has_profile() {
        for kind in AgentKind::ALL {
            let profile = kind.profile();
            assert!(profile.system_prompt.contains("summary"));
            assert_eq!(profile.capabilities.len(), 3);
        }
    }
}
