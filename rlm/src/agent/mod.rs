pub(crate) mod exec;
pub mod message;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::gateway::{DEFAULT_MAX_TOKENS, Gateway, GatewayError, QueryOptions};
use crate::parsing::{TerminationSignal, find_code_blocks, find_final_answer, truncate_output};
use crate::prompts;
use crate::session::{DEFAULT_INPUT_NAME, Session, SessionConfig, SessionError};

pub use message::{Conversation, Message, MessageRole};

use exec::{ExecAccumulator, execute_and_collect};

pub const DEFAULT_ROOT_MODEL: &str = "claude-opus-4-6";
pub const DEFAULT_MAX_ITERATIONS: usize = 15;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 20_000;

/// Send an event to the channel if it's still open.
pub(crate) async fn send_event(tx: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
    if !tx.is_closed() {
        let _ = tx.send(event).await;
    }
}

/// Configuration for the iteration loop.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Model driving the loop. Sub-queries use the gateway's default model.
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: String,
    /// Round budget before giving up with [`prompts::NO_ANSWER`].
    pub max_iterations: usize,
    /// Per-round output budget, in characters, fed back to the model.
    pub max_output_chars: usize,
    /// Name the input is bound to inside the session.
    pub input_name: String,
    /// Operation budget per code segment; 0 means unlimited.
    pub max_operations: u64,
    /// When set, append each root request/response as a JSON line to this file.
    pub llm_log_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_ROOT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: prompts::SYSTEM_PROMPT.to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            input_name: DEFAULT_INPUT_NAME.to_string(),
            max_operations: 0,
            llm_log_path: None,
        }
    }
}

/// Where the answer was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    /// A marker in a model response with no code.
    Response,
    /// `FINAL`/`FINAL_VAR` called from executed code.
    Session,
    /// A marker in the combined output of executed code.
    Output,
}

/// Events emitted during a run.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "round_start")]
    RoundStart {
        round: usize,
        max_rounds: usize,
        message_count: usize,
    },
    #[serde(rename = "llm_response")]
    LlmResponse {
        round: usize,
        content: String,
        duration_ms: u64,
    },
    #[serde(rename = "code_block")]
    CodeBlock {
        round: usize,
        index: usize,
        code: String,
    },
    #[serde(rename = "code_output")]
    CodeOutput {
        round: usize,
        index: usize,
        stdout: String,
        stderr: String,
        exception: Option<String>,
        duration_ms: u64,
    },
    #[serde(rename = "nudge")]
    Nudge { round: usize },
    #[serde(rename = "final")]
    Final {
        round: usize,
        answer: String,
        source: AnswerSource,
    },
    #[serde(rename = "budget_exhausted")]
    BudgetExhausted { rounds: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("input is empty")]
    EmptyInput,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// How a run ended.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub answer: String,
    pub rounds: usize,
    /// `None` when the round budget ran out.
    pub signal: Option<TerminationSignal>,
}

impl RunOutcome {
    pub fn answered(&self) -> bool {
        self.signal.is_some()
    }
}

/// Drives the root model: ask, execute its code, feed output back, until it answers.
pub struct Agent {
    gateway: Arc<Gateway>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(gateway: Arc<Gateway>, config: AgentConfig) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Answer `query` about `input`. Budget exhaustion returns [`prompts::NO_ANSWER`].
    pub async fn run(&self, query: &str, input: &str) -> Result<String, AgentError> {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        Ok(self.run_with_events(query, input, tx).await?.answer)
    }

    /// Like [`Agent::run`], streaming progress on `event_tx`.
    pub async fn run_with_events(
        &self,
        query: &str,
        input: &str,
        event_tx: mpsc::Sender<AgentEvent>,
    ) -> Result<RunOutcome, AgentError> {
        if input.trim().is_empty() {
            return Err(AgentError::EmptyInput);
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("rlm_run", run_id = %run_id);
        self.run_session(query, input, &run_id, &event_tx)
            .instrument(span)
            .await
    }

    /// Own the session for one run; it is released on every exit path.
    async fn run_session(
        &self,
        query: &str,
        input: &str,
        run_id: &str,
        event_tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<RunOutcome, AgentError> {
        let mut session = Session::new(
            Arc::clone(&self.gateway),
            SessionConfig {
                max_operations: self.config.max_operations,
                ..Default::default()
            },
        )?;
        let outcome = self.drive(&session, query, input, run_id, event_tx).await;
        session.release();
        outcome
    }

    async fn drive(
        &self,
        session: &Session,
        query: &str,
        input: &str,
        run_id: &str,
        event_tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<RunOutcome, AgentError> {
        let length = session.load_input(input, &self.config.input_name).await?;
        tracing::info!("input loaded: {length} chars, {} lines", input.lines().count());

        let mut conversation = Conversation::new();
        conversation.push_user(prompts::context_message(
            query,
            input,
            &self.config.input_name,
        ));
        let options = QueryOptions {
            model: Some(self.config.model.clone()),
            max_tokens: Some(self.config.max_tokens),
            system: Some(self.config.system_prompt.clone()),
        };
        let max_rounds = self.config.max_iterations;

        for round in 1..=max_rounds {
            tracing::info!(
                "round {round}/{max_rounds} ({} messages, {} chars)",
                conversation.len(),
                conversation.char_count()
            );
            send_event(
                event_tx,
                AgentEvent::RoundStart {
                    round,
                    max_rounds,
                    message_count: conversation.len(),
                },
            )
            .await;

            let started = Instant::now();
            let response = self
                .gateway
                .call_messages(conversation.messages(), &options)
                .await?;
            let duration_ms = started.elapsed().as_millis() as u64;
            log_llm_debug(
                &self.config.llm_log_path,
                run_id,
                round,
                conversation.messages(),
                &response,
            );
            send_event(
                event_tx,
                AgentEvent::LlmResponse {
                    round,
                    content: response.clone(),
                    duration_ms,
                },
            )
            .await;
            conversation.push_assistant(response.as_str());

            let blocks = find_code_blocks(&response);
            if blocks.is_empty() {
                if let Some(signal) = find_final_answer(&response, Some(session)) {
                    return Ok(finish(signal, round, AnswerSource::Response, event_tx).await);
                }
                tracing::info!("no code in response; nudging");
                conversation.push_user(prompts::NUDGE);
                send_event(event_tx, AgentEvent::Nudge { round }).await;
                continue;
            }

            let mut acc = ExecAccumulator::new();
            for (index, code) in blocks.iter().enumerate() {
                tracing::info!("executing segment {}/{}", index + 1, blocks.len());
                execute_and_collect(session, code, round, index, &mut acc, event_tx).await;
            }

            if let Some(signal) = session.active_termination() {
                return Ok(finish(signal, round, AnswerSource::Session, event_tx).await);
            }
            let combined = acc.combined();
            if let Some(signal) = find_final_answer(&combined, Some(session)) {
                return Ok(finish(signal, round, AnswerSource::Output, event_tx).await);
            }
            if acc.had_failure {
                tracing::debug!("round {round} had a faulting segment");
            }
            let truncated = truncate_output(&combined, self.config.max_output_chars);
            conversation.push_user(prompts::repl_feedback(&truncated));
        }

        tracing::warn!("no answer after {max_rounds} rounds");
        send_event(event_tx, AgentEvent::BudgetExhausted { rounds: max_rounds }).await;
        Ok(RunOutcome {
            answer: prompts::NO_ANSWER.to_string(),
            rounds: max_rounds,
            signal: None,
        })
    }
}

async fn finish(
    signal: TerminationSignal,
    round: usize,
    source: AnswerSource,
    event_tx: &mpsc::Sender<AgentEvent>,
) -> RunOutcome {
    tracing::info!(
        "answer found in round {round} ({source:?}, {} chars)",
        signal.value.chars().count()
    );
    send_event(
        event_tx,
        AgentEvent::Final {
            round,
            answer: signal.value.clone(),
            source,
        },
    )
    .await;
    RunOutcome {
        answer: signal.value.clone(),
        rounds: round,
        signal: Some(signal),
    }
}

/// Append a root request/response pair to the debug log (if configured).
fn log_llm_debug(
    log_path: &Option<PathBuf>,
    run_id: &str,
    round: usize,
    request: &[Message],
    response_text: &str,
) {
    let Some(path) = log_path else { return };

    let entry = serde_json::json!({
        "round": round,
        "ts": chrono::Utc::now().to_rfc3339(),
        "run_id": run_id,
        "request": request,
        "response": response_text,
    });

    if let Ok(mut f) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        use std::io::Write;
        let _ = writeln!(f, "{}", entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use crate::testing::ScriptedBackend;

    fn agent(backend: Arc<ScriptedBackend>, config: AgentConfig) -> Agent {
        let gateway = Arc::new(Gateway::new(backend, GatewayConfig::default()));
        Agent::new(gateway, config)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn events_follow_the_round() {
        let backend = Arc::new(ScriptedBackend::texts([
            "thinking about it",
            "```repl\nprint(context.len());\n```",
            "FINAL(5)",
        ]));
        let agent = agent(backend, AgentConfig::default());
        let (tx, mut rx) = mpsc::channel(64);
        let outcome = agent.run_with_events("q", "hello", tx).await.unwrap();
        assert_eq!(outcome.answer, "5");
        assert_eq!(outcome.rounds, 3);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec![
                "round_start",
                "llm_response",
                "nudge",
                "round_start",
                "llm_response",
                "code_block",
                "code_output",
                "round_start",
                "llm_response",
                "final",
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn root_calls_use_root_model_and_system_prompt() {
        let backend = Arc::new(ScriptedBackend::texts(["FINAL(done)"]));
        let config = AgentConfig {
            model: "root-model".into(),
            system_prompt: "sys".into(),
            ..Default::default()
        };
        agent(backend.clone(), config).run("q", "input").await.unwrap();
        let req = &backend.requests()[0];
        assert_eq!(req.model, "root-model");
        assert_eq!(req.system.as_deref(), Some("sys"));
        assert!(req.messages[0].content.starts_with("## Task\nq\n"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn debug_log_gets_one_line_per_round() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("llm.jsonl");
        let backend = Arc::new(ScriptedBackend::texts(["no code here", "FINAL(ok)"]));
        let config = AgentConfig {
            llm_log_path: Some(log.clone()),
            ..Default::default()
        };
        agent(backend, config).run("q", "input").await.unwrap();
        let text = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["round"], 2);
        assert_eq!(lines[1]["response"], "FINAL(ok)");
        assert_eq!(lines[1]["request"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn blank_input_is_rejected() {
        let backend = Arc::new(ScriptedBackend::texts(["FINAL(x)"]));
        let err = agent(backend.clone(), AgentConfig::default())
            .run("q", "  \n\t")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::EmptyInput));
        assert_eq!(backend.call_count(), 0);
    }
}
