pub mod agent;
pub mod backend;
pub mod embedded;
pub mod gateway;
pub mod parsing;
pub mod prompts;
pub mod provider;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// Re-exports
pub use agent::{
    Agent, AgentConfig, AgentError, AgentEvent, AnswerSource, Conversation, Message, MessageRole,
    RunOutcome,
};
pub use backend::{Backend, BackendError, CompletionRequest, HttpBackend};
pub use gateway::{Gateway, GatewayConfig, GatewayError, QueryOptions, RetryPolicy};
pub use parsing::{
    TerminationKind, TerminationSignal, VariableLookup, find_code_blocks, find_final_answer,
    truncate_output,
};
pub use provider::{ConfigError, Provider, ProviderKind, RlmConfig};
pub use session::{ExecResult, Session, SessionConfig, SessionError};
