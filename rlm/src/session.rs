use std::borrow::Cow;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use regex::Regex;
use rhai::{AST, Dynamic, Engine, Scope};
use tempfile::TempDir;
use tokio::runtime::Handle;

use crate::embedded::{self, HostBridge, OutputCapture, PRIMITIVES, TerminationSlot};
use crate::gateway::Gateway;
use crate::parsing::{TerminationSignal, VariableLookup};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Name the input text is bound to unless the caller picks another.
pub const DEFAULT_INPUT_NAME: &str = "context";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("script engine setup failed: {0}")]
    Engine(String),
    #[error("sessions must be created inside a tokio runtime")]
    NoRuntime,
    #[error("not a valid variable name: {0:?}")]
    InvalidName(String),
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Operation budget per execution; 0 means unlimited.
    pub max_operations: u64,
    /// Create a scratch directory holding a copy of each loaded input.
    pub scratch_dir: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_operations: 0,
            scratch_dir: true,
        }
    }
}

/// Captured result of running one code segment.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    /// `"<Kind>: <message>"` when the segment faulted.
    pub exception: Option<String>,
    pub duration_ms: u64,
}

impl ExecResult {
    pub fn is_ok(&self) -> bool {
        self.exception.is_none()
    }
}

/// Bindings and function definitions that survive between executions.
struct ReplState {
    scope: Scope<'static>,
    functions: AST,
}

/// A persistent script namespace for one run.
///
/// Executions are serialized: a second `execute` waits for the first to finish.
pub struct Session {
    engine: Arc<Engine>,
    state: Arc<tokio::sync::Mutex<ReplState>>,
    capture: Arc<OutputCapture>,
    termination: TerminationSlot,
    scratch: Option<TempDir>,
}

impl Session {
    /// Build a session whose `llm_query` primitives route through `gateway`.
    ///
    /// Must be called from within a tokio runtime; the primitives block on it.
    pub fn new(gateway: Arc<Gateway>, config: SessionConfig) -> Result<Self, SessionError> {
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let capture = Arc::new(OutputCapture::default());
        let termination = TerminationSlot::default();
        let engine = embedded::build_engine(
            HostBridge {
                gateway,
                runtime,
                capture: Arc::clone(&capture),
                termination: Arc::clone(&termination),
            },
            config.max_operations,
        )
        .map_err(SessionError::Engine)?;

        let scratch = if config.scratch_dir {
            Some(tempfile::Builder::new().prefix("rlm_repl_").tempdir()?)
        } else {
            None
        };
        tracing::debug!(
            "session created (scratch: {:?})",
            scratch.as_ref().map(|d| d.path().to_path_buf())
        );

        Ok(Self {
            engine: Arc::new(engine),
            state: Arc::new(tokio::sync::Mutex::new(ReplState {
                scope: Scope::new(),
                functions: AST::empty(),
            })),
            capture,
            termination,
            scratch,
        })
    }

    /// Bind `text` to `name` in the namespace and return its length in characters.
    ///
    /// A copy is written to `<name>.txt` in the scratch directory when there is one.
    pub async fn load_input(&self, text: &str, name: &str) -> Result<usize, SessionError> {
        if !IDENTIFIER.is_match(name) || PRIMITIVES.contains(&name) {
            return Err(SessionError::InvalidName(name.to_string()));
        }
        if let Some(dir) = &self.scratch {
            std::fs::write(dir.path().join(format!("{name}.txt")), text)?;
        }
        let mut state = self.state.lock().await;
        state.scope.set_value(name.to_string(), text.to_string());
        Ok(text.chars().count())
    }

    /// Run a code segment against the persistent namespace.
    ///
    /// Faults are reported in the result, never returned as errors; bindings made
    /// before a fault are kept.
    pub async fn execute(&self, code: &str) -> ExecResult {
        let mut state = Arc::clone(&self.state).lock_owned().await;
        let engine = Arc::clone(&self.engine);
        let capture = Arc::clone(&self.capture);
        let code = code.to_string();
        let start = Instant::now();

        let joined = tokio::task::spawn_blocking(move || {
            // Anything left over from an execution that panicked.
            capture.take();
            let exception = run_segment(&engine, &mut state, &code).err();
            let (stdout, stderr) = capture.take();
            ExecResult {
                stdout,
                stderr,
                exception,
                duration_ms: 0,
            }
        })
        .await;

        let mut result = joined.unwrap_or_else(|e| ExecResult {
            exception: Some(format!("Panic: {e}")),
            ..Default::default()
        });
        result.duration_ms = start.elapsed().as_millis() as u64;
        if let Some(exception) = &result.exception {
            tracing::debug!("segment faulted: {exception}");
        }
        result
    }

    /// The termination signal set by `FINAL`/`FINAL_VAR`, if any.
    pub fn active_termination(&self) -> Option<TerminationSignal> {
        self.termination.lock().unwrap().clone()
    }

    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|d| d.path())
    }

    /// Remove the scratch directory. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(dir) = self.scratch.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!("failed to remove session scratch {}: {e}", path.display());
            }
        }
    }
}

impl VariableLookup for Session {
    /// Only meaningful between executions: while one holds the namespace this
    /// returns `None`, the same as for an unbound name.
    fn get_var(&self, name: &str) -> Option<String> {
        let Ok(state) = self.state.try_lock() else {
            tracing::debug!("namespace busy; lookup of {name:?} treated as unbound");
            return None;
        };
        state
            .scope
            .get_value::<Dynamic>(name)
            .filter(|v| !v.is_unit())
            .map(|v| v.to_string())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

/// Compile `code`, retrying with single-quoted `FINAL`/`FINAL_VAR` arguments rewritten
/// as strings. Code that already compiles is never rewritten.
fn compile_segment(engine: &Engine, code: &str) -> Result<AST, String> {
    let err = match engine.compile(code) {
        Ok(ast) => return Ok(ast),
        Err(e) => e,
    };
    match embedded::normalize_termination_quotes(code) {
        Cow::Owned(rewritten) => engine
            .compile(rewritten)
            .map_err(|_| format!("SyntaxError: {err}")),
        Cow::Borrowed(_) => Err(format!("SyntaxError: {err}")),
    }
}

fn run_segment(engine: &Engine, state: &mut ReplState, code: &str) -> Result<(), String> {
    let ast = compile_segment(engine, code)?;
    if let Some(name) = ast
        .iter_functions()
        .map(|f| f.name)
        .find(|name| PRIMITIVES.contains(name))
    {
        return Err(format!("PermissionError: cannot redefine built-in `{name}`"));
    }

    // Definitions persist even if the body faults.
    state.functions = state.functions.merge(&ast.clone_functions_only());
    let program = state.functions.merge(&ast);
    let outcome = engine
        .run_ast_with_scope(&mut state.scope, &program)
        .map_err(|e| embedded::describe_fault(&e));
    embedded::compact_scope(&mut state.scope);
    outcome
}
