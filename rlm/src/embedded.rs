use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Scope};
use tokio::runtime::Handle;

use crate::gateway::{Gateway, QueryOptions};
use crate::parsing::TerminationSignal;

/// Names the host injects into every session. Scripts may not redefine them.
pub const PRIMITIVES: &[&str] = &[
    "llm_query",
    "llm_query_batched",
    "FINAL",
    "FINAL_VAR",
    "SHOW_VARS",
];

/// Symbols removed from the language. This is a deny-list, not a sandbox:
/// `import` still resolves modules from disk.
const DENIED_SYMBOLS: &[&str] = &["eval"];

/// Max characters of a value shown by `SHOW_VARS()`.
const PREVIEW_CHARS: usize = 200;

/// `FINAL('...')` / `FINAL_VAR('...')` with a single-quoted argument.
static SINGLE_QUOTED_TERMINATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(FINAL_VAR|FINAL)\(\s*'((?:[^'\\\n]|\\.)*)'\s*\)").unwrap()
});

/// Rewrite single-quoted termination arguments as string literals.
///
/// In the script language `'x'` is a character literal, so `FINAL_VAR('answer')`
/// would not even compile.
pub(crate) fn normalize_termination_quotes(code: &str) -> Cow<'_, str> {
    SINGLE_QUOTED_TERMINATION.replace_all(code, |caps: &regex::Captures| {
        let mut literal = String::with_capacity(caps[2].len() + 2);
        let mut chars = caps[2].chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    literal.push('\'');
                }
                '\\' => {
                    literal.push('\\');
                    if let Some(next) = chars.next() {
                        literal.push(next);
                    }
                }
                '"' => literal.push_str("\\\""),
                other => literal.push(other),
            }
        }
        format!("{}(\"{literal}\")", &caps[1])
    })
}

/// stdout/stderr buffers written by the engine's print hooks during one execution.
#[derive(Default)]
pub(crate) struct OutputCapture {
    stdout: Mutex<String>,
    stderr: Mutex<String>,
}

impl OutputCapture {
    pub fn print(&self, line: &str) {
        let mut out = self.stdout.lock().unwrap();
        out.push_str(line);
        out.push('\n');
    }

    pub fn eprint(&self, line: &str) {
        let mut err = self.stderr.lock().unwrap();
        err.push_str(line);
        err.push('\n');
    }

    /// Drain both buffers.
    pub fn take(&self) -> (String, String) {
        let stdout = std::mem::take(&mut *self.stdout.lock().unwrap());
        let stderr = std::mem::take(&mut *self.stderr.lock().unwrap());
        (stdout, stderr)
    }
}

pub(crate) type TerminationSlot = Arc<Mutex<Option<TerminationSignal>>>;

/// Everything the host functions need to reach back out of the engine.
pub(crate) struct HostBridge {
    pub gateway: Arc<Gateway>,
    pub runtime: Handle,
    pub capture: Arc<OutputCapture>,
    pub termination: TerminationSlot,
}

/// Build a script engine with output capture, the deny-list, and the recursion primitives.
pub(crate) fn build_engine(bridge: HostBridge, max_operations: u64) -> Result<Engine, String> {
    let mut engine = Engine::new();
    for symbol in DENIED_SYMBOLS {
        engine.disable_symbol(*symbol);
    }
    engine.set_max_operations(max_operations);

    let out = Arc::clone(&bridge.capture);
    engine.on_print(move |s| out.print(s));
    let err = Arc::clone(&bridge.capture);
    engine.on_debug(move |s, _source, _pos| err.eprint(s));

    register_queries(&mut engine, &bridge);
    register_termination(&mut engine, &bridge)?;

    let capture = Arc::clone(&bridge.capture);
    engine
        .register_custom_syntax(["SHOW_VARS", "(", ")"], false, move |context, _inputs| {
            for line in describe_vars(context.scope()) {
                capture.print(&line);
            }
            Ok(Dynamic::UNIT)
        })
        .map_err(|e| format!("SHOW_VARS: {e}"))?;

    Ok(engine)
}

// ── Sub-queries ──

fn register_queries(engine: &mut Engine, bridge: &HostBridge) {
    let (gw, rt) = (Arc::clone(&bridge.gateway), bridge.runtime.clone());
    engine.register_fn(
        "llm_query",
        move |prompt: ImmutableString| -> Result<String, Box<EvalAltResult>> {
            query(&gw, &rt, &prompt, &QueryOptions::default())
        },
    );

    let (gw, rt) = (Arc::clone(&bridge.gateway), bridge.runtime.clone());
    engine.register_fn(
        "llm_query",
        move |prompt: ImmutableString, options: Map| -> Result<String, Box<EvalAltResult>> {
            query(&gw, &rt, &prompt, &query_options(&options)?)
        },
    );

    let (gw, rt) = (Arc::clone(&bridge.gateway), bridge.runtime.clone());
    engine.register_fn(
        "llm_query_batched",
        move |prompts: Array| -> Result<Array, Box<EvalAltResult>> {
            query_batched(&gw, &rt, prompts, &QueryOptions::default())
        },
    );

    let (gw, rt) = (Arc::clone(&bridge.gateway), bridge.runtime.clone());
    engine.register_fn(
        "llm_query_batched",
        move |prompts: Array, options: Map| -> Result<Array, Box<EvalAltResult>> {
            query_batched(&gw, &rt, prompts, &query_options(&options)?)
        },
    );
}

fn query(
    gateway: &Gateway,
    runtime: &Handle,
    prompt: &str,
    options: &QueryOptions,
) -> Result<String, Box<EvalAltResult>> {
    runtime
        .block_on(gateway.query(prompt, options))
        .map_err(|e| format!("llm_query failed: {e}").into())
}

fn query_batched(
    gateway: &Gateway,
    runtime: &Handle,
    prompts: Array,
    options: &QueryOptions,
) -> Result<Array, Box<EvalAltResult>> {
    let prompts = prompts
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            p.into_string()
                .map_err(|ty| format!("llm_query_batched: prompt {i} is {ty}, expected string"))
        })
        .collect::<Result<Vec<String>, String>>()?;
    let results = runtime
        .block_on(gateway.query_batched(&prompts, options))
        .map_err(|e| format!("llm_query_batched failed: {e}"))?;
    Ok(results.into_iter().map(Dynamic::from).collect())
}

/// Read `#{model, max_tokens, system}` overrides; unit values mean "use the default".
fn query_options(map: &Map) -> Result<QueryOptions, Box<EvalAltResult>> {
    let get = |key: &str| map.get(key).filter(|v| !v.is_unit());
    let max_tokens = match get("max_tokens") {
        Some(v) => {
            let n = v
                .as_int()
                .map_err(|ty| format!("max_tokens must be an integer, got {ty}"))?;
            Some(u32::try_from(n).map_err(|_| format!("max_tokens out of range: {n}"))?)
        }
        None => None,
    };
    Ok(QueryOptions {
        model: get("model").map(|v| v.to_string()),
        max_tokens,
        system: get("system").map(|v| v.to_string()),
    })
}

// ── Termination ──

fn register_termination(engine: &mut Engine, bridge: &HostBridge) -> Result<(), String> {
    let (capture, slot) = (Arc::clone(&bridge.capture), Arc::clone(&bridge.termination));
    engine.register_fn("FINAL", move |answer: Dynamic| {
        let value = answer.to_string();
        // Echo the textual marker so the output scan agrees with the slot.
        capture.print(&format!("FINAL({value})"));
        *slot.lock().unwrap() = Some(TerminationSignal::literal(value));
    });

    // Syntax rather than a function: it has to read the live scope.
    let (capture, slot) = (Arc::clone(&bridge.capture), Arc::clone(&bridge.termination));
    engine
        .register_custom_syntax(
            ["FINAL_VAR", "(", "$expr$", ")"],
            false,
            move |context, inputs| {
                let name = context.eval_expression_tree(&inputs[0])?.to_string();
                match context.scope().get_value::<Dynamic>(&name) {
                    Some(value) => {
                        *slot.lock().unwrap() =
                            Some(TerminationSignal::by_reference(&name, value.to_string()));
                        capture.print(&format!("FINAL_VAR('{name}')"));
                    }
                    None => {
                        capture.print(&format!("Error: variable '{name}' not found in namespace"));
                    }
                }
                Ok(Dynamic::UNIT)
            },
        )
        .map_err(|e| format!("FINAL_VAR: {e}"))?;
    Ok(())
}

// ── Introspection ──

/// Each name's most recent entry, in order of that entry. Later entries shadow
/// earlier ones with the same name.
pub(crate) fn latest_bindings(scope: &Scope) -> Vec<(String, bool, Dynamic)> {
    let entries: Vec<(&str, bool, Dynamic)> = scope.iter().collect();
    let mut seen = HashSet::new();
    let mut latest: Vec<(String, bool, Dynamic)> = entries
        .into_iter()
        .rev()
        .filter(|(name, ..)| seen.insert(*name))
        .map(|(name, constant, value)| (name.to_string(), constant, value))
        .collect();
    latest.reverse();
    latest
}

/// Drop shadowed entries so their values can be freed.
pub(crate) fn compact_scope(scope: &mut Scope<'static>) {
    let latest = latest_bindings(scope);
    if latest.len() == scope.len() {
        return;
    }
    let mut compacted = Scope::new();
    for (name, constant, value) in latest {
        if constant {
            compacted.push_constant_dynamic(name, value);
        } else {
            compacted.push_dynamic(name, value);
        }
    }
    *scope = compacted;
}

/// One line per user-defined binding: `  name: type = preview`, sorted by name.
pub(crate) fn describe_vars(scope: &Scope) -> Vec<String> {
    let mut visible: Vec<(String, bool, Dynamic)> = latest_bindings(scope)
        .into_iter()
        .filter(|(name, ..)| !name.starts_with('_') && !PRIMITIVES.contains(&name.as_str()))
        .collect();
    visible.sort_by(|a, b| a.0.cmp(&b.0));
    visible
        .into_iter()
        .map(|(name, _constant, value)| {
            let repr = format!("{value:?}");
            let preview = if repr.chars().count() > PREVIEW_CHARS {
                let cut: String = repr.chars().take(PREVIEW_CHARS).collect();
                format!("{cut}...")
            } else {
                repr
            };
            format!("  {name}: {} = {preview}", value.type_name())
        })
        .collect()
}

// ── Faults ──

fn fault_kind(err: &EvalAltResult) -> &'static str {
    match err {
        EvalAltResult::ErrorInFunctionCall(.., inner, _) => fault_kind(inner),
        EvalAltResult::ErrorParsing(..) => "SyntaxError",
        EvalAltResult::ErrorVariableNotFound(..) | EvalAltResult::ErrorFunctionNotFound(..) => {
            "NameError"
        }
        EvalAltResult::ErrorArrayBounds(..) | EvalAltResult::ErrorStringBounds(..) => "IndexError",
        EvalAltResult::ErrorMismatchDataType(..) | EvalAltResult::ErrorMismatchOutputType(..) => {
            "TypeError"
        }
        EvalAltResult::ErrorArithmetic(..) => "ArithmeticError",
        EvalAltResult::ErrorTooManyOperations(..) => "OperationLimitExceeded",
        _ => "RuntimeError",
    }
}

/// Short `"<Kind>: <message>"` description of a script fault.
pub(crate) fn describe_fault(err: &EvalAltResult) -> String {
    format!("{}: {err}", fault_kind(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── describe_vars ──

    #[test]
    fn describe_vars_hides_private_names_and_sorts() {
        let mut scope = Scope::new();
        scope.push("zeta", 1_i64);
        scope.push("_hidden", 2_i64);
        scope.push("alpha", "text".to_string());
        let lines = describe_vars(&scope);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  alpha: string = "));
        assert!(lines[0].contains("text"));
        assert!(lines[1].starts_with("  zeta: i64 = 1"));
    }

    #[test]
    fn describe_vars_uses_latest_shadow() {
        let mut scope = Scope::new();
        scope.push("x", 1_i64);
        scope.push("x", 2_i64);
        assert_eq!(describe_vars(&scope), vec!["  x: i64 = 2".to_string()]);
    }

    #[test]
    fn describe_vars_caps_preview() {
        let mut scope = Scope::new();
        scope.push("big", "y".repeat(1000));
        let lines = describe_vars(&scope);
        assert!(lines[0].ends_with("..."));
        assert!(lines[0].len() < 260);
    }

    #[test]
    fn compact_scope_keeps_latest_value_per_name() {
        let mut scope = Scope::new();
        scope.push("chunk", "old".to_string());
        scope.push("n", 1_i64);
        scope.push("chunk", "new".to_string());
        scope.push_constant("LIMIT", 3_i64);
        compact_scope(&mut scope);
        assert_eq!(scope.len(), 3);
        assert_eq!(scope.get_value::<String>("chunk").as_deref(), Some("new"));
        assert_eq!(scope.get_value::<i64>("n"), Some(1));
        assert_eq!(scope.is_constant("LIMIT"), Some(true));
    }

    // ── normalize_termination_quotes ──

    #[test]
    fn single_quoted_termination_becomes_string_literal() {
        assert_eq!(
            normalize_termination_quotes("let a = 1; FINAL_VAR( 'answer' );"),
            "let a = 1; FINAL_VAR(\"answer\");"
        );
        assert_eq!(normalize_termination_quotes("FINAL('42')"), "FINAL(\"42\")");
    }

    #[test]
    fn quotes_inside_single_quoted_argument_are_escaped() {
        assert_eq!(
            normalize_termination_quotes(r#"FINAL('it\'s "done"')"#),
            r#"FINAL("it's \"done\"")"#
        );
    }

    #[test]
    fn other_code_is_left_alone() {
        let code = r#"let c = 'x'; FINAL("already"); MY_FINAL('y');"#;
        assert!(matches!(normalize_termination_quotes(code), Cow::Borrowed(_)));
    }

    // ── query_options ──

    #[test]
    fn query_options_reads_overrides() {
        let mut map = Map::new();
        map.insert("model".into(), Dynamic::from("small".to_string()));
        map.insert("max_tokens".into(), Dynamic::from(256_i64));
        map.insert("system".into(), Dynamic::UNIT);
        let opts = query_options(&map).unwrap();
        assert_eq!(opts.model.as_deref(), Some("small"));
        assert_eq!(opts.max_tokens, Some(256));
        assert!(opts.system.is_none());
    }

    #[test]
    fn query_options_rejects_bad_max_tokens() {
        let mut map = Map::new();
        map.insert("max_tokens".into(), Dynamic::from("many".to_string()));
        assert!(query_options(&map).is_err());
        let mut map = Map::new();
        map.insert("max_tokens".into(), Dynamic::from(-1_i64));
        assert!(query_options(&map).is_err());
    }

    // ── OutputCapture ──

    #[test]
    fn capture_take_drains() {
        let capture = OutputCapture::default();
        capture.print("a");
        capture.eprint("b");
        assert_eq!(capture.take(), ("a\n".to_string(), "b\n".to_string()));
        assert_eq!(capture.take(), (String::new(), String::new()));
    }
}
