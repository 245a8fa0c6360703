//! Output protocol: code segments, termination markers, and output truncation.

use std::sync::LazyLock;

use regex::Regex;

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```repl[ \t]*\r?\n(.*?)```").unwrap());
static FINAL_VAR_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"FINAL_VAR\(\s*['"](\w+)['"]\s*\)"#).unwrap());
static FINAL_CALL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bFINAL\(").unwrap());

/// How the answer was signalled.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationKind {
    Literal,
    ByReference { name: String },
}

/// A request to stop the run and return `value`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TerminationSignal {
    pub kind: TerminationKind,
    pub value: String,
}

impl TerminationSignal {
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            kind: TerminationKind::Literal,
            value: value.into(),
        }
    }

    pub fn by_reference(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: TerminationKind::ByReference { name: name.into() },
            value: value.into(),
        }
    }
}

/// Read access to a namespace, for resolving `FINAL_VAR('name')`.
pub trait VariableLookup {
    /// Stringified value of `name`, or `None` if it is unbound or unit.
    fn get_var(&self, name: &str) -> Option<String>;
}

impl VariableLookup for std::collections::HashMap<String, String> {
    fn get_var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Extract ```` ```repl ```` fenced code segments, trimmed, in order of appearance.
pub fn find_code_blocks(text: &str) -> Vec<String> {
    CODE_BLOCK
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect()
}

/// Look for a termination marker in `text`.
///
/// `FINAL_VAR('name')` is checked first and only resolves when `vars` is given and
/// binds `name`. Otherwise the text must end with `FINAL(...)` (trailing whitespace
/// allowed, the argument may span lines); one layer of matching quotes is stripped.
pub fn find_final_answer(
    text: &str,
    vars: Option<&dyn VariableLookup>,
) -> Option<TerminationSignal> {
    if let Some(caps) = FINAL_VAR_CALL.captures(text)
        && let Some(vars) = vars
    {
        let name = &caps[1];
        if let Some(value) = vars.get_var(name) {
            return Some(TerminationSignal::by_reference(name, value));
        }
    }

    let start = FINAL_CALL.find_iter(text).last()?.end();
    let argument = text[start..].trim_end().strip_suffix(')')?;
    Some(TerminationSignal::literal(strip_quotes(argument.trim())))
}

fn strip_quotes(answer: &str) -> &str {
    let bytes = answer.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &answer[1..answer.len() - 1];
        }
    }
    answer
}

/// Keep the first and last `max_length / 2` characters of an oversized text.
///
/// The omitted middle is replaced by a marker naming how many characters were cut.
/// Lengths are counted in characters, not bytes.
pub fn truncate_output(text: &str, max_length: usize) -> String {
    let total = text.chars().count();
    if total <= max_length {
        return text.to_string();
    }

    let keep = max_length / 2;
    let omitted = total - 2 * keep;
    let head_end = text
        .char_indices()
        .nth(keep)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let tail_start = if keep == 0 {
        text.len()
    } else {
        text.char_indices()
            .nth(total - keep)
            .map(|(i, _)| i)
            .unwrap_or(text.len())
    };
    format!(
        "{}\n\n... [{omitted} characters truncated] ...\n\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}
