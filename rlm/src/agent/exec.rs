use tokio::sync::mpsc;

use crate::session::{ExecResult, Session};

use super::{AgentEvent, send_event};

/// Output gathered from the code segments of a single round.
pub(crate) struct ExecAccumulator {
    outputs: Vec<String>,
    pub had_failure: bool,
}

impl ExecAccumulator {
    pub fn new() -> Self {
        Self {
            outputs: Vec::new(),
            had_failure: false,
        }
    }

    pub fn push(&mut self, result: &ExecResult) {
        self.had_failure |= result.exception.is_some();
        let block = segment_output(result);
        if !block.is_empty() {
            self.outputs.push(block);
        }
    }

    /// All segment outputs joined by newlines, or `(no output)` if every segment was silent.
    pub fn combined(&self) -> String {
        if self.outputs.is_empty() {
            "(no output)".to_string()
        } else {
            self.outputs.join("\n")
        }
    }
}

/// stdout, then labeled stderr and exception blocks when present.
pub(crate) fn segment_output(result: &ExecResult) -> String {
    let mut out = result.stdout.clone();
    if !result.stderr.is_empty() {
        out.push_str("\n[stderr]\n");
        out.push_str(&result.stderr);
    }
    if let Some(exception) = &result.exception {
        out.push_str("\n[exception]\n");
        out.push_str(exception);
    }
    out
}

/// Execute a code segment, emit events, and collect its output into the accumulator.
pub(crate) async fn execute_and_collect(
    session: &Session,
    code: &str,
    round: usize,
    index: usize,
    acc: &mut ExecAccumulator,
    event_tx: &mpsc::Sender<AgentEvent>,
) {
    send_event(
        event_tx,
        AgentEvent::CodeBlock {
            round,
            index,
            code: code.to_string(),
        },
    )
    .await;

    let result = session.execute(code).await;
    let preview: String = segment_output(&result).chars().take(500).collect();
    tracing::debug!("segment {} output ({}ms): {preview}", index + 1, result.duration_ms);

    send_event(
        event_tx,
        AgentEvent::CodeOutput {
            round,
            index,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            exception: result.exception.clone(),
            duration_ms: result.duration_ms,
        },
    )
    .await;
    acc.push(&result);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stdout: &str, stderr: &str, exception: Option<&str>) -> ExecResult {
        ExecResult {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exception: exception.map(String::from),
            duration_ms: 0,
        }
    }

    #[test]
    fn segment_output_labels_blocks() {
        let r = result("out\n", "warn\n", Some("NameError: x"));
        assert_eq!(
            segment_output(&r),
            "out\n\n[stderr]\nwarn\n\n[exception]\nNameError: x"
        );
        assert_eq!(segment_output(&result("only\n", "", None)), "only\n");
    }

    #[test]
    fn silent_round_reports_no_output() {
        let mut acc = ExecAccumulator::new();
        acc.push(&result("", "", None));
        assert_eq!(acc.combined(), "(no output)");
        assert!(!acc.had_failure);
    }

    #[test]
    fn segments_are_joined_in_order() {
        let mut acc = ExecAccumulator::new();
        acc.push(&result("a", "", None));
        acc.push(&result("", "", None));
        acc.push(&result("", "", Some("TypeError: bad")));
        assert_eq!(acc.combined(), "a\n\n[exception]\nTypeError: bad");
        assert!(acc.had_failure);
    }
}
