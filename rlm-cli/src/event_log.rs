use std::io::Write;
use std::path::Path;

use rlm_core::AgentEvent;

/// Appends run events to a JSONL file, one timestamped object per line.
pub struct EventLogger {
    file: std::io::BufWriter<std::fs::File>,
}

impl EventLogger {
    pub fn open(path: &Path, query: &str, input_chars: usize) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut logger = Self {
            file: std::io::BufWriter::new(file),
        };
        logger.write_json(&serde_json::json!({
            "type": "run_start",
            "ts": chrono::Local::now().to_rfc3339(),
            "query": query,
            "input_chars": input_chars,
        }))?;
        Ok(logger)
    }

    fn write_json(&mut self, value: &serde_json::Value) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.file, value)?;
        self.file.write_all(b"\n")?;
        Ok(())
    }

    pub fn log_event(&mut self, event: &AgentEvent) {
        let mut value = serde_json::to_value(event).unwrap_or_default();
        if let serde_json::Value::Object(ref mut map) = value {
            map.insert(
                "ts".into(),
                serde_json::Value::String(chrono::Local::now().to_rfc3339()),
            );
        }
        let _ = self.write_json(&value);
    }

    pub fn finish(mut self) -> anyhow::Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
