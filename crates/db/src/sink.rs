//! Line-delimited local sink.
//!
//! Backs the `mock` db mode and the optional frame journal: one JSON
//! document per line, appended per topic slug.

use std::io::Write;
use std::path::PathBuf;

use sync_core::Result;

/// Appends JSON lines to files derived from a `{topic}` pattern.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    pattern: String,
}

impl JsonlSink {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    fn path_for(&self, topic: &str) -> PathBuf {
        let slug = topic.replace('/', "_");
        PathBuf::from(self.pattern.replace("{topic}", &slug))
    }

    /// Append one document to the topic's file.
    pub fn append(&self, topic: &str, value: &serde_json::Value) -> Result<()> {
        let path = self.path_for(topic);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let line = serde_json::to_string(value)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_writes_one_line_per_document() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir
            .path()
            .join("messages_{topic}.jsonl")
            .to_string_lossy()
            .into_owned();
        let sink = JsonlSink::new(pattern);

        sink.append("spBv1.0/Secil/DBIRTH/EdgeA/DeviceA", &serde_json::json!({"a": 1}))
            .unwrap();
        sink.append("spBv1.0/Secil/DBIRTH/EdgeA/DeviceA", &serde_json::json!({"a": 2}))
            .unwrap();

        let contents = std::fs::read_to_string(
            dir.path().join("messages_spBv1.0_Secil_DBIRTH_EdgeA_DeviceA.jsonl"),
        )
        .unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
