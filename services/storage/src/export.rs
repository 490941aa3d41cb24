//! Export of stored events to JSON documents.

use crate::event::StoredEvent;
use serde::Deserialize;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to write export: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unknown export format: {0} (expected json or ndjson)")]
    UnknownFormat(String),
}

/// Output layout of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// One pretty-printed JSON array
    #[default]
    Json,
    /// One compact JSON document per line
    #[serde(alias = "jsonl")]
    Ndjson,
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "ndjson" | "jsonl" => Ok(ExportFormat::Ndjson),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "json"),
            ExportFormat::Ndjson => write!(f, "ndjson"),
        }
    }
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Ndjson => "application/x-ndjson",
        }
    }
}

/// Write `events` to `writer`; returns the number of events written.
pub fn write_export<W: Write>(
    events: &[StoredEvent],
    format: ExportFormat,
    mut writer: W,
) -> Result<usize, ExportError> {
    match format {
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, events)?;
            writeln!(writer)?;
        }
        ExportFormat::Ndjson => {
            for event in events {
                serde_json::to_writer(&mut writer, event)?;
                writeln!(writer)?;
            }
        }
    }
    writer.flush()?;
    Ok(events.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::{create_detection, create_test_event};
    use uuid::Uuid;

    fn sample_events() -> Vec<StoredEvent> {
        ["cam-1", "cam-2"]
            .into_iter()
            .map(|source| StoredEvent {
                id: Uuid::new_v4(),
                event: create_test_event(source, &[create_detection("truck", 0.75)]),
            })
            .collect()
    }

    #[test]
    fn test_json_export_is_array() {
        let events = sample_events();
        let mut buffer = Vec::new();
        let written = write_export(&events, ExportFormat::Json, &mut buffer).unwrap();
        assert_eq!(written, 2);

        let parsed: Vec<StoredEvent> = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(parsed, events);
    }

    #[test]
    fn test_ndjson_export_one_event_per_line() {
        let events = sample_events();
        let mut buffer = Vec::new();
        write_export(&events, ExportFormat::Ndjson, &mut buffer).unwrap();

        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["source_id"], "cam-1");
        assert!(first["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("ndjson".parse::<ExportFormat>().unwrap(), ExportFormat::Ndjson);
        assert!("csv".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_query_format_accepts_jsonl_alias() {
        let parsed: ExportFormat = serde_json::from_str("\"jsonl\"").unwrap();
        assert_eq!(parsed, ExportFormat::Ndjson);
        let parsed: ExportFormat = serde_json::from_str("\"ndjson\"").unwrap();
        assert_eq!(parsed, ExportFormat::Ndjson);
        assert!(serde_json::from_str::<ExportFormat>("\"csv\"").is_err());
    }
}
