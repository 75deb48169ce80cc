use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub ts: String,
    pub event: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub payload: Value,
}

impl EventRow {
    pub fn new(event: &str, run_id: &str, item_id: Option<&str>, payload: Value) -> Self {
        Self {
            ts: Utc::now().to_rfc3339(),
            event: event.to_string(),
            run_id: run_id.to_string(),
            item_id: item_id.map(str::to_string),
            payload,
        }
    }
}

/// Append-only lifecycle log. Write-only side channel; never read back to
/// reconstruct run state.
pub trait EventSink {
    fn append(&mut self, row: &EventRow) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlEventSink {
    writer: BufWriter<File>,
}

impl JsonlEventSink {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl EventSink for JsonlEventSink {
    fn append(&mut self, row: &EventRow) -> Result<()> {
        serde_json::to_writer(&mut self.writer, row)?;
        self.writer.write_all(b"\n")?;
        // Flushed per row so external tailers see events as they happen.
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct MemoryEventSink {
    pub rows: std::rc::Rc<std::cell::RefCell<Vec<EventRow>>>,
}

#[cfg(test)]
impl MemoryEventSink {
    pub(crate) fn events(&self) -> Vec<String> {
        self.rows.borrow().iter().map(|row| row.event.clone()).collect()
    }
}

#[cfg(test)]
impl EventSink for MemoryEventSink {
    fn append(&mut self, row: &EventRow) -> Result<()> {
        self.rows.borrow_mut().push(row.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
