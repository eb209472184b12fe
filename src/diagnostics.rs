use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::errors::PipelineResult;

const DEFAULT_BATCH_SIZE: usize = 25;

/// Coarse health reporting for the pipeline: lifecycle events (batch
/// completion, unresolved records, exhausted lookups) buffered in memory and
/// appended to a JSONL file in batches. Strictly advisory; callers treat
/// write failures as non-fatal.
#[derive(Clone)]
pub struct DiagnosticsLog {
    queue: Arc<Mutex<Vec<DiagnosticEvent>>>,
    buffer_path: PathBuf,
    batch_size: usize,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl DiagnosticEvent {
    fn new(name: String, payload: serde_json::Value) -> Self {
        Self {
            name,
            timestamp: Utc::now(),
            payload,
        }
    }
}

impl DiagnosticsLog {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> PipelineResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let buffer_path = data_dir.join("pipeline-diagnostics.jsonl");
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)?;

        Ok(Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) -> PipelineResult<()> {
        let mut queue = self.queue.lock();
        queue.push(DiagnosticEvent::new(name.into(), payload));
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> PipelineResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    fn persist_locked(&self, queue: &mut Vec<DiagnosticEvent>) -> PipelineResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        for event in queue.iter() {
            let line = serde_json::to_vec(event)?;
            file.write_all(&line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }
}
