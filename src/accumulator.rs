//! Result accumulator
//!
//! Collects [`AnalysisRecord`]s from worker threads and hands them to the
//! output sink in batches. The buffer and the sink share one lock, so the
//! size check, the drain and the clear happen atomically with respect to
//! concurrent `add` calls.
//!
//! A failed sink write is terminal. The sink may already hold part of the
//! failed batch, so nothing is sent to it again; the final flush discards
//! what is still buffered.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::output::{OutputError, OutputSink};
use crate::record::AnalysisRecord;

struct Inner {
    buffer: Vec<AnalysisRecord>,
    sink: Box<dyn OutputSink>,
    finalized: bool,
    failed: bool,
    written: usize,
    batches: usize,
    paths: Vec<PathBuf>,
}

impl Inner {
    fn drain(&mut self, is_final: bool) -> Result<Option<PathBuf>, OutputError> {
        let written = match self.sink.write_batch(&self.buffer, is_final) {
            Ok(written) => written,
            Err(e) => {
                self.failed = true;
                tracing::error!(pending = self.buffer.len(), "batch write failed: {}", e);
                return Err(e);
            }
        };
        self.written += self.buffer.len();
        if !self.buffer.is_empty() {
            self.batches += 1;
        }
        self.buffer.clear();

        if let Some(path) = &written {
            if !self.paths.contains(path) {
                self.paths.push(path.clone());
            }
        }
        Ok(written)
    }
}

/// Thread-safe batching buffer in front of an [`OutputSink`]
pub struct ResultAccumulator {
    batch_size: usize,
    inner: Mutex<Inner>,
}

impl ResultAccumulator {
    pub fn new(sink: Box<dyn OutputSink>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            inner: Mutex::new(Inner {
                buffer: Vec::with_capacity(batch_size),
                sink,
                finalized: false,
                failed: false,
                written: 0,
                batches: 0,
                paths: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, OutputError> {
        self.inner.lock().map_err(|_| OutputError::Closed)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Append one record, writing a batch once `batch_size` is reached
    ///
    /// Returns the path reported by the sink when a batch was written.
    pub fn add(&self, record: AnalysisRecord) -> Result<Option<PathBuf>, OutputError> {
        let mut inner = self.lock()?;
        if inner.finalized || inner.failed {
            return Err(OutputError::Closed);
        }
        inner.buffer.push(record);
        if inner.buffer.len() >= self.batch_size {
            return inner.drain(false);
        }
        Ok(None)
    }

    /// Append several records in order
    pub fn extend<I>(&self, records: I) -> Result<(), OutputError>
    where
        I: IntoIterator<Item = AnalysisRecord>,
    {
        for record in records {
            self.add(record)?;
        }
        Ok(())
    }

    /// Write out pending records
    ///
    /// With `is_final` the sink is finalized, even when nothing is pending.
    /// Finalization happens at most once; later calls return `Ok(None)`
    /// without touching the sink. After a failed write the final flush only
    /// marks the accumulator finalized and drops the unwritten records.
    pub fn flush(&self, is_final: bool) -> Result<Option<PathBuf>, OutputError> {
        let mut inner = self.lock()?;
        if inner.finalized {
            return Ok(None);
        }
        if inner.failed {
            if !is_final {
                return Err(OutputError::Closed);
            }
            tracing::warn!(
                discarded = inner.buffer.len(),
                written = inner.written,
                "output not finalized after a failed write"
            );
            inner.buffer.clear();
            inner.finalized = true;
            return Ok(None);
        }
        if !is_final && inner.buffer.is_empty() {
            return Ok(None);
        }

        let written = inner.drain(is_final)?;
        if is_final {
            inner.finalized = true;
            tracing::info!(records = inner.written, batches = inner.batches, "output finalized");
        }
        Ok(written)
    }

    /// Release the sink's resources
    pub fn cleanup(&self) -> Result<(), OutputError> {
        self.lock()?.sink.cleanup()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().map(|i| i.buffer.len()).unwrap_or(0)
    }

    /// Records accepted by the sink so far
    pub fn written(&self) -> usize {
        self.inner.lock().map(|i| i.written).unwrap_or(0)
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.lock().map(|i| i.finalized).unwrap_or(false)
    }

    /// Whether a sink write has failed
    pub fn has_failed(&self) -> bool {
        self.inner.lock().map(|i| i.failed).unwrap_or(true)
    }

    /// Distinct paths reported by the sink, in first-seen order
    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.inner
            .lock()
            .map(|i| i.paths.clone())
            .unwrap_or_default()
    }

    /// Primary output path of the sink
    pub fn output_path(&self) -> Option<PathBuf> {
        self.inner
            .lock()
            .ok()
            .map(|i| i.sink.output_path().to_path_buf())
    }
}
