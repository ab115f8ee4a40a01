//! Optional JSONL trace writer for diagnosing block timing and recovery.
//!
//! Enable via `--debug-trace <path>`.  Each line is a self-contained JSON
//! object with at least a `t` field (seconds since the writer was created,
//! f64) and an `event` field.
//!
//! Example output:
//! ```jsonl
//! {"t":0.001,"event":"page","from_index":1,"blocks":50}
//! {"t":0.002,"event":"blk_start","index":1}
//! {"t":0.078,"event":"blk_connected","index":1,"latency_ms":75.1}
//! {"t":0.410,"event":"blk_done","index":1,"chunks":16,"elapsed_ms":408.2}
//! {"t":0.411,"event":"flush","index":1,"bytes":4194304}
//! {"t":0.900,"event":"revert","reason":"network","bytes":1048576}
//! ```

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;

pub struct TraceWriter {
    file: Mutex<std::io::BufWriter<std::fs::File>>,
    epoch: Instant,
}

impl TraceWriter {
    pub fn new(path: &std::path::Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self {
            file: Mutex::new(std::io::BufWriter::with_capacity(64 * 1024, file)),
            epoch: Instant::now(),
        })
    }

    /// Write a JSON event line.  The `t` field is injected automatically.
    pub fn log(&self, mut obj: Value) {
        let t = self.epoch.elapsed().as_secs_f64();
        if let Some(map) = obj.as_object_mut() {
            map.insert("t".into(), Value::from(t));
        }
        let mut f = self.file.lock();
        let _ = serde_json::to_writer(&mut *f, &obj);
        let _ = writeln!(&mut *f);
    }

    /// Push buffered lines to disk; called when a transfer ends.
    pub fn flush(&self) {
        let _ = self.file.lock().flush();
    }
}

/// Zero-cost trace helper.  The closure is only called when tracing is enabled,
/// so `json!()` allocations are skipped entirely in the common (no-trace) path.
#[inline]
pub fn trace_log(trace: &Option<Arc<TraceWriter>>, f: impl FnOnce() -> Value) {
    if let Some(tw) = trace {
        tw.log(f());
    }
}
