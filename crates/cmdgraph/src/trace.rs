//! Low-level API call trace.
//!
//! Each device-facing call made while dispatching a command (constant-buffer argument binding,
//! kernel launch, copies, fills) produces one [`ApiCallRecord`]. Records render to the textual
//! form external trace checkers match against:
//!
//! ```text
//! ---> kernel_set_arg_mem_obj(
//! 	<unknown> : report
//! 	<unknown> : 0
//! 	<unknown> : 0
//! 	<unknown> : 0
//! ) ---> 	result : SUCCESS
//! ```

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::backend::spec::BackendResult;

static NEXT_TRACE_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TRACE_THREAD_ID: u64 = NEXT_TRACE_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_trace_thread_id() -> u64 {
    TRACE_THREAD_ID.with(|tid| *tid)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCallRecord {
    pub seq: u64,
    pub name: String,
    pub args: Vec<String>,
    pub result: String,
    pub thread: u64,
}

impl ApiCallRecord {
    pub fn render(&self) -> String {
        let mut out = format!("---> {}(\n", self.name);
        for arg in &self.args {
            let _ = writeln!(out, "\t<unknown> : {arg}");
        }
        let _ = write!(out, ") ---> \tresult : {}", self.result);
        out
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn succeeded(&self) -> bool {
        self.result == "SUCCESS"
    }
}

/// Per-context recorder of [`ApiCallRecord`]s.
pub struct ApiTrace {
    enabled: AtomicBool,
    echo: AtomicBool,
    next_seq: AtomicU64,
    records: Mutex<Vec<ApiCallRecord>>,
}

impl ApiTrace {
    pub fn new(enabled: bool, echo: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled || echo),
            echo: AtomicBool::new(echo),
            next_seq: AtomicU64::new(0),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Prints every record to stdout as it is captured.
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.records
            .lock()
            .expect("api trace mutex poisoned")
            .clear();
    }

    pub fn take_records(&self) -> Vec<ApiCallRecord> {
        let mut records = self.records.lock().expect("api trace mutex poisoned");
        std::mem::take(&mut *records)
    }

    pub fn records_named(&self, name: &str) -> Vec<ApiCallRecord> {
        self.records
            .lock()
            .expect("api trace mutex poisoned")
            .iter()
            .filter(|record| record.name == name)
            .cloned()
            .collect()
    }

    pub fn take_trace_json(&self) -> Option<String> {
        let records = self.take_records();
        if records.is_empty() {
            return None;
        }
        serde_json::to_string(&records).ok()
    }

    /// Renders and drains all records in capture order.
    pub fn take_rendered(&self) -> String {
        self.take_records()
            .iter()
            .map(ApiCallRecord::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub(crate) fn record<T>(&self, name: &str, args: Vec<String>, result: &BackendResult<T>) {
        if !self.is_enabled() {
            return;
        }
        let record = ApiCallRecord {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            args,
            result: match result {
                Ok(_) => "SUCCESS".to_string(),
                Err(err) => format!("ERROR({err})"),
            },
            thread: current_trace_thread_id(),
        };
        if self.echo.load(Ordering::Relaxed) {
            println!("{}", record.render());
        }
        self.records
            .lock()
            .expect("api trace mutex poisoned")
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_matches_trace_pattern() {
        let trace = ApiTrace::new(true, false);
        trace.record::<()>(
            "kernel_set_arg_mem_obj",
            vec!["k".into(), "0".into(), "0".into(), "0".into()],
            &Ok(()),
        );
        let rendered = trace.take_rendered();
        assert_eq!(
            rendered,
            "---> kernel_set_arg_mem_obj(\n\t<unknown> : k\n\t<unknown> : 0\n\t<unknown> : 0\n\t<unknown> : 0\n) ---> \tresult : SUCCESS"
        );
    }

    #[test]
    fn disabled_trace_records_nothing() {
        let trace = ApiTrace::new(false, false);
        trace.record::<()>("enqueue_fill", Vec::new(), &Ok(()));
        assert!(trace.take_trace_json().is_none());
        trace.enable();
        trace.record::<()>("enqueue_fill", Vec::new(), &Ok(()));
        let json = trace.take_trace_json().unwrap();
        assert!(json.contains("enqueue_fill"));
    }
}
