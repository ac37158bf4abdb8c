//! Observability seam.
//!
//! The engine logs through `tracing` but emits spans and counters through
//! this trait so deployments can wire any sink without the engine linking
//! against it. The default implementation drops everything.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// RAII guard returned by [`Tracer::span`]; the span ends when dropped.
pub struct SpanGuard {
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl SpanGuard {
    /// A guard that does nothing on drop.
    #[must_use]
    pub fn noop() -> Self {
        Self { on_drop: None }
    }

    /// A guard running `f` when the span ends.
    #[must_use]
    pub fn on_drop(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(f)),
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

/// Sink for spans, events and counters emitted by the engine.
pub trait Tracer: Send + Sync {
    /// Opens a span; it ends when the returned guard drops.
    fn span(&self, _name: &'static str) -> SpanGuard {
        SpanGuard::noop()
    }

    /// Records a point-in-time event with attributes.
    fn event(&self, _name: &'static str, _attrs: &[(&'static str, String)]) {}

    /// Adds `n` to the named counter.
    fn counter_add(&self, _name: &'static str, _n: u64) {}
}

/// Tracer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Tracer that accumulates counters in memory; test support.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl RecordingTracer {
    /// Creates an empty recorder behind an [`Arc`] for sharing with the
    /// pipeline.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current value of `name`, zero if never incremented.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }
}

impl Tracer for RecordingTracer {
    fn counter_add(&self, name: &'static str, n: u64) {
        *self.counters.lock().entry(name).or_insert(0) += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_noop_tracer_is_silent() {
        let t = NoopTracer;
        let _guard = t.span("anything");
        t.event("event", &[("k", "v".into())]);
        t.counter_add("c", 3);
    }

    #[test]
    fn test_span_guard_runs_on_drop() {
        static DROPPED: AtomicBool = AtomicBool::new(false);
        let guard = SpanGuard::on_drop(|| DROPPED.store(true, Ordering::SeqCst));
        assert!(!DROPPED.load(Ordering::SeqCst));
        drop(guard);
        assert!(DROPPED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_recording_tracer_counts() {
        let t = RecordingTracer::default();
        t.counter_add("retries", 1);
        t.counter_add("retries", 2);
        assert_eq!(t.counter("retries"), 3);
        assert_eq!(t.counter("unknown"), 0);
    }
}
