use crate::context::TransactionContext;
use std::time::{Duration, Instant};

/// Sink for spans and counters emitted at component boundaries: transport
/// entry/exit, scheduler per-pattern, per-agent invocation, per-tool call,
/// per-policy evaluation. No specific backend is assumed.
pub trait TelemetrySink: Send + Sync {
    fn span(&self, name: &str, ctx: &TransactionContext, elapsed: Duration);

    fn counter(&self, name: &str, value: u64);
}

/// Discards everything. Acceptable for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn span(&self, _name: &str, _ctx: &TransactionContext, _elapsed: Duration) {}

    fn counter(&self, _name: &str, _value: u64) {}
}

/// Routes spans and counters into the structured log stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn span(&self, name: &str, ctx: &TransactionContext, elapsed: Duration) {
        tracing::info!(
            span = name,
            transaction_id = %ctx.transaction_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "span"
        );
    }

    fn counter(&self, name: &str, value: u64) {
        tracing::info!(counter = name, value, "counter");
    }
}

/// Measures a boundary span and reports it to the sink on drop.
pub struct SpanTimer<'a> {
    sink: &'a dyn TelemetrySink,
    name: &'a str,
    ctx: &'a TransactionContext,
    start: Instant,
}

impl<'a> SpanTimer<'a> {
    pub fn start(sink: &'a dyn TelemetrySink, name: &'a str, ctx: &'a TransactionContext) -> Self {
        Self {
            sink,
            name,
            ctx,
            start: Instant::now(),
        }
    }
}

impl Drop for SpanTimer<'_> {
    fn drop(&mut self) {
        self.sink.span(self.name, self.ctx, self.start.elapsed());
    }
}
