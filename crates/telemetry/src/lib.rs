//! Logging setup and the process-wide log sink.
//!
//! Two shared resources live here: the `tracing` subscriber installed once
//! at startup, and the contractual log sink — a plain function accepting a
//! line of text, installed and cleared under an exclusive lock. The sink is
//! advisory: emitting through it must never change control flow, and a
//! missing sink is a no-op.

#![deny(unsafe_code)]

use std::sync::{Arc, RwLock};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Initialize structured logging (JSON) with env filter.
/// Set RUST_LOG, e.g., "info,vault=debug".
pub fn init_json_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// The process-wide log sink type.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

static SINK: RwLock<Option<LogSink>> = RwLock::new(None);

/// Install the process-wide log sink, replacing any previous one.
pub fn set_log_sink(sink: LogSink) {
    if let Ok(mut slot) = SINK.write() {
        *slot = Some(sink);
    }
}

/// Remove the installed log sink.
pub fn clear_log_sink() {
    if let Ok(mut slot) = SINK.write() {
        *slot = None;
    }
}

/// Send one line to the installed sink, if any.
pub fn emit(line: &str) {
    if let Ok(slot) = SINK.read() {
        if let Some(sink) = slot.as_ref() {
            sink(line);
        }
    }
}
