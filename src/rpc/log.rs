//! src/rpc/log.rs
//!
//! A tracing `Layer` that mirrors emitted events onto a broadcast channel,
//! backing the RPC `monitor` command (§4.13) the same way a CLI's `serf
//! monitor` subcommand tails agent logs over the IPC connection rather than
//! reading a file on disk.

use std::fmt::Write as _;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Capacity of the broadcast channel backing `monitor` subscribers. A slow
/// consumer drops the oldest lines rather than stall the tracing event path.
const LOG_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct LogLine {
    pub level: Level,
    pub text: String,
}

/// Installed once into the global subscriber (see `main.rs`); every `monitor`
/// subscription gets its own receiver off the same broadcast sender.
pub struct LogTap {
    tx: broadcast::Sender<LogLine>,
}

impl LogTap {
    pub fn new() -> (Self, broadcast::Sender<LogLine>) {
        let (tx, _rx) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        (Self { tx: tx.clone() }, tx)
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S> Layer<S> for LogTap
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let text = format!("{}:{}{}", event.metadata().target(), visitor.message, visitor.fields);
        let _ = self.tx.send(LogLine { level: *event.metadata().level(), text });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_lines_sent_after_they_subscribe() {
        let (_tap, tx) = LogTap::new();
        let mut rx = tx.subscribe();
        tx.send(LogLine { level: Level::INFO, text: "hello".into() }).unwrap();
        let line = rx.try_recv().unwrap();
        assert_eq!(line.text, "hello");
    }
}
