//! Operator notification side-channel.

use tracing::info;

/// Fire-and-forget human-readable notification sink.
pub trait Notifier: Send + Sync {
    fn send(&self, text: &str);
}

/// Default `Notifier`: writes to the `tracing` log at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn send(&self, text: &str) {
        info!(notification = text, "operator notification");
    }
}

/// `Notifier` that discards everything. Useful where the caller has no
/// operator channel configured at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn send(&self, _text: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_notifier_does_not_panic() {
        let n = LoggingNotifier;
        n.send("agent claude spawned for card c1");
    }

    #[test]
    fn noop_notifier_does_nothing_observable() {
        let n = NoopNotifier;
        n.send("anything");
    }
}
