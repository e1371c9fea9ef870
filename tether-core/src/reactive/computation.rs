//! Computation signal bus.
//!
//! Reconcilers bracket their remote work with coarse-grained signals so a UI
//! knows when to render:
//!
//! - `Start`: a reconciliation round is beginning.
//! - `End`: the round resolved (initial snapshot or a terminal error).
//! - `Async`: something changed after the round, re-render out of band.
//!
//! Signals carry no payload. Consumers should treat each one as an
//! independent, idempotent "something may have changed" hint.

use tokio::sync::broadcast;

/// Buffered signals per receiver before a slow consumer starts lagging.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Start,
    End,
    Async,
}

/// Cloneable handle to a signal bus.
///
/// Clones share the same bus.
#[derive(Debug, Clone)]
pub struct Computation {
    sender: broadcast::Sender<Signal>,
}

impl Computation {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Listen for signals emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.sender.subscribe()
    }

    pub fn emit(&self, signal: Signal) {
        // No receivers is fine: nobody is rendering.
        let _ = self.sender.send(signal);
    }

    pub fn start(&self) {
        self.emit(Signal::Start);
    }

    pub fn end(&self) {
        self.emit(Signal::End);
    }

    pub fn asynchronous(&self) {
        self.emit(Signal::Async);
    }

    /// Number of live receivers.
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Computation {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain every signal currently buffered in `receiver`.
pub fn drain(receiver: &mut broadcast::Receiver<Signal>) -> Vec<Signal> {
    let mut signals = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(signal) => signals.push(signal),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_each_signal() {
        let computation = Computation::new();
        let mut rx = computation.subscribe();

        computation.start();
        computation.end();
        computation.asynchronous();

        assert_eq!(drain(&mut rx), vec![Signal::Start, Signal::End, Signal::Async]);
    }

    #[test]
    fn emit_without_listeners_is_fine() {
        let computation = Computation::new();
        computation.start();
        assert_eq!(computation.listener_count(), 0);
    }

    #[test]
    fn clones_share_the_bus() {
        let computation = Computation::new();
        let other = computation.clone();
        let mut rx = computation.subscribe();

        other.asynchronous();

        assert_eq!(drain(&mut rx), vec![Signal::Async]);
    }

    #[test]
    fn receivers_are_independent() {
        let computation = Computation::new();
        let mut a = computation.subscribe();
        let mut b = computation.subscribe();

        computation.end();

        assert_eq!(drain(&mut a), vec![Signal::End]);
        assert_eq!(drain(&mut b), vec![Signal::End]);
    }
}
