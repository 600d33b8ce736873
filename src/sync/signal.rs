//! Cancellation signals and composition.

use tokio_util::sync::CancellationToken;

/// Cancellation handle used throughout the core.
///
/// Every blocking wait in the tunnel takes or derives one of these, so
/// no task ever waits on something that can no longer happen.
pub type Signal = CancellationToken;

/// Derive a signal that fires the first time any source fires.
///
/// Sources that are already cancelled make the derived signal fire
/// immediately. An empty source list yields a signal that never fires.
pub fn link<I>(sources: I) -> Signal
where
    I: IntoIterator<Item = Signal>,
{
    let sources: Vec<Signal> = sources.into_iter().collect();
    let derived = Signal::new();

    if sources.is_empty() {
        return derived;
    }
    if sources.iter().any(|s| s.is_cancelled()) {
        derived.cancel();
        return derived;
    }

    let fire = derived.clone();
    tokio::spawn(async move {
        let waits = sources
            .iter()
            .map(|s| Box::pin(s.cancelled()))
            .collect::<Vec<_>>();
        futures_util::future::select_all(waits).await;
        fire.cancel();
    });

    derived
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn linked_signal_fires_on_first_source() {
        let a = Signal::new();
        let b = Signal::new();
        let linked = link([a.clone(), b.clone()]);

        assert!(!linked.is_cancelled());
        b.cancel();

        tokio::time::timeout(Duration::from_secs(1), linked.cancelled())
            .await
            .expect("linked signal should fire");
        assert!(!a.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_source_fires_immediately() {
        let a = Signal::new();
        a.cancel();
        let linked = link([Signal::new(), a]);
        assert!(linked.is_cancelled());
    }

    #[tokio::test]
    async fn empty_link_never_fires() {
        let linked = link([]);
        assert!(!linked.is_cancelled());
    }
}
