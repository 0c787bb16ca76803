/// Close countdown after a healthy sequence.

use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventSink, WatchdogEvent};

const TICK: Duration = Duration::from_secs(1);

pub struct AutoCloseCountdown {
    sink: EventSink,
    running: Mutex<Option<CancellationToken>>,
}

impl AutoCloseCountdown {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            running: Mutex::new(None),
        }
    }

    /// Publish the remaining seconds once per second, then `CloseRequested`.
    /// Restarting replaces a running countdown.
    pub fn start(&self, delay_secs: u32) -> JoinHandle<()> {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.running.lock().unwrap().replace(cancel.clone()) {
            previous.cancel();
        }

        let sink = self.sink.clone();
        sink.activity(format!(
            "Application will automatically close in {} seconds...",
            delay_secs
        ));
        sink.emit(WatchdogEvent::AutoCloseCountdown(delay_secs));

        tokio::spawn(async move {
            let mut remaining = delay_secs;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + TICK, TICK);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    sink.activity("Auto-closing application...");
                    sink.emit(WatchdogEvent::CloseRequested);
                    cancel.cancel();
                    return;
                }
                sink.emit(WatchdogEvent::AutoCloseCountdown(remaining));
            }
        })
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.running.lock().unwrap().take() {
            cancel.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|c| !c.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counts_down_then_requests_close() {
        let (sink, mut rx) = EventSink::channel();
        let countdown = AutoCloseCountdown::new(sink);

        countdown.start(3).await.unwrap();
        assert!(!countdown.is_active());

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| !matches!(e, WatchdogEvent::Activity(_)))
            .collect();
        assert_eq!(
            events,
            vec![
                WatchdogEvent::AutoCloseCountdown(3),
                WatchdogEvent::AutoCloseCountdown(2),
                WatchdogEvent::AutoCloseCountdown(1),
                WatchdogEvent::CloseRequested,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_close() {
        let (sink, mut rx) = EventSink::channel();
        let countdown = AutoCloseCountdown::new(sink);

        let handle = countdown.start(10);
        assert!(countdown.is_active());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        countdown.stop();
        handle.await.unwrap();

        assert!(!std::iter::from_fn(|| rx.try_recv().ok())
            .any(|e| e == WatchdogEvent::CloseRequested));
    }
}
