/// Tailer lifecycle and event republishing.
///
/// Every `start_monitoring` call tears down the previous tailer (stopping its
/// poll task) and builds a fresh one, so a restart never leaks a handle or
/// double-reports lines. Tail events are mapped onto the shared
/// `WatchdogEvent` stream.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{EventSink, MonitoringStatus, WatchdogEvent};
use crate::tailer::{LogLine, LogTailer, TailEvent, TailerState};
use crate::timestamp::TimestampExtractor;
use crate::DEFAULT_POLL_INTERVAL_MS;

struct ActiveTail {
    tailer: Arc<LogTailer>,
    cancel: CancellationToken,
}

pub struct WatchdogOrchestrator {
    sink: EventSink,
    extractor: TimestampExtractor,
    poll_interval: Duration,
    active: Mutex<Option<ActiveTail>>,
}

impl WatchdogOrchestrator {
    pub fn new(sink: EventSink, timestamp_format: &str) -> Self {
        Self {
            sink,
            extractor: TimestampExtractor::new(timestamp_format),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            active: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// (Re)start tailing `path`. Must be called inside a tokio runtime.
    pub fn start_monitoring(&self, path: &Path) -> anyhow::Result<()> {
        self.stop_active();

        let tailer = Arc::new(LogTailer::new());
        if let Err(e) = tailer.start_monitoring(path) {
            self.sink
                .status(MonitoringStatus::Error, format!("Cannot monitor log file: {}", e));
            self.sink
                .activity(format!("ERROR: Cannot monitor {}: {}", path.display(), e));
            return Err(e);
        }

        if tailer.state() == TailerState::WaitingForFile {
            self.sink
                .status(MonitoringStatus::WaitingForLogFile, "Waiting for log file...");
            self.sink
                .activity(format!("Log file does not exist yet: {}", path.display()));
            self.sink.activity("Waiting for log file to be created...");
        } else {
            self.sink
                .status(MonitoringStatus::Active, "Monitoring active");
            self.sink.activity("Monitoring started successfully.");
        }

        let cancel = CancellationToken::new();
        let (tail_tx, tail_rx) = mpsc::unbounded_channel();
        tailer.spawn_polling(self.poll_interval, tail_tx, cancel.clone());
        tokio::spawn(forward(tail_rx, self.sink.clone()));

        *self.active.lock().unwrap() = Some(ActiveTail { tailer, cancel });
        Ok(())
    }

    fn stop_active(&self) {
        if let Some(previous) = self.active.lock().unwrap().take() {
            debug!("Replacing previous tailer");
            previous.cancel.cancel();
            previous.tailer.dispose();
        }
    }

    fn tailer(&self) -> Option<Arc<LogTailer>> {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| Arc::clone(&a.tailer))
    }

    pub fn read_all_lines(&self) -> Vec<LogLine> {
        self.tailer()
            .map(|t| t.read_all_lines())
            .unwrap_or_default()
    }

    pub fn read_tail_lines(&self, max_count: usize) -> Vec<LogLine> {
        self.tailer()
            .map(|t| t.read_tail_lines(max_count))
            .unwrap_or_default()
    }

    pub fn extract_timestamp(&self, line: &str) -> Option<NaiveDateTime> {
        self.extractor.extract(line)
    }

    pub fn extractor(&self) -> &TimestampExtractor {
        &self.extractor
    }

    pub fn tailer_state(&self) -> TailerState {
        self.tailer()
            .map(|t| t.state())
            .unwrap_or(TailerState::NotStarted)
    }

    pub fn dispose(&self) {
        self.stop_active();
    }
}

impl Drop for WatchdogOrchestrator {
    fn drop(&mut self) {
        self.stop_active();
    }
}

async fn forward(mut rx: mpsc::UnboundedReceiver<TailEvent>, sink: EventSink) {
    while let Some(event) = rx.recv().await {
        match event {
            TailEvent::FileCreated(path) => {
                sink.activity(format!("Log file created: {}", path.display()));
                sink.emit(WatchdogEvent::FileCreated(path));
            }
            TailEvent::FileChanged(path) => {
                debug!(path = %path.display(), "Log file changed");
                sink.emit(WatchdogEvent::FileChanged(path));
            }
            TailEvent::NewLine(line) => sink.emit(WatchdogEvent::NewLine(line)),
        }
    }
}
