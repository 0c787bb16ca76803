/// Polling log file tailer.
///
/// Works whether or not the file exists yet, and survives truncation and
/// rotation:
///
///   NotStarted → WaitingForFile → Open ⇄ WaitingForFile,  any → Disposed
///
/// All file state (handle + read cursor) sits behind one mutex shared by the
/// poll task and direct `read_*` calls. The lock is taken per access and never
/// held while events are delivered, so an observer may call back into the
/// tailer without deadlocking.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chunk size for backward reads in `read_tail_lines`.
const TAIL_CHUNK_SIZE: usize = 8192;

/// A physical line of the watched file.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub content: String,
    /// 1-based
    pub line_number: usize,
    /// Filled in by the scanner.
    pub timestamp: Option<NaiveDateTime>,
}

impl LogLine {
    pub fn new(content: impl Into<String>, line_number: usize) -> Self {
        Self {
            content: content.into(),
            line_number,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TailEvent {
    /// The file appeared (or reappeared after rotation) and was opened. Its
    /// content is reported from the following poll on.
    FileCreated(PathBuf),
    /// One complete line, in file order.
    NewLine(String),
    /// Emitted after a poll that read new content.
    FileChanged(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    NotStarted,
    WaitingForFile,
    Open,
    Disposed,
}

struct TailInner {
    path: Option<PathBuf>,
    file: Option<File>,
    cursor: u64,
    state: TailerState,
}

pub struct LogTailer {
    inner: Mutex<TailInner>,
}

impl Default for LogTailer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogTailer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TailInner {
                path: None,
                file: None,
                cursor: 0,
                state: TailerState::NotStarted,
            }),
        }
    }

    /// Begin watching `path`. Creates the containing directory if needed and
    /// opens the file right away when it already exists (cursor at 0). A file
    /// that exists but cannot be opened is treated like a missing one.
    pub fn start_monitoring(&self, path: impl Into<PathBuf>) -> anyhow::Result<()> {
        let path = path.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.state == TailerState::Disposed {
            anyhow::bail!("tailer has been disposed");
        }

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if !dir.exists() {
                info!(dir = %dir.display(), "Creating log directory");
                fs::create_dir_all(dir)?;
            }
        }

        inner.file = None;
        inner.cursor = 0;
        if path.exists() {
            match File::open(&path) {
                Ok(file) => {
                    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
                    debug!(path = %path.display(), bytes = len, "Opened log file");
                    inner.file = Some(file);
                    inner.state = TailerState::Open;
                }
                Err(e) => {
                    // Polling retries the open every tick.
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Cannot open log file, will retry"
                    );
                    inner.state = TailerState::WaitingForFile;
                }
            }
        } else {
            debug!(path = %path.display(), "Log file does not exist yet, polling for it");
            inner.state = TailerState::WaitingForFile;
        }
        inner.path = Some(path);
        Ok(())
    }

    /// One poll tick. Returns the events to publish, in order.
    pub fn poll(&self) -> Vec<TailEvent> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mut events = Vec::new();

        if matches!(inner.state, TailerState::NotStarted | TailerState::Disposed) {
            return events;
        }
        let Some(path) = inner.path.clone() else {
            return events;
        };

        if inner.file.is_some() {
            match check_rotation(&path, inner.file.as_ref()) {
                Rotation::None => {}
                Rotation::Gone => {
                    info!(path = %path.display(), "Log file disappeared, waiting for it to return");
                    inner.file = None;
                    inner.cursor = 0;
                    inner.state = TailerState::WaitingForFile;
                    return events;
                }
                Rotation::Replaced => {
                    info!(path = %path.display(), "Log file replaced, reopening");
                    inner.file = None;
                }
            }
        }

        if inner.file.is_none() {
            if !path.exists() {
                return events;
            }
            match File::open(&path) {
                Ok(file) => {
                    debug!(path = %path.display(), "Log file now exists, opened");
                    inner.file = Some(file);
                    inner.cursor = 0;
                    inner.state = TailerState::Open;
                    events.push(TailEvent::FileCreated(path.clone()));
                    // Content is left for the next tick so an observer can
                    // scan the new file first.
                    return events;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot open log file, will retry");
                    return events;
                }
            }
        }

        let cursor = inner.cursor;
        let Some(file) = inner.file.as_mut() else {
            return events;
        };
        let len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot stat log file, will retry");
                return events;
            }
        };

        let start = if len < cursor {
            warn!(previous = cursor, current = len, "Log file truncated, re-reading from start");
            0
        } else {
            cursor
        };
        if len == start {
            inner.cursor = start;
            return events;
        }

        match read_complete_lines(file, start, len) {
            Ok((lines, consumed)) => {
                inner.cursor = start + consumed;
                debug!(
                    lines = lines.len(),
                    from = start,
                    to = inner.cursor,
                    "Read new content"
                );
                if !lines.is_empty() {
                    events.extend(lines.into_iter().map(TailEvent::NewLine));
                    events.push(TailEvent::FileChanged(path));
                }
            }
            Err(e) => {
                inner.cursor = start;
                warn!(error = %e, "Failed reading new lines, will retry");
            }
        }
        events
    }

    /// Re-read the whole file as numbered lines and move the cursor to the
    /// end, so polling only reports content appended after this call.
    pub fn read_all_lines(&self) -> Vec<LogLine> {
        let mut inner = self.inner.lock().unwrap();
        let Some(file) = inner.file.as_mut() else {
            debug!("read_all_lines: no open file");
            return Vec::new();
        };

        let mut buf = Vec::new();
        let read = file
            .seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut buf));
        if let Err(e) = read {
            warn!(error = %e, "Failed reading log file");
            return Vec::new();
        }

        inner.cursor = buf.len() as u64;
        let lines: Vec<LogLine> = split_lines(&buf, true)
            .into_iter()
            .enumerate()
            .map(|(i, content)| LogLine::new(content, i + 1))
            .collect();
        debug!(lines = lines.len(), cursor = inner.cursor, "Read all lines");
        lines
    }

    /// Read up to `max_count` lines backwards from the end of the file.
    /// Lines are numbered 1..k relative to the returned subset; the cursor is
    /// left at end-of-file.
    pub fn read_tail_lines(&self, max_count: usize) -> Vec<LogLine> {
        let mut inner = self.inner.lock().unwrap();
        let Some(file) = inner.file.as_mut() else {
            return Vec::new();
        };
        let len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(error = %e, "Cannot stat log file");
                return Vec::new();
            }
        };

        let lines = match read_backwards(file, len, max_count) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(error = %e, "Failed reading log tail");
                return Vec::new();
            }
        };
        inner.cursor = len;

        lines
            .into_iter()
            .enumerate()
            .map(|(i, content)| LogLine::new(content, i + 1))
            .collect()
    }

    pub fn cursor(&self) -> u64 {
        self.inner.lock().unwrap().cursor
    }

    pub fn state(&self) -> TailerState {
        self.inner.lock().unwrap().state
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().unwrap().path.clone()
    }

    /// Release the handle. Later polls and reads become no-ops.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.file = None;
        inner.state = TailerState::Disposed;
        debug!("Tailer disposed");
    }

    /// Drive `poll()` every `interval` until `cancel` fires or the receiver
    /// goes away.
    pub fn spawn_polling(
        self: &Arc<Self>,
        interval: Duration,
        tx: mpsc::UnboundedSender<TailEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tailer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for event in tailer.poll() {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
        })
    }
}

enum Rotation {
    None,
    Gone,
    Replaced,
}

fn check_rotation(path: &Path, open: Option<&File>) -> Rotation {
    let on_disk = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Rotation::Gone,
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Some(Ok(held)) = open.map(File::metadata) {
            if held.ino() != on_disk.ino() || held.dev() != on_disk.dev() {
                return Rotation::Replaced;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (open, on_disk);
    Rotation::None
}

/// Read `[start, end)` and return the complete lines in it plus the number of
/// bytes they span. A trailing partial line is left for the next poll.
fn read_complete_lines(
    file: &mut File,
    start: u64,
    end: u64,
) -> std::io::Result<(Vec<String>, u64)> {
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((end - start) as usize);
    file.by_ref().take(end - start).read_to_end(&mut buf)?;

    let consumed = match buf.iter().rposition(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };
    Ok((split_lines(&buf[..consumed], false), consumed as u64))
}

/// Split on `\n`, dropping a trailing `\r` from each line. The empty segment
/// after a final newline is not a line; an unterminated final segment is kept
/// only when `keep_partial` is set.
fn split_lines(buf: &[u8], keep_partial: bool) -> Vec<String> {
    let mut lines = Vec::new();
    let mut segments = buf.split(|&b| b == b'\n').peekable();
    while let Some(segment) = segments.next() {
        let is_last = segments.peek().is_none();
        if is_last && (segment.is_empty() || !keep_partial) {
            break;
        }
        let segment = segment.strip_suffix(b"\r").unwrap_or(segment);
        lines.push(String::from_utf8_lossy(segment).into_owned());
    }
    lines
}

fn read_backwards(file: &mut File, len: u64, max_count: usize) -> std::io::Result<Vec<String>> {
    let mut lines: Vec<String> = Vec::with_capacity(max_count.min(1024));
    if max_count == 0 || len == 0 {
        return Ok(lines);
    }

    let mut chunk = vec![0u8; TAIL_CHUNK_SIZE];
    let mut position = len;
    // Bytes of the line being assembled, in reverse order.
    let mut current: Vec<u8> = Vec::with_capacity(256);
    let mut at_file_end = true;

    'chunks: while position > 0 {
        let to_read = (TAIL_CHUNK_SIZE as u64).min(position) as usize;
        position -= to_read as u64;
        file.seek(SeekFrom::Start(position))?;
        file.read_exact(&mut chunk[..to_read])?;

        for &byte in chunk[..to_read].iter().rev() {
            if byte == b'\n' {
                if at_file_end && current.is_empty() {
                    // Terminator of the last line, not an empty line.
                    at_file_end = false;
                    continue;
                }
                lines.push(finish_reversed(&mut current));
                if lines.len() >= max_count {
                    break 'chunks;
                }
            } else {
                current.push(byte);
            }
            at_file_end = false;
        }
    }

    if !current.is_empty() && lines.len() < max_count {
        lines.push(finish_reversed(&mut current));
    }

    lines.reverse();
    Ok(lines)
}

fn finish_reversed(current: &mut Vec<u8>) -> String {
    current.reverse();
    if current.last() == Some(&b'\r') {
        current.pop();
    }
    let line = String::from_utf8_lossy(current).into_owned();
    current.clear();
    line
}
