/// One-shot historical scan of the log.
///
/// Classifies the most recent trigger/expected pairing of the current session.
/// Undated lines are excluded from the relevant set here, unlike the live path
/// where an undated trigger counts as recent.

use chrono::NaiveDateTime;
use tracing::debug;

use crate::events::EventSink;
use crate::tailer::LogLine;
use crate::timestamp::TimestampExtractor;
use crate::ACTIVITY_TIME_FORMAT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    NoTriggerFound,
    SequenceCompleted,
    IncompleteSequence,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub status: ScanStatus,
    /// Set for `SequenceCompleted` and `IncompleteSequence`.
    pub last_trigger: Option<LogLine>,
    /// Line number of the completing expected line, if any.
    pub completed_by: Option<usize>,
    pub total_lines: usize,
    pub relevant_lines: usize,
    pub trigger_count: usize,
    pub expected_count: usize,
}

/// Case-insensitive substring test.
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

pub struct SessionScanner<'a> {
    extractor: &'a TimestampExtractor,
    sink: Option<EventSink>,
}

impl<'a> SessionScanner<'a> {
    pub fn new(extractor: &'a TimestampExtractor) -> Self {
        Self {
            extractor,
            sink: None,
        }
    }

    /// Narrate the scan to the activity stream.
    pub fn with_activity(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    fn activity(&self, message: String) {
        match &self.sink {
            Some(sink) => sink.activity(message),
            None => debug!("{}", message),
        }
    }

    /// Assigns timestamps to `lines` in place and classifies them.
    pub fn scan(
        &self,
        lines: &mut [LogLine],
        session_threshold: NaiveDateTime,
        trigger_pattern: &str,
        expected_pattern: &str,
    ) -> ScanResult {
        for line in lines.iter_mut() {
            line.timestamp = self.extractor.extract(&line.content);
        }

        let total_lines = lines.len();
        self.activity(format!("Read {} total lines from log file.", total_lines));

        let relevant: Vec<&LogLine> = lines
            .iter()
            .filter(|l| l.timestamp.is_some_and(|ts| ts >= session_threshold))
            .collect();
        self.activity(format!(
            "Filtered out {} lines from before session threshold.",
            total_lines - relevant.len()
        ));
        self.activity(format!(
            "Analyzing {} lines from current session.",
            relevant.len()
        ));

        let triggers: Vec<&LogLine> = relevant
            .iter()
            .copied()
            .filter(|l| contains_ignore_case(&l.content, trigger_pattern))
            .collect();
        let expected: Vec<&LogLine> = relevant
            .iter()
            .copied()
            .filter(|l| contains_ignore_case(&l.content, expected_pattern))
            .collect();
        self.activity(format!(
            "Found {} trigger line(s) and {} expected line(s) in current session.",
            triggers.len(),
            expected.len()
        ));

        let mut result = ScanResult {
            status: ScanStatus::NoTriggerFound,
            last_trigger: None,
            completed_by: None,
            total_lines,
            relevant_lines: relevant.len(),
            trigger_count: triggers.len(),
            expected_count: expected.len(),
        };

        let Some(last_trigger) = triggers.iter().max_by_key(|l| l.line_number) else {
            self.activity(
                "No trigger pattern found in current session. Waiting for new entries...".into(),
            );
            return result;
        };
        self.activity(format!(
            "Last trigger at line {}: {}",
            last_trigger.line_number,
            last_trigger
                .timestamp
                .map(|ts| ts.format(ACTIVITY_TIME_FORMAT).to_string())
                .unwrap_or_else(|| "no timestamp".into())
        ));

        let completing = expected
            .iter()
            .filter(|e| e.line_number > last_trigger.line_number)
            .max_by_key(|e| e.line_number);

        result.last_trigger = Some((*last_trigger).clone());
        match completing {
            Some(line) => {
                self.activity(format!(
                    "Found expected line after last trigger at line {}.",
                    line.line_number
                ));
                self.activity("Sequence completed in current session. System is healthy.".into());
                result.status = ScanStatus::SequenceCompleted;
                result.completed_by = Some(line.line_number);
            }
            None => {
                self.activity(
                    "INCOMPLETE SEQUENCE: Trigger found without expected line in current session."
                        .into(),
                );
                result.status = ScanStatus::IncompleteSequence;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn threshold() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn lines(text: &[&str]) -> Vec<LogLine> {
        text.iter()
            .enumerate()
            .map(|(i, l)| LogLine::new(*l, i + 1))
            .collect()
    }

    fn scan(text: &[&str]) -> ScanResult {
        let extractor = TimestampExtractor::new("yyyy-MM-dd HH:mm:ss");
        let mut lines = lines(text);
        SessionScanner::new(&extractor).scan(&mut lines, threshold(), "BEGIN JOB", "job done")
    }

    #[test]
    fn no_trigger() {
        let result = scan(&["2024-03-01 12:01:00 idle", "2024-03-01 12:02:00 job done"]);
        assert_eq!(result.status, ScanStatus::NoTriggerFound);
        assert!(result.last_trigger.is_none());
        assert_eq!(result.relevant_lines, 2);
    }

    #[test]
    fn completed_sequence() {
        let result = scan(&[
            "2024-03-01 12:01:00 begin job",
            "2024-03-01 12:02:00 Job Done",
        ]);
        assert_eq!(result.status, ScanStatus::SequenceCompleted);
        assert_eq!(result.last_trigger.unwrap().line_number, 1);
        assert_eq!(result.completed_by, Some(2));
    }

    #[test]
    fn last_trigger_wins() {
        let result = scan(&[
            "2024-03-01 12:01:00 begin job",
            "2024-03-01 12:02:00 job done",
            "2024-03-01 12:03:00 begin job",
            "2024-03-01 12:03:30 still working",
        ]);
        assert_eq!(result.status, ScanStatus::IncompleteSequence);
        let trigger = result.last_trigger.unwrap();
        assert_eq!(trigger.line_number, 3);
        assert_eq!(
            trigger.timestamp,
            Some(threshold() + chrono::Duration::minutes(3))
        );
        assert_eq!(result.trigger_count, 2);
    }

    #[test]
    fn completion_uses_greatest_expected_line() {
        let result = scan(&[
            "2024-03-01 12:01:00 begin job",
            "2024-03-01 12:02:00 job done",
            "2024-03-01 12:02:10 job done",
        ]);
        assert_eq!(result.completed_by, Some(3));
    }

    #[test]
    fn stale_and_undated_lines_are_ignored() {
        let result = scan(&[
            "2024-03-01 11:00:00 begin job",
            "begin job without a timestamp",
            "2024-03-01 12:05:00 unrelated",
        ]);
        assert_eq!(result.status, ScanStatus::NoTriggerFound);
        assert_eq!(result.total_lines, 3);
        assert_eq!(result.relevant_lines, 1);
    }

    #[test]
    fn stale_expected_does_not_complete() {
        let result = scan(&[
            "2024-03-01 11:59:00 job done",
            "2024-03-01 12:00:00 begin job",
        ]);
        assert_eq!(result.status, ScanStatus::IncompleteSequence);
    }

    #[test]
    fn narrates_to_activity_sink() {
        let extractor = TimestampExtractor::new("yyyy-MM-dd HH:mm:ss");
        let (sink, mut rx) = EventSink::channel();
        let mut lines = lines(&["2024-03-01 12:01:00 begin job"]);
        SessionScanner::new(&extractor)
            .with_activity(sink)
            .scan(&mut lines, threshold(), "begin job", "job done");

        let mut messages = Vec::new();
        while let Ok(crate::events::WatchdogEvent::Activity(m)) = rx.try_recv() {
            messages.push(m);
        }
        assert_eq!(messages.first().unwrap(), "Read 1 total lines from log file.");
        assert!(messages.last().unwrap().starts_with("INCOMPLETE SEQUENCE"));
    }

    #[test]
    fn case_insensitive_match() {
        assert!(contains_ignore_case("Operation COMPLETED", "completed"));
        assert!(!contains_ignore_case("Operation", "completed"));
    }
}
