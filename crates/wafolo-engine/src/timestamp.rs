/// Timestamp extraction from raw log lines.
///
/// Formats are written in the token style used by the configuration file
/// (`yyyy-MM-dd HH:mm:ss.fff`) and translated to chrono's strftime syntax once
/// at construction. A format that already contains `%` is taken verbatim.
///
/// Extraction never fails loudly: anything unparseable is simply "no
/// timestamp", and callers decide what that means in their context.

use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;

/// Tried after the configured primary format, in this order.
pub const FALLBACK_FORMATS: &[&str] = &[
    "yyyy-MM-dd HH:mm:ss",
    "yyyy-MM-dd HH:mm:ss.fff",
    "dd/MM/yyyy HH:mm:ss",
    "MM/dd/yyyy HH:mm:ss",
    "yyyy-MM-ddTHH:mm:ss",
    "yyyy-MM-ddTHH:mm:ss.fff",
];

/// Extra characters scanned past the format length.
const PREFIX_SLACK: usize = 5;

/// Lenient second-chance parses, ISO-like first, then month-first, then
/// day-first numeric dates.
const GENERAL_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%m-%d-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
];

fn timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(\d{4}[-/]\d{2}[-/]\d{2}[T\s]\d{2}:\d{2}:\d{2}(?:\.\d{3})?)",
            r"|(\d{2}[-/]\d{2}[-/]\d{4}\s\d{2}:\d{2}:\d{2})",
        ))
        .expect("timestamp regex is valid")
    })
}

#[derive(Debug, Clone)]
struct Candidate {
    /// Length of the format as written, which bounds the scanned prefix.
    width: usize,
    strftime: String,
}

#[derive(Debug, Clone)]
pub struct TimestampExtractor {
    candidates: Vec<Candidate>,
}

impl TimestampExtractor {
    /// Build the ordered, de-duplicated candidate list `[primary] ++ fallbacks`.
    pub fn new(primary_format: &str) -> Self {
        let mut seen: Vec<&str> = Vec::new();
        let mut candidates = Vec::new();

        for format in std::iter::once(primary_format).chain(FALLBACK_FORMATS.iter().copied()) {
            let format = format.trim();
            if format.is_empty() || seen.contains(&format) {
                continue;
            }
            seen.push(format);
            candidates.push(Candidate {
                width: format.chars().count(),
                strftime: to_strftime(format),
            });
        }

        Self { candidates }
    }

    pub fn extract(&self, line: &str) -> Option<NaiveDateTime> {
        if line.trim().is_empty() {
            return None;
        }
        let line_len = line.chars().count();

        for candidate in &self.candidates {
            if line_len < candidate.width {
                continue;
            }
            let prefix = char_prefix(line, candidate.width + PREFIX_SLACK);
            let Some(found) = timestamp_regex().find(prefix) else {
                continue;
            };
            let text = found.as_str();

            if let Ok(parsed) = NaiveDateTime::parse_from_str(text, &candidate.strftime) {
                return Some(parsed);
            }
            if let Some(parsed) = parse_general(text) {
                return Some(parsed);
            }
        }
        None
    }

    /// Number of formats tried per line.
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }
}

/// Undated lines count as recent; without a threshold nothing is recent.
///
/// This is the live-path rule. The historical scanner deliberately does the
/// opposite and drops undated lines.
pub fn is_timestamp_recent(
    timestamp: Option<NaiveDateTime>,
    threshold: Option<NaiveDateTime>,
) -> bool {
    match (timestamp, threshold) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(ts), Some(threshold)) => ts >= threshold,
    }
}

fn parse_general(text: &str) -> Option<NaiveDateTime> {
    GENERAL_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

fn char_prefix(line: &str, max_chars: usize) -> &str {
    match line.char_indices().nth(max_chars) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Translate `yyyy-MM-dd HH:mm:ss.fff` style tokens to strftime.
fn to_strftime(format: &str) -> String {
    if format.contains('%') {
        return format.to_string();
    }

    const TOKENS: &[(&str, &str)] = &[
        ("yyyy", "%Y"),
        (".fff", "%.3f"),
        ("fff", "%3f"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
    ];

    let mut out = String::with_capacity(format.len() * 2);
    let mut rest = format;
    'outer: while !rest.is_empty() {
        for (token, replacement) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c != '\'' {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }
    out
}
