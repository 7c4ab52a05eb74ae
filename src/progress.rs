//! Pipeline progress reporting.
//!
//! Reports observable progress during `dix index` so users see what is
//! being crawled, how much is left, and which stages were served from the
//! cache. Progress is emitted on **stderr** so stdout remains parseable for
//! scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Crawling: pages fetched and files seen so far. Total unknown.
    Crawl { pages: u64, files: u64 },
    /// Documents fetched and rendered.
    Extract { n: u64, total: u64 },
    /// Records embedded (or failed) so far.
    Embed { n: u64, total: u64 },
    /// Records written to the index.
    Write { n: u64, total: u64 },
    /// A stage was loaded from its snapshot instead of recomputed.
    CacheHit { stage: String, records: u64 },
}

impl ProgressEvent {
    fn phase(&self) -> &'static str {
        match self {
            ProgressEvent::Crawl { .. } => "crawl",
            ProgressEvent::Extract { .. } => "extract",
            ProgressEvent::Embed { .. } => "embed",
            ProgressEvent::Write { .. } => "write",
            ProgressEvent::CacheHit { .. } => "cache",
        }
    }
}

/// Reports pipeline progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: `extract  12 / 40 documents (30%)`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Crawl { pages, files } => format!(
                "crawl  {} pages, {} files\n",
                format_number(*pages),
                format_number(*files)
            ),
            ProgressEvent::Extract { n, total } => counted("extract", *n, *total, "documents"),
            ProgressEvent::Embed { n, total } => counted("embed", *n, *total, "records"),
            ProgressEvent::Write { n, total } => counted("write", *n, *total, "records"),
            ProgressEvent::CacheHit { stage, records } => format!(
                "cache  {} snapshot loaded ({} records)\n",
                stage,
                format_number(*records)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

fn counted(phase: &str, n: u64, total: u64, unit: &str) -> String {
    format!(
        "{}  {} / {} {} ({}%)\n",
        phase,
        format_number(n),
        format_number(total),
        unit,
        percent(n, total)
    )
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let phase = event.phase();
        let obj = match &event {
            ProgressEvent::Crawl { pages, files } => serde_json::json!({
                "event": "progress",
                "phase": phase,
                "pages": pages,
                "files": files
            }),
            ProgressEvent::Extract { n, total }
            | ProgressEvent::Embed { n, total }
            | ProgressEvent::Write { n, total } => serde_json::json!({
                "event": "progress",
                "phase": phase,
                "n": n,
                "total": total,
                "percent": percent(*n, *total)
            }),
            ProgressEvent::CacheHit { stage, records } => serde_json::json!({
                "event": "cache_hit",
                "phase": phase,
                "stage": stage,
                "records": records
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Whole-number percentage, `100` for an empty total.
pub fn percent(n: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        (n.min(total) * 100) / total
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn percent_is_monotonic_and_bounded() {
        let total = 7;
        let mut last = 0;
        for n in 0..=total {
            let p = percent(n, total);
            assert!(p >= last);
            last = p;
        }
        assert_eq!(percent(7, 7), 100);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(9, 7), 100);
    }

    #[test]
    fn counted_line() {
        assert_eq!(
            counted("extract", 3, 12, "documents"),
            "extract  3 / 12 documents (25%)\n"
        );
    }
}
