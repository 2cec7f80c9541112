//! Rsync progress parsing
//!
//! Turns `--info=progress2` output lines into structured updates. Parsing is
//! lenient: lines that do not look like progress are treated as file names or
//! discarded, and a progress update without a rate is still valid.

use regex::Regex;
use std::sync::OnceLock;

/// A structured progress update for one transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferProgress {
    pub bytes_done: u64,
    /// Total bytes if the tool reported one for this transfer
    pub bytes_total: Option<u64>,
    pub percent: Option<u8>,
    pub rate_bytes_per_sec: Option<u64>,
    pub eta_seconds: Option<u64>,
    /// Path of the file currently being transferred
    pub current_path: Option<String>,
}

/// One parsed line of tool output.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    /// A progress counter line
    Progress {
        bytes_done: u64,
        percent: Option<u8>,
        rate_bytes_per_sec: Option<u64>,
        elapsed_seconds: Option<u64>,
    },
    /// A per-file transfer line
    File(String),
    /// Anything else
    Ignored,
}

// progress2 format: "  1,234,567  45%   10.50MB/s    0:01:23 (xfr#3, to-chk=0/7)"
fn progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^\s*
            (?P<bytes>\d{1,3}(?:,\d{3})*|\d+)
            \s+
            (?P<pct>\d{1,3})%
            \s+
            (?P<rate>[\d.]+)(?P<unit>[kKMG]?)B/s
            \s+
            (?P<h>\d+):(?P<m>\d{2}):(?P<s>\d{2})
            ",
        )
        .expect("static regex")
    })
}

/// Parse a single line of rsync output.
pub fn parse_line(line: &str) -> ProgressLine {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return ProgressLine::Ignored;
    }

    if let Some(caps) = progress_pattern().captures(trimmed) {
        let bytes_done = caps["bytes"].replace(',', "").parse().unwrap_or(0);
        let percent = caps["pct"].parse::<u8>().ok().filter(|p| *p <= 100);
        let rate = caps["rate"].parse::<f64>().ok().map(|r| {
            let multiplier = match &caps["unit"] {
                "k" | "K" => 1024.0,
                "M" => 1024.0 * 1024.0,
                "G" => 1024.0 * 1024.0 * 1024.0,
                _ => 1.0,
            };
            (r * multiplier) as u64
        });
        let elapsed = {
            let h: u64 = caps["h"].parse().unwrap_or(0);
            let m: u64 = caps["m"].parse().unwrap_or(0);
            let s: u64 = caps["s"].parse().unwrap_or(0);
            Some(h * 3600 + m * 60 + s)
        };
        return ProgressLine::Progress {
            bytes_done,
            percent,
            rate_bytes_per_sec: rate,
            elapsed_seconds: elapsed,
        };
    }

    // rsync prints one relative path per transferred file. Summary lines and
    // diagnostics start with known prefixes we do not care about.
    if !trimmed.starts_with(' ')
        && !trimmed.starts_with("sending ")
        && !trimmed.starts_with("sent ")
        && !trimmed.starts_with("total ")
        && !trimmed.starts_with("created ")
        && !trimmed.starts_with("deleting ")
    {
        return ProgressLine::File(trimmed.to_string());
    }

    ProgressLine::Ignored
}

/// Accumulates parsed lines into the latest transfer state.
///
/// `bytes_done` only moves forward; rsync occasionally restarts its counter
/// between files and those dips are not forwarded.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: TransferProgress,
}

impl ProgressTracker {
    pub fn new(bytes_total: u64) -> Self {
        Self {
            state: TransferProgress {
                bytes_total: Some(bytes_total),
                ..Default::default()
            },
        }
    }

    /// Feed one output line. Returns an updated snapshot when the line
    /// changed the visible state.
    pub fn feed(&mut self, line: &str) -> Option<TransferProgress> {
        match parse_line(line) {
            ProgressLine::Progress {
                bytes_done,
                percent,
                rate_bytes_per_sec,
                ..
            } => {
                if bytes_done > self.state.bytes_done {
                    self.state.bytes_done = bytes_done;
                }
                self.state.percent = percent.or(self.state.percent);
                self.state.rate_bytes_per_sec = rate_bytes_per_sec;
                self.state.eta_seconds = self.eta();
                Some(self.state.clone())
            }
            ProgressLine::File(path) => {
                self.state.current_path = Some(path);
                Some(self.state.clone())
            }
            ProgressLine::Ignored => None,
        }
    }

    pub fn snapshot(&self) -> TransferProgress {
        self.state.clone()
    }

    fn eta(&self) -> Option<u64> {
        let total = self.state.bytes_total?;
        let rate = self.state.rate_bytes_per_sec?;
        if rate == 0 || self.state.bytes_done >= total {
            return None;
        }
        Some((total - self.state.bytes_done) / rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress2_line() {
        let line = "  1,234,567  45%   10.50MB/s    0:01:23 (xfr#3, to-chk=0/7)";
        match parse_line(line) {
            ProgressLine::Progress {
                bytes_done,
                percent,
                rate_bytes_per_sec,
                elapsed_seconds,
            } => {
                assert_eq!(bytes_done, 1_234_567);
                assert_eq!(percent, Some(45));
                assert_eq!(rate_bytes_per_sec, Some((10.5 * 1024.0 * 1024.0) as u64));
                assert_eq!(elapsed_seconds, Some(83));
            }
            other => panic!("expected progress, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_kilobyte_rate() {
        let line = "32,768 100%  512.00kB/s    0:00:00";
        match parse_line(line) {
            ProgressLine::Progress {
                bytes_done,
                rate_bytes_per_sec,
                ..
            } => {
                assert_eq!(bytes_done, 32_768);
                assert_eq!(rate_bytes_per_sec, Some(512 * 1024));
            }
            other => panic!("expected progress, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_file_line() {
        assert_eq!(
            parse_line("Movies/Alien (1979)/alien.mkv"),
            ProgressLine::File("Movies/Alien (1979)/alien.mkv".to_string())
        );
    }

    #[test]
    fn test_unknown_lines_ignored() {
        assert_eq!(parse_line(""), ProgressLine::Ignored);
        assert_eq!(
            parse_line("sent 1,234 bytes  received 35 bytes"),
            ProgressLine::Ignored
        );
        assert_eq!(
            parse_line("total size is 9,999  speedup is 1.00"),
            ProgressLine::Ignored
        );
    }

    #[test]
    fn test_tracker_monotonic_bytes() {
        let mut tracker = ProgressTracker::new(2_000_000);

        let first = tracker.feed("1,000,000  50%  1.00MB/s  0:00:01").unwrap();
        assert_eq!(first.bytes_done, 1_000_000);

        // A counter restart must not move bytes_done backwards.
        let second = tracker.feed("500  0%  1.00MB/s  0:00:00").unwrap();
        assert_eq!(second.bytes_done, 1_000_000);

        let third = tracker.feed("1,500,000  75%  1.00MB/s  0:00:02").unwrap();
        assert_eq!(third.bytes_done, 1_500_000);
        assert_eq!(third.eta_seconds, Some(0));
    }

    #[test]
    fn test_tracker_eta() {
        let mut tracker = ProgressTracker::new(10 * 1024 * 1024);
        let update = tracker
            .feed("5,242,880  50%  1.00MB/s  0:00:05")
            .unwrap();
        assert_eq!(update.eta_seconds, Some(5));
    }

    #[test]
    fn test_tracker_keeps_current_path() {
        let mut tracker = ProgressTracker::new(100);
        tracker.feed("Movies/Alien/alien.mkv");
        let update = tracker.feed("50 50%  1.00kB/s  0:00:00").unwrap();
        assert_eq!(
            update.current_path.as_deref(),
            Some("Movies/Alien/alien.mkv")
        );
    }
}
