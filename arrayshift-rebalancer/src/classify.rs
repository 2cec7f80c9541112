//! Transfer error classification
//!
//! Maps rsync exit codes and stderr text to a severity/recoverability
//! verdict. Rules are an ordered list evaluated first-match-wins, followed by
//! the retry policy the engine applies to recoverable failures.

use std::time::Duration;

/// Rsync exit codes the classifier distinguishes.
pub const EXIT_PARTIAL_TRANSFER: i32 = 23;
pub const EXIT_VANISHED_SOURCE: i32 = 24;
pub const EXIT_TIMEOUT_IO: i32 = 30;
pub const EXIT_TIMEOUT_DAEMON: i32 = 35;

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Success,
    Transient,
    Resource,
    Permission,
    Unknown,
}

/// Classification verdict for one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub severity: Severity,
    pub category: Category,
    pub recoverable: bool,
    pub detail: String,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        self.category == Category::Success
    }
}

/// Human descriptions for common rsync exit codes.
fn exit_code_meaning(code: i32) -> &'static str {
    match code {
        0 => "success",
        1 => "syntax or usage error",
        2 => "protocol incompatibility",
        3 => "errors selecting input/output files",
        5 => "error starting client-server protocol",
        10 => "error in socket I/O",
        11 => "error in file I/O",
        12 => "error in rsync protocol data stream",
        20 => "received SIGUSR1 or SIGINT",
        22 => "error allocating core memory buffers",
        23 => "partial transfer due to error",
        24 => "partial transfer due to vanished source files",
        30 => "timeout in data send/receive",
        35 => "timeout waiting for daemon connection",
        _ => "unknown rsync error",
    }
}

type Rule = (fn(i32, &str) -> bool, fn(i32, &str) -> Verdict);

/// Ordered classification rules; the first matching rule wins.
const RULES: &[Rule] = &[
    // 1. Exit 0: success.
    (|code, _| code == 0, |_, _| Verdict {
        severity: Severity::Low,
        category: Category::Success,
        recoverable: true,
        detail: "success".to_string(),
    }),
    // 2. Destination out of space: overrides whatever code rsync exited
    // with (a partial transfer onto a full disk must not be retried).
    (
        |_, stderr| {
            let s = stderr.to_ascii_lowercase();
            s.contains("no space left") || s.contains("disk full") || s.contains("quota exceeded")
        },
        |_, _| Verdict {
            severity: Severity::Critical,
            category: Category::Resource,
            recoverable: false,
            detail: "destination disk full; free space or lower the target".to_string(),
        },
    ),
    // 3. Permission problems: also override the exit code.
    (
        |_, stderr| {
            let s = stderr.to_ascii_lowercase();
            s.contains("permission denied") || s.contains("operation not permitted")
        },
        |_, _| Verdict {
            severity: Severity::High,
            category: Category::Permission,
            recoverable: false,
            detail: "permission denied; check ownership and run as root".to_string(),
        },
    ),
    // 4. Partial transfer / vanished source: the tool resumes cleanly.
    (
        |code, _| code == EXIT_PARTIAL_TRANSFER || code == EXIT_VANISHED_SOURCE,
        |code, _| Verdict {
            severity: Severity::Medium,
            category: Category::Transient,
            recoverable: true,
            detail: exit_code_meaning(code).to_string(),
        },
    ),
    // 5. Timeouts.
    (
        |code, _| code == EXIT_TIMEOUT_IO || code == EXIT_TIMEOUT_DAEMON,
        |code, _| Verdict {
            severity: Severity::Medium,
            category: Category::Transient,
            recoverable: true,
            detail: exit_code_meaning(code).to_string(),
        },
    ),
    // 6. Everything else.
    (|_, _| true, |code, _| Verdict {
        severity: Severity::High,
        category: Category::Unknown,
        recoverable: false,
        detail: format!("{} (exit code {})", exit_code_meaning(code), code),
    }),
];

/// Classify one tool invocation.
pub fn classify(exit_code: i32, stderr: &str) -> Verdict {
    for (predicate, verdict) in RULES {
        if predicate(exit_code, stderr) {
            return verdict(exit_code, stderr);
        }
    }
    unreachable!("final rule matches everything")
}

/// Retry backoff: 2s doubling per attempt, capped at 60s.
pub fn retry_delay(attempt: u32) -> Duration {
    const BASE_SECS: u64 = 2;
    const CAP_SECS: u64 = 60;
    let secs = BASE_SECS.saturating_mul(1u64 << attempt.min(10));
    Duration::from_secs(secs.min(CAP_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success() {
        let verdict = classify(0, "");
        assert!(verdict.is_success());
    }

    #[test]
    fn test_partial_and_vanished_are_transient() {
        for code in [EXIT_PARTIAL_TRANSFER, EXIT_VANISHED_SOURCE] {
            let verdict = classify(code, "");
            assert_eq!(verdict.category, Category::Transient);
            assert_eq!(verdict.severity, Severity::Medium);
            assert!(verdict.recoverable);
        }
    }

    #[test]
    fn test_timeouts_are_transient() {
        for code in [EXIT_TIMEOUT_IO, EXIT_TIMEOUT_DAEMON] {
            let verdict = classify(code, "");
            assert_eq!(verdict.category, Category::Transient);
            assert!(verdict.recoverable);
        }
    }

    #[test]
    fn test_disk_full_is_critical() {
        let verdict = classify(11, "rsync: write failed: No space left on device (28)");
        assert_eq!(verdict.severity, Severity::Critical);
        assert_eq!(verdict.category, Category::Resource);
        assert!(!verdict.recoverable);
    }

    #[test]
    fn test_stderr_overrides_transient_exit_code() {
        // A partial transfer that ran the disk full must not be retried,
        // even though exit 23 alone would be transient.
        let verdict = classify(
            EXIT_PARTIAL_TRANSFER,
            "rsync: write failed: No space left on device (28)",
        );
        assert_eq!(verdict.category, Category::Resource);
        assert_eq!(verdict.severity, Severity::Critical);
        assert!(!verdict.recoverable);
    }

    #[test]
    fn test_permission_denied() {
        // Permission context wins over the exit code.
        let verdict = classify(23, "rsync: opendir failed: Permission denied (13)");
        assert_eq!(verdict.category, Category::Permission);
        assert_eq!(verdict.severity, Severity::High);
        assert!(!verdict.recoverable);

        let verdict = classify(1, "rsync: opendir failed: Permission denied (13)");
        assert_eq!(verdict.category, Category::Permission);
        assert_eq!(verdict.severity, Severity::High);
        assert!(!verdict.recoverable);
    }

    #[test]
    fn test_unknown_error() {
        let verdict = classify(12, "something odd");
        assert_eq!(verdict.category, Category::Unknown);
        assert_eq!(verdict.severity, Severity::High);
        assert!(!verdict.recoverable);
        assert!(verdict.detail.contains("12"));
    }

    #[test]
    fn test_retry_delays() {
        assert_eq!(retry_delay(0), Duration::from_secs(2));
        assert_eq!(retry_delay(1), Duration::from_secs(4));
        assert_eq!(retry_delay(2), Duration::from_secs(8));
        assert_eq!(retry_delay(5), Duration::from_secs(60));
        assert_eq!(retry_delay(30), Duration::from_secs(60));
    }
}
