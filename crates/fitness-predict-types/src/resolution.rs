// Terminal outcomes of a prediction job

use serde_json::Value;

/// Longest diagnostic text carried in a failure detail, in characters.
pub const MAX_DETAIL_CHARS: usize = 500;

/// Server-side failure classes. All of them map to HTTP 500.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Scratch directory or temp file could not be prepared.
    StagingFailed,
    /// The worker process could not be started.
    SpawnFailed,
    /// The worker wrote a fatal error marker to stderr.
    WorkerReportedError,
    /// The worker exited 0 without writing anything to stdout.
    EmptyOutput,
    /// The worker exited with a non-zero code or was killed by a signal.
    NonZeroExit,
    /// The worker exited 0 but stdout was not a JSON document.
    MalformedOutput,
    /// The watchdog fired before any other outcome.
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::StagingFailed => "staging_failed",
            FailureKind::SpawnFailed => "spawn_failed",
            FailureKind::WorkerReportedError => "worker_reported_error",
            FailureKind::EmptyOutput => "empty_output",
            FailureKind::NonZeroExit => "non_zero_exit",
            FailureKind::MalformedOutput => "malformed_output",
            FailureKind::Timeout => "timeout",
        }
    }

    pub fn http_status(&self) -> u16 {
        500
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed job: what went wrong, a caller-facing message and an optional
/// truncated diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    pub detail: Option<String>,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach a diagnostic. The text is truncated to [`MAX_DETAIL_CHARS`].
    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(truncate_detail(detail));
        self
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}

/// The single terminal outcome of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The worker produced one well-formed JSON document and exited 0.
    Success(Value),
    Failure(JobFailure),
    /// The caller went away; nothing is written back.
    Abandoned,
}

impl Resolution {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Resolution::Failure(JobFailure::new(kind, message))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Resolution::Failure(f) => Some(f.kind),
            _ => None,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Success(_) => "success",
            Resolution::Failure(f) => f.kind.as_str(),
            Resolution::Abandoned => "abandoned",
        }
    }
}

/// Cap `text` at [`MAX_DETAIL_CHARS`] characters, never splitting a char.
pub fn truncate_detail(text: &str) -> String {
    match text.char_indices().nth(MAX_DETAIL_CHARS) {
        Some((cut, _)) => format!("{}…[truncated]", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_text_untouched() {
        assert_eq!(truncate_detail("boom"), "boom");
    }

    #[test]
    fn test_truncate_long_text() {
        let long = "x".repeat(2_000);
        let cut = truncate_detail(&long);
        assert!(cut.starts_with(&"x".repeat(MAX_DETAIL_CHARS)));
        assert!(cut.ends_with("…[truncated]"));
        assert_eq!(cut.chars().filter(|c| *c == 'x').count(), MAX_DETAIL_CHARS);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_DETAIL_CHARS + 10);
        let cut = truncate_detail(&long);
        assert_eq!(cut.chars().filter(|c| *c == 'é').count(), MAX_DETAIL_CHARS);
    }

    #[test]
    fn test_failure_is_always_500() {
        let failure = JobFailure::new(FailureKind::Timeout, "too slow");
        assert_eq!(failure.http_status(), 500);
        assert_eq!(
            Resolution::Failure(failure).failure_kind(),
            Some(FailureKind::Timeout)
        );
    }
}
