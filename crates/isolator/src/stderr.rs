//! Best-effort recovery of an error from a worker's unstructured stderr.
//!
//! Used when a worker exited without writing a protocol payload. Recognizes
//! the fatal-error shapes workers commonly print and falls back to wrapping
//! the raw text. Recovery never fails.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::outcome::ErrorValue;

/// Kind used when no known shape matched.
pub const WORKER_CRASH: &str = "WorkerCrash";

static UNCAUGHT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:PHP )?Fatal error:\s+Uncaught (?P<kind>[\w\\]+):?\s*(?P<message>.*?) in (?P<file>\S+?):(?P<line>\d+)\s*$",
    )
    .expect("valid regex")
});

static FATAL_ON_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:PHP )?(?P<kind>Fatal error|Parse error):\s+(?P<message>.*?) in (?P<file>\S+) on line (?P<line>\d+)\s*$",
    )
    .expect("valid regex")
});

static PANIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^thread '(?P<thread>[^']*)' panicked at (?P<file>[^\n']+?):(?P<line>\d+):\d+:\r?\n(?P<message>[^\r\n]*)",
    )
    .expect("valid regex")
});

static LEGACY_PANIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^thread '(?P<thread>[^']*)' panicked at '(?P<message>[^\n]*)', (?P<file>[^\n]+?):(?P<line>\d+):\d+",
    )
    .expect("valid regex")
});

static FATAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:PHP )?Fatal error:\s+(?P<message>.+?)\s*$").expect("valid regex")
});

static ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Error: (?P<message>.+?)\s*$").expect("valid regex"));

static TRACE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#\d+ ").expect("valid regex"));

/// Raw stderr text from a worker that did not follow the protocol.
///
/// Works on text, so callers holding bytes convert them lossily first: invalid
/// UTF-8 sequences reach the recovered message as U+FFFD. The byte-exact capture
/// stays available on `WorkerOutcome::stderr`.
pub struct StderrStream<'a> {
    text: &'a str,
}

impl<'a> StderrStream<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text }
    }

    /// Reconstruct an error from the text.
    pub fn error_value(&self) -> ErrorValue {
        if let Some(caps) = UNCAUGHT.captures(self.text) {
            let kind = caps["kind"].to_string();
            return self.located(kind, &caps).with_trace(self.trace_after(&caps));
        }

        if let Some(caps) = FATAL_ON_LINE.captures(self.text) {
            let kind = match &caps["kind"] {
                "Parse error" => "ParseError",
                _ => "FatalError",
            };
            return self.located(kind.to_string(), &caps);
        }

        if let Some(caps) = PANIC.captures(self.text).or_else(|| LEGACY_PANIC.captures(self.text)) {
            let error = self.located("Panic".to_string(), &caps);
            return error.with_trace(vec![format!("thread '{}'", &caps["thread"])]);
        }

        if let Some(caps) = FATAL.captures(self.text) {
            return ErrorValue::new("FatalError", &caps["message"]);
        }

        if let Some(caps) = ERROR_LINE.captures(self.text) {
            return ErrorValue::new("Error", &caps["message"]);
        }

        ErrorValue::new(WORKER_CRASH, self.text)
    }

    fn located(&self, kind: String, caps: &Captures<'_>) -> ErrorValue {
        let line = caps["line"].parse().ok();
        ErrorValue::new(kind, caps["message"].trim()).with_location(&caps["file"], line)
    }

    /// Stack trace lines (`#0 ...`) directly following a match.
    fn trace_after(&self, caps: &Captures<'_>) -> Vec<String> {
        let Some(end) = caps.get(0).map(|m| m.end()) else {
            return Vec::new();
        };
        self.text[end..]
            .lines()
            .skip_while(|line| line.trim().is_empty() || line.trim() == "Stack trace:")
            .take_while(|line| TRACE_LINE.is_match(line))
            .map(|line| line.trim().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_error_on_line() {
        let error = StderrStream::new("Fatal error: Allowed memory size exhausted in file.ext on line 10")
            .error_value();

        assert_eq!(error.kind, "FatalError");
        assert_eq!(error.message, "Allowed memory size exhausted");
        assert_eq!(error.file.as_deref(), Some("file.ext"));
        assert_eq!(error.line, Some(10));
    }

    #[test]
    fn parse_error_with_php_prefix() {
        let error = StderrStream::new(
            "PHP Parse error:  syntax error, unexpected '}' in /app/wp-config.php on line 42\n",
        )
        .error_value();

        assert_eq!(error.kind, "ParseError");
        assert_eq!(error.message, "syntax error, unexpected '}'");
        assert_eq!(error.line, Some(42));
    }

    #[test]
    fn uncaught_exception_with_stack_trace() {
        let text = "Warning: something minor\n\
                    PHP Fatal error:  Uncaught RuntimeException: Database gone in /app/src/Db.php:88\n\
                    Stack trace:\n\
                    #0 /app/src/Loader.php(12): Db->connect()\n\
                    #1 {main}\n  \
                    thrown in /app/src/Db.php on line 88\n";
        let error = StderrStream::new(text).error_value();

        assert_eq!(error.kind, "RuntimeException");
        assert_eq!(error.message, "Database gone");
        assert_eq!(error.file.as_deref(), Some("/app/src/Db.php"));
        assert_eq!(error.line, Some(88));
        assert_eq!(
            error.trace,
            vec!["#0 /app/src/Loader.php(12): Db->connect()", "#1 {main}"]
        );
    }

    #[test]
    fn namespaced_exception_class() {
        let error = StderrStream::new(
            "Fatal error: Uncaught Acme\\Errors\\Boom: no luck in /srv/a.php:3",
        )
        .error_value();
        assert_eq!(error.kind, "Acme\\Errors\\Boom");
        assert_eq!(error.message, "no luck");
    }

    #[test]
    fn rust_panic() {
        let text = "thread 'main' panicked at crates/jobs/src/lib.rs:17:9:\n\
                    index out of bounds: the len is 0 but the index is 3\n\
                    note: run with `RUST_BACKTRACE=1` environment variable to display a backtrace\n";
        let error = StderrStream::new(text).error_value();

        assert_eq!(error.kind, "Panic");
        assert_eq!(error.message, "index out of bounds: the len is 0 but the index is 3");
        assert_eq!(error.file.as_deref(), Some("crates/jobs/src/lib.rs"));
        assert_eq!(error.line, Some(17));
        assert_eq!(error.trace, vec!["thread 'main'"]);
    }

    #[test]
    fn legacy_rust_panic() {
        let error = StderrStream::new("thread 'worker' panicked at 'boom', src/main.rs:4:5\n")
            .error_value();

        assert_eq!(error.kind, "Panic");
        assert_eq!(error.message, "boom");
        assert_eq!(error.line, Some(4));
    }

    #[test]
    fn fatal_error_without_location() {
        let error = StderrStream::new("Fatal error: failed to apply control: bad autoload\n")
            .error_value();

        assert_eq!(error.kind, "FatalError");
        assert_eq!(error.message, "failed to apply control: bad autoload");
        assert!(error.file.is_none());
    }

    #[test]
    fn error_line() {
        let error = StderrStream::new("Error: connection refused\n").error_value();
        assert_eq!(error.kind, "Error");
        assert_eq!(error.message, "connection refused");
    }

    #[test]
    fn unrecognized_text_is_kept_verbatim() {
        let text = "Segmentation fault (core dumped)\n";
        let error = StderrStream::new(text).error_value();

        assert_eq!(error.kind, WORKER_CRASH);
        assert_eq!(error.message, text);
    }

    #[test]
    fn never_fails_on_odd_input() {
        for text in ["\u{0}\u{1}", " ", "Fatal error:", "thread '' panicked at", "#0 x"] {
            let error = StderrStream::new(text).error_value();
            assert!(!error.kind.is_empty());
        }
    }
}
