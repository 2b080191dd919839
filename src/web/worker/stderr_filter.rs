// Classification of worker stderr lines

use regex::Regex;

/// What a single stderr line means for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrClass {
    /// Framework/runtime banner text. Dropped without logging above trace.
    Noise,
    /// The worker is failing. Resolves the job immediately.
    RealError,
    /// Anything else. Logged, never acted on.
    Neutral,
}

lazy_static::lazy_static! {
    /// TensorFlow, absl, CUDA and Python warning chatter printed by the
    /// inference script on every run.
    static ref NOISE_PATTERN: Regex = Regex::new(concat!(
        r"(?i)(",
        r"oneDNN custom operations|TF_ENABLE_ONEDNN_OPTS",
        r"|This TensorFlow binary is optimized|rebuild TensorFlow with the appropriate compiler flags",
        r"|To enable the following instructions",
        r"|Could not find cuda drivers|Unable to register cu(DNN|FFT|BLAS) factory",
        r"|computation placer already registered|cuda_(dnn|fft|blas|executor|driver)",
        r"|failed call to cuInit|TensorRT",
        r"|All log messages before absl::InitializeLog",
        r"|tensorflow/core/|tensorflow/compiler/|external/local_xla|external/local_tsl",
        r"|^[IWE]\d{4} \d{2}:\d{2}:\d{2}",
        r"|^WARNING:(tensorflow|absl)",
        r"|UserWarning|DeprecationWarning|FutureWarning|warnings\.warn",
        r")"
    ))
    .unwrap();

    /// Lines that open with an exception name or a crash banner. These win
    /// over noise, since the message text may quote a library name.
    static ref LEADING_ERROR_PATTERN: Regex = Regex::new(concat!(
        r"^\s*(",
        r"Traceback \(most recent call last\)",
        r"|[A-Za-z_][A-Za-z0-9_.]*(Error|Exception): ",
        r"|Killed$|Segmentation fault",
        r")"
    ))
    .unwrap();

    /// Markers that only show up when the script is actually dying.
    static ref ERROR_PATTERN: Regex = Regex::new(concat!(
        r"(",
        r"Traceback \(most recent call last\)",
        r"|ModuleNotFoundError|ImportError|No module named",
        r"|Segmentation fault|MemoryError",
        r")"
    ))
    .unwrap();
}

/// Longest run of stderr kept while waiting for a newline. A longer line is
/// classified window by window instead of being buffered whole.
pub const MAX_PARTIAL_LINE_BYTES: usize = 64 * 1024;

/// Classify one stderr line. A line that starts like an exception is always
/// an error; otherwise noise is checked first so banners that happen to
/// contain "Error" never fail a job.
pub fn classify_line(line: &str) -> StderrClass {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return StderrClass::Neutral;
    }
    if LEADING_ERROR_PATTERN.is_match(line) {
        StderrClass::RealError
    } else if NOISE_PATTERN.is_match(line) {
        StderrClass::Noise
    } else if ERROR_PATTERN.is_match(line) {
        StderrClass::RealError
    } else {
        StderrClass::Neutral
    }
}

/// Splits stderr chunks into lines, carrying partial lines across chunks.
#[derive(Debug, Default)]
pub struct StderrScanner {
    partial: String,
}

/// First real-error line found in a chunk, plus everything after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub captured: String,
}

impl StderrScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk. Returns a report as soon as a complete line classifies
    /// as a real error. Only the new chunk is searched for line breaks.
    pub fn push(&mut self, chunk: &[u8]) -> Option<ErrorReport> {
        let text = String::from_utf8_lossy(chunk);

        let rest = match text.rfind('\n') {
            Some(last_newline) => {
                let (complete, rest) = text.split_at(last_newline + 1);
                let mut lines = std::mem::take(&mut self.partial);
                lines.push_str(complete);
                if let Some(report) = scan(&lines, rest) {
                    return Some(report);
                }
                rest
            }
            None => &text[..],
        };

        self.partial.push_str(rest);
        if self.partial.len() <= MAX_PARTIAL_LINE_BYTES {
            return None;
        }
        let window = std::mem::take(&mut self.partial);
        log::debug!(
            "[ARBITER] worker stderr line exceeds {MAX_PARTIAL_LINE_BYTES} bytes, classifying in pieces"
        );
        scan(&window, "")
    }

    /// Bytes held back waiting for the end of the current line.
    pub fn buffered_len(&self) -> usize {
        self.partial.len()
    }

    /// Classify whatever is left without a trailing newline. Called once the
    /// worker has exited.
    pub fn finish(&mut self) -> Option<ErrorReport> {
        let rest = std::mem::take(&mut self.partial);
        scan(&rest, "")
    }
}

fn scan(text: &str, trailing: &str) -> Option<ErrorReport> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        match classify_line(line) {
            StderrClass::RealError => {
                let mut captured = text[offset..].trim_end().to_string();
                if !trailing.is_empty() {
                    captured.push('\n');
                    captured.push_str(trailing);
                }
                return Some(ErrorReport { captured });
            }
            StderrClass::Noise => {
                log::trace!("[ARBITER] suppressed worker stderr: {}", line.trim_end());
            }
            StderrClass::Neutral => {
                if !line.trim().is_empty() {
                    log::debug!("[ARBITER] worker stderr: {}", line.trim_end());
                }
            }
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensorflow_banners_are_noise() {
        let banners = [
            "2024-05-01 10:00:00.000000: I tensorflow/core/util/port.cc:113] oneDNN custom operations are on.",
            "This TensorFlow binary is optimized to use available CPU instructions in performance-critical operations.",
            "To enable the following instructions: AVX2 FMA, in other operations, rebuild TensorFlow with the appropriate compiler flags.",
            "W0000 00:00:1700000000.000000   123 cuda_executor.cc:1000] Could not find cuda drivers on your machine",
            "E0000 00:00:1700000000.000000 Unable to register cuDNN factory: Attempting to register factory for plugin cuDNN when one has already been registered",
            "WARNING: All log messages before absl::InitializeLog() is called are written to STDERR",
            "/usr/lib/python3/site-packages/keras/src/saving.py:12: UserWarning: Skipping variable loading for optimizer",
        ];
        for banner in banners {
            assert_eq!(classify_line(banner), StderrClass::Noise, "{banner}");
        }
    }

    #[test]
    fn test_real_error_markers() {
        let markers = [
            "Traceback (most recent call last):",
            "ModuleNotFoundError: No module named 'tensorflow'",
            "ImportError: cannot import name 'keras'",
            "ValueError: Model expects image input, not tabular",
            "PIL.UnidentifiedImageError: cannot identify image file",
            "Killed",
        ];
        for marker in markers {
            assert_eq!(classify_line(marker), StderrClass::RealError, "{marker}");
        }
    }

    #[test]
    fn test_neutral_lines() {
        assert_eq!(classify_line("loading model..."), StderrClass::Neutral);
        assert_eq!(classify_line(""), StderrClass::Neutral);
        assert_eq!(classify_line("1/1 [==============================] - 0s 50ms/step"), StderrClass::Neutral);
    }

    #[test]
    fn test_scanner_waits_for_complete_line() {
        let mut scanner = StderrScanner::new();
        assert_eq!(scanner.push(b"Traceback (most rec"), None);
        let report = scanner.push(b"ent call last):\n  File \"predict.py\"").unwrap();
        assert!(report.captured.starts_with("Traceback (most recent call last):"));
        assert!(report.captured.contains("predict.py"));
    }

    #[test]
    fn test_scanner_skips_noise_then_reports_error() {
        let mut scanner = StderrScanner::new();
        let chunk = b"oneDNN custom operations are on.\nValueError: bad shape\nmore context\n";
        let report = scanner.push(chunk).unwrap();
        assert_eq!(report.captured, "ValueError: bad shape\nmore context");
    }

    #[test]
    fn test_exception_line_quoting_noise_token_is_error() {
        let line = "ImportError: libnvinfer.so.8: cannot open shared object file (TensorRT)";
        assert_eq!(classify_line(line), StderrClass::RealError);
        assert_eq!(
            classify_line("  tensorflow.python.framework.errors_impl.NotFoundError: cuda_dnn missing"),
            StderrClass::RealError
        );
        // Plain TensorRT chatter stays noise.
        assert_eq!(
            classify_line("W tensorflow/compiler/tf2tensorrt/utils/py_utils.cc:38] TF-TRT Warning: Could not find TensorRT"),
            StderrClass::Noise
        );
    }

    #[test]
    fn test_scanner_buffer_bounded_without_newlines() {
        let mut scanner = StderrScanner::new();
        let chunk = vec![b'x'; 8 * 1024];
        for _ in 0..(8 * 1024 * 1024 / chunk.len()) {
            assert_eq!(scanner.push(&chunk), None);
            assert!(scanner.buffered_len() <= MAX_PARTIAL_LINE_BYTES);
        }
        // Normal lines still work once the runaway line ends.
        let report = scanner.push(b"\nValueError: bad shape\n").unwrap();
        assert_eq!(report.captured, "ValueError: bad shape");
    }

    #[test]
    fn test_scanner_reports_error_at_start_of_long_line() {
        let mut scanner = StderrScanner::new();
        assert_eq!(scanner.push(b"RuntimeError: tensor dump "), None);
        let filler = vec![b'0'; 8 * 1024];
        let report = (0..16).find_map(|_| scanner.push(&filler)).unwrap();
        assert!(report.captured.starts_with("RuntimeError: tensor dump"));
        assert_eq!(scanner.buffered_len(), 0);
    }

    #[test]
    fn test_scanner_finish_flushes_partial_line() {
        let mut scanner = StderrScanner::new();
        assert_eq!(scanner.push(b"RuntimeError: out of memory"), None);
        let report = scanner.finish().unwrap();
        assert_eq!(report.captured, "RuntimeError: out of memory");
        assert_eq!(scanner.finish(), None);
    }
}
