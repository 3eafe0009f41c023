//! Log fan-out: one container output stream, three sinks.
//!
//! Every line a stage container prints goes to (a) a per-stage append-mode
//! log file, (b) the unified run log used by the offset-cursor tail
//! interface, and (c) a bounded broadcast tap for in-process subscribers.
//! The tap drops oldest lines when a subscriber lags, so a slow viewer
//! never applies back-pressure to the running container.

use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use tokio::sync::broadcast;

/// Capacity of the broadcast tap; lagging receivers skip oldest lines.
pub const LOG_TAP_CAPACITY: usize = 1024;

/// One tagged output line offered to live subscribers.
#[derive(Debug, Clone)]
pub struct LogLine {
    /// Stage that produced the line.
    pub stage: String,
    /// The line, ANSI-stripped.
    pub line: String,
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap())
}

/// Removes ANSI escape sequences (colors, cursor movement) from a line.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ansi_re().replace_all(text, "")
}

/// Per-attempt log sink writing to the stage file, the run log, and the tap.
pub struct LogSink {
    stage: String,
    stage_file: File,
    run_file: File,
    tap: broadcast::Sender<LogLine>,
}

impl LogSink {
    /// Opens the per-stage attempt log (`<stage>_<attempt_ts>.log`) and the
    /// unified `run.log`, both in append mode, under `log_dir`.
    pub fn open(
        log_dir: &Path,
        stage: &str,
        tap: broadcast::Sender<LogLine>,
    ) -> std::io::Result<(Self, std::path::PathBuf)> {
        std::fs::create_dir_all(log_dir)?;
        let attempt_ts = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let stage_path = log_dir.join(format!("{stage}_{attempt_ts}.log"));
        let stage_file = OpenOptions::new().create(true).append(true).open(&stage_path)?;
        let run_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("run.log"))?;

        Ok((
            Self {
                stage: stage.to_string(),
                stage_file,
                run_file,
                tap,
            },
            stage_path,
        ))
    }

    /// Writes one output line to all sinks. Tap send failures (no live
    /// subscriber) are ignored.
    pub fn write_line(&mut self, raw: &str) -> std::io::Result<()> {
        let line = strip_ansi(raw.trim_end_matches(['\n', '\r']));
        writeln!(self.stage_file, "{line}")?;
        writeln!(self.run_file, "[{}] {}", self.stage, line)?;
        let _ = self.tap.send(LogLine {
            stage: self.stage.clone(),
            line: line.into_owned(),
        });
        Ok(())
    }

    /// Writes a comment line (metadata header/footer) to the log files
    /// without offering it to subscribers.
    pub fn write_comment(&mut self, text: &str) -> std::io::Result<()> {
        writeln!(self.stage_file, "# {text}")?;
        writeln!(self.run_file, "# [{}] {}", self.stage, text)?;
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.stage_file.flush()?;
        self.run_file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[32mok\x1b[0m done"), "ok done");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_sink_fan_out() {
        let dir = tempfile::tempdir().unwrap();
        let (tap, mut rx) = broadcast::channel(8);
        let (mut sink, stage_path) = LogSink::open(dir.path(), "sfm", tap).unwrap();

        sink.write_comment("Command: odm ...").unwrap();
        sink.write_line("\x1b[1mfeature extraction 10%\x1b[0m\n").unwrap();
        sink.flush().unwrap();

        let stage_log = std::fs::read_to_string(&stage_path).unwrap();
        assert!(stage_log.contains("# Command: odm ..."));
        assert!(stage_log.contains("feature extraction 10%"));
        assert!(!stage_log.contains("\x1b"));

        let run_log = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert!(run_log.contains("[sfm] feature extraction 10%"));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.stage, "sfm");
        assert_eq!(received.line, "feature extraction 10%");
    }

    #[test]
    fn test_lagging_subscriber_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let (tap, mut rx) = broadcast::channel(2);
        let (mut sink, _) = LogSink::open(dir.path(), "sfm", tap).unwrap();

        for i in 0..5 {
            sink.write_line(&format!("line {i}")).unwrap();
        }

        // Receiver lagged: oldest lines were dropped, newest survive.
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
        assert_eq!(rx.try_recv().unwrap().line, "line 3");
        assert_eq!(rx.try_recv().unwrap().line, "line 4");
    }

    #[test]
    fn test_no_subscriber_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tap, _) = broadcast::channel(2);
        let (mut sink, _) = LogSink::open(dir.path(), "sfm", tap).unwrap();
        sink.write_line("nobody listening").unwrap();
    }
}
