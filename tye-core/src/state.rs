use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Which output stream a log line came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// A raw output line published on a service's log subject.
#[derive(Clone, Debug)]
pub struct LogLine {
    pub at: SystemTime,
    pub replica: String,
    pub stream: LogStream,
    pub text: String,
}

impl LogLine {
    pub fn new(replica: impl Into<String>, stream: LogStream, text: impl Into<String>) -> Self {
        Self {
            at: SystemTime::now(),
            replica: replica.into(),
            stream,
            text: text.into(),
        }
    }

    /// Render as `[replica] text`, tagging non-stdout streams.
    pub fn display(&self) -> String {
        let prefix = match self.stream {
            LogStream::Stdout => "",
            LogStream::Stderr => "[stderr] ",
            LogStream::System => "[system] ",
        };
        format!("[{}] {}{}", self.replica, prefix, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_tags_stream() {
        let line = LogLine::new("api_1234", LogStream::Stderr, "boom");
        assert_eq!(line.display(), "[api_1234] [stderr] boom");
        let line = LogLine::new("api_1234", LogStream::Stdout, "ok");
        assert_eq!(line.display(), "[api_1234] ok");
    }
}
