use std::io::{self, Write};

use serde::Serialize;
use tracing::debug;

use crate::app::{ProgressEvent, ProgressSink, StageReport};
use crate::error::{PreservationOutcome, SipError};

/// Failure raised before any stage ran, such as a bad config or object id.
#[derive(Debug, Serialize)]
pub struct FailureReport {
    #[serde(flatten)]
    pub outcome: PreservationOutcome,
    pub category: String,
}

impl From<&SipError> for FailureReport {
    fn from(err: &SipError) -> Self {
        Self {
            outcome: err.outcome(),
            category: err.category(),
        }
    }
}

/// Machine-readable output on stdout. Progress goes to the log only.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &StageReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_failure(err: &SipError) -> io::Result<()> {
        Self::print_json(&FailureReport::from(err))
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, event: ProgressEvent) {
        debug!(elapsed = ?event.elapsed, "{}", event.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_report_carries_category() {
        let err = SipError::InvalidConfig("catalogue.url is required".to_string());
        let json = serde_json::to_value(FailureReport::from(&err)).unwrap();
        assert_eq!(json["outcome"], "terminal_failure");
        assert_eq!(json["category"], err.category());
        assert!(json["detail"].as_str().unwrap().contains("catalogue.url"));
        let text = serde_json::to_string(&FailureReport::from(&err)).unwrap();
        assert_eq!(text.matches("\"category\"").count(), 1);

        let err = SipError::Timeout("GET module/Object/1".to_string());
        let json = serde_json::to_value(FailureReport::from(&err)).unwrap();
        assert_eq!(json["outcome"], "retryable_failure");
        assert_eq!(json["category"], "TimeoutError");
    }
}
