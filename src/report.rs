use crate::token::compression_ratio;
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// A pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Source documents to topic fragments
    Extract,
    /// Fragments to one section per topic
    Merge,
    /// Topic sections to one unified document
    Reduce,
    /// Formatting and minification
    Compress,
    /// Versioned copy of the final document
    Release,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Self; 5] = [
        Self::Extract,
        Self::Merge,
        Self::Reduce,
        Self::Compress,
        Self::Release,
    ];

    /// 1-based position in the pipeline.
    #[must_use]
    pub const fn number(self) -> usize {
        match self {
            Self::Extract => 1,
            Self::Merge => 2,
            Self::Reduce => 3,
            Self::Compress => 4,
            Self::Release => 5,
        }
    }

    /// Lowercase stage name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Merge => "merge",
            Self::Reduce => "reduce",
            Self::Compress => "compress",
            Self::Release => "release",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One failed unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    /// Unit name, e.g. `topic:walkers` or `pass 2 group 1`
    pub unit: String,

    /// What went wrong
    pub error: String,
}

/// Outcome of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    /// Stage that produced this report
    pub stage: Stage,

    /// Units completed successfully
    pub succeeded: usize,

    /// Units that failed
    pub failed: usize,

    /// Estimated tokens read by the stage
    pub original_tokens: usize,

    /// Estimated tokens written by the stage
    pub condensed_tokens: usize,

    /// Wall-clock time of the stage
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,

    /// Failure log
    pub failures: Vec<FailureRecord>,
}

impl StageReport {
    /// Creates an empty report for `stage`.
    #[must_use]
    pub const fn new(stage: Stage) -> Self {
        Self {
            stage,
            succeeded: 0,
            failed: 0,
            original_tokens: 0,
            condensed_tokens: 0,
            duration: Duration::ZERO,
            failures: Vec::new(),
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub(crate) fn record_failure(&mut self, unit: impl Into<String>, error: impl Into<String>) {
        self.failed += 1;
        self.failures.push(FailureRecord {
            unit: unit.into(),
            error: error.into(),
        });
    }

    /// Returns `condensed_tokens / original_tokens`.
    #[must_use]
    pub fn compression_ratio(&self) -> f64 {
        compression_ratio(self.original_tokens, self.condensed_tokens)
    }
}

pub(crate) fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let numbers: Vec<usize> = Stage::ALL.iter().map(|s| s.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert!(Stage::Extract < Stage::Release);
        assert_eq!(Stage::Reduce.to_string(), "reduce");
    }

    #[test]
    fn test_report_records_failures() {
        let mut report = StageReport::new(Stage::Merge);
        report.record_success();
        report.record_failure("topic:edges", "HTTP 500: boom");

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].unit, "topic:edges");
    }

    #[test]
    fn test_report_serializes_duration_as_seconds() {
        let mut report = StageReport::new(Stage::Compress);
        report.duration = Duration::from_millis(1500);
        report.original_tokens = 100;
        report.condensed_tokens = 25;

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stage"], "compress");
        assert_eq!(json["duration"], 1.5);
        assert!((report.compression_ratio() - 0.25).abs() < f64::EPSILON);
    }
}
