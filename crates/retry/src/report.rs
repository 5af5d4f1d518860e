//! Aggregate of the failures that made a message poison.

use std::fmt;

use postbus_core::CapturedError;

/// All captured failures handed to the error handler, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    errors: Vec<CapturedError>,
}

impl FailureReport {
    pub fn new(errors: Vec<CapturedError>) -> Self {
        Self { errors }
    }

    /// Report with a single failure.
    pub fn single(error: CapturedError) -> Self {
        Self { errors: vec![error] }
    }

    pub fn errors(&self) -> &[CapturedError] {
        &self.errors
    }

    pub fn count(&self) -> usize {
        self.errors.len()
    }

    /// `"<n> unhandled exceptions"`.
    pub fn summary(&self) -> String {
        format!("{} unhandled exceptions", self.errors.len())
    }

    /// Newline-joined full descriptions in chronological order.
    pub fn details(&self) -> String {
        self.errors
            .iter()
            .map(CapturedError::full_description)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Summary followed by the details; this is what goes into the error-details header.
    pub fn description(&self) -> String {
        if self.errors.is_empty() {
            return self.summary();
        }
        format!("{}:\n{}", self.summary(), self.details())
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_has_count_and_every_error() {
        let report = FailureReport::new(vec![
            CapturedError::synthetic("ApplicationError", "boom"),
            CapturedError::synthetic("ApplicationError", "bang"),
        ]);

        let description = report.description();
        assert!(description.starts_with("2 unhandled exceptions"));
        let boom = description.find("boom").unwrap();
        let bang = description.find("bang").unwrap();
        assert!(boom < bang);
    }

    #[test]
    fn empty_report_is_just_the_summary() {
        assert_eq!(FailureReport::new(Vec::new()).description(), "0 unhandled exceptions");
    }
}
