//! Observability events for rlsgate
//!
//! Every log line carries an `event` field naming one of these. Events are
//! explicit and typed so log consumers can match on stable strings.

use std::fmt;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Configuration
    /// Configuration loaded
    ConfigLoaded,
    /// Policy file loaded into the registry
    PoliciesLoaded,

    // Registry
    /// Policy created
    PolicyCreated,
    /// Policy dropped
    PolicyDropped,
    /// Row level security enabled, disabled or forced
    RlsToggled,
    /// New registry snapshot published
    SnapshotPublished,
    /// Static check flagged a policy
    LintWarning,

    // Evaluation
    /// Statement context created
    StatementBegin,
    /// Statement finished; cache statistics attached
    StatementComplete,
    /// Bypass role or exempt table skipped policies
    RlsBypassed,
    /// Access denied by policy
    AccessDenied,
    /// Write rejected by a WITH CHECK clause
    WriteRejected,
    /// Statement aborted by cancellation or timeout
    StatementCancelled,
    /// Predicate evaluation failed
    EvaluationFailed,

    // Harness
    /// Fixture run started
    FixtureStart,
    /// Fixture case did not match its expectation
    CaseFailed,
    /// Fixture run finished
    FixtureComplete,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::PoliciesLoaded => "POLICIES_LOADED",

            Event::PolicyCreated => "POLICY_CREATED",
            Event::PolicyDropped => "POLICY_DROPPED",
            Event::RlsToggled => "RLS_TOGGLED",
            Event::SnapshotPublished => "SNAPSHOT_PUBLISHED",
            Event::LintWarning => "POLICY_LINT_WARNING",

            Event::StatementBegin => "STATEMENT_BEGIN",
            Event::StatementComplete => "STATEMENT_COMPLETE",
            Event::RlsBypassed => "RLS_BYPASSED",
            Event::AccessDenied => "RLS_ACCESS_DENIED",
            Event::WriteRejected => "RLS_WRITE_REJECTED",
            Event::StatementCancelled => "STATEMENT_CANCELLED",
            Event::EvaluationFailed => "POLICY_EVALUATION_FAILED",

            Event::FixtureStart => "FIXTURE_BEGIN",
            Event::CaseFailed => "FIXTURE_CASE_FAILED",
            Event::FixtureComplete => "FIXTURE_COMPLETE",
        }
    }

    /// Returns true if the event reports a statement-level failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Event::StatementCancelled | Event::EvaluationFailed | Event::CaseFailed
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_strings_are_stable() {
        assert_eq!(Event::AccessDenied.as_str(), "RLS_ACCESS_DENIED");
        assert_eq!(Event::SnapshotPublished.to_string(), "SNAPSHOT_PUBLISHED");
    }

    #[test]
    fn test_failure_events() {
        assert!(Event::EvaluationFailed.is_failure());
        assert!(!Event::AccessDenied.is_failure());
    }
}
