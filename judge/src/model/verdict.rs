use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Status of a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    /// Execution finished without a system-level verdict; output still has to be compared
    Unknown,
    Accepted,
    WrongAnswer,
    RuntimeError,
    MemoryLimitExceeded,
    TimeLimitExceeded,
    InternalError,
    CompilationError,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Unknown => "UNKNOWN",
            TestStatus::Accepted => "ACCEPTED",
            TestStatus::WrongAnswer => "WRONG_ANSWER",
            TestStatus::RuntimeError => "RUNTIME_ERROR",
            TestStatus::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            TestStatus::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            TestStatus::InternalError => "INTERNAL_ERROR",
            TestStatus::CompilationError => "COMPILATION_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Overall status of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubmissionStatus {
    Unknown,
    Pending,
    Ac,
    Wa,
    Re,
    Mle,
    Tle,
    Ie,
    Ce,
}

impl SubmissionStatus {
    /// Whether judging has produced a final answer
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Unknown | SubmissionStatus::Pending)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionStatus::Unknown => "UNKNOWN",
            SubmissionStatus::Pending => "PENDING",
            SubmissionStatus::Ac => "AC",
            SubmissionStatus::Wa => "WA",
            SubmissionStatus::Re => "RE",
            SubmissionStatus::Mle => "MLE",
            SubmissionStatus::Tle => "TLE",
            SubmissionStatus::Ie => "IE",
            SubmissionStatus::Ce => "CE",
        };
        write!(f, "{}", s)
    }
}

/// Statuses observed across the tests of one submission.
///
/// `Unknown` never contributes to the observed set.
pub struct ObservedStatuses {
    tests: usize,
    seen: BTreeSet<TestStatus>,
}

impl ObservedStatuses {
    pub fn collect<'a>(statuses: impl IntoIterator<Item = &'a TestStatus>) -> Self {
        let mut tests = 0;
        let mut seen = BTreeSet::new();
        for status in statuses {
            tests += 1;
            if *status != TestStatus::Unknown {
                seen.insert(*status);
            }
        }
        Self { tests, seen }
    }

    pub fn contains(&self, status: TestStatus) -> bool {
        self.seen.contains(&status)
    }

    fn is_empty(&self) -> bool {
        self.tests == 0
    }

    fn only_accepted(&self) -> bool {
        self.seen.len() == 1 && self.contains(TestStatus::Accepted)
    }
}

type Rule = (fn(&ObservedStatuses) -> bool, SubmissionStatus);

/// Aggregation policy, evaluated top to bottom; the first matching rule wins.
/// The order is part of the external contract.
const AGGREGATION_RULES: &[Rule] = &[
    (ObservedStatuses::is_empty, SubmissionStatus::Ce),
    (ObservedStatuses::only_accepted, SubmissionStatus::Ac),
    (has_compilation_error, SubmissionStatus::Ce),
    (has_wrong_answer, SubmissionStatus::Wa),
    (has_memory_limit_exceeded, SubmissionStatus::Mle),
    (has_time_limit_exceeded, SubmissionStatus::Tle),
    (has_internal_error, SubmissionStatus::Ie),
];

fn has_compilation_error(s: &ObservedStatuses) -> bool {
    s.contains(TestStatus::CompilationError)
}

fn has_wrong_answer(s: &ObservedStatuses) -> bool {
    s.contains(TestStatus::WrongAnswer)
}

fn has_memory_limit_exceeded(s: &ObservedStatuses) -> bool {
    s.contains(TestStatus::MemoryLimitExceeded)
}

fn has_time_limit_exceeded(s: &ObservedStatuses) -> bool {
    s.contains(TestStatus::TimeLimitExceeded)
}

fn has_internal_error(s: &ObservedStatuses) -> bool {
    s.contains(TestStatus::InternalError)
}

/// Derive the overall submission status from per-test statuses
pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a TestStatus>) -> SubmissionStatus {
    let observed = ObservedStatuses::collect(statuses);
    AGGREGATION_RULES
        .iter()
        .find(|(matches, _)| matches(&observed))
        .map(|(_, status)| *status)
        .unwrap_or(SubmissionStatus::Re)
}
