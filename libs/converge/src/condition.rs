//! Conditions over snapshots.

use std::fmt;

type Check<S> = Box<dyn Fn(&S) -> bool + Send + Sync>;
type FailCheck<S> = Box<dyn Fn(&S) -> Option<String> + Send + Sync>;

/// A predicate a wait is trying to make true.
///
/// Besides the predicate itself a condition can carry "fail" checks that
/// recognize snapshots from which the predicate can never become true, so a
/// wait can stop early instead of running into its timeout.
pub struct Condition<S> {
    description: String,
    satisfied: Check<S>,
    fail_checks: Vec<FailCheck<S>>,
    accept_gone: bool,
}

impl<S> Condition<S> {
    /// Create a condition from a description and a predicate.
    pub fn new<F>(description: impl Into<String>, satisfied: F) -> Self
    where
        F: Fn(&S) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            satisfied: Box::new(satisfied),
            fail_checks: Vec::new(),
            accept_gone: false,
        }
    }

    /// Add a check that returns a reason when the snapshot rules out success.
    pub fn fail_when<F>(mut self, check: F) -> Self
    where
        F: Fn(&S) -> Option<String> + Send + Sync + 'static,
    {
        self.fail_checks.push(Box::new(check));
        self
    }

    /// Treat "the backend no longer knows the resource" as success.
    pub fn accept_gone(mut self) -> Self {
        self.accept_gone = true;
        self
    }

    /// Both conditions must hold. Fail checks of both apply.
    pub fn and(self, other: Condition<S>) -> Self
    where
        S: 'static,
    {
        let Condition {
            description,
            satisfied,
            mut fail_checks,
            accept_gone,
        } = self;
        fail_checks.extend(other.fail_checks);
        let other_satisfied = other.satisfied;

        Self {
            description: format!("{} and {}", description, other.description),
            satisfied: Box::new(move |s| satisfied(s) && other_satisfied(s)),
            fail_checks,
            accept_gone: accept_gone && other.accept_gone,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_satisfied(&self, snapshot: &S) -> bool {
        (self.satisfied)(snapshot)
    }

    /// Reason the snapshot can never satisfy this condition, if any.
    pub fn unrecoverable(&self, snapshot: &S) -> Option<String> {
        self.fail_checks.iter().find_map(|check| check(snapshot))
    }

    pub fn accepts_gone(&self) -> bool {
        self.accept_gone
    }
}

impl<S> fmt::Debug for Condition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("description", &self.description)
            .field("fail_checks", &self.fail_checks.len())
            .field("accept_gone", &self.accept_gone)
            .finish()
    }
}

impl<S> fmt::Display for Condition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}
