use std::time::{Duration, Instant};

use dispatch_core::{DispatchError, Result};

/// Caller-supplied time budget for a routing call.
///
/// Checked before each registry and health lookup so a slow store surfaces
/// as `DeadlineExceeded` instead of a hung request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn none() -> Self {
        Self { at: None }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(budget),
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Fails with `DeadlineExceeded` naming `stage` once the deadline passed.
    pub fn check(&self, stage: &str) -> Result<()> {
        if self.is_expired() {
            return Err(DispatchError::DeadlineExceeded {
                stage: stage.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_never_expires() {
        let d = Deadline::none();
        assert!(!d.is_expired());
        assert!(d.check("registry").is_ok());
        assert_eq!(d.remaining(), None);
    }

    #[test]
    fn past_deadline_fails_with_stage() {
        let d = Deadline::at(Instant::now());
        let err = d.check("health lookup").unwrap_err();
        assert_eq!(
            err,
            DispatchError::DeadlineExceeded {
                stage: "health lookup".into()
            }
        );
    }

    #[test]
    fn generous_budget_passes() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(d.check("registry").is_ok());
        assert!(d.remaining().is_some_and(|r| r > Duration::from_secs(50)));
    }
}
