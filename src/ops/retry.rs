//! Generic retry controller with validator feedback ("steering").
//!
//! Each attempt produces a candidate; the validator either accepts it or
//! returns a diagnosis. The diagnosis is fed to the steering hook, which
//! mutates the caller's prompt state (a steering message in a chat retry,
//! an appended instruction in a compression retry) before the next attempt.
//! With purification enabled, HEAD is restored to the pre-retry point on
//! success so the caller can re-commit the clean result, leaving the retry
//! commits orphaned but queryable.

use crate::errors::{Result, TractError};

/// One failed attempt's diagnosis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    pub diagnosis: String,
}

/// Successful controller output.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
    /// Diagnoses of the failed attempts, in order.
    pub history: Vec<RetryAttempt>,
}

/// Controller knobs.
#[derive(Debug, Clone, Default)]
pub struct RetryControls {
    /// Total attempt ceiling; zero is treated as one.
    pub max_retries: u32,
    /// Restore HEAD to the pre-retry point on success.
    pub purify: bool,
    /// Optional note the caller attaches to purified re-commits.
    pub provenance_note: Option<String>,
}

impl RetryControls {
    pub fn new(max_retries: u32) -> Self {
        RetryControls {
            max_retries,
            purify: false,
            provenance_note: None,
        }
    }

    pub fn purified(mut self) -> Self {
        self.purify = true;
        self
    }
}

/// Run `attempt` until `validate` accepts or the ceiling is hit.
///
/// `validate` returns `None` to accept and `Some(diagnosis)` to reject;
/// rejections are fed to `steer` before the next attempt. `head_fn` and
/// `reset_fn` only run when purification is on. Exhaustion carries the
/// last diagnosis and the last rejected value (serialized), so callers can
/// inspect what the final attempt actually produced.
pub fn retry_with_steering<T: serde::Serialize>(
    controls: &RetryControls,
    mut attempt: impl FnMut(u32) -> Result<T>,
    mut validate: impl FnMut(&T) -> Result<Option<String>>,
    mut steer: impl FnMut(&str) -> Result<()>,
    head_fn: impl FnOnce() -> Result<Option<String>>,
    mut reset_fn: impl FnMut(&str) -> Result<()>,
) -> Result<RetryOutcome<T>> {
    let max_attempts = controls.max_retries.max(1);
    let pre_head = if controls.purify { head_fn()? } else { None };

    let mut history: Vec<RetryAttempt> = Vec::new();
    let mut last_rejected: Option<T> = None;
    for attempt_number in 1..=max_attempts {
        let value = attempt(attempt_number)?;
        match validate(&value)? {
            None => {
                if controls.purify {
                    if let Some(head) = &pre_head {
                        reset_fn(head)?;
                    }
                }
                return Ok(RetryOutcome {
                    value,
                    attempts: attempt_number,
                    history,
                });
            }
            Some(diagnosis) => {
                tracing::debug!(attempt = attempt_number, %diagnosis, "attempt rejected");
                if attempt_number < max_attempts {
                    steer(&diagnosis)?;
                }
                history.push(RetryAttempt {
                    attempt: attempt_number,
                    diagnosis,
                });
                last_rejected = Some(value);
            }
        }
    }

    Err(TractError::RetryExhausted {
        attempts: max_attempts,
        last_diagnosis: history.last().map(|entry| entry.diagnosis.clone()),
        last_result: last_rejected
            .as_ref()
            .and_then(|value| serde_json::to_value(value).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_first_attempt_success_needs_no_steering() {
        let steered = RefCell::new(0);
        let outcome = retry_with_steering(
            &RetryControls::new(3),
            |_| Ok("fine".to_string()),
            |_| Ok(None),
            |_| {
                *steered.borrow_mut() += 1;
                Ok(())
            },
            || Ok(None),
            |_| Ok(()),
        )
        .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.history.is_empty());
        assert_eq!(*steered.borrow(), 0);
    }

    #[test]
    fn test_steering_feeds_diagnosis_between_attempts() {
        let prompts = RefCell::new(vec!["base".to_string()]);
        let outcome = retry_with_steering(
            &RetryControls::new(3),
            |n| Ok(format!("attempt-{n} with {}", prompts.borrow().join("+"))),
            |value| {
                Ok(if value.contains("fix it") {
                    None
                } else {
                    Some("missing $50k".to_string())
                })
            },
            |diagnosis| {
                assert_eq!(diagnosis, "missing $50k");
                prompts.borrow_mut().push("fix it".to_string());
                Ok(())
            },
            || Ok(None),
            |_| Ok(()),
        )
        .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(outcome.history[0].diagnosis, "missing $50k");
    }

    /// Exhaustion reports what failed and what the final attempt produced.
    #[test]
    fn test_exhaustion_carries_last_diagnosis_and_result() {
        let err = retry_with_steering(
            &RetryControls::new(2),
            |n| Ok(format!("draft {n}")),
            |_| Ok(Some("still wrong".to_string())),
            |_| Ok(()),
            || Ok(None),
            |_| Ok(()),
        )
        .unwrap_err();
        match err {
            TractError::RetryExhausted {
                attempts,
                last_diagnosis,
                last_result,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_diagnosis.as_deref(), Some("still wrong"));
                assert_eq!(last_result, Some(serde_json::json!("draft 2")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_purify_restores_head_on_success() {
        let resets = RefCell::new(Vec::new());
        let calls = RefCell::new(0);
        retry_with_steering(
            &RetryControls::new(3).purified(),
            |n| Ok(n),
            |n| {
                *calls.borrow_mut() += 1;
                Ok((*n < 2).then(|| "retry".to_string()))
            },
            |_| Ok(()),
            || Ok(Some("head-0".to_string())),
            |head: &str| {
                resets.borrow_mut().push(head.to_string());
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(resets.borrow().as_slice(), ["head-0"]);
        assert_eq!(*calls.borrow(), 2);
    }
}
