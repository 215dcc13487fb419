//! Continuation policy
//!
//! Evaluated once per iteration, right after validation. Pure and
//! deterministic: it sees exactly four inputs and nothing else.

use serde::{Deserialize, Serialize};

/// What the engine does after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Run another iteration
    Continue,
    /// Generate the report
    Finish,
}

/// Decide whether research continues.
///
/// 1. Sufficient and valid findings finish the run, even at the last iteration.
/// 2. Otherwise the iteration bound finishes it with a best-effort report.
/// 3. Otherwise another iteration runs; the caller bumps `iteration`.
pub fn decide(sufficient: bool, validation_valid: bool, iteration: u32, max_iterations: u32) -> Decision {
    if sufficient && validation_valid {
        return Decision::Finish;
    }
    if iteration >= max_iterations {
        return Decision::Finish;
    }
    Decision::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sufficient_and_valid_always_finishes() {
        for max in 1..6 {
            for iteration in 1..=max + 1 {
                assert_eq!(decide(true, true, iteration, max), Decision::Finish);
            }
        }
    }

    #[test]
    fn test_iteration_limit_finishes() {
        assert_eq!(decide(false, true, 3, 3), Decision::Finish);
        assert_eq!(decide(true, false, 3, 3), Decision::Finish);
        assert_eq!(decide(false, false, 4, 3), Decision::Finish);
    }

    #[test]
    fn test_continue_below_limit() {
        for iteration in 1..5 {
            assert_eq!(decide(false, true, iteration, 5), Decision::Continue);
        }
        // Sufficient but invalid is not enough
        assert_eq!(decide(true, false, 1, 5), Decision::Continue);
    }

    #[test]
    fn test_single_iteration_budget() {
        assert_eq!(decide(false, false, 1, 1), Decision::Finish);
    }
}
