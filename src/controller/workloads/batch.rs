//! Batch size arithmetic
//!
//! Turns the plan's absolute-or-percentage batch sizes into concrete replica
//! goals for the target (new version) and the source (old version).
//! Percentages round up. The last batch always lands exactly on the total so
//! rounding in earlier batches never leaves replicas behind.

use super::WorkloadError;
use crate::crd::rollout::{RolloutBatch, RolloutPlan};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Resolve an absolute or percentage value against `total`
///
/// Accepts `Int(n)`, `"n"` and `"n%"` with n >= 0; percentages must be 0-100.
pub fn scaled_value(value: &IntOrString, total: i32, round_up: bool) -> Result<i32, WorkloadError> {
    let invalid = || WorkloadError::InvalidBatchValue(format!("{value:?}"));

    match value {
        IntOrString::Int(n) if *n >= 0 => Ok(*n),
        IntOrString::Int(_) => Err(invalid()),
        IntOrString::String(s) => {
            let s = s.trim();
            if let Some(percent_str) = s.strip_suffix('%') {
                let percent: i64 = percent_str.trim().parse().map_err(|_| invalid())?;
                if !(0..=100).contains(&percent) {
                    return Err(invalid());
                }
                let scaled = i64::from(total) * percent;
                let resolved = if round_up {
                    (scaled + 99) / 100
                } else {
                    scaled / 100
                };
                i32::try_from(resolved).map_err(|_| invalid())
            } else {
                match s.parse::<i32>() {
                    Ok(n) if n >= 0 => Ok(n),
                    _ => Err(invalid()),
                }
            }
        }
    }
}

fn batch_at(plan: &RolloutPlan, current_batch: usize) -> Result<&RolloutBatch, WorkloadError> {
    plan.rollout_batches
        .get(current_batch)
        .ok_or(WorkloadError::BatchOutOfRange {
            batch: current_batch as i64,
            batches: plan.rollout_batches.len(),
        })
}

/// Replicas that should run the new version once `current_batch` is done
pub fn target_goal(
    plan: &RolloutPlan,
    total: i32,
    current_batch: usize,
) -> Result<i32, WorkloadError> {
    batch_at(plan, current_batch)?;

    if current_batch == plan.rollout_batches.len() - 1 {
        return Ok(total);
    }

    let mut goal: i64 = 0;
    for batch in &plan.rollout_batches[..=current_batch] {
        goal += i64::from(scaled_value(&batch.replicas, total, true)?);
    }
    // Clamped to total, so it fits back into i32
    Ok(goal.min(i64::from(total)) as i32)
}

/// Replicas that should stay on the old version once `current_batch` is done
pub fn source_goal(
    plan: &RolloutPlan,
    total: i32,
    current_batch: usize,
) -> Result<i32, WorkloadError> {
    Ok(total - target_goal(plan, total, current_batch)?)
}

/// Unavailability budget of a batch; none declared means zero
pub fn max_unavailable(batch: &RolloutBatch, reference_size: i32) -> Result<i32, WorkloadError> {
    match &batch.max_unavailable {
        Some(value) => scaled_value(value, reference_size, true),
        None => Ok(0),
    }
}

/// Check that the batches add up to `total`
///
/// Every batch but the last must leave something for the last one. A last
/// batch given as an absolute count has to land exactly on `total`; a
/// percentage last batch absorbs whatever rounding the others caused.
pub fn verify_sum_of_batch_sizes(plan: &RolloutPlan, total: i32) -> Result<(), WorkloadError> {
    let Some((last, rest)) = plan.rollout_batches.split_last() else {
        return Err(WorkloadError::EmptyPlan);
    };

    for batch in &plan.rollout_batches {
        scaled_value(&batch.replicas, total, true)?;
        if let Some(unavailable) = &batch.max_unavailable {
            scaled_value(unavailable, total, true)?;
        }
    }

    let mut sum: i64 = 0;
    for batch in rest {
        sum += i64::from(scaled_value(&batch.replicas, total, true)?);
    }
    if !rest.is_empty() && sum >= i64::from(total) {
        return Err(WorkloadError::BatchSizeMismatch { sum, total });
    }

    let last_is_absolute = match &last.replicas {
        IntOrString::Int(_) => true,
        IntOrString::String(s) => !s.trim().ends_with('%'),
    };
    if last_is_absolute {
        sum += i64::from(scaled_value(&last.replicas, total, true)?);
        if sum != i64::from(total) {
            return Err(WorkloadError::BatchSizeMismatch { sum, total });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::rollout::RolloutStrategyType;

    fn pct(s: &str) -> IntOrString {
        IntOrString::String(s.to_string())
    }

    fn plan(batches: Vec<IntOrString>) -> RolloutPlan {
        RolloutPlan {
            rollout_batches: batches
                .into_iter()
                .map(|replicas| RolloutBatch {
                    replicas,
                    max_unavailable: None,
                })
                .collect(),
            rollout_strategy: RolloutStrategyType::IncreaseFirst,
            target_size: None,
        }
    }

    #[test]
    fn test_scaled_value_percent_rounds_up() {
        assert_eq!(scaled_value(&pct("25%"), 10, true).unwrap(), 3);
        assert_eq!(scaled_value(&pct("25%"), 10, false).unwrap(), 2);
        assert_eq!(scaled_value(&pct("50%"), 10, true).unwrap(), 5);
        assert_eq!(scaled_value(&pct("0%"), 10, true).unwrap(), 0);
        assert_eq!(scaled_value(&pct("100%"), 7, true).unwrap(), 7);
    }

    #[test]
    fn test_scaled_value_absolute() {
        assert_eq!(scaled_value(&IntOrString::Int(4), 10, true).unwrap(), 4);
        assert_eq!(scaled_value(&pct("4"), 10, true).unwrap(), 4);
    }

    #[test]
    fn test_scaled_value_rejects_malformed() {
        assert!(scaled_value(&IntOrString::Int(-1), 10, true).is_err());
        assert!(scaled_value(&pct("-5%"), 10, true).is_err());
        assert!(scaled_value(&pct("150%"), 10, true).is_err());
        assert!(scaled_value(&pct("half"), 10, true).is_err());
        assert!(scaled_value(&pct("%"), 10, true).is_err());
    }

    #[test]
    fn test_goals_for_two_half_batches() {
        let plan = plan(vec![pct("50%"), pct("50%")]);

        assert_eq!(target_goal(&plan, 10, 0).unwrap(), 5);
        assert_eq!(source_goal(&plan, 10, 0).unwrap(), 5);
        assert_eq!(target_goal(&plan, 10, 1).unwrap(), 10);
        assert_eq!(source_goal(&plan, 10, 1).unwrap(), 0);
    }

    #[test]
    fn test_last_batch_is_exact_despite_rounding() {
        // 34% of 10 rounds up to 4 each time: 4, 8, then the last batch lands on 10
        let plan = plan(vec![pct("34%"), pct("34%"), pct("34%")]);

        assert_eq!(target_goal(&plan, 10, 0).unwrap(), 4);
        assert_eq!(target_goal(&plan, 10, 1).unwrap(), 8);
        assert_eq!(target_goal(&plan, 10, 2).unwrap(), 10);
        assert_eq!(source_goal(&plan, 10, 2).unwrap(), 0);
    }

    #[test]
    fn test_goals_are_monotonic() {
        let plan = plan(vec![
            IntOrString::Int(1),
            pct("20%"),
            pct("33%"),
            IntOrString::Int(0),
            pct("40%"),
        ]);
        let total = 13;

        for i in 0..plan.rollout_batches.len() - 1 {
            assert!(target_goal(&plan, total, i).unwrap() <= target_goal(&plan, total, i + 1).unwrap());
            assert!(source_goal(&plan, total, i).unwrap() >= source_goal(&plan, total, i + 1).unwrap());
        }
        assert_eq!(target_goal(&plan, total, 4).unwrap(), total);
    }

    #[test]
    fn test_goal_out_of_range_batch() {
        let plan = plan(vec![pct("100%")]);
        assert!(matches!(
            target_goal(&plan, 10, 1),
            Err(WorkloadError::BatchOutOfRange { batch: 1, batches: 1 })
        ));
    }

    #[test]
    fn test_max_unavailable() {
        let mut batch = RolloutBatch {
            replicas: pct("50%"),
            max_unavailable: None,
        };
        assert_eq!(max_unavailable(&batch, 10).unwrap(), 0);

        batch.max_unavailable = Some(IntOrString::Int(2));
        assert_eq!(max_unavailable(&batch, 10).unwrap(), 2);

        batch.max_unavailable = Some(pct("10%"));
        assert_eq!(max_unavailable(&batch, 5).unwrap(), 1);
    }

    #[test]
    fn test_verify_sum_accepts_percentages() {
        assert!(verify_sum_of_batch_sizes(&plan(vec![pct("50%"), pct("50%")]), 10).is_ok());
        // Last percentage batch absorbs the surplus
        assert!(verify_sum_of_batch_sizes(&plan(vec![pct("60%"), pct("50%")]), 10).is_ok());
        assert!(verify_sum_of_batch_sizes(&plan(vec![pct("100%")]), 10).is_ok());
    }

    #[test]
    fn test_verify_sum_absolute_last_batch_must_be_exact() {
        assert!(verify_sum_of_batch_sizes(
            &plan(vec![IntOrString::Int(4), IntOrString::Int(6)]),
            10
        )
        .is_ok());

        let err = verify_sum_of_batch_sizes(
            &plan(vec![IntOrString::Int(3), IntOrString::Int(6)]),
            10,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            WorkloadError::BatchSizeMismatch { sum: 9, total: 10 }
        ));

        // Single absolute batch short of the total
        assert!(verify_sum_of_batch_sizes(&plan(vec![IntOrString::Int(9)]), 10).is_err());
    }

    #[test]
    fn test_verify_sum_rejects_early_batches_covering_everything() {
        let err = verify_sum_of_batch_sizes(&plan(vec![pct("100%"), pct("10%")]), 10).unwrap_err();
        assert!(matches!(
            err,
            WorkloadError::BatchSizeMismatch { sum: 10, total: 10 }
        ));
    }

    #[test]
    fn test_verify_sum_reports_huge_batches_without_overflow() {
        let err = verify_sum_of_batch_sizes(
            &plan(vec![
                IntOrString::Int(i32::MAX),
                IntOrString::Int(i32::MAX),
                pct("50%"),
            ]),
            10,
        )
        .unwrap_err();
        match err {
            WorkloadError::BatchSizeMismatch { sum, total } => {
                assert_eq!(sum, 2 * i64::from(i32::MAX));
                assert_eq!(total, 10);
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = verify_sum_of_batch_sizes(
            &plan(vec![IntOrString::Int(5), IntOrString::Int(i32::MAX)]),
            10,
        )
        .unwrap_err();
        assert!(matches!(err, WorkloadError::BatchSizeMismatch { total: 10, .. }));
    }

    #[test]
    fn test_target_goal_clamps_huge_batches() {
        let plan = plan(vec![
            IntOrString::Int(i32::MAX),
            IntOrString::Int(i32::MAX),
            pct("50%"),
        ]);
        assert_eq!(target_goal(&plan, 10, 1).unwrap(), 10);
        assert_eq!(source_goal(&plan, 10, 1).unwrap(), 0);
    }

    #[test]
    fn test_verify_sum_rejects_empty_and_malformed_plans() {
        assert!(matches!(
            verify_sum_of_batch_sizes(&plan(vec![]), 10),
            Err(WorkloadError::EmptyPlan)
        ));
        assert!(matches!(
            verify_sum_of_batch_sizes(&plan(vec![pct("lots"), pct("50%")]), 10),
            Err(WorkloadError::InvalidBatchValue(_))
        ));
    }
}
