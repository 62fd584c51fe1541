//! Interval planner (C4): derives the ordered list of `(start, end)` work
//! intervals from the catalog's global window. See spec.md §4.3.

use crate::time::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: Timestamp,
    pub end: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// The intervals this run is actually responsible for working
    /// (`intervals[start_idx..start_idx+work_count]` of the full split).
    pub intervals: Vec<Interval>,
    /// `|Plan|` over the *entire* window, independent of `start_idx`/`count`
    /// windowing — this is what gets persisted as `intervals_total_cnt` and
    /// checked for resume consistency.
    pub total: usize,
}

/// Split `[first, last]` into intervals of `size` (spec.md §4.3, steps 1–3),
/// then select the `[start_idx, start_idx + count)` sub-range to work on
/// (steps 4–7).
///
/// `first`/`last` are `None` when the catalog has no series at all, in which
/// case the plan is empty (spec.md §8 boundary behavior).
pub fn generate(
    first: Option<Timestamp>,
    last: Option<Timestamp>,
    size: u64,
    count: i64,
    start_idx: usize,
) -> Plan {
    let (Some(first), Some(last)) = (first, last) else {
        return Plan::default();
    };
    debug_assert!(size > 0, "interval size must be positive");

    let mut intervals = Vec::new();
    let mut upper = first.saturating_add(size).min(last);
    intervals.push(Interval { start: first, end: upper });

    while upper < last {
        let lower = upper + 1;
        upper = (upper + size).min(last);
        intervals.push(Interval { start: lower, end: upper });
    }

    let total = intervals.len();

    let work_count = if count == -1 {
        total
    } else {
        count.max(0) as usize
    };

    let start_idx = if start_idx >= total {
        tracing::warn!(
            start_idx,
            total,
            "requested start index greater than total interval count, starting at index 0 instead"
        );
        0
    } else {
        start_idx
    };

    let end_idx = (start_idx + work_count).min(total);
    let work_intervals = intervals[start_idx..end_idx].to_vec();

    tracing::info!(
        count = work_intervals.len(),
        start_idx,
        total,
        "interval plan computed"
    );

    Plan {
        intervals: work_intervals,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bounds_yield_empty_plan() {
        let plan = generate(None, None, 100, -1, 0);
        assert!(plan.intervals.is_empty());
        assert_eq!(plan.total, 0);
    }

    #[test]
    fn single_sample_window_is_one_zero_width_interval() {
        let plan = generate(Some(42), Some(42), 100, -1, 0);
        assert_eq!(plan.intervals, vec![Interval { start: 42, end: 42 }]);
        assert_eq!(plan.total, 1);
    }

    #[test]
    fn seed_scenario_1_covers_window_with_plus_one_offsets() {
        // 3 series x 10 samples, interval_size=100, window 0..250.
        let plan = generate(Some(0), Some(250), 100, -1, 0);
        assert_eq!(
            plan.intervals,
            vec![
                Interval { start: 0, end: 100 },
                Interval { start: 101, end: 200 },
                Interval { start: 201, end: 250 },
            ]
        );
        assert_eq!(plan.total, 3);
    }

    #[test]
    fn consecutive_intervals_have_no_overlap_or_gap() {
        let plan = generate(Some(0), Some(10_000), 777, -1, 0);
        for w in plan.intervals.windows(2) {
            assert_eq!(w[1].start, w[0].end + 1);
        }
        assert_eq!(plan.intervals.first().unwrap().start, 0);
        assert_eq!(plan.intervals.last().unwrap().end, 10_000);
    }

    #[test]
    fn nb_minus_one_works_all_intervals() {
        let plan = generate(Some(0), Some(1000), 100, -1, 0);
        assert_eq!(plan.intervals.len(), plan.total);
    }

    #[test]
    fn explicit_count_limits_work_to_min_nb_total_minus_start_idx() {
        let plan = generate(Some(0), Some(1000), 100, 2, 3);
        assert_eq!(plan.intervals.len(), 2);
        assert_eq!(plan.total, 10);
    }

    #[test]
    fn out_of_range_start_idx_resets_to_zero_with_warning() {
        let plan = generate(Some(0), Some(1000), 100, -1, 999);
        assert_eq!(plan.intervals.first().unwrap().start, 0);
        assert_eq!(plan.intervals.len(), plan.total);
    }

    #[test]
    fn count_larger_than_remaining_is_clamped() {
        let plan = generate(Some(0), Some(1000), 100, 100, 9);
        // total is 10 intervals (indices 0..9); starting at 9 leaves 1.
        assert_eq!(plan.total, 10);
        assert_eq!(plan.intervals.len(), 1);
    }
}
