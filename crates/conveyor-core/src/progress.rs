use crate::task::TaskStatus;

/// Map a task's status and pipeline position to a 0–100 progress value.
///
/// Active progress advances in proportion to completed agents over an
/// 80-point band starting at 15. Failure-class and cancelled states freeze
/// the last computed value rather than resetting it, so observed progress
/// never moves backwards.
pub fn progress_for(
    status: TaskStatus,
    agents_completed: usize,
    agents_total: usize,
    last: u8,
) -> u8 {
    match status {
        TaskStatus::Created => 0,
        TaskStatus::Staging => 10,
        TaskStatus::Ready => 15,
        TaskStatus::Active => {
            if agents_total == 0 {
                15
            } else {
                let band = (agents_completed * 80) / agents_total;
                15 + band.min(80) as u8
            }
        }
        TaskStatus::Completed => 100,
        TaskStatus::StagingFailed
        | TaskStatus::Failed
        | TaskStatus::Cancelled
        | TaskStatus::Expired => last,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_stage_values() {
        assert_eq!(progress_for(TaskStatus::Created, 0, 0, 0), 0);
        assert_eq!(progress_for(TaskStatus::Staging, 0, 0, 0), 10);
        assert_eq!(progress_for(TaskStatus::Ready, 0, 0, 10), 15);
        assert_eq!(progress_for(TaskStatus::Completed, 3, 3, 95), 100);
    }

    #[test]
    fn active_band_scales_with_position() {
        assert_eq!(progress_for(TaskStatus::Active, 0, 4, 15), 15);
        assert_eq!(progress_for(TaskStatus::Active, 1, 4, 15), 35);
        assert_eq!(progress_for(TaskStatus::Active, 2, 4, 35), 55);
        assert_eq!(progress_for(TaskStatus::Active, 3, 4, 55), 75);
        assert_eq!(progress_for(TaskStatus::Active, 4, 4, 75), 95);

        // Uneven split floors, never exceeds the band.
        assert_eq!(progress_for(TaskStatus::Active, 1, 3, 15), 41);
        assert_eq!(progress_for(TaskStatus::Active, 2, 3, 41), 68);
        assert_eq!(progress_for(TaskStatus::Active, 9, 3, 0), 95);
    }

    #[test]
    fn zero_agents_stays_at_claim_value() {
        assert_eq!(progress_for(TaskStatus::Active, 0, 0, 15), 15);
    }

    #[test]
    fn failure_states_freeze_last_value() {
        assert_eq!(progress_for(TaskStatus::Failed, 2, 4, 55), 55);
        assert_eq!(progress_for(TaskStatus::Cancelled, 1, 4, 35), 35);
        assert_eq!(progress_for(TaskStatus::Expired, 0, 0, 10), 10);
        assert_eq!(progress_for(TaskStatus::StagingFailed, 0, 0, 10), 10);
    }

    #[test]
    fn monotonic_over_a_full_walk() {
        let mut last = 0u8;
        let walk = [
            (TaskStatus::Created, 0),
            (TaskStatus::Staging, 0),
            (TaskStatus::Ready, 0),
            (TaskStatus::Active, 0),
            (TaskStatus::Active, 1),
            (TaskStatus::Active, 2),
            (TaskStatus::Completed, 2),
        ];
        for (status, done) in walk {
            let next = progress_for(status, done, 2, last);
            assert!(next >= last, "{status}: {next} < {last}");
            last = next;
        }
        assert_eq!(last, 100);
    }
}
