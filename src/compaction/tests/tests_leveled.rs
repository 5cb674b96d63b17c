//! Trigger evaluation and input selection of the leveled strategy.

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::compaction::leveled::LeveledStrategy;
    use crate::compaction::tests::helpers::*;
    use crate::compaction::CompactionStrategy;
    use crate::manifest::Version;

    fn file_numbers(task: &crate::compaction::CompactionTask) -> Vec<u64> {
        task.inputs.iter().map(|t| t.file_number()).collect()
    }

    #[test]
    fn level_budget_grows_geometrically() {
        let strategy = LeveledStrategy::new(4, 1000, 10);
        assert_eq!(strategy.level_budget(1), 1000);
        assert_eq!(strategy.level_budget(2), 10_000);
        assert_eq!(strategy.level_budget(3), 100_000);
        assert_eq!(strategy.level_budget(40), u64::MAX);
    }

    #[test]
    fn l0_below_trigger_needs_nothing() {
        let tmp = TempDir::new().unwrap();
        let version = Version::from_tables(
            4,
            vec![
                table(tmp.path(), 1, 0, &["a", "b"], "1"),
                table(tmp.path(), 2, 0, &["c"], "1"),
            ],
        )
        .unwrap();

        let strategy = LeveledStrategy::new(3, u64::MAX, 10);
        assert!(!strategy.needs_compaction(&version));
        assert!(strategy.pick(&version).is_none());
    }

    #[test]
    fn l0_pick_takes_all_l0_plus_overlapping_l1() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let version = Version::from_tables(
            4,
            vec![
                table(tmp.path(), 1, 1, &["a", "b"], "old"),
                table(tmp.path(), 2, 1, &["m", "n"], "old"),
                table(tmp.path(), 3, 1, &["x", "y"], "old"),
                table(tmp.path(), 4, 0, &["b", "c"], "new"),
                table(tmp.path(), 5, 0, &["k", "n"], "new"),
            ],
        )
        .unwrap();

        let strategy = LeveledStrategy::new(2, u64::MAX, 10);
        assert!(strategy.needs_compaction(&version));
        let task = strategy.pick(&version).unwrap();

        assert_eq!(task.level, 0);
        assert_eq!(task.output_level, 1);
        // Newest L0 first, then the L1 tables intersecting [b, n].
        assert_eq!(file_numbers(&task), vec![5, 4, 1, 2]);
        assert!(task.drop_tombstones);
    }

    #[test]
    fn tombstones_kept_when_deeper_levels_have_data() {
        let tmp = TempDir::new().unwrap();
        let version = Version::from_tables(
            4,
            vec![
                table(tmp.path(), 1, 0, &["a"], "1"),
                table(tmp.path(), 2, 3, &["a"], "deep"),
            ],
        )
        .unwrap();

        let task = LeveledStrategy::new(1, u64::MAX, 10).pick(&version).unwrap();
        assert!(!task.drop_tombstones);
    }

    #[test]
    fn oversized_level_rotates_through_tables() {
        let tmp = TempDir::new().unwrap();
        let version = Version::from_tables(
            4,
            vec![
                wide_table(tmp.path(), 1, 1, "a", 10),
                wide_table(tmp.path(), 2, 1, "b", 10),
                wide_table(tmp.path(), 3, 1, "c", 10),
                wide_table(tmp.path(), 4, 2, "b", 5),
            ],
        )
        .unwrap();

        // Budget of one byte keeps L1 over its trigger.
        let strategy = LeveledStrategy::new(100, 1, 1_000_000);
        let picks: Vec<Vec<u64>> = (0..4)
            .map(|_| file_numbers(&strategy.pick(&version).unwrap()))
            .collect();

        assert_eq!(picks, vec![vec![1], vec![2, 4], vec![3], vec![1]]);
    }

    #[test]
    fn deepest_level_never_compacts() {
        let tmp = TempDir::new().unwrap();
        let version = Version::from_tables(
            3,
            vec![wide_table(tmp.path(), 1, 2, "a", 50)],
        )
        .unwrap();

        let strategy = LeveledStrategy::new(1, 1, 2);
        assert!(!strategy.needs_compaction(&version));
        assert!(strategy.pick(&version).is_none());
    }

    #[test]
    fn sorted_level_task_targets_next_level() {
        let tmp = TempDir::new().unwrap();
        let version = Version::from_tables(
            3,
            vec![wide_table(tmp.path(), 7, 1, "k", 20)],
        )
        .unwrap();

        let task = LeveledStrategy::new(4, 1, 10).pick(&version).unwrap();
        assert_eq!((task.level, task.output_level), (1, 2));
        assert_eq!(file_numbers(&task), vec![7]);
        assert!(task.drop_tombstones);
    }
}
