//! k-way merge semantics: key order, newest-source-wins and error handling.

#[cfg(test)]
mod tests {
    use crate::command::Command;
    use crate::compaction::MergeIterator;
    use crate::sstable::SSTableError;

    type Item = Result<Command, SSTableError>;

    fn source(cmds: Vec<Command>) -> Box<dyn Iterator<Item = Item>> {
        Box::new(cmds.into_iter().map(Ok))
    }

    fn keys(cmds: &[Command]) -> Vec<&str> {
        cmds.iter().map(|c| c.key()).collect()
    }

    #[test]
    fn interleaves_sources_in_key_order() {
        let merged: Vec<Command> = MergeIterator::new(vec![
            source(vec![Command::set("a", "1"), Command::set("d", "1")]),
            source(vec![Command::set("b", "2"), Command::set("e", "2")]),
            source(vec![Command::set("c", "3")]),
        ])
        .collect::<Result<_, _>>()
        .unwrap();

        assert_eq!(keys(&merged), ["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn lowest_rank_wins_on_equal_keys() {
        let merged: Vec<Command> = MergeIterator::new(vec![
            source(vec![Command::set("k", "newest"), Command::remove("x")]),
            source(vec![Command::set("k", "middle"), Command::set("x", "old")]),
            source(vec![Command::set("k", "oldest")]),
        ])
        .collect::<Result<_, _>>()
        .unwrap();

        assert_eq!(merged, vec![Command::set("k", "newest"), Command::remove("x")]);
    }

    #[test]
    fn empty_sources_are_fine() {
        let merged: Vec<Item> = MergeIterator::new(vec![
            source(Vec::new()),
            source(vec![Command::set("a", "1")]),
            source(Vec::new()),
        ])
        .collect();
        assert_eq!(merged.len(), 1);

        assert!(MergeIterator::new(Vec::new()).next().is_none());
    }

    #[test]
    fn source_error_is_yielded_once_and_ends_merge() {
        let failing: Box<dyn Iterator<Item = Item>> = Box::new(
            vec![
                Ok(Command::set("a", "1")),
                Err(SSTableError::Corrupt("bad part".into())),
                Ok(Command::set("z", "1")),
            ]
            .into_iter(),
        );
        let mut merge = MergeIterator::new(vec![
            failing,
            source(vec![Command::set("b", "2"), Command::set("c", "2")]),
        ]);

        assert_eq!(merge.next().unwrap().unwrap(), Command::set("a", "1"));
        assert!(matches!(merge.next(), Some(Err(SSTableError::Corrupt(_)))));
        assert!(merge.next().is_none());
    }
}
