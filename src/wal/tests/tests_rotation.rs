//! Rotation of the active log to the staging file.

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::command::Command;
    use crate::wal::tests::helpers::*;
    use crate::wal::{Wal, WalError};

    #[test]
    fn rotation_moves_contents_and_starts_fresh() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let wal_path = tmp.path().join("wal");
        let staging = tmp.path().join("walTmp");

        let mut wal = Wal::open(&wal_path, false).unwrap();
        let cmds = sample_commands(10);
        for c in &cmds {
            wal.append(c).unwrap();
        }
        wal.rotate_to_staging(&staging).unwrap();

        assert!(wal.is_empty());
        assert_eq!(wal.path(), wal_path.as_path());
        wal.append(&Command::set("new", "1")).unwrap();

        let (staged, err, _) = replay(&staging);
        assert!(err.is_none());
        assert_eq!(staged, cmds);

        let (active, err, _) = replay(&wal_path);
        assert!(err.is_none());
        assert_eq!(active, vec![Command::set("new", "1")]);
    }

    #[test]
    fn rotation_refuses_to_overwrite_staging() {
        let tmp = TempDir::new().unwrap();
        let wal_path = tmp.path().join("wal");
        let staging = tmp.path().join("walTmp");
        std::fs::write(&staging, b"older").unwrap();

        let mut wal = Wal::open(&wal_path, false).unwrap();
        wal.append(&Command::set("k", "v")).unwrap();

        let err = wal.rotate_to_staging(&staging).unwrap_err();
        assert!(matches!(err, WalError::StagingExists(_)));

        // Current log is untouched and still writable.
        wal.append(&Command::set("k2", "v2")).unwrap();
        assert_eq!(wal.iter().unwrap().count(), 2);
        assert_eq!(std::fs::read(&staging).unwrap(), b"older");
    }

    #[test]
    fn rotation_of_closed_log_fails() {
        let tmp = TempDir::new().unwrap();
        let mut wal = Wal::open(tmp.path().join("wal"), false).unwrap();
        wal.close().unwrap();
        let err = wal.rotate_to_staging(&tmp.path().join("walTmp")).unwrap_err();
        assert!(matches!(err, WalError::Closed));
        assert!(!tmp.path().join("walTmp").exists());
    }
}
