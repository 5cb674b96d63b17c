//! MANIFEST persistence and directory recovery.
//!
//! Covers the commit point (install → MANIFEST), orphan and temp cleanup,
//! corrupt table quarantine, footer-scan reconstruction, and the
//! unrecoverable cases.

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use crate::manifest::tests::helpers::*;
    use crate::manifest::{MANIFEST_FILENAME, Manifest, ManifestError};

    #[test]
    fn empty_directory_opens_empty() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let rec = Manifest::open(tmp.path(), 4).unwrap();
        assert_eq!(rec.manifest.snapshot().table_count(), 0);
        assert_eq!(rec.next_file_number, 1);
        assert!(tmp.path().join(MANIFEST_FILENAME).exists());
    }

    #[test]
    fn installed_tables_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let mut m = Manifest::open(tmp.path(), 4).unwrap().manifest;
        let t1 = table(tmp.path(), 1, 0, &["a", "b"], "x");
        let t2 = table(tmp.path(), 2, 1, &["c", "d"], "y");
        m.install(vec![t1, t2], &[], 3).unwrap();
        drop(m);

        let rec = Manifest::open(tmp.path(), 4).unwrap();
        let v = rec.manifest.snapshot();
        assert_eq!(file_numbers(v.tables_at(0)), [1]);
        assert_eq!(file_numbers(v.tables_at(1)), [2]);
        assert_eq!(rec.next_file_number, 3);
    }

    #[test]
    fn removed_tables_are_deleted_after_last_reader() {
        let tmp = TempDir::new().unwrap();
        let mut m = Manifest::open(tmp.path(), 4).unwrap().manifest;
        let t1 = table(tmp.path(), 1, 0, &["a"], "x");
        let path = t1.path().to_path_buf();
        m.install(vec![t1.clone()], &[], 2).unwrap();

        let reader = m.snapshot();
        let t2 = table(tmp.path(), 2, 1, &["a"], "x");
        m.install(vec![t2], &[t1.clone()], 3).unwrap();
        drop(t1);

        assert!(path.exists(), "old version still references the table");
        drop(reader);
        assert!(!path.exists());
    }

    #[test]
    fn failed_install_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut m = Manifest::open(tmp.path(), 4).unwrap().manifest;
        let t1 = table(tmp.path(), 1, 1, &["a", "m"], "x");
        m.install(vec![t1.clone()], &[], 2).unwrap();

        let t2 = table(tmp.path(), 2, 1, &["b", "c"], "x");
        let err = m.install(vec![t2], &[], 3).unwrap_err();
        assert!(matches!(err, ManifestError::Overlap { .. }));
        assert_eq!(m.snapshot().table_count(), 1);
        assert!(!t1.is_obsolete());
    }

    /// # Scenario
    /// The directory loses read permission after the table is written, so
    /// the MANIFEST rename still works but the directory fsync after it
    /// cannot open the directory. Root bypasses the permission check and
    /// takes the plain path.
    ///
    /// # Expected behavior
    /// The install counts as committed: it returns the new version, the
    /// table is not marked obsolete, and a reopen finds it.
    #[cfg(unix)]
    #[test]
    fn install_commits_once_manifest_is_renamed() {
        use std::os::unix::fs::PermissionsExt;

        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut m = Manifest::open(tmp.path(), 4).unwrap().manifest;
        let t1 = table(tmp.path(), 1, 0, &["a", "b"], "x");

        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o300)).unwrap();
        let installed = m.install(vec![t1.clone()], &[], 2);
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o755)).unwrap();

        let version = installed.unwrap();
        assert_eq!(file_numbers(version.tables_at(0)), [1]);
        assert!(!t1.is_obsolete());
        drop((m, version, t1));

        let rec = Manifest::open(tmp.path(), 4).unwrap();
        assert_eq!(file_numbers(rec.manifest.snapshot().tables_at(0)), [1]);
    }

    #[test]
    fn orphans_and_temp_files_are_removed() {
        let tmp = TempDir::new().unwrap();
        let mut m = Manifest::open(tmp.path(), 4).unwrap().manifest;
        m.install(vec![table(tmp.path(), 1, 0, &["a"], "x")], &[], 2)
            .unwrap();
        drop(m);

        // An uncommitted output and two interrupted writes.
        drop(table(tmp.path(), 7, 1, &["z"], "x"));
        fs::write(tmp.path().join("000008.tmp"), b"partial").unwrap();
        fs::write(tmp.path().join("MANIFEST.tmp"), b"partial").unwrap();

        let rec = Manifest::open(tmp.path(), 4).unwrap();
        assert_eq!(rec.manifest.snapshot().table_count(), 1);
        assert!(!tmp.path().join("000007.sst").exists());
        assert!(!tmp.path().join("000008.tmp").exists());
        assert!(!tmp.path().join("MANIFEST.tmp").exists());
        assert_eq!(rec.next_file_number, 9);
    }

    #[test]
    fn corrupt_listed_table_is_quarantined() {
        let tmp = TempDir::new().unwrap();
        let mut m = Manifest::open(tmp.path(), 4).unwrap().manifest;
        let t1 = table(tmp.path(), 1, 0, &["a"], "x");
        let t2 = table(tmp.path(), 2, 0, &["b"], "y");
        let bad_path = t2.path().to_path_buf();
        m.install(vec![t1, t2], &[], 3).unwrap();
        drop(m);

        let mut bytes = fs::read(&bad_path).unwrap();
        let n = bytes.len();
        bytes[n - 8] ^= 0xFF;
        fs::write(&bad_path, &bytes).unwrap();

        let rec = Manifest::open(tmp.path(), 4).unwrap();
        assert_eq!(file_numbers(rec.manifest.snapshot().tables_at(0)), [1]);
        assert!(!bad_path.exists());
        assert!(tmp.path().join("000002.corrupt").exists());
    }

    #[test]
    fn missing_listed_table_is_unrecoverable() {
        let tmp = TempDir::new().unwrap();
        let mut m = Manifest::open(tmp.path(), 4).unwrap().manifest;
        let t1 = table(tmp.path(), 1, 0, &["a"], "x");
        let path = t1.path().to_path_buf();
        m.install(vec![t1], &[], 2).unwrap();
        drop(m);
        fs::remove_file(path).unwrap();

        let err = Manifest::open(tmp.path(), 4).err().unwrap();
        assert!(matches!(err, ManifestError::Unrecoverable(_)));
    }

    #[test]
    fn corrupt_manifest_is_rebuilt_from_footers() {
        let tmp = TempDir::new().unwrap();
        let mut m = Manifest::open(tmp.path(), 4).unwrap().manifest;
        m.install(
            vec![
                table(tmp.path(), 1, 0, &["a"], "x"),
                table(tmp.path(), 2, 2, &["b", "c"], "y"),
            ],
            &[],
            3,
        )
        .unwrap();
        drop(m);
        fs::write(tmp.path().join(MANIFEST_FILENAME), b"garbage!").unwrap();

        let rec = Manifest::open(tmp.path(), 4).unwrap();
        let v = rec.manifest.snapshot();
        assert_eq!(file_numbers(v.tables_at(0)), [1]);
        assert_eq!(file_numbers(v.tables_at(2)), [2]);
        assert_eq!(rec.next_file_number, 3);
    }

    #[test]
    fn missing_manifest_with_overlap_is_unrecoverable() {
        let tmp = TempDir::new().unwrap();
        drop(table(tmp.path(), 1, 1, &["a", "m"], "x"));
        drop(table(tmp.path(), 2, 1, &["c", "z"], "y"));

        let err = Manifest::open(tmp.path(), 4).err().unwrap();
        assert!(matches!(err, ManifestError::Unrecoverable(_)));
    }
}
