//! Append-only JSONL sequences with resume-point recovery.
//!
//! A sequence is a file holding one JSON object per line, each with an `id`.
//! Writers only ever append whole batches and `fsync` before returning, so a
//! killed process leaves the file consistent up to its last completed
//! append. The next run derives where to continue from the id on the last
//! line; nothing else is persisted.

mod lease;
mod tail;

pub use lease::WriterLease;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::{ensure_parent_dir, PipelineError};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Deserialize)]
struct IdOnly {
    id: u64,
}

/// Handle on one checkpointed sequence file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Opens an existing sequence. A missing file is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(PipelineError::MissingResource { path });
        }
        Ok(Self { path })
    }

    /// Opens a sequence, creating an empty file (and its directory) when absent.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            ensure_parent_dir(&path)?;
            OpenOptions::new().create(true).append(true).open(&path)?;
            debug!(path = %path.display(), "created empty sequence");
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Id the next appended record should carry: `last.id + 1`, or 0 when the
    /// sequence holds no complete record yet.
    ///
    /// Reads only the tail of the file and has no side effects. An
    /// unterminated trailing fragment is not a record and is skipped.
    pub fn resume_point(&self) -> Result<u64, PipelineError> {
        Ok(self
            .last_record::<IdOnly>()?
            .map(|last| last.id + 1)
            .unwrap_or(0))
    }

    /// The last complete record, if any.
    pub fn last_record<R: DeserializeOwned>(&self) -> Result<Option<R>, PipelineError> {
        let mut file = File::open(&self.path)?;
        let Some(line) = tail::last_complete_line(&mut file)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&line.bytes) {
            Ok(record) => Ok(Some(record)),
            Err(source) => Err(PipelineError::CorruptRecord {
                path: self.path.clone(),
                line: tail::line_number_at(&mut file, line.offset)?,
                source,
            }),
        }
    }

    /// Appends `records` in order and forces them to disk before returning.
    ///
    /// The batch is serialized up front and written with a single call, so a
    /// serialization failure writes nothing.
    pub fn append<R: Serialize>(&self, records: &[R]) -> Result<(), PipelineError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut payload = Vec::new();
        for record in records {
            serde_json::to_writer(&mut payload, record)?;
            payload.push(b'\n');
        }

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&payload)?;
        file.sync_data()?;
        debug!(path = %self.path.display(), count = records.len(), "appended records");
        Ok(())
    }

    /// Reads every record. Blank lines are skipped; malformed lines are errors.
    pub fn read_all<R: DeserializeOwned>(&self) -> Result<Vec<R>, PipelineError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| {
                PipelineError::CorruptRecord {
                    path: self.path.clone(),
                    line: idx + 1,
                    source,
                }
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Cuts off an unterminated final line left behind by a writer that was
    /// killed mid-append. Returns the number of bytes removed.
    ///
    /// Only the owner of the sequence may call this, before its first append.
    pub fn recover_torn_tail(&self) -> Result<u64, PipelineError> {
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let len = file.metadata()?.len();
        let keep = tail::complete_prefix_len(&mut file)?;
        if keep == len {
            return Ok(0);
        }
        file.set_len(keep)?;
        file.sync_data()?;
        let removed = len - keep;
        warn!(
            path = %self.path.display(),
            bytes = removed,
            "discarded unterminated trailing record from an interrupted write"
        );
        Ok(removed)
    }
}

/// Loads an input pool that must exist and hold at least one record.
pub fn load_records<R: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<R>, PipelineError> {
    let store = CheckpointStore::open(path)?;
    let records: Vec<R> = store.read_all()?;
    if records.is_empty() {
        return Err(PipelineError::EmptyResource {
            path: store.path.clone(),
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u64,
        text: String,
    }

    fn rows(range: std::ops::Range<u64>) -> Vec<Row> {
        range
            .map(|id| Row { id, text: format!("row {}", id) })
            .collect()
    }

    fn scratch() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open_or_create(dir.path().join("out.jsonl")).unwrap();
        (dir, store)
    }

    #[test]
    fn empty_sequence_resumes_at_zero() {
        let (_dir, store) = scratch();
        assert_eq!(store.resume_point().unwrap(), 0);
        assert!(store.last_record::<Row>().unwrap().is_none());
    }

    #[test]
    fn open_requires_the_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.jsonl");
        match CheckpointStore::open(&missing) {
            Err(PipelineError::MissingResource { path }) => assert_eq!(path, missing),
            other => panic!("expected missing resource, got {:?}", other),
        }
    }

    #[test]
    fn open_or_create_makes_parent_directories() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("pool").join("slices.jsonl");
        let store = CheckpointStore::open_or_create(&nested).unwrap();
        assert!(nested.is_file());
        assert_eq!(store.resume_point().unwrap(), 0);
    }

    #[test]
    fn resume_point_is_idempotent() {
        let (_dir, store) = scratch();
        store.append(&rows(0..5)).unwrap();
        for _ in 0..3 {
            assert_eq!(store.resume_point().unwrap(), 5);
        }
    }

    #[test]
    fn appends_are_visible_in_order() {
        let (_dir, store) = scratch();
        store.append(&rows(0..3)).unwrap();
        store.append(&rows(3..4)).unwrap();
        store.append::<Row>(&[]).unwrap();
        let all: Vec<Row> = store.read_all().unwrap();
        assert_eq!(all, rows(0..4));
        assert_eq!(store.resume_point().unwrap(), 4);
    }

    #[test]
    fn resume_point_follows_the_last_id_not_the_count() {
        let (_dir, store) = scratch();
        store.append(&[Row { id: 41, text: "late".into() }]).unwrap();
        assert_eq!(store.resume_point().unwrap(), 42);
    }

    #[test]
    fn trailing_blank_lines_are_ignored() {
        let (_dir, store) = scratch();
        store.append(&rows(0..2)).unwrap();
        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        file.write_all(b"\n  \n").unwrap();
        assert_eq!(store.resume_point().unwrap(), 2);
        assert_eq!(store.read_all::<Row>().unwrap().len(), 2);
    }

    #[test]
    fn long_lines_span_several_tail_blocks() {
        let (_dir, store) = scratch();
        let big = "x".repeat(50_000);
        store
            .append(&[Row { id: 0, text: big.clone() }, Row { id: 1, text: big }])
            .unwrap();
        assert_eq!(store.resume_point().unwrap(), 2);
    }

    #[test]
    fn torn_tail_is_skipped_then_recovered() {
        let (_dir, store) = scratch();
        store.append(&rows(0..3)).unwrap();
        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        file.write_all(br#"{"id": 3, "text": "half"#).unwrap();

        assert_eq!(store.resume_point().unwrap(), 3);
        let removed = store.recover_torn_tail().unwrap();
        assert!(removed > 0);
        assert_eq!(store.recover_torn_tail().unwrap(), 0);

        store.append(&rows(3..4)).unwrap();
        assert_eq!(store.read_all::<Row>().unwrap(), rows(0..4));
    }

    #[test]
    fn a_lone_fragment_recovers_to_empty() {
        let (_dir, store) = scratch();
        std::fs::write(store.path(), b"{\"id\": 0").unwrap();
        assert_eq!(store.resume_point().unwrap(), 0);
        store.recover_torn_tail().unwrap();
        assert_eq!(std::fs::metadata(store.path()).unwrap().len(), 0);
    }

    #[test]
    fn corrupt_last_line_is_reported_with_its_line_number() {
        let (_dir, store) = scratch();
        store.append(&rows(0..2)).unwrap();
        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        file.write_all(b"not json\n").unwrap();
        match store.resume_point() {
            Err(PipelineError::CorruptRecord { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected corrupt record, got {:?}", other),
        }
        match store.read_all::<Row>() {
            Err(PipelineError::CorruptRecord { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected corrupt record, got {:?}", other),
        }
    }

    #[test]
    fn extra_fields_do_not_matter_for_the_resume_point() {
        let (_dir, store) = scratch();
        store
            .append(&[json!({"id": 0, "source": "a.docx", "labels": ["x"]})])
            .unwrap();
        assert_eq!(store.resume_point().unwrap(), 1);
    }

    #[test]
    fn load_records_distinguishes_missing_and_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool.jsonl");
        assert!(matches!(
            load_records::<Row>(&path),
            Err(PipelineError::MissingResource { .. })
        ));
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            load_records::<Row>(&path),
            Err(PipelineError::EmptyResource { .. })
        ));
        std::fs::write(&path, b"{\"id\":0,\"text\":\"a\"}\n").unwrap();
        assert_eq!(load_records::<Row>(&path).unwrap().len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn ids_written_in_batches_have_no_gaps(batches in prop::collection::vec(1usize..6, 1..8)) {
            let (_dir, store) = scratch();
            for size in &batches {
                let start = store.resume_point().unwrap();
                store.append(&rows(start..start + *size as u64)).unwrap();
            }
            let total: usize = batches.iter().sum();
            let ids: Vec<u64> = store.read_all::<Row>().unwrap().iter().map(|r| r.id).collect();
            prop_assert_eq!(ids, (0..total as u64).collect::<Vec<_>>());
            prop_assert_eq!(store.resume_point().unwrap(), total as u64);
        }
    }
}
