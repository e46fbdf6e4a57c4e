//! Cuts every document in a folder into overlapping windows.

use crate::document::{list_documents, read_document, slice_text, TextSlice};
use crate::driver::{claim_sequence, run_span, RunSummary};
use shared::core::config::SliceConfig;
use shared::types::SliceRecord;
use shared::PipelineError;
use tracing::{info, warn};

pub const NAME: &str = "slice";

/// A slice before it has been given an id.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSlice {
    pub source: String,
    pub slice: TextSlice,
}

/// Every slice of every document, in folder order then offset order. The
/// enumeration is deterministic for an unchanged folder, which is what lets
/// a rerun skip the slices already written.
pub fn plan(config: &SliceConfig) -> Result<Vec<PlannedSlice>, PipelineError> {
    let documents = list_documents(&config.input_folder)?;
    if documents.is_empty() {
        return Err(PipelineError::EmptyResource {
            path: config.input_folder.clone(),
        });
    }

    let mut planned = Vec::new();
    for path in documents {
        let text = read_document(&path)?;
        let source = path.display().to_string();
        let slices = slice_text(&text, config.length, config.step);
        info!(source = %source, chars = text.chars().count(), slices = slices.len(), "read document");
        planned.extend(slices.into_iter().map(|slice| PlannedSlice {
            source: source.clone(),
            slice,
        }));
    }
    Ok(planned)
}

pub fn run(config: &SliceConfig) -> Result<RunSummary, PipelineError> {
    let span = run_span(NAME);
    let _enter = span.enter();

    let planned = plan(config)?;
    let (store, _lease) = claim_sequence(&config.output_file)?;
    let resume_point = store.resume_point()?;

    let mut summary = RunSummary {
        stage: NAME,
        resumed_from: resume_point,
        ..RunSummary::default()
    };

    if resume_point > 0 {
        if let Some(last) = store.last_record::<SliceRecord>()? {
            let expected = usize::try_from(last.id)
                .ok()
                .and_then(|idx| planned.get(idx));
            let matches = expected
                .map(|p| p.source == last.source && p.slice.offset == last.offset)
                .unwrap_or(false);
            if !matches {
                warn!(
                    last_id = last.id,
                    source = %last.source,
                    offset = last.offset,
                    "last written slice does not match the current documents; the input folder may have changed"
                );
            }
        }
    }

    let start = usize::try_from(resume_point).unwrap_or(usize::MAX);
    if start >= planned.len() {
        info!(resume_point, planned = planned.len(), "all slices already written");
        summary.already_complete = true;
        return Ok(summary);
    }

    let mut next_id = resume_point;
    for batch in planned[start..].chunks(config.batch_size.max(1)) {
        let records: Vec<SliceRecord> = batch
            .iter()
            .map(|p| {
                let record = SliceRecord {
                    id: next_id,
                    source: p.source.clone(),
                    slice: p.slice.text.clone(),
                    offset: p.slice.offset,
                    is_labeled: false,
                    labels: Vec::new(),
                };
                next_id += 1;
                record
            })
            .collect();
        store.append(&records)?;
        summary.batches += 1;
        summary.written += records.len();
    }

    info!(batches = summary.batches, written = summary.written, "slicing complete");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::tests::write_docx;
    use checkpoint::CheckpointStore;
    use tempfile::TempDir;

    fn config(dir: &TempDir, length: usize, step: usize, batch_size: usize) -> SliceConfig {
        SliceConfig {
            input_folder: dir.path().join("docs"),
            output_file: dir.path().join("out").join("slices.jsonl"),
            length,
            step,
            batch_size,
        }
    }

    fn setup() -> TempDir {
        let dir = TempDir::new().unwrap();
        let docs = dir.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        write_docx(&docs.join("a.docx"), &["abcdef", "ghij"]);
        std::fs::write(docs.join("b.txt"), "klmno").unwrap();
        dir
    }

    #[test]
    fn slices_all_documents_with_sequential_ids() {
        let dir = setup();
        let cfg = config(&dir, 4, 3, 2);
        let summary = run(&cfg).unwrap();

        let records: Vec<SliceRecord> =
            CheckpointStore::open(&cfg.output_file).unwrap().read_all().unwrap();
        let got: Vec<(u64, &str, usize)> = records
            .iter()
            .map(|r| (r.id, r.slice.as_str(), r.offset))
            .collect();
        assert_eq!(
            got,
            vec![
                (0, "abcd", 0),
                (1, "defg", 3),
                (2, "ghij", 6),
                (3, "j", 9),
                (4, "klmn", 0),
                (5, "no", 3),
            ]
        );
        assert!(records[0].source.ends_with("a.docx"));
        assert!(records[4].source.ends_with("b.txt"));
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.written, 6);
    }

    #[test]
    fn rerun_only_appends_missing_slices() {
        let dir = setup();
        let cfg = config(&dir, 4, 3, 100);
        run(&cfg).unwrap();

        // Simulate a run killed after the first four slices.
        let content = std::fs::read_to_string(&cfg.output_file).unwrap();
        let kept: String = content.lines().take(4).map(|l| format!("{}\n", l)).collect();
        std::fs::write(&cfg.output_file, kept).unwrap();

        let summary = run(&cfg).unwrap();
        assert_eq!(summary.resumed_from, 4);
        assert_eq!(summary.written, 2);

        let ids: Vec<u64> = CheckpointStore::open(&cfg.output_file)
            .unwrap()
            .read_all::<SliceRecord>()
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, (0..6).collect::<Vec<_>>());

        let again = run(&cfg).unwrap();
        assert!(again.already_complete);
    }

    #[test]
    fn empty_folder_is_an_empty_resource() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        assert!(matches!(
            run(&config(&dir, 4, 3, 2)),
            Err(PipelineError::EmptyResource { .. })
        ));
    }
}
