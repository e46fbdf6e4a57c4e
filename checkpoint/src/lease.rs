use fs2::FileExt;
use shared::{ensure_parent_dir, PipelineError};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive right to append to one sequence, held for the lifetime of the
/// value. Backed by an advisory lock on `<sequence>.lock` next to the file.
#[derive(Debug)]
pub struct WriterLease {
    lock_file: File,
    lock_path: PathBuf,
}

impl WriterLease {
    /// Takes the lease without waiting. Fails with `SequenceLocked` when
    /// another process (or another handle in this one) already holds it.
    pub fn acquire(sequence: &Path) -> Result<Self, PipelineError> {
        let lock_path = lock_path_for(sequence);
        ensure_parent_dir(&lock_path)?;

        let mut lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                lock_file.set_len(0)?;
                writeln!(lock_file, "{}", std::process::id())?;
                debug!(sequence = %sequence.display(), "acquired writer lease");
                Ok(Self { lock_file, lock_path })
            }
            Err(e) if is_contended(&e) => Err(PipelineError::SequenceLocked {
                path: sequence.to_path_buf(),
            }),
            Err(e) => Err(PipelineError::Io(e)),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.kind() == fs2::lock_contended_error().kind()
}

fn lock_path_for(sequence: &Path) -> PathBuf {
    let mut name = sequence
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    sequence.with_file_name(name)
}
