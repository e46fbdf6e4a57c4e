use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

const TAIL_BLOCK: u64 = 8 * 1024;

/// A newline-terminated, non-blank line found near the end of a file.
pub(crate) struct TailLine {
    /// Byte offset of the first byte of the line.
    pub offset: u64,
    pub bytes: Vec<u8>,
}

enum Scan {
    Found { start: usize, end: usize },
    NeedMore,
    Nothing,
}

/// Finds the last newline-terminated line that is not blank, reading the
/// file backwards in fixed blocks. Bytes after the final newline belong to
/// an unfinished write and are never returned.
pub(crate) fn last_complete_line(file: &mut File) -> io::Result<Option<TailLine>> {
    let len = file.metadata()?.len();
    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();

    loop {
        match scan(&buf, pos == 0) {
            Scan::Found { start, end } => {
                return Ok(Some(TailLine {
                    offset: pos + start as u64,
                    bytes: buf[start..end].to_vec(),
                }));
            }
            Scan::Nothing => return Ok(None),
            Scan::NeedMore => {
                let read = TAIL_BLOCK.min(pos);
                pos -= read;
                let mut block = vec![0u8; read as usize];
                file.seek(SeekFrom::Start(pos))?;
                file.read_exact(&mut block)?;
                block.extend_from_slice(&buf);
                buf = block;
            }
        }
    }
}

/// Length of the file up to and including its final newline.
pub(crate) fn complete_prefix_len(file: &mut File) -> io::Result<u64> {
    let len = file.metadata()?.len();
    let mut pos = len;
    while pos > 0 {
        let read = TAIL_BLOCK.min(pos);
        pos -= read;
        let mut block = vec![0u8; read as usize];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut block)?;
        if let Some(idx) = block.iter().rposition(|b| *b == b'\n') {
            return Ok(pos + idx as u64 + 1);
        }
    }
    Ok(0)
}

/// 1-based line number of the line starting at `offset`.
pub(crate) fn line_number_at(file: &mut File, offset: u64) -> io::Result<usize> {
    file.seek(SeekFrom::Start(0))?;
    let mut newlines = 0;
    let mut remaining = offset;
    let mut block = vec![0u8; TAIL_BLOCK as usize];
    while remaining > 0 {
        let want = TAIL_BLOCK.min(remaining) as usize;
        file.read_exact(&mut block[..want])?;
        newlines += block[..want].iter().filter(|b| **b == b'\n').count();
        remaining -= want as u64;
    }
    Ok(newlines + 1)
}

fn scan(buf: &[u8], at_file_start: bool) -> Scan {
    let Some(mut end) = buf.iter().rposition(|b| *b == b'\n') else {
        return if at_file_start { Scan::Nothing } else { Scan::NeedMore };
    };
    loop {
        match buf[..end].iter().rposition(|b| *b == b'\n') {
            Some(prev) => {
                if !is_blank(&buf[prev + 1..end]) {
                    return Scan::Found { start: prev + 1, end };
                }
                end = prev;
            }
            None if at_file_start => {
                return if is_blank(&buf[..end]) {
                    Scan::Nothing
                } else {
                    Scan::Found { start: 0, end }
                };
            }
            None => return Scan::NeedMore,
        }
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(content: &[u8]) -> (tempfile::NamedTempFile, File) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(content).unwrap();
        let file = File::open(tmp.path()).unwrap();
        (tmp, file)
    }

    fn last(content: &[u8]) -> Option<(u64, String)> {
        let (_tmp, mut file) = file_with(content);
        last_complete_line(&mut file)
            .unwrap()
            .map(|l| (l.offset, String::from_utf8(l.bytes).unwrap()))
    }

    #[test]
    fn finds_the_last_terminated_line() {
        assert_eq!(last(b"a\nbb\n"), Some((2, "bb".into())));
        assert_eq!(last(b"a\nbb\ncc"), Some((2, "bb".into())));
        assert_eq!(last(b"only\n"), Some((0, "only".into())));
    }

    #[test]
    fn nothing_without_a_terminated_line() {
        assert_eq!(last(b""), None);
        assert_eq!(last(b"partial"), None);
        assert_eq!(last(b"\n \n"), None);
    }

    #[test]
    fn prefix_stops_after_the_final_newline() {
        let (_tmp, mut file) = file_with(b"a\nb\nfrag");
        assert_eq!(complete_prefix_len(&mut file).unwrap(), 4);
        let (_tmp, mut file) = file_with(b"frag");
        assert_eq!(complete_prefix_len(&mut file).unwrap(), 0);
    }

    #[test]
    fn line_numbers_count_preceding_newlines() {
        let (_tmp, mut file) = file_with(b"a\nb\nc\n");
        assert_eq!(line_number_at(&mut file, 0).unwrap(), 1);
        assert_eq!(line_number_at(&mut file, 4).unwrap(), 3);
    }
}
