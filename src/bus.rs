//! Append-only JSONL bus.
//!
//! Every inter-process channel is one newline-delimited-JSON file. Writers
//! append a full record in a single write ending in `\n`; readers keep a byte
//! offset and only ever consume complete newline-terminated lines, so a
//! record is either fully visible or not visible at all. Bus files are never
//! rewritten or truncated; the one exception is [`trim_jsonl`], which only
//! applies to overlay append-files that no cursor reader tails.

use serde::Serialize;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::Path;

use crate::storage::ensure_file;

/// Append one record as a single `line + \n` write.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<(), String> {
    ensure_file(path).map_err(|e| format!("ensure {} failed: {}", path.display(), e))?;
    let line = serde_json::to_string(record).map_err(|e| format!("serialize failed: {}", e))?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("open {} failed: {}", path.display(), e))?;
    writeln!(file, "{}", line).map_err(|e| format!("write {} failed: {}", path.display(), e))?;
    Ok(())
}

/// Read complete lines past `offset`, returning parsed records and the new
/// offset. Empty and malformed lines are skipped but still advance the
/// offset. An unterminated tail (a record mid-write) is left for the next
/// poll.
pub fn read_new_jsonl(path: &Path, mut offset: u64) -> (Vec<Value>, u64) {
    if ensure_file(path).is_err() {
        return (Vec::new(), offset);
    }
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return (Vec::new(), offset),
    };
    let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if offset > file_len {
        // Shorter than our cursor (file was recreated out-of-band): restart.
        log::warn!(
            "[bus] {} shrank below cursor ({} < {}), resetting to 0",
            path.display(),
            file_len,
            offset
        );
        offset = 0;
    }

    let mut reader = BufReader::new(file);
    if reader.seek(SeekFrom::Start(offset)).is_err() {
        return (Vec::new(), offset);
    }

    let mut records = Vec::new();
    let mut buf: Vec<u8> = Vec::new();
    loop {
        buf.clear();
        let n = match reader.read_until(b'\n', &mut buf) {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            // Partial line without terminator: the writer is mid-append.
            break;
        }
        offset += n as u64;
        let text = String::from_utf8_lossy(&buf);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            records.push(value);
        }
    }
    (records, offset)
}

/// Keep only the newest `max_lines` once the file exceeds `max_lines + 50`.
/// Only valid for overlay append-files, never for cursor-tailed bus files.
pub fn trim_jsonl(path: &Path, max_lines: usize) {
    if max_lines == 0 {
        return;
    }
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return,
    };
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines + 50 {
        return;
    }
    let keep = &lines[lines.len() - max_lines..];
    let mut out = keep.join("\n");
    out.push('\n');
    if let Err(e) = std::fs::write(path, out) {
        log::warn!("[bus] trim of {} failed: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write as _;

    #[test]
    fn cursor_advances_only_past_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.inbox.jsonl");

        append_jsonl(&path, &json!({"type": "chat", "ts": 1})).unwrap();
        append_jsonl(&path, &json!({"type": "chat", "ts": 2})).unwrap();

        let (recs, off) = read_new_jsonl(&path, 0);
        assert_eq!(recs.len(), 2);
        assert_eq!(off, std::fs::metadata(&path).unwrap().len());

        // Partial trailing write must not be consumed.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"type\":\"chat\",\"ts\":3").unwrap();
        let (recs2, off2) = read_new_jsonl(&path, off);
        assert!(recs2.is_empty());
        assert_eq!(off2, off);

        // Completing the line makes it visible.
        f.write_all(b"}\n").unwrap();
        let (recs3, off3) = read_new_jsonl(&path, off2);
        assert_eq!(recs3.len(), 1);
        assert_eq!(recs3[0]["ts"], 3);
        assert_eq!(off3, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn malformed_and_empty_lines_are_skipped_but_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.jsonl");
        std::fs::write(&path, "{\"ok\":1}\n\nnot json\n{\"ok\":2}\n").unwrap();

        let (recs, off) = read_new_jsonl(&path, 0);
        assert_eq!(recs.len(), 2);
        assert_eq!(off, std::fs::metadata(&path).unwrap().len());

        // Nothing new: same offset, no records.
        let (recs2, off2) = read_new_jsonl(&path, off);
        assert!(recs2.is_empty());
        assert_eq!(off2, off);
    }

    #[test]
    fn missing_file_reads_as_empty_and_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("missing.jsonl");
        let (recs, off) = read_new_jsonl(&path, 0);
        assert!(recs.is_empty());
        assert_eq!(off, 0);
        assert!(path.exists());
    }

    #[test]
    fn trim_keeps_newest_lines_past_slack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.jsonl");
        for i in 0..160 {
            append_jsonl(&path, &json!({"i": i})).unwrap();
        }

        // 160 <= 100 + 50 slack: untouched.
        trim_jsonl(&path, 100);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 160);

        append_jsonl(&path, &json!({"i": 160})).unwrap();
        trim_jsonl(&path, 100);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 100);
        assert!(lines[0].contains("\"i\":61"));
        assert!(lines[99].contains("\"i\":160"));
    }
}
