//! Pipelined line reading and record decoding.

use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::Path;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log;

use crate::record::Record;

/// Reads `reader` line by line, pushing every non-empty line to `lines`.
///
/// Empty lines are dropped so trailing newlines never turn into decode
/// noise. A read error ends the file early with a warning naming `origin`;
/// a receiver that has gone away ends the read quietly. Returns the number
/// of lines pushed.
pub fn read_lines<R: BufRead>(reader: R, lines: &Sender<String>, origin: &str) -> u64 {
    let mut pushed = 0;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::warn!("read failed on {}, treating file as exhausted: {}", origin, err);
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        if lines.send(line).is_err() {
            break;
        }
        pushed += 1;
    }
    return pushed;
}

/// Drains `lines`, decoding each line into a record pushed to `records`.
///
/// Malformed lines are logged and counted, never forwarded and never fatal.
/// Returns the number of lines skipped. The record sender is dropped on
/// return, which is what closes the downstream queue.
pub fn decode_lines(lines: Receiver<String>, records: Sender<Record>) -> u64 {
    let mut skipped = 0;
    for line in lines {
        match line.parse::<Record>() {
            Ok(record) => {
                if records.send(record).is_err() {
                    break;
                }
            }
            Err(err) => {
                log::warn!("skipping malformed record line: {}", err);
                skipped += 1;
            }
        }
    }
    return skipped;
}

/// A run file streamed as decoded records through a two-thread pipeline.
///
/// A line thread reads the file into a bounded queue and a decode thread
/// turns lines into records in a second bounded queue, so the next record
/// is already read and decoded while the current one is being consumed.
/// Records arrive in file order.
pub struct RecordStream {
    records: Option<Receiver<Record>>,
    line_handle: Option<thread::JoinHandle<()>>,
    decode_handle: Option<thread::JoinHandle<u64>>,
}

impl RecordStream {
    /// Opens `path` and spawns its read and decode threads, each side
    /// buffering up to `lookahead` items.
    ///
    /// The open itself happens on the calling thread so the caller can
    /// apply its open-failure policy before any worker exists.
    pub fn open(path: &Path, lookahead: usize) -> io::Result<RecordStream> {
        let file = fs::File::open(path)?;

        let (line_tx, line_rx) = crossbeam_channel::bounded::<String>(lookahead);
        let (record_tx, record_rx) = crossbeam_channel::bounded::<Record>(lookahead);

        let display_path = path.display().to_string();
        let line_handle = thread::spawn(move || {
            read_lines(io::BufReader::new(file), &line_tx, &display_path);
        });
        let decode_handle = thread::spawn(move || decode_lines(line_rx, record_tx));

        return Ok(RecordStream {
            records: Some(record_rx),
            line_handle: Some(line_handle),
            decode_handle: Some(decode_handle),
        });
    }

    /// Pulls the next record, blocking while the pipeline catches up.
    /// Returns [`None`] once the file is exhausted.
    pub fn next(&mut self) -> Option<Record> {
        self.records.as_ref()?.recv().ok()
    }

    /// Joins both worker threads and returns the number of skipped lines.
    pub fn finish(mut self) -> u64 {
        drop(self.records.take());
        if let Some(handle) = self.line_handle.take() {
            let _ = handle.join();
        }
        match self.decode_handle.take() {
            Some(handle) => handle.join().unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        // drop the receiver first to unblock a send into a full queue,
        // then the joins cannot deadlock
        drop(self.records.take());
        if let Some(handle) = self.line_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.decode_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;
    use std::path::Path;

    use rstest::*;

    use crate::record::Record;

    use super::{decode_lines, read_lines, RecordStream};

    #[test]
    fn test_read_lines_drops_empty_lines() {
        let input = io::Cursor::new(b"1,a,b\n\n2,c,d\r\n   \n3,e,f".to_vec());
        let (tx, rx) = crossbeam_channel::unbounded();

        let pushed = read_lines(input, &tx, "test input");
        drop(tx);

        assert_eq!(pushed, 4);
        let lines = Vec::from_iter(rx);
        assert_eq!(lines, vec!["1,a,b", "2,c,d", "   ", "3,e,f"]);
    }

    #[test]
    fn test_decode_lines_skips_malformed() {
        let (line_tx, line_rx) = crossbeam_channel::unbounded();
        let (record_tx, record_rx) = crossbeam_channel::unbounded();
        for line in ["5,alice,f", "oops", "1,bob,m", "x,y"] {
            line_tx.send(line.to_owned()).unwrap();
        }
        drop(line_tx);

        let skipped = decode_lines(line_rx, record_tx);

        assert_eq!(skipped, 2);
        let records = Vec::from_iter(record_rx);
        assert_eq!(records, vec![Record::new(5, "alice", "f"), Record::new(1, "bob", "m")]);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(16)]
    fn test_record_stream_preserves_file_order(#[case] lookahead: usize) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.txt");
        fs::write(&path, "1,a,x\n2,b,y\nbroken line\n3,c,z\n").unwrap();

        let mut stream = RecordStream::open(&path, lookahead).unwrap();
        let mut keys = Vec::new();
        while let Some(record) = stream.next() {
            keys.push(record.key);
        }

        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(stream.finish(), 1);
    }

    #[test]
    fn test_record_stream_open_error_surfaces() {
        assert!(RecordStream::open(Path::new("./no-such-run.txt"), 2).is_err());
    }

    #[test]
    fn test_record_stream_early_drop_joins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        let mut contents = String::new();
        for i in 0..10_000 {
            contents.push_str(&format!("{},n,v\n", i));
        }
        fs::write(&path, contents).unwrap();

        let mut stream = RecordStream::open(&path, 2).unwrap();
        assert!(stream.next().is_some());
        // the line thread is blocked on a full queue here; dropping the
        // stream must still join cleanly
        drop(stream);
    }
}
