/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use crate::clock;
use crate::config::CompressionMode;
use crate::funcs;
use crate::membuf::MemBuf;
use crate::real::TraceFile;
use crate::record::{Record, NULL_ARG, STATUS_DIFF, STATUS_FULL};

/// Sliding window length for peephole compression.
pub const WINDOW_SIZE: usize = 3;

/// Turns records into trace bytes. Only the windowed mode keeps state:
/// the last [`WINDOW_SIZE`] records, most recent first, owned by the
/// window until eviction.
pub struct Encoder {
    mode: CompressionMode,
    window: [Option<Record>; WINDOW_SIZE],
}

impl Encoder {
    pub fn new(mode: CompressionMode) -> Self {
        Encoder {
            mode,
            window: [None, None, None],
        }
    }

    /// Encode one record into `membuf`. Consumes the record; in windowed
    /// mode it is retained as the newest window entry.
    pub fn encode(&mut self, record: Record, epoch: f64, membuf: &mut MemBuf, out: &TraceFile) {
        match self.mode {
            CompressionMode::Text => self.write_text(&record, membuf, out),
            CompressionMode::Binary => self.write_binary(&record, epoch, membuf, out),
            CompressionMode::Windowed => self.write_windowed(record, epoch, membuf, out),
        }
    }

    /// Drop every record still held by the window.
    pub fn clear_window(&mut self) {
        for slot in self.window.iter_mut() {
            *slot = None;
        }
    }

    fn write_text(&mut self, record: &Record, membuf: &mut MemBuf, out: &TraceFile) {
        let name = funcs::name_by_id(record.func_id).unwrap_or(NULL_ARG);
        let head = format!(
            "{:.6} {:.6} {} {}",
            record.tstart, record.tend, record.res, name
        );
        membuf.append(head.as_bytes(), out);
        self.write_args(record, membuf, out);
    }

    fn write_binary(&mut self, record: &Record, epoch: f64, membuf: &mut MemBuf, out: &TraceFile) {
        let tstart = clock::to_ticks(record.tstart, epoch);
        let tend = clock::to_ticks(record.tend, epoch);
        membuf.append(&[record.status], out);
        membuf.append(&tstart.to_le_bytes(), out);
        membuf.append(&tend.to_le_bytes(), out);
        membuf.append(&record.res.to_le_bytes(), out);
        membuf.append(&record.func_id.to_le_bytes(), out);
        self.write_args(record, membuf, out);
    }

    fn write_args(&mut self, record: &Record, membuf: &mut MemBuf, out: &TraceFile) {
        for arg in &record.args {
            membuf.append(b" ", out);
            membuf.append(Record::wire_arg(arg).as_bytes(), out);
        }
        membuf.append(b"\n", out);
    }

    fn write_windowed(
        &mut self,
        mut record: Record,
        epoch: f64,
        membuf: &mut MemBuf,
        out: &TraceFile,
    ) {
        let mut chosen: Option<(usize, Record)> = None;
        for (idx, slot) in self.window.iter().enumerate() {
            let Some(old) = slot else {
                break;
            };
            // A window entry is a compression candidate only if it is the
            // same function with the same number of arguments, and the
            // count fits the 7-bit position mask.
            if old.func_id == record.func_id
                && old.arg_count() == record.arg_count()
                && (1..8).contains(&record.arg_count())
            {
                let diff = diff_record(old, &record);
                if diff.arg_count() < record.arg_count() {
                    chosen = Some((idx, diff));
                    break;
                }
            }
        }

        match chosen {
            Some((window_idx, mut diff)) => {
                diff.tstart = record.tstart;
                diff.tend = record.tend;
                diff.res = record.res;
                // Diff records carry the window index where decoders
                // expect the function id; the status high bit tells the
                // two layouts apart.
                diff.func_id = window_idx as i32;
                self.write_binary(&diff, epoch, membuf, out);
            }
            None => {
                record.status = STATUS_FULL;
                self.write_binary(&record, epoch, membuf, out);
            }
        }

        // Evict the oldest entry and install the new record at slot 0.
        self.window.rotate_right(1);
        self.window[0] = Some(record);
    }
}

/// Record holding only the argument positions where `new` departs from
/// `old`; the status byte gets the diff bit plus one mask bit per
/// differing position.
fn diff_record(old: &Record, new: &Record) -> Record {
    let mut status = STATUS_DIFF;
    let mut args = Vec::new();
    for (i, (old_arg, new_arg)) in old.args.iter().zip(new.args.iter()).enumerate() {
        if old_arg != new_arg {
            status |= 1u8 << i;
            args.push(new_arg.clone());
        }
    }
    let mut diff = Record::new(new.func_id, new.tstart, new.tend, new.res, args);
    diff.tid = new.tid;
    diff.call_depth = new.call_depth;
    diff.status = status;
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::real;
    use std::fs;
    use std::path::Path;

    fn encode_all(mode: CompressionMode, records: Vec<Record>, path: &Path) -> Vec<u8> {
        let out = real::table().open_for_write(path).unwrap();
        let mut membuf = MemBuf::with_capacity(1024);
        let mut encoder = Encoder::new(mode);
        for record in records {
            encoder.encode(record, 0.0, &mut membuf, &out);
        }
        membuf.flush(&out);
        out.close();
        fs::read(path).unwrap()
    }

    fn args(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|v| Some((*v).to_owned())).collect()
    }

    fn write_id() -> i32 {
        funcs::id_by_name("write").unwrap()
    }

    #[test]
    fn test_text_mode_lines() {
        let open = funcs::id_by_name("open").unwrap();
        let close = funcs::id_by_name("close").unwrap();
        let records = vec![
            Record::new(open, 0.000001, 0.000002, 3, args(&["a", "0"])),
            Record::new(write_id(), 0.000003, 0.000004, 2, args(&["3", "hi"])),
            Record::new(close, 0.000005, 0.000006, 0, args(&["3"])),
        ];
        let dir = tempfile::tempdir().unwrap();
        let bytes = encode_all(CompressionMode::Text, records, &dir.path().join("t.itf"));
        let text = String::from_utf8(bytes).unwrap();
        let expected = "0.000001 0.000002 3 open a 0\n\
                        0.000003 0.000004 2 write 3 hi\n\
                        0.000005 0.000006 0 close 3\n";
        assert_eq!(expected, text);
    }

    #[test]
    fn test_text_mode_argument_substitutions() {
        let open = funcs::id_by_name("open").unwrap();
        let records = vec![Record::new(
            open,
            0.0,
            0.0,
            0,
            vec![Some("  ".to_owned()), Some(String::new()), None],
        )];
        let dir = tempfile::tempdir().unwrap();
        let bytes = encode_all(CompressionMode::Text, records, &dir.path().join("t.itf"));
        let text = String::from_utf8(bytes).unwrap();
        // Spaces-only becomes underscores, the empty argument stays a
        // zero-length token, the absent argument becomes ???.
        assert_eq!("0.000000 0.000000 0 open __  ???\n", text);
    }

    #[test]
    fn test_binary_mode_layout() {
        let record = Record::new(write_id(), 5e-6, 7e-6, 2, args(&["3", "hi"]));
        let dir = tempfile::tempdir().unwrap();
        let bytes = encode_all(
            CompressionMode::Binary,
            vec![record],
            &dir.path().join("b.itf"),
        );
        let mut expected = vec![STATUS_FULL];
        expected.extend_from_slice(&clock::to_ticks(5e-6, 0.0).to_le_bytes());
        expected.extend_from_slice(&clock::to_ticks(7e-6, 0.0).to_le_bytes());
        expected.extend_from_slice(&2i32.to_le_bytes());
        expected.extend_from_slice(&write_id().to_le_bytes());
        expected.extend_from_slice(b" 3 hi\n");
        assert_eq!(expected, bytes);
    }

    #[test]
    fn test_windowed_diff_sequence() {
        let records = vec![
            Record::new(write_id(), 0.0, 0.0, 0, args(&["3", "100"])),
            Record::new(write_id(), 0.0, 0.0, 0, args(&["3", "200"])),
            Record::new(write_id(), 0.0, 0.0, 0, args(&["3", "300"])),
        ];
        let dir = tempfile::tempdir().unwrap();
        let bytes = encode_all(
            CompressionMode::Windowed,
            records,
            &dir.path().join("w.itf"),
        );

        // First record is emitted in full.
        let mut expected = vec![STATUS_FULL];
        expected.extend_from_slice(&0i32.to_le_bytes());
        expected.extend_from_slice(&0i32.to_le_bytes());
        expected.extend_from_slice(&0i32.to_le_bytes());
        expected.extend_from_slice(&write_id().to_le_bytes());
        expected.extend_from_slice(b" 3 100\n");
        // The next two diff against the newest window entry: mask bit 1,
        // window index 0, only the changed argument in the tail.
        for payload in [b"200", b"300"] {
            expected.push(STATUS_DIFF | 0b10);
            expected.extend_from_slice(&0i32.to_le_bytes());
            expected.extend_from_slice(&0i32.to_le_bytes());
            expected.extend_from_slice(&0i32.to_le_bytes());
            expected.extend_from_slice(&0i32.to_le_bytes());
            expected.push(b' ');
            expected.extend_from_slice(payload);
            expected.push(b'\n');
        }
        assert_eq!(expected, bytes);
    }

    #[test]
    fn test_windowed_reference_can_sit_deeper_in_window() {
        let read = funcs::id_by_name("read").unwrap();
        let records = vec![
            Record::new(write_id(), 0.0, 0.0, 0, args(&["3", "100"])),
            Record::new(read, 0.0, 0.0, 0, args(&["7"])),
            Record::new(write_id(), 0.0, 0.0, 0, args(&["3", "200"])),
        ];
        let dir = tempfile::tempdir().unwrap();
        let bytes = encode_all(
            CompressionMode::Windowed,
            records,
            &dir.path().join("w.itf"),
        );
        // The third record diffs against the first write, which moved to
        // window slot 1 when the read was installed at slot 0.
        let tail = &bytes[bytes.len() - 22..];
        assert_eq!(STATUS_DIFF | 0b10, tail[0]);
        assert_eq!(&1i32.to_le_bytes()[..], &tail[13..17]);
        assert_eq!(&b" 200\n"[..], &tail[17..]);
    }

    #[test]
    fn test_windowed_full_when_every_argument_differs() {
        // One argument, always changing: a diff would not be smaller, so
        // every record is emitted in full.
        let close = funcs::id_by_name("close").unwrap();
        let records = vec![
            Record::new(close, 0.0, 0.0, 0, args(&["1"])),
            Record::new(close, 0.0, 0.0, 0, args(&["2"])),
        ];
        let dir = tempfile::tempdir().unwrap();
        let bytes = encode_all(
            CompressionMode::Windowed,
            records,
            &dir.path().join("w.itf"),
        );
        assert_eq!(STATUS_FULL, bytes[0]);
        assert_eq!(STATUS_FULL, bytes[20]);
    }

    #[test]
    fn test_windowed_boundary_arg_counts_fall_through() {
        let read = funcs::id_by_name("read").unwrap();
        let eight: Vec<Option<String>> =
            (0..8).map(|i| Some(i.to_string())).collect();
        let mut second_eight = eight.clone();
        second_eight[0] = Some("x".to_owned());
        let records = vec![
            Record::new(write_id(), 0.0, 0.0, 0, vec![]),
            Record::new(write_id(), 0.0, 0.0, 0, vec![]),
            Record::new(read, 0.0, 0.0, 0, eight),
            Record::new(read, 0.0, 0.0, 0, second_eight),
        ];
        let dir = tempfile::tempdir().unwrap();
        let bytes = encode_all(
            CompressionMode::Windowed,
            records,
            &dir.path().join("w.itf"),
        );
        // Zero arguments and eight arguments can never use diff mode.
        for record_bytes in bytes.split_inclusive(|b| *b == b'\n') {
            assert_eq!(STATUS_FULL, record_bytes[0]);
        }
    }

    #[test]
    fn test_windowed_encoding_is_deterministic() {
        let make = || {
            vec![
                Record::new(write_id(), 1e-6, 2e-6, 4, args(&["3", "100"])),
                Record::new(write_id(), 3e-6, 4e-6, 4, args(&["3", "200"])),
                Record::new(write_id(), 5e-6, 6e-6, 4, args(&["4", "200"])),
            ]
        };
        let dir = tempfile::tempdir().unwrap();
        let first = encode_all(CompressionMode::Windowed, make(), &dir.path().join("a.itf"));
        let second = encode_all(CompressionMode::Windowed, make(), &dir.path().join("b.itf"));
        assert_eq!(first, second);
    }
}
