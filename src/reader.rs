/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::clock;
use crate::config::CompressionMode;
use crate::cst::{Cst, CstError};
use crate::encoder::WINDOW_SIZE;
use crate::meta::{GlobalMeta, LocalMeta, MetaError, GLOBAL_META_FILENAME};
use crate::record::{Record, STATUS_DIFF, STATUS_FULL};
use crate::sequitur::{CfgRules, GrammarError};
use crate::blob;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("trace i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Cst(#[from] CstError),
    #[error(transparent)]
    Grammar(#[from] GrammarError),
    #[error("rank {0} has no decodable trace data")]
    NoData(i32),
    #[error("malformed record in rank {rank} stream at byte {offset}: {reason}")]
    BadRecord {
        rank: i32,
        offset: usize,
        reason: String,
    },
}

/// Offline reader over a trace directory: global metadata, per-rank
/// local metadata, and the per-rank record streams (either encoded
/// `.itf` files or `.cfg`/`.cst` grammar pairs from the filter tool).
pub struct RecorderReader {
    dir: PathBuf,
    pub metadata: GlobalMeta,
    func_names: Vec<String>,
    name_index: HashMap<String, i32>,
    locals: Vec<Option<LocalMeta>>,
}

impl RecorderReader {
    pub fn open(dir: &Path) -> Result<RecorderReader, ReaderError> {
        let bytes = fs::read(dir.join(GLOBAL_META_FILENAME))?;
        let (metadata, func_names) = GlobalMeta::parse(&bytes)?;
        let name_index = func_names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id as i32))
            .collect();

        let mut locals = Vec::new();
        for rank in 0..metadata.total_ranks.max(0) {
            let path = dir.join(format!("{}.mt", rank));
            let local = match fs::read(&path) {
                Ok(bytes) => Some(LocalMeta::parse(&bytes, func_names.len())?),
                // Filtered traces carry no local metadata.
                Err(_) => None,
            };
            locals.push(local);
        }

        Ok(RecorderReader {
            dir: dir.to_path_buf(),
            metadata,
            func_names,
            name_index,
            locals,
        })
    }

    pub fn total_ranks(&self) -> i32 {
        self.metadata.total_ranks
    }

    pub fn func_names(&self) -> &[String] {
        &self.func_names
    }

    /// Published name of the record's function, as listed in the global
    /// metadata.
    pub fn func_name(&self, record: &Record) -> Option<&str> {
        usize::try_from(record.func_id)
            .ok()
            .and_then(|id| self.func_names.get(id))
            .map(String::as_str)
    }

    pub fn local_meta(&self, rank: i32) -> Option<&LocalMeta> {
        usize::try_from(rank)
            .ok()
            .and_then(|rank| self.locals.get(rank))
            .and_then(Option::as_ref)
    }

    /// Decode one rank's records in trace order, invoking `callback` per
    /// record. The reader owns each record until the callback returns.
    pub fn decode_records<F: FnMut(&Record)>(
        &self,
        rank: i32,
        mut callback: F,
    ) -> Result<usize, ReaderError> {
        let itf = self.dir.join(format!("{}.itf", rank));
        if itf.exists() {
            let data = fs::read(&itf)?;
            return match self.metadata.compression_mode {
                CompressionMode::Text => self.decode_text(rank, &data, &mut callback),
                CompressionMode::Binary => self.decode_binary(rank, &data, false, &mut callback),
                CompressionMode::Windowed => self.decode_binary(rank, &data, true, &mut callback),
            };
        }
        if self.cfg_path(rank).exists() && self.cst_path(rank).exists() {
            return self.decode_grammar(rank, &mut callback);
        }
        Err(ReaderError::NoData(rank))
    }

    /// Call-signature table of a filtered trace.
    pub fn get_cst(&self, rank: i32) -> Result<Cst, ReaderError> {
        let bytes = fs::read(self.cst_path(rank))?;
        Ok(Cst::parse(&blob::read_blob(&bytes)?)?)
    }

    /// Grammar of a filtered trace.
    pub fn get_cfg(&self, rank: i32) -> Result<CfgRules, ReaderError> {
        let bytes = fs::read(self.cfg_path(rank))?;
        Ok(CfgRules::parse(&blob::read_blob(&bytes)?)?)
    }

    fn cst_path(&self, rank: i32) -> PathBuf {
        self.dir.join(format!("{}.cst", rank))
    }

    fn cfg_path(&self, rank: i32) -> PathBuf {
        self.dir.join(format!("{}.cfg", rank))
    }

    fn epoch(&self, rank: i32) -> f64 {
        self.local_meta(rank).map(|local| local.start_ts).unwrap_or(0.0)
    }

    fn func_id_of(&self, name: &str) -> Option<i32> {
        // The text encoder emits table names, so profiling names carry
        // the `P` the published table dropped.
        self.name_index
            .get(name)
            .or_else(|| self.name_index.get(name.strip_prefix('P')?))
            .copied()
    }

    fn decode_text<F: FnMut(&Record)>(
        &self,
        rank: i32,
        data: &[u8],
        callback: &mut F,
    ) -> Result<usize, ReaderError> {
        let text = std::str::from_utf8(data).map_err(|err| ReaderError::BadRecord {
            rank,
            offset: err.valid_up_to(),
            reason: "stream is not utf-8".to_owned(),
        })?;
        let mut count = 0;
        let mut offset = 0;
        for line in text.lines() {
            let bad = |reason: &str| ReaderError::BadRecord {
                rank,
                offset,
                reason: reason.to_owned(),
            };
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() < 4 {
                return Err(bad("fewer than four fields"));
            }
            let tstart: f64 = fields[0].parse().map_err(|_| bad("bad start timestamp"))?;
            let tend: f64 = fields[1].parse().map_err(|_| bad("bad end timestamp"))?;
            let res: i32 = fields[2].parse().map_err(|_| bad("bad return value"))?;
            let func_id = self
                .func_id_of(fields[3])
                .ok_or_else(|| bad(&format!("unknown function '{}'", fields[3])))?;
            let args = fields[4..].iter().map(|arg| Some((*arg).to_owned())).collect();
            let record = Record::new(func_id, tstart, tend, res, args);
            callback(&record);
            count += 1;
            offset += line.len() + 1;
        }
        Ok(count)
    }

    fn decode_binary<F: FnMut(&Record)>(
        &self,
        rank: i32,
        data: &[u8],
        windowed: bool,
        callback: &mut F,
    ) -> Result<usize, ReaderError> {
        let epoch = self.epoch(rank);
        let mut window: Vec<Record> = Vec::with_capacity(WINDOW_SIZE);
        let mut count = 0;
        let mut pos = 0;
        while pos < data.len() {
            let bad = |offset: usize, reason: String| ReaderError::BadRecord {
                rank,
                offset,
                reason,
            };
            if pos + 17 > data.len() {
                return Err(bad(pos, "truncated record header".to_owned()));
            }
            let status = data[pos];
            let read_i32 = |at: usize| {
                i32::from_le_bytes(data[at..at + 4].try_into().expect("bounds checked"))
            };
            let tstart_ticks = read_i32(pos + 1);
            let tend_ticks = read_i32(pos + 5);
            let res = read_i32(pos + 9);
            let func_field = read_i32(pos + 13);

            let tail_start = pos + 17;
            let newline = data[tail_start..]
                .iter()
                .position(|b| *b == b'\n')
                .ok_or_else(|| bad(pos, "record tail has no terminator".to_owned()))?;
            let tail = &data[tail_start..tail_start + newline];
            let args = parse_arg_tail(tail).map_err(|reason| bad(pos, reason))?;

            let tstart = clock::from_ticks(tstart_ticks, epoch);
            let tend = clock::from_ticks(tend_ticks, epoch);

            let record = if windowed && status & STATUS_DIFF != 0 {
                resolve_diff(&window, status, func_field, tstart, tend, res, &args)
                    .map_err(|reason| bad(pos, reason))?
            } else {
                let mut record = Record::new(func_field, tstart, tend, res, args);
                record.status = STATUS_FULL;
                record
            };

            if windowed {
                // Mirror the encoder: newest reconstructed record at
                // slot 0, oldest evicted.
                window.insert(0, record.clone());
                window.truncate(WINDOW_SIZE);
            }
            callback(&record);
            count += 1;
            pos = tail_start + newline + 1;
        }
        Ok(count)
    }

    fn decode_grammar<F: FnMut(&Record)>(
        &self,
        rank: i32,
        callback: &mut F,
    ) -> Result<usize, ReaderError> {
        let cst = self.get_cst(rank)?;
        let cfg = self.get_cfg(rank)?;
        let mut count = 0;
        let mut failure: Option<ReaderError> = None;
        cfg.expand(&mut |terminal| {
            if failure.is_some() {
                return;
            }
            match cst.get(terminal) {
                Some(signature) => match Cst::record_from_key(&signature.key) {
                    Ok(record) => {
                        callback(&record);
                        count += 1;
                    }
                    Err(err) => failure = Some(err.into()),
                },
                None => {
                    failure = Some(ReaderError::BadRecord {
                        rank,
                        offset: count,
                        reason: format!("grammar references unknown terminal {}", terminal),
                    })
                }
            }
        })?;
        match failure {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }
}

fn parse_arg_tail(tail: &[u8]) -> Result<Vec<Option<String>>, String> {
    if tail.is_empty() {
        return Ok(Vec::new());
    }
    if tail[0] != b' ' {
        return Err("argument tail does not start with a separator".to_owned());
    }
    tail[1..]
        .split(|b| *b == b' ')
        .map(|arg| {
            std::str::from_utf8(arg)
                .map(|arg| Some(arg.to_owned()))
                .map_err(|_| "argument is not utf-8".to_owned())
        })
        .collect()
}

/// Reconstruct a full record from a diff record and its window
/// reference.
fn resolve_diff(
    window: &[Record],
    status: u8,
    window_idx: i32,
    tstart: f64,
    tend: f64,
    res: i32,
    diff_args: &[Option<String>],
) -> Result<Record, String> {
    let reference = usize::try_from(window_idx)
        .ok()
        .and_then(|idx| window.get(idx))
        .ok_or_else(|| format!("diff references empty window slot {}", window_idx))?;

    let mask = status & !STATUS_DIFF;
    if mask.count_ones() as usize != diff_args.len() {
        return Err(format!(
            "diff mask has {} bit(s) but {} argument(s)",
            mask.count_ones(),
            diff_args.len()
        ));
    }

    let mut args = reference.args.clone();
    let mut next_diff = 0;
    for bit in 0..7usize {
        if mask & (1u8 << bit) == 0 {
            continue;
        }
        if bit >= args.len() {
            return Err(format!(
                "diff mask bit {} beyond the reference's {} argument(s)",
                bit,
                args.len()
            ));
        }
        args[bit] = diff_args[next_diff].clone();
        next_diff += 1;
    }

    Ok(Record::new(reference.func_id, tstart, tend, res, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::funcs;
    use crate::logger::Logger;

    fn args(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|v| Some((*v).to_owned())).collect()
    }

    fn trace(dir: &Path, mode: CompressionMode, records: &[Record]) -> PathBuf {
        let config = Config {
            compression_mode: mode,
            traces_dir: dir.join("recorder-logs"),
            with_non_mpi: false,
            signal_handlers: false,
        };
        let mut logger = Logger::create(&config, 0, 1).unwrap();
        let epoch = logger.start_ts();
        for record in records {
            let mut record = record.clone();
            record.tstart += epoch;
            record.tend += epoch;
            logger.append(record);
        }
        logger.finalize();
        config.traces_dir
    }

    fn sample_records() -> Vec<Record> {
        let open = funcs::id_by_name("open").unwrap();
        let write = funcs::id_by_name("write").unwrap();
        let close = funcs::id_by_name("close").unwrap();
        vec![
            Record::new(open, 10e-6, 20e-6, 3, args(&["a", "0"])),
            Record::new(write, 30e-6, 40e-6, 2, args(&["3", "100"])),
            Record::new(write, 50e-6, 60e-6, 2, args(&["3", "200"])),
            Record::new(write, 70e-6, 80e-6, 2, args(&["3", "300"])),
            Record::new(close, 90e-6, 100e-6, 0, args(&["3"])),
        ]
    }

    fn decode_all(dir: &Path) -> Vec<Record> {
        let reader = RecorderReader::open(dir).unwrap();
        let mut decoded = Vec::new();
        let count = reader.decode_records(0, |record| decoded.push(record.clone())).unwrap();
        assert_eq!(decoded.len(), count);
        assert_eq!(
            reader.local_meta(0).unwrap().total_records,
            decoded.len() as u64
        );
        decoded
    }

    fn assert_same_calls(expected: &[Record], decoded: &[Record], epoch: f64) {
        assert_eq!(expected.len(), decoded.len());
        for (want, got) in expected.iter().zip(decoded) {
            assert_eq!(want.func_id, got.func_id);
            assert_eq!(want.res, got.res);
            assert_eq!(want.args, got.args);
            // Binary timestamps are tick-quantized around the epoch.
            assert!((got.tstart - epoch - want.tstart).abs() <= 2.0 * clock::TIME_RESOLUTION);
            assert!((got.tend - epoch - want.tend).abs() <= 2.0 * clock::TIME_RESOLUTION);
        }
    }

    #[test]
    fn test_round_trip_text() {
        let tmp = tempfile::tempdir().unwrap();
        let records = sample_records();
        let dir = trace(tmp.path(), CompressionMode::Text, &records);
        let decoded = decode_all(&dir);
        let epoch = RecorderReader::open(&dir).unwrap().local_meta(0).unwrap().start_ts;
        assert_same_calls(&records, &decoded, epoch);
    }

    #[test]
    fn test_round_trip_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let records = sample_records();
        let dir = trace(tmp.path(), CompressionMode::Binary, &records);
        let decoded = decode_all(&dir);
        let epoch = RecorderReader::open(&dir).unwrap().local_meta(0).unwrap().start_ts;
        assert_same_calls(&records, &decoded, epoch);
    }

    #[test]
    fn test_round_trip_windowed() {
        let tmp = tempfile::tempdir().unwrap();
        let records = sample_records();
        let dir = trace(tmp.path(), CompressionMode::Windowed, &records);
        let decoded = decode_all(&dir);
        let epoch = RecorderReader::open(&dir).unwrap().local_meta(0).unwrap().start_ts;
        assert_same_calls(&records, &decoded, epoch);
    }

    #[test]
    fn test_round_trip_windowed_with_deep_window_reference() {
        let write = funcs::id_by_name("write").unwrap();
        let read = funcs::id_by_name("read").unwrap();
        let records = vec![
            Record::new(write, 0.0, 0.0, 0, args(&["3", "100"])),
            Record::new(read, 0.0, 0.0, 0, args(&["7", "64"])),
            Record::new(write, 0.0, 0.0, 0, args(&["3", "200"])),
            Record::new(read, 0.0, 0.0, 0, args(&["7", "128"])),
        ];
        let tmp = tempfile::tempdir().unwrap();
        let dir = trace(tmp.path(), CompressionMode::Windowed, &records);
        let decoded = decode_all(&dir);
        let epoch = RecorderReader::open(&dir).unwrap().local_meta(0).unwrap().start_ts;
        assert_same_calls(&records, &decoded, epoch);
    }

    #[test]
    fn test_round_trip_edge_arguments() {
        let open = funcs::id_by_name("open").unwrap();
        let records = vec![
            Record::new(open, 0.0, 0.0, 0, vec![]),
            Record::new(open, 0.0, 0.0, 0, vec![Some(String::new())]),
            Record::new(open, 0.0, 0.0, 0, vec![Some("a b".to_owned()), None]),
        ];
        let tmp = tempfile::tempdir().unwrap();
        let dir = trace(tmp.path(), CompressionMode::Binary, &records);
        let decoded = decode_all(&dir);
        assert_eq!(Vec::<Option<String>>::new(), decoded[0].args);
        assert_eq!(args(&[""]), decoded[1].args);
        // Wire substitutions applied on the way in.
        assert_eq!(args(&["a_b", "???"]), decoded[2].args);
    }

    #[test]
    fn test_missing_rank_reports_no_data() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = trace(tmp.path(), CompressionMode::Binary, &sample_records());
        let reader = RecorderReader::open(&dir).unwrap();
        assert!(matches!(
            reader.decode_records(5, |_| {}),
            Err(ReaderError::NoData(5))
        ));
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = trace(tmp.path(), CompressionMode::Binary, &sample_records());
        let itf = dir.join("0.itf");
        let mut bytes = fs::read(&itf).unwrap();
        bytes.truncate(bytes.len() - 5);
        fs::write(&itf, &bytes).unwrap();
        let reader = RecorderReader::open(&dir).unwrap();
        assert!(reader.decode_records(0, |_| {}).is_err());
    }
}
