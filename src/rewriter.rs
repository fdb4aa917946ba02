/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use log::{debug, info};
use serde::Serialize;

use crate::blob;
use crate::cst::Cst;
use crate::filter::{self, Filter};
use crate::meta::{GLOBAL_META_FILENAME, TIMESTAMPS_FILENAME, VERSION_FILENAME};
use crate::reader::RecorderReader;
use crate::record::Record;
use crate::sequitur::Grammar;

/// Subdirectory of the input trace receiving the rewritten output.
pub const FILTERED_DIR: &str = "_filtered";

/// Apply `filters` to every record of the trace in `trace_dir`, rebuild
/// the call-signature table and the per-rank grammars, and serialize
/// them into `<trace_dir>/_filtered/`.
pub fn filter_trace(trace_dir: &Path, filter_path: &Path) -> anyhow::Result<()> {
    let filters = filter::load_filters(filter_path);
    let reader = RecorderReader::open(trace_dir)
        .with_context(|| format!("failed to open trace at '{}'", trace_dir.display()))?;

    // The table is global: every rank's records intern into it, and each
    // rank gets an identical serialized copy.
    let mut cst = Cst::new();
    let mut cfgs = Vec::new();
    for rank in 0..reader.total_ranks() {
        let mut cfg = Grammar::new();
        reader
            .decode_records(rank, |record| {
                let rewritten = rewrite_record(&reader, &filters, record);
                grow_cst_cfg(&mut cst, &mut cfg, &rewritten);
            })
            .with_context(|| format!("failed to decode records of rank {}", rank))?;
        cfgs.push(cfg);
    }
    info!(
        "rebuilt {} call signature(s) over {} rank(s)",
        cst.len(),
        cfgs.len()
    );

    let out_dir = trace_dir.join(FILTERED_DIR);
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create '{}'", out_dir.display()))?;

    for (rank, cfg) in cfgs.iter().enumerate() {
        let path = out_dir.join(format!("{}.cfg", rank));
        let mut file =
            File::create(&path).with_context(|| format!("failed to create '{}'", path.display()))?;
        blob::write_blob(&mut file, &cfg.serialize())
            .with_context(|| format!("failed to write '{}'", path.display()))?;

        let path = out_dir.join(format!("{}.cst", rank));
        let mut file =
            File::create(&path).with_context(|| format!("failed to create '{}'", path.display()))?;
        blob::write_blob(&mut file, &cst.serialize())
            .with_context(|| format!("failed to write '{}'", path.display()))?;
    }

    // Timestamps and version ride along unchanged; the timestamps file
    // is optional.
    for name in [VERSION_FILENAME, TIMESTAMPS_FILENAME] {
        let src = trace_dir.join(name);
        if src.exists() {
            fs::copy(&src, out_dir.join(name))
                .with_context(|| format!("failed to copy '{}'", src.display()))?;
        }
    }

    let mut metadata = reader.metadata.clone();
    metadata.interprocess_compression = 0;
    let names: Vec<&str> = reader.func_names().iter().map(String::as_str).collect();
    let path = out_dir.join(GLOBAL_META_FILENAME);
    fs::write(&path, metadata.to_bytes(&names))
        .with_context(|| format!("failed to write '{}'", path.display()))?;

    Ok(())
}

/// Rewritten copy of `record`; records matching no filter pass through
/// unchanged.
fn rewrite_record(reader: &RecorderReader, filters: &[Filter], record: &Record) -> Record {
    let mut rewritten = record.clone();
    if let Some(name) = reader.func_name(record) {
        rewritten.args = filter::rewrite_args(filters, name, rewritten.args);
        if rewritten.args != record.args {
            debug!(
                "rewrote {} {:?} -> {:?}",
                name, record.args, rewritten.args
            );
        }
    }
    rewritten
}

/// Intern the record's signature and extend the rank's grammar by its
/// terminal.
fn grow_cst_cfg(cst: &mut Cst, cfg: &mut Grammar, record: &Record) {
    let terminal_id = cst.intern(Cst::compose_key(record));
    cfg.append_terminal(terminal_id, 1);
}

#[derive(Serialize)]
struct ExportedRecord<'a> {
    func: &'a str,
    tstart: f64,
    tend: f64,
    res: i32,
    tid: u64,
    call_depth: i32,
    args: &'a [Option<String>],
}

/// Expand a trace back into one line per record, optionally applying
/// filters first, as text or JSON lines.
pub fn export_trace<W: Write>(
    trace_dir: &Path,
    filter_path: Option<&Path>,
    json: bool,
    out: &mut W,
) -> anyhow::Result<()> {
    let filters = filter_path.map(filter::load_filters).unwrap_or_default();
    let reader = RecorderReader::open(trace_dir)
        .with_context(|| format!("failed to open trace at '{}'", trace_dir.display()))?;

    for rank in 0..reader.total_ranks() {
        let mut failure = None;
        reader
            .decode_records(rank, |record| {
                if failure.is_some() {
                    return;
                }
                let record = rewrite_record(&reader, &filters, record);
                let name = reader.func_name(&record).unwrap_or("???");
                let result = if json {
                    let exported = ExportedRecord {
                        func: name,
                        tstart: record.tstart,
                        tend: record.tend,
                        res: record.res,
                        tid: record.tid,
                        call_depth: record.call_depth,
                        args: &record.args,
                    };
                    serde_json::to_writer(&mut *out, &exported)
                        .map_err(anyhow::Error::from)
                        .and_then(|_| writeln!(out).map_err(anyhow::Error::from))
                } else {
                    let args: Vec<String> =
                        record.args.iter().map(Record::wire_arg).collect();
                    writeln!(
                        out,
                        "{:.6} {:.6} {} {} ( {} )",
                        record.tstart,
                        record.tend,
                        name,
                        record.call_depth,
                        args.join(" ")
                    )
                    .map_err(anyhow::Error::from)
                };
                if let Err(err) = result {
                    failure = Some(err);
                }
            })
            .with_context(|| format!("failed to decode records of rank {}", rank))?;
        if let Some(err) = failure {
            return Err(err.context("failed to write exported records"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionMode, Config};
    use crate::funcs;
    use crate::logger::Logger;

    fn args(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|v| Some((*v).to_owned())).collect()
    }

    fn write_trace(dir: &Path) -> std::path::PathBuf {
        let config = Config {
            compression_mode: CompressionMode::Windowed,
            traces_dir: dir.join("recorder-logs"),
            with_non_mpi: false,
            signal_handlers: false,
        };
        let mut logger = Logger::create(&config, 0, 1).unwrap();
        let epoch = logger.start_ts();
        let write = funcs::id_by_name("write").unwrap();
        let close = funcs::id_by_name("close").unwrap();
        for i in 0..4 {
            logger.append(Record::new(
                write,
                epoch,
                epoch,
                2,
                args(&["3", &(512 * (i + 1)).to_string()]),
            ));
        }
        logger.append(Record::new(close, epoch, epoch, 0, args(&["3"])));
        logger.finalize();
        config.traces_dir
    }

    #[test]
    fn test_filter_rewrites_and_serializes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_trace(tmp.path());
        let filter_path = tmp.path().join("filters.txt");
        fs::write(&filter_path, "write 0 1[0:1024-0,1024:1048576-1]\n").unwrap();

        filter_trace(&dir, &filter_path).unwrap();

        let out_dir = dir.join(FILTERED_DIR);
        let reader = RecorderReader::open(&out_dir).unwrap();
        assert_eq!(0, reader.metadata.interprocess_compression);
        let cst = reader.get_cst(0).unwrap();
        // write(3,512) and write(3,1024..2048) collapse into two
        // signatures, close(3) keeps its own.
        assert_eq!(3, cst.len());

        let mut decoded = Vec::new();
        reader
            .decode_records(0, |record| decoded.push(record.clone()))
            .unwrap();
        assert_eq!(5, decoded.len());
        assert_eq!(args(&["3", "0"]), decoded[0].args);
        assert_eq!(args(&["3", "1"]), decoded[1].args);
        assert_eq!(args(&["3"]), decoded[4].args);
    }

    #[test]
    fn test_missing_filter_file_copies_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_trace(tmp.path());
        filter_trace(&dir, &tmp.path().join("nonexistent.txt")).unwrap();

        let reader = RecorderReader::open(&dir).unwrap();
        let mut original = Vec::new();
        reader
            .decode_records(0, |record| original.push(record.clone()))
            .unwrap();

        let filtered = RecorderReader::open(&dir.join(FILTERED_DIR)).unwrap();
        let mut copied = Vec::new();
        filtered
            .decode_records(0, |record| copied.push(record.clone()))
            .unwrap();

        assert_eq!(original.len(), copied.len());
        for (a, b) in original.iter().zip(&copied) {
            assert_eq!(a.func_id, b.func_id);
            assert_eq!(a.args, b.args);
        }
    }

    #[test]
    fn test_export_text_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_trace(tmp.path());
        let mut out = Vec::new();
        export_trace(&dir, None, false, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(5, text.lines().count());
        assert!(text.lines().next().unwrap().contains("write 0 ( 3 512 )"));
    }

    #[test]
    fn test_export_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_trace(tmp.path());
        let mut out = Vec::new();
        export_trace(&dir, None, true, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!("write", first["func"]);
        assert_eq!("512", first["args"][1]);
    }
}
