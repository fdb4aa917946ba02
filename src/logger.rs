/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use log::{debug, warn};

use crate::clock::{self, TIME_RESOLUTION};
use crate::config::Config;
use crate::encoder::{Encoder, WINDOW_SIZE};
use crate::funcs;
use crate::membuf::MemBuf;
use crate::meta::{FileEntry, GlobalMeta, LocalMeta, GLOBAL_META_FILENAME, VERSION_FILENAME};
use crate::real::{self, TraceFile};
use crate::record::Record;
use crate::registry::FilenameRegistry;

/// Per-rank trace writer: owns the data and metadata files, the write
/// buffer, the encoder, and the local metadata it stamps at finalize.
pub struct Logger {
    rank: i32,
    nprocs: i32,
    traces_dir: PathBuf,
    data_file: TraceFile,
    meta_file: TraceFile,
    start_ts: f64,
    local: LocalMeta,
    encoder: Encoder,
    membuf: MemBuf,
    registry: FilenameRegistry,
}

impl Logger {
    /// Set up the output directory and open this rank's files. Rank 0
    /// resets the directory and writes the run-wide metadata; every rank
    /// passes the barrier before opening its own files so no rank writes
    /// into a directory about to be removed.
    pub fn create(config: &Config, rank: i32, nprocs: i32) -> anyhow::Result<Logger> {
        let real = real::table();
        let traces_dir = config.traces_dir.clone();

        if rank == 0 {
            if real.path_exists(&traces_dir) && !real.remove_path(&traces_dir) {
                debug!("stale trace directory '{}' not removed", traces_dir.display());
            }
            if !real.make_dir(&traces_dir) {
                debug!("trace directory '{}' not created", traces_dir.display());
            }
        }
        real.barrier();

        let data_path = traces_dir.join(format!("{}.itf", rank));
        let data_file = real
            .open_for_write(&data_path)
            .ok_or_else(|| anyhow!("failed to open trace file '{}'", data_path.display()))?;
        let meta_path = traces_dir.join(format!("{}.mt", rank));
        let meta_file = match real.open_for_write(&meta_path) {
            Some(file) => file,
            None => {
                data_file.close();
                return Err(anyhow!(
                    "failed to open metadata file '{}'",
                    meta_path.display()
                ));
            }
        };

        let logger = Logger {
            rank,
            nprocs,
            traces_dir,
            data_file,
            meta_file,
            start_ts: clock::wtime(),
            local: LocalMeta::new(funcs::FUNC_COUNT),
            encoder: Encoder::new(config.compression_mode),
            membuf: MemBuf::new(),
            registry: FilenameRegistry::new(),
        };

        if rank == 0 {
            logger
                .write_global_meta(config)
                .context("failed to write global metadata")?;
        }
        Ok(logger)
    }

    fn write_global_meta(&self, config: &Config) -> anyhow::Result<()> {
        let real = real::table();
        let meta = GlobalMeta {
            time_resolution: TIME_RESOLUTION,
            total_ranks: self.nprocs,
            compression_mode: config.compression_mode,
            peephole_window_size: WINDOW_SIZE as i32,
            interprocess_compression: 0,
        };
        let names: Vec<&str> = (0..funcs::FUNC_COUNT)
            .map(|id| funcs::published_name(id as i32).unwrap_or(""))
            .collect();

        let path = self.traces_dir.join(GLOBAL_META_FILENAME);
        let file = real
            .open_for_write(&path)
            .ok_or_else(|| anyhow!("failed to open '{}'", path.display()))?;
        file.write(&meta.to_bytes(&names));
        file.close();

        let path = self.traces_dir.join(VERSION_FILENAME);
        let file = real
            .open_for_write(&path)
            .ok_or_else(|| anyhow!("failed to open '{}'", path.display()))?;
        file.write(env!("CARGO_PKG_VERSION").as_bytes());
        file.close();
        Ok(())
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn start_ts(&self) -> f64 {
        self.start_ts
    }

    /// Rank and size learned from the distributed-init handoff.
    pub fn set_mpi_info(&mut self, rank: i32, nprocs: i32) {
        if rank != self.rank {
            // Files are already open under the old rank; records keep
            // flowing there rather than losing the trace.
            warn!(
                "rank changed from {} to {} after trace files were opened",
                self.rank, rank
            );
        }
        self.rank = rank;
        self.nprocs = nprocs;
    }

    /// Encode one record into the trace and account for it.
    pub fn append(&mut self, record: Record) {
        self.local.total_records += 1;
        match usize::try_from(record.func_id).ok() {
            Some(id) if id < self.local.function_count.len() => {
                self.local.function_count[id] += 1;
            }
            _ => warn!("record with unknown func_id {}", record.func_id),
        }
        self.encoder
            .encode(record, self.start_ts, &mut self.membuf, &self.data_file);
    }

    /// Remember a pathname the traced program touched.
    pub fn observe_filename(&mut self, path: &str) {
        self.registry.intern(path);
    }

    /// Stamp and write the local metadata, drain the buffer, and close
    /// both files. Called with recording already disabled, so the stat
    /// per filename cannot be traced.
    pub fn finalize(mut self) {
        self.encoder.clear_window();

        self.local.start_ts = self.start_ts;
        self.local.end_ts = clock::wtime();
        self.local.files = self
            .registry
            .iterate()
            .map(|(id, name)| FileEntry {
                id,
                size: real::file_size(name),
                name: name.to_owned(),
            })
            .collect();

        self.meta_file.write(&self.local.to_bytes());
        self.meta_file.close();

        self.membuf.flush(&self.data_file);
        self.membuf.destroy();
        self.data_file.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionMode;
    use std::fs;
    use std::io::Write;

    fn config(dir: &std::path::Path, mode: CompressionMode) -> Config {
        Config {
            compression_mode: mode,
            traces_dir: dir.join("recorder-logs"),
            with_non_mpi: false,
            signal_handlers: false,
        }
    }

    fn args(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|v| Some((*v).to_owned())).collect()
    }

    #[test]
    fn test_single_rank_text_run() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), CompressionMode::Text);

        let traced = tmp.path().join("a");
        let mut traced_file = fs::File::create(&traced).unwrap();
        traced_file.write_all(b"x").unwrap();
        drop(traced_file);
        let traced_name = traced.to_str().unwrap().to_owned();

        let mut logger = Logger::create(&config, 0, 1).unwrap();
        let open = funcs::id_by_name("open").unwrap();
        let write = funcs::id_by_name("write").unwrap();
        let close = funcs::id_by_name("close").unwrap();
        logger.observe_filename(&traced_name);
        logger.append(Record::new(open, 0.000001, 0.000002, 3, args(&[&traced_name, "0"])));
        logger.append(Record::new(write, 0.000003, 0.000004, 2, args(&["3", "hi"])));
        logger.append(Record::new(close, 0.000005, 0.000006, 0, args(&["3"])));
        logger.finalize();

        let dir = config.traces_dir;
        let text = fs::read_to_string(dir.join("0.itf")).unwrap();
        assert_eq!(3, text.lines().count());
        assert!(text.ends_with('\n'));
        assert!(text.lines().nth(1).unwrap().ends_with("2 write 3 hi"));

        let local = LocalMeta::parse(&fs::read(dir.join("0.mt")).unwrap(), funcs::FUNC_COUNT).unwrap();
        assert_eq!(3, local.total_records);
        assert_eq!(1, local.function_count[open as usize]);
        assert_eq!(1, local.function_count[write as usize]);
        assert_eq!(1, local.function_count[close as usize]);
        assert_eq!(
            local.total_records,
            local.function_count.iter().map(|c| *c as u64).sum::<u64>()
        );
        assert_eq!(1, local.files.len());
        assert_eq!(0, local.files[0].id);
        assert_eq!(1, local.files[0].size);
        assert_eq!(traced_name, local.files[0].name);

        let (global, names) =
            GlobalMeta::parse(&fs::read(dir.join(GLOBAL_META_FILENAME)).unwrap()).unwrap();
        assert_eq!(1, global.total_ranks);
        assert_eq!(CompressionMode::Text, global.compression_mode);
        assert_eq!(funcs::FUNC_COUNT, names.len());
        assert!(names.contains(&"MPI_Barrier".to_owned()));
        assert!(fs::read(dir.join(VERSION_FILENAME)).unwrap().len() > 0);
    }

    #[test]
    fn test_record_counts_match_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), CompressionMode::Windowed);
        let mut logger = Logger::create(&config, 0, 1).unwrap();
        let write = funcs::id_by_name("write").unwrap();
        for i in 0..100 {
            logger.append(Record::new(write, 0.0, 0.0, 0, args(&["3", &i.to_string()])));
        }
        logger.finalize();
        let local = LocalMeta::parse(
            &fs::read(config.traces_dir.join("0.mt")).unwrap(),
            funcs::FUNC_COUNT,
        )
        .unwrap();
        assert_eq!(100, local.total_records);
        assert_eq!(100, local.function_count[write as usize]);
    }

    #[test]
    fn test_runs_are_byte_identical_for_same_records() {
        let write = funcs::id_by_name("write").unwrap();
        let run = |dir: &std::path::Path| {
            let config = config(dir, CompressionMode::Windowed);
            let mut logger = Logger::create(&config, 0, 1).unwrap();
            // Identical epoch-relative timestamps keep the tick fields
            // equal across the two runs.
            let epoch = logger.start_ts();
            for i in 0..10 {
                logger.append(Record::new(
                    write,
                    epoch,
                    epoch,
                    0,
                    args(&["3", &(i % 3).to_string()]),
                ));
            }
            logger.finalize();
            fs::read(config.traces_dir.join("0.itf")).unwrap()
        };
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        assert_eq!(run(a.path()), run(b.path()));
    }
}
