/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::config::CompressionMode;

pub const GLOBAL_META_FILENAME: &str = "recorder.mt";
pub const VERSION_FILENAME: &str = "VERSION";
pub const TIMESTAMPS_FILENAME: &str = "recorder.ts";

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("metadata is truncated or malformed: {0}")]
    Io(#[from] io::Error),
    #[error("unknown compression mode {0}")]
    UnknownMode(i32),
    #[error("function name table is not valid utf-8")]
    BadName,
}

/// Run-wide metadata, written once by rank 0. The packed header is
/// followed by one published function name per line.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalMeta {
    pub time_resolution: f64,
    pub total_ranks: i32,
    pub compression_mode: CompressionMode,
    pub peephole_window_size: i32,
    pub interprocess_compression: i32,
}

impl GlobalMeta {
    pub fn write_to<W: Write>(&self, out: &mut W, func_names: &[&str]) -> io::Result<()> {
        out.write_f64::<LittleEndian>(self.time_resolution)?;
        out.write_i32::<LittleEndian>(self.total_ranks)?;
        out.write_i32::<LittleEndian>(self.compression_mode.as_i32())?;
        out.write_i32::<LittleEndian>(self.peephole_window_size)?;
        out.write_i32::<LittleEndian>(self.interprocess_compression)?;
        for name in func_names {
            out.write_all(name.as_bytes())?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn to_bytes(&self, func_names: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes, func_names)
            .expect("in-memory metadata write cannot fail");
        bytes
    }

    /// Parse the packed header and the function name table.
    pub fn parse(bytes: &[u8]) -> Result<(GlobalMeta, Vec<String>), MetaError> {
        let mut cursor = Cursor::new(bytes);
        let time_resolution = cursor.read_f64::<LittleEndian>()?;
        let total_ranks = cursor.read_i32::<LittleEndian>()?;
        let mode = cursor.read_i32::<LittleEndian>()?;
        let peephole_window_size = cursor.read_i32::<LittleEndian>()?;
        let interprocess_compression = cursor.read_i32::<LittleEndian>()?;
        let compression_mode =
            CompressionMode::from_i32(mode).ok_or(MetaError::UnknownMode(mode))?;

        let names = &bytes[cursor.position() as usize..];
        let names = std::str::from_utf8(names).map_err(|_| MetaError::BadName)?;
        let func_names = names
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();

        Ok((
            GlobalMeta {
                time_resolution,
                total_ranks,
                compression_mode,
                peephole_window_size,
                interprocess_compression,
            },
            func_names,
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub id: i32,
    pub size: u64,
    pub name: String,
}

/// Per-rank metadata stamped at finalize, followed by the filename table.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMeta {
    pub total_records: u64,
    pub function_count: Vec<i32>,
    pub start_ts: f64,
    pub end_ts: f64,
    pub files: Vec<FileEntry>,
}

impl LocalMeta {
    pub fn new(func_count: usize) -> Self {
        LocalMeta {
            total_records: 0,
            function_count: vec![0; func_count],
            start_ts: 0.0,
            end_ts: 0.0,
            files: Vec::new(),
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.total_records)?;
        for count in &self.function_count {
            out.write_i32::<LittleEndian>(*count)?;
        }
        out.write_i32::<LittleEndian>(self.files.len() as i32)?;
        out.write_f64::<LittleEndian>(self.start_ts)?;
        out.write_f64::<LittleEndian>(self.end_ts)?;
        for file in &self.files {
            out.write_i32::<LittleEndian>(file.id)?;
            out.write_u64::<LittleEndian>(file.size)?;
            out.write_i32::<LittleEndian>(file.name.len() as i32)?;
            out.write_all(file.name.as_bytes())?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)
            .expect("in-memory metadata write cannot fail");
        bytes
    }

    /// Parse a `<rank>.mt` blob. `func_count` is the length of the
    /// function name table in the global metadata.
    pub fn parse(bytes: &[u8], func_count: usize) -> Result<LocalMeta, MetaError> {
        let mut cursor = Cursor::new(bytes);
        let total_records = cursor.read_u64::<LittleEndian>()?;
        let mut function_count = vec![0i32; func_count];
        for count in function_count.iter_mut() {
            *count = cursor.read_i32::<LittleEndian>()?;
        }
        let num_files = cursor.read_i32::<LittleEndian>()?;
        let start_ts = cursor.read_f64::<LittleEndian>()?;
        let end_ts = cursor.read_f64::<LittleEndian>()?;
        let mut files = Vec::with_capacity(num_files.max(0) as usize);
        for _ in 0..num_files.max(0) {
            let id = cursor.read_i32::<LittleEndian>()?;
            let size = cursor.read_u64::<LittleEndian>()?;
            let name_len = cursor.read_i32::<LittleEndian>()?.max(0) as usize;
            let mut name = vec![0u8; name_len];
            cursor.read_exact(&mut name)?;
            let name = String::from_utf8(name).map_err(|_| MetaError::BadName)?;
            files.push(FileEntry { id, size, name });
        }
        Ok(LocalMeta {
            total_records,
            function_count,
            start_ts,
            end_ts,
            files,
        })
    }
}
