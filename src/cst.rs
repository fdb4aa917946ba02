/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::record::Record;

#[derive(Error, Debug)]
pub enum CstError {
    #[error("call-signature blob is truncated")]
    Truncated,
    #[error("call-signature key is malformed: {0}")]
    BadKey(String),
    #[error("terminal ids are not dense")]
    SparseIds,
}

/// One deduplicated call signature: the byte key plus its dense terminal
/// id and how often it occurred.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSignature {
    pub terminal_id: i32,
    pub rank: i32,
    pub count: u32,
    pub key: Vec<u8>,
}

/// Call-signature table: maps a record's byte key to a terminal id
/// assigned in insertion order from 0.
#[derive(Debug, Default)]
pub struct Cst {
    index: HashMap<Vec<u8>, usize>,
    entries: Vec<CallSignature>,
}

impl Cst {
    pub fn new() -> Self {
        Cst::default()
    }

    /// Terminal id for `key`, assigning the next dense id on first
    /// sight and bumping the occurrence count otherwise.
    pub fn intern(&mut self, key: Vec<u8>) -> i32 {
        if let Some(idx) = self.index.get(&key) {
            self.entries[*idx].count += 1;
            return self.entries[*idx].terminal_id;
        }
        let terminal_id = self.entries.len() as i32;
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push(CallSignature {
            terminal_id,
            rank: 0,
            count: 1,
            key,
        });
        terminal_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in terminal-id order.
    pub fn entries(&self) -> &[CallSignature] {
        &self.entries
    }

    pub fn get(&self, terminal_id: i32) -> Option<&CallSignature> {
        usize::try_from(terminal_id).ok().and_then(|i| self.entries.get(i))
    }

    /// Byte key of a record: tid, func id, call depth, arg count, then
    /// the length-prefixed argument blob. Every argument is followed by
    /// one space so the decoder can count them by separator.
    pub fn compose_key(record: &Record) -> Vec<u8> {
        let mut blob = Vec::new();
        for arg in &record.args {
            blob.extend_from_slice(Record::wire_arg(arg).as_bytes());
            blob.push(b' ');
        }
        let mut key = Vec::with_capacity(24 + blob.len());
        key.extend_from_slice(&record.tid.to_le_bytes());
        key.extend_from_slice(&record.func_id.to_le_bytes());
        key.extend_from_slice(&record.call_depth.to_le_bytes());
        key.extend_from_slice(&(record.args.len() as i32).to_le_bytes());
        key.extend_from_slice(&(blob.len() as i32).to_le_bytes());
        key.extend_from_slice(&blob);
        key
    }

    /// Rebuild a record from a signature key. Timestamps and the return
    /// value are not part of the signature and come back zeroed.
    pub fn record_from_key(key: &[u8]) -> Result<Record, CstError> {
        let mut cursor = Cursor::new(key);
        let tid = cursor.read_u64::<LittleEndian>().map_err(|_| CstError::Truncated)?;
        let func_id = cursor.read_i32::<LittleEndian>().map_err(|_| CstError::Truncated)?;
        let call_depth = cursor.read_i32::<LittleEndian>().map_err(|_| CstError::Truncated)?;
        let arg_count = cursor.read_i32::<LittleEndian>().map_err(|_| CstError::Truncated)?;
        let blob_len = cursor.read_i32::<LittleEndian>().map_err(|_| CstError::Truncated)?;
        let mut blob = vec![0u8; blob_len.max(0) as usize];
        cursor.read_exact(&mut blob).map_err(|_| CstError::Truncated)?;

        let mut args = Vec::new();
        let mut start = 0;
        for (i, byte) in blob.iter().enumerate() {
            if *byte == b' ' {
                let arg = std::str::from_utf8(&blob[start..i])
                    .map_err(|_| CstError::BadKey("argument is not utf-8".to_owned()))?;
                args.push(Some(arg.to_owned()));
                start = i + 1;
            }
        }
        if args.len() != arg_count.max(0) as usize {
            return Err(CstError::BadKey(format!(
                "blob holds {} argument(s), header says {}",
                args.len(),
                arg_count
            )));
        }

        let mut record = Record::new(func_id, 0.0, 0.0, 0, args);
        record.tid = tid;
        record.call_depth = call_depth;
        Ok(record)
    }

    /// Length-prefixed serialization: entry count, then per entry the
    /// terminal id, rank, key length, count, and key bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(self.entries.len() as i32).to_le_bytes());
        for entry in &self.entries {
            bytes.extend_from_slice(&entry.terminal_id.to_le_bytes());
            bytes.extend_from_slice(&entry.rank.to_le_bytes());
            bytes.extend_from_slice(&(entry.key.len() as i32).to_le_bytes());
            bytes.extend_from_slice(&(entry.count as i32).to_le_bytes());
            bytes.extend_from_slice(&entry.key);
        }
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<Cst, CstError> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_i32::<LittleEndian>().map_err(|_| CstError::Truncated)?;
        let mut entries = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let terminal_id = cursor.read_i32::<LittleEndian>().map_err(|_| CstError::Truncated)?;
            let rank = cursor.read_i32::<LittleEndian>().map_err(|_| CstError::Truncated)?;
            let key_len = cursor.read_i32::<LittleEndian>().map_err(|_| CstError::Truncated)?;
            let count = cursor.read_i32::<LittleEndian>().map_err(|_| CstError::Truncated)?;
            let mut key = vec![0u8; key_len.max(0) as usize];
            cursor.read_exact(&mut key).map_err(|_| CstError::Truncated)?;
            entries.push(CallSignature {
                terminal_id,
                rank,
                count: count.max(0) as u32,
                key,
            });
        }
        entries.sort_by_key(|entry| entry.terminal_id);
        for (i, entry) in entries.iter().enumerate() {
            if entry.terminal_id != i as i32 {
                return Err(CstError::SparseIds);
            }
        }
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.key.clone(), i))
            .collect();
        Ok(Cst { index, entries })
    }
}
