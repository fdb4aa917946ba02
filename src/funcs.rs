/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

/// Names of every traced entry point. A record's `func_id` is an index
/// into this table, so the order is part of the on-disk format.
pub const FUNC_NAMES: &[&str] = &[
    // POSIX stream I/O
    "fopen",
    "fopen64",
    "fdopen",
    "freopen",
    "fclose",
    "fread",
    "fwrite",
    "fprintf",
    "fseek",
    "ftell",
    "fflush",
    // POSIX descriptor I/O
    "open",
    "open64",
    "creat",
    "close",
    "read",
    "write",
    "pread",
    "pread64",
    "pwrite",
    "pwrite64",
    "readv",
    "writev",
    "lseek",
    "lseek64",
    "fsync",
    "fdatasync",
    // Metadata and directory calls
    "stat",
    "stat64",
    "fstat",
    "fstat64",
    "lstat",
    "access",
    "unlink",
    "rename",
    "mkdir",
    "rmdir",
    "remove",
    "truncate",
    "ftruncate",
    // Message-passing entry points, traced through their profiling names
    "PMPI_File_open",
    "PMPI_File_close",
    "PMPI_File_read",
    "PMPI_File_read_at",
    "PMPI_File_read_all",
    "PMPI_File_write",
    "PMPI_File_write_at",
    "PMPI_File_write_all",
    "PMPI_File_seek",
    "PMPI_File_sync",
    "PMPI_Barrier",
    "PMPI_Bcast",
    "PMPI_Allreduce",
    "PMPI_Reduce",
    "PMPI_Gather",
    "PMPI_Scatter",
];

/// Number of traced functions; sizes the per-function count block in the
/// local metadata.
pub const FUNC_COUNT: usize = FUNC_NAMES.len();

pub fn name_by_id(func_id: i32) -> Option<&'static str> {
    usize::try_from(func_id).ok().and_then(|i| FUNC_NAMES.get(i).copied())
}

pub fn id_by_name(name: &str) -> Option<i32> {
    FUNC_NAMES.iter().position(|n| *n == name).map(|i| i as i32)
}

/// Name as stored in the global metadata: profiling message-passing names
/// lose their leading `P`, so `PMPI_X` is published as `MPI_X`.
pub fn published_name(func_id: i32) -> Option<&'static str> {
    name_by_id(func_id).map(|name| name.strip_prefix("PMPI_").map_or(name, |_| &name[1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_lookup_round_trip() {
        for (id, name) in FUNC_NAMES.iter().enumerate() {
            assert_eq!(Some(id as i32), id_by_name(name));
            assert_eq!(Some(*name), name_by_id(id as i32));
        }
    }

    #[test]
    fn test_unknown_ids() {
        assert_eq!(None, name_by_id(-1));
        assert_eq!(None, name_by_id(FUNC_COUNT as i32));
        assert_eq!(None, id_by_name("no_such_call"));
    }

    #[test]
    fn test_published_name_strips_profiling_prefix() {
        let barrier = id_by_name("PMPI_Barrier").unwrap();
        assert_eq!(Some("MPI_Barrier"), published_name(barrier));
        let write = id_by_name("write").unwrap();
        assert_eq!(Some("write"), published_name(write));
    }
}
