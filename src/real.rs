/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::OnceLock;

use libc::{c_char, c_int, c_void, FILE};

type FopenFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut FILE;
type FwriteFn = unsafe extern "C" fn(*const c_void, usize, usize, *mut FILE) -> usize;
type FcloseFn = unsafe extern "C" fn(*mut FILE) -> c_int;
type AccessFn = unsafe extern "C" fn(*const c_char, c_int) -> c_int;
type MkdirFn = unsafe extern "C" fn(*const c_char, libc::mode_t) -> c_int;
type RemoveFn = unsafe extern "C" fn(*const c_char) -> c_int;

type MpiBarrierFn = unsafe extern "C" fn(c_int) -> c_int;
type MpiCommQueryFn = unsafe extern "C" fn(c_int, *mut c_int) -> c_int;
type MpiFlagQueryFn = unsafe extern "C" fn(*mut c_int) -> c_int;

/// Predefined world communicator handle of the MPICH ABI.
const MPI_COMM_WORLD: c_int = 0x4400_0000;

/// Resolved original implementations of the I/O primitives the tracer
/// uses for its own output. Calls through this table bypass interception
/// and must never produce a record.
pub struct RealCalls {
    fopen: FopenFn,
    fwrite: FwriteFn,
    fclose: FcloseFn,
    access: AccessFn,
    mkdir: MkdirFn,
    remove: RemoveFn,
    mpi: Option<MpiCalls>,
}

struct MpiCalls {
    barrier: MpiBarrierFn,
    comm_rank: MpiCommQueryFn,
    comm_size: MpiCommQueryFn,
    initialized: MpiFlagQueryFn,
}

static REAL: OnceLock<RealCalls> = OnceLock::new();

/// Resolve the table once and cache it.
pub fn table() -> &'static RealCalls {
    REAL.get_or_init(RealCalls::resolve)
}

fn lookup(name: &[u8]) -> *mut c_void {
    debug_assert_eq!(Some(&0), name.last());
    unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast()) }
}

/// Resolve a symbol the tracer cannot run without.
fn require(name: &[u8]) -> *mut c_void {
    let sym = lookup(name);
    if sym.is_null() {
        // The tracer cannot fall back to the intercepted entry points:
        // calling them from its own write path would recurse forever.
        eprintln!(
            "recorder: failed to resolve real '{}', cannot trace",
            String::from_utf8_lossy(&name[..name.len() - 1])
        );
        std::process::abort();
    }
    sym
}

impl RealCalls {
    fn resolve() -> RealCalls {
        unsafe {
            RealCalls {
                fopen: std::mem::transmute::<*mut c_void, FopenFn>(require(b"fopen\0")),
                fwrite: std::mem::transmute::<*mut c_void, FwriteFn>(require(b"fwrite\0")),
                fclose: std::mem::transmute::<*mut c_void, FcloseFn>(require(b"fclose\0")),
                access: std::mem::transmute::<*mut c_void, AccessFn>(require(b"access\0")),
                mkdir: std::mem::transmute::<*mut c_void, MkdirFn>(require(b"mkdir\0")),
                remove: std::mem::transmute::<*mut c_void, RemoveFn>(require(b"remove\0")),
                mpi: MpiCalls::resolve(),
            }
        }
    }

    /// Open `path` for binary writing through the real `fopen`.
    pub fn open_for_write(&self, path: &Path) -> Option<TraceFile> {
        let path = cstring(path)?;
        let fp = unsafe { (self.fopen)(path.as_ptr(), b"wb\0".as_ptr().cast()) };
        if fp.is_null() {
            None
        } else {
            Some(TraceFile { fp })
        }
    }

    pub fn path_exists(&self, path: &Path) -> bool {
        match cstring(path) {
            Some(path) => unsafe { (self.access)(path.as_ptr(), libc::F_OK) == 0 },
            None => false,
        }
    }

    /// Real `mkdir`, mode `rwxrwxr-x`. Failure (typically EEXIST) is
    /// reported through the return value and left to the caller.
    pub fn make_dir(&self, path: &Path) -> bool {
        match cstring(path) {
            Some(path) => unsafe { (self.mkdir)(path.as_ptr(), 0o775) == 0 },
            None => false,
        }
    }

    pub fn remove_path(&self, path: &Path) -> bool {
        match cstring(path) {
            Some(path) => unsafe { (self.remove)(path.as_ptr()) == 0 },
            None => false,
        }
    }

    fn mpi_ready(&self) -> Option<&MpiCalls> {
        let mpi = self.mpi.as_ref()?;
        let mut flag: c_int = 0;
        unsafe { (mpi.initialized)(&mut flag) };
        if flag != 0 {
            Some(mpi)
        } else {
            None
        }
    }

    /// Rank and size of the world communicator; `(0, 1)` when the
    /// message-passing library is absent or not yet initialized.
    pub fn world_rank_size(&self) -> (i32, i32) {
        match self.mpi_ready() {
            Some(mpi) => {
                let mut rank: c_int = 0;
                let mut size: c_int = 1;
                unsafe {
                    (mpi.comm_rank)(MPI_COMM_WORLD, &mut rank);
                    (mpi.comm_size)(MPI_COMM_WORLD, &mut size);
                }
                (rank, size)
            }
            None => (0, 1),
        }
    }

    /// World barrier; no-op for non-distributed runs.
    pub fn barrier(&self) {
        if let Some(mpi) = self.mpi_ready() {
            unsafe { (mpi.barrier)(MPI_COMM_WORLD) };
        }
    }
}

impl MpiCalls {
    fn resolve() -> Option<MpiCalls> {
        let barrier = lookup(b"PMPI_Barrier\0");
        let comm_rank = lookup(b"PMPI_Comm_rank\0");
        let comm_size = lookup(b"PMPI_Comm_size\0");
        let initialized = lookup(b"PMPI_Initialized\0");
        if barrier.is_null() || comm_rank.is_null() || comm_size.is_null() || initialized.is_null()
        {
            return None;
        }
        unsafe {
            Some(MpiCalls {
                barrier: std::mem::transmute::<*mut c_void, MpiBarrierFn>(barrier),
                comm_rank: std::mem::transmute::<*mut c_void, MpiCommQueryFn>(comm_rank),
                comm_size: std::mem::transmute::<*mut c_void, MpiCommQueryFn>(comm_size),
                initialized: std::mem::transmute::<*mut c_void, MpiFlagQueryFn>(initialized),
            })
        }
    }
}

/// Size of a file on disk, 0 when stat fails. Only called at finalize,
/// after recording is disabled, so the stat is never itself traced.
pub fn file_size(path: &str) -> u64 {
    let Ok(path) = CString::new(path) else {
        return 0;
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::stat(path.as_ptr(), &mut st) };
    if rc == 0 {
        st.st_size as u64
    } else {
        0
    }
}

fn cstring(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes()).ok()
}

/// An output stream backed by the real `fopen`/`fwrite`/`fclose`.
pub struct TraceFile {
    fp: *mut FILE,
}

// The logger holds its files behind one lock and never shares them.
unsafe impl Send for TraceFile {}

impl TraceFile {
    /// Write all of `bytes`, reporting whether the stream accepted them.
    pub fn write(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        let written = unsafe { (table().fwrite)(bytes.as_ptr().cast(), 1, bytes.len(), self.fp) };
        written == bytes.len()
    }

    pub fn close(self) {
        unsafe { (table().fclose)(self.fp) };
    }
}
