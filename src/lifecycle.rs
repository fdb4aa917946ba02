/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use libc::c_int;
use log::{error, info};

use crate::clock;
use crate::config::Config;
use crate::logger::Logger;
use crate::real;
use crate::record::Record;

static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);
/// Polled by every interceptor before it builds a record; cleared before
/// finalize emits any bytes so the tracer's own I/O is never traced.
static RECORDING: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Whether the tracer is between init and finalize and accepting records.
pub fn recording() -> bool {
    RECORDING.load(Ordering::Relaxed)
}

/// Initialize the tracer once. Driven either by the distributed-init
/// interception (after the real initializer ran) or by the process
/// startup hook; whichever fires first wins and the other is a no-op.
#[no_mangle]
pub extern "C" fn recorder_init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    let config = Config::from_env();
    let (rank, nprocs) = real::table().world_rank_size();
    match Logger::create(&config, rank, nprocs) {
        Ok(logger) => {
            let Ok(mut slot) = LOGGER.lock() else { return };
            *slot = Some(logger);
            RECORDING.store(true, Ordering::SeqCst);
            if config.signal_handlers {
                install_signal_handlers();
            }
            info!("recorder initialized, rank {} of {}", rank, nprocs);
        }
        Err(err) => error!("recorder failed to initialize: {:#}", err),
    }
}

/// Re-query rank and size after the real distributed initializer returned
/// and publish them to the writer.
#[no_mangle]
pub extern "C" fn update_mpi_info() {
    let (rank, nprocs) = real::table().world_rank_size();
    let Ok(mut slot) = LOGGER.lock() else { return };
    if let Some(logger) = slot.as_mut() {
        logger.set_mpi_info(rank, nprocs);
    }
}

/// Flush and close the trace. Idempotent; a no-op when the tracer never
/// initialized.
#[no_mangle]
pub extern "C" fn recorder_finalize() {
    if !INITIALIZED.load(Ordering::SeqCst) {
        return;
    }
    RECORDING.store(false, Ordering::SeqCst);
    let logger = match LOGGER.lock() {
        Ok(mut slot) => slot.take(),
        Err(_) => return,
    };
    if let Some(logger) = logger {
        let rank = logger.rank();
        let elapsed = clock::wtime() - logger.start_ts();
        logger.finalize();
        if rank == 0 {
            info!("recorder finalized, elapsed time: {:.2}s", elapsed);
        }
    }
}

/// Append one record to this rank's trace. Silently dropped while the
/// tracer is not recording.
pub fn append_record(record: Record) {
    if !recording() {
        return;
    }
    let Ok(mut slot) = LOGGER.lock() else { return };
    if let Some(logger) = slot.as_mut() {
        logger.append(record);
    }
}

/// Register a pathname touched by the traced program.
pub fn observe_filename(path: &str) {
    if !recording() {
        return;
    }
    let Ok(mut slot) = LOGGER.lock() else { return };
    if let Some(logger) = slot.as_mut() {
        logger.observe_filename(path);
    }
}

extern "C" fn signal_handler(sig: c_int) {
    // Best-effort flush; none of this is async-signal-safe and a
    // pathological crash can still lose the trace tail.
    recorder_finalize();
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

fn install_signal_handlers() {
    let handler: extern "C" fn(c_int) = signal_handler;
    for sig in [libc::SIGSEGV, libc::SIGINT, libc::SIGTERM] {
        unsafe { libc::signal(sig, handler as libc::sighandler_t) };
    }
}

/// Startup/teardown hooks for non-distributed programs, active only when
/// `RECORDER_WITH_NON_MPI=1`. Distributed programs reach `recorder_init`
/// through the intercepted message-passing initializer instead.
#[cfg(target_os = "linux")]
mod hooks {
    extern "C" fn startup() {
        if crate::config::Config::from_env().with_non_mpi {
            super::recorder_init();
            unsafe { libc::atexit(teardown) };
        }
    }

    extern "C" fn teardown() {
        super::recorder_finalize();
    }

    #[used]
    #[link_section = ".init_array"]
    static STARTUP_HOOK: extern "C" fn() = startup;
}
