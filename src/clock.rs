/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

/// Timestamps are stored as integer multiples of this resolution.
pub const TIME_RESOLUTION: f64 = 0.000001;

/// Monotonic wall clock in floating-point seconds.
pub fn wtime() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// Integer ticks since `epoch`, truncated, as stored in binary records.
pub fn to_ticks(t: f64, epoch: f64) -> i32 {
    ((t - epoch) / TIME_RESOLUTION) as i32
}

/// Inverse of [`to_ticks`], up to truncation loss.
pub fn from_ticks(ticks: i32, epoch: f64) -> f64 {
    epoch + ticks as f64 * TIME_RESOLUTION
}
