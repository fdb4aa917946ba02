/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

/// Status byte of a record emitted as-is.
pub const STATUS_FULL: u8 = 0x00;
/// High bit marking a diff record; the low seven bits are a bitmask of
/// differing argument positions.
pub const STATUS_DIFF: u8 = 0x80;
/// Placeholder emitted for an absent argument.
pub const NULL_ARG: &str = "???";

/// Metadata of one intercepted call.
///
/// Created by an interceptor right before it issues the real call and
/// handed to the encoder, which consumes it unless the sliding window
/// retains it for peephole compression.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub tid: u64,
    /// Nesting count for intercepted calls made while another intercepted
    /// call of the same thread is still on the stack.
    pub call_depth: i32,
    pub func_id: i32,
    /// Seconds since process epoch.
    pub tstart: f64,
    pub tend: f64,
    pub res: i32,
    /// `None` renders as `???`.
    pub args: Vec<Option<String>>,
    pub status: u8,
}

impl Record {
    pub fn new(func_id: i32, tstart: f64, tend: f64, res: i32, args: Vec<Option<String>>) -> Self {
        Record {
            tid: 0,
            call_depth: 0,
            func_id,
            tstart,
            tend,
            res,
            args,
            status: STATUS_FULL,
        }
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Argument as it appears on the wire: spaces become underscores
    /// because space is the field separator, absent arguments become
    /// `???`.
    pub fn wire_arg(arg: &Option<String>) -> String {
        match arg {
            Some(value) => value.replace(' ', "_"),
            None => NULL_ARG.to_owned(),
        }
    }
}
