/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! In-band I/O call tracer and its offline trace tooling.
//!
//! The online half runs inside the traced process: interception wrappers
//! hand every call to [`append_record`], records are encoded (plain
//! text, raw binary, or windowed-differential binary) through a fixed
//! write buffer, and each rank ends up with its own data and metadata
//! files. The offline half ([`reader`], [`rewriter`]) decodes traces,
//! applies argument filters, and rebuilds them as a call-signature table
//! plus a per-rank Sequitur grammar.

pub mod args;
pub mod blob;
pub mod clock;
pub mod config;
pub mod cst;
pub mod encoder;
pub mod filter;
pub mod funcs;
pub mod lifecycle;
pub mod logger;
pub mod membuf;
pub mod meta;
pub mod real;
pub mod reader;
pub mod record;
pub mod registry;
pub mod rewriter;
pub mod sequitur;

pub use lifecycle::{append_record, observe_filename, recorder_finalize, recorder_init, update_mpi_info};
pub use reader::RecorderReader;
pub use record::Record;
