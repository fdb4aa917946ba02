/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[clap(subcommand)]
    pub mode: Mode,
}

#[derive(Debug, PartialEq, Clone, Subcommand)]
#[clap(rename_all = "kebab_case")]
pub enum Mode {
    /// Apply argument filters to a trace and rebuild its call-signature
    /// table and per-rank grammars under <TRACE_DIR>/_filtered
    Filter {
        /// Trace directory produced by the tracer
        #[arg(short, long)]
        trace_dir: String,
        /// Path to the filter file
        #[arg(short, long)]
        filter_file: String,
    },
    /// Expand a trace back into one record per line
    Export {
        /// Trace directory (plain or filtered)
        #[arg(short, long)]
        trace_dir: String,
        /// Optional filter file applied before printing
        #[arg(short, long)]
        filter_file: Option<String>,
        /// Emit JSON lines instead of text
        #[arg(short, long, default_value_t = false)]
        json: bool,
    },
}
