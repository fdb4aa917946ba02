/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use recorder::args::{Args, Mode};
use recorder::rewriter;

fn main() -> ExitCode {
    env_logger::init();
    if let Err(err) = run() {
        error!("{:?}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.mode {
        Mode::Filter {
            trace_dir,
            filter_file,
        } => rewriter::filter_trace(Path::new(&trace_dir), Path::new(&filter_file)),
        Mode::Export {
            trace_dir,
            filter_file,
            json,
        } => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            rewriter::export_trace(
                Path::new(&trace_dir),
                filter_file.as_deref().map(Path::new),
                json,
                &mut out,
            )?;
            out.flush()?;
            Ok(())
        }
    }
}
