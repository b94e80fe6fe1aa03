//! Driver for the GEMM dispatch task.
//!
//! Usage: `gemm-dispatch [CODE_OBJECT] [KERNEL_SYMBOL]`
//!
//! Runs the 128x128x128 single-precision GEMM against the given code object
//! (default `kernel.co`), prints the accumulated diagnostics followed by a
//! single `Success`/`Failed` line, and exits 0 on success, 1 on any failure.

use std::env;
use std::path::PathBuf;
use std::process;

use aql_dispatch::{Dispatch, GemmTask};

const DEFAULT_CODE_OBJECT: &str = "kernel.co";
const DEFAULT_SYMBOL: &str = "mad2d";

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let code_object = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CODE_OBJECT));
    let symbol = args.next().unwrap_or_else(|| DEFAULT_SYMBOL.to_string());

    let mut task = GemmTask::new(code_object, symbol);
    let mut dispatch = Dispatch::new();
    process::exit(dispatch.run_main(&mut task));
}
