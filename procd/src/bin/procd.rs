// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Daemon CLI: `procd [-q|-v|-D] -u <unix_socket_path>`.

use std::path::PathBuf;

use clap::Parser;
use log::error;
use procd::Daemon;

#[derive(Parser)]
struct Cli {
    /// Path of the `AF_UNIX SOCK_SEQPACKET` socket to listen on.
    #[arg(short = 'u', long = "socket")]
    socket: PathBuf,

    /// Quiet: log errors only.
    #[arg(short = 'q', long, conflicts_with_all = ["verbose", "trace"])]
    quiet: bool,

    /// Verbose: log debug messages.
    #[arg(short = 'v', long, conflicts_with = "trace")]
    verbose: bool,

    /// Trace: log everything, stay attached to the controlling terminal.
    #[arg(short = 'D', long)]
    trace: bool,
}

fn main() {
    let args = Cli::parse();

    let level = if args.quiet {
        "error"
    } else if args.trace {
        "trace"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut daemon = match Daemon::bind(&args.socket) {
        Ok(d) => d,
        Err(e) => {
            error!("bring-up failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = daemon.run() {
        error!("daemon exited with error: {e}");
        std::process::exit(1);
    }
}
