// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Client CLI: `procctl [-q|-v|-D] -u <unix_socket_path> <cmd> [args...]`.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::error;
use nix::sys::signal::{raise, Signal};
use procctl::Connection;
use procwire::StartArgs;

#[derive(Parser)]
struct Cli {
    #[arg(short = 'u', long = "socket")]
    socket: PathBuf,

    #[arg(short = 'q', long, conflicts_with_all = ["verbose", "trace"])]
    quiet: bool,

    #[arg(short = 'v', long, conflicts_with = "trace")]
    verbose: bool,

    #[arg(short = 'D', long)]
    trace: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn and stream a process.
    Start {
        path: String,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Reattach to a running process and stream it.
    Attach { id: String },
    /// List processes known to the daemon.
    List,
    /// Send a signal to a process.
    Kill { id: String, signum: i32 },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "error"
    } else if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut conn = match Connection::connect(&cli.socket) {
        Ok(c) => c,
        Err(e) => {
            error!("connect failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = conn.hello(1) {
        error!("handshake failed: {e}");
        std::process::exit(1);
    }

    let exit_code = match cli.command {
        Command::Start { path, args } => {
            let envp: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
            let start_args = StartArgs {
                path,
                argv: args,
                envp,
            };
            match conn.start(&start_args) {
                Ok(_) => stream_until_exit(&mut conn),
                Err(e) => {
                    error!("start failed: {e}");
                    1
                }
            }
        }
        Command::Attach { id } => match conn.attach(&id) {
            Ok(_) => stream_until_exit(&mut conn),
            Err(e) => {
                error!("attach failed: {e}");
                1
            }
        },
        Command::List => match conn.list() {
            Ok(entries) => {
                for entry in entries {
                    let (status, code) = entry.status.to_wire();
                    println!("{}\tstatus={status}\tcode={code}", entry.process_id);
                }
                0
            }
            Err(e) => {
                error!("list failed: {e}");
                1
            }
        },
        Command::Kill { id, signum } => match conn.attach(&id) {
            Ok(_) => match conn.kill(signum as u16) {
                Ok(()) => 0,
                Err(e) => {
                    error!("kill failed: {e}");
                    1
                }
            },
            Err(e) => {
                error!("attach failed: {e}");
                1
            }
        },
    };

    std::process::exit(exit_code);
}

/// Copies local stdin into the remote process, remote stdout/stderr to
/// local, and reflects the remote's exit status on this process: on remote
/// exit the client exits with the same status; on remote signal the
/// client re-raises the signal on itself.
fn stream_until_exit(conn: &mut Connection) -> i32 {
    conn.callbacks.on_stdout = Some(Box::new(|bytes: &[u8]| {
        let _ = std::io::stdout().write_all(bytes);
        let _ = std::io::stdout().flush();
    }));
    conn.callbacks.on_stderr = Some(Box::new(|bytes: &[u8]| {
        let _ = std::io::stderr().write_all(bytes);
    }));

    let final_status = loop {
        if let Some(status) = conn.last_status {
            if status.is_terminal() {
                break status;
            }
        }

        let mut buf = [0u8; 4096];
        match try_read_stdin(&mut buf) {
            Some(0) => {
                let _ = conn.stdin_eof();
            }
            Some(n) => {
                let _ = conn.stdin_data(&buf[..n]);
            }
            None => {}
        }

        if let Err(e) = conn.poll(Some(Duration::from_millis(100))) {
            error!("session error: {e}");
            break procwire::ProcessStatus::Exit(1);
        }
    };

    match final_status {
        procwire::ProcessStatus::Exit(code) => code as i32,
        procwire::ProcessStatus::Kill(signal) => {
            if let Ok(sig) = Signal::try_from(signal as i32) {
                let _ = raise(sig);
            }
            128 + signal as i32
        }
        procwire::ProcessStatus::Run => 0,
    }
}

/// Non-blocking probe of stdin; `None` if nothing is ready yet.
fn try_read_stdin(buf: &mut [u8]) -> Option<usize> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    let stdin = std::io::stdin();
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(stdin.as_raw_fd()) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(n) if n > 0 => std::io::stdin().read(buf).ok(),
        _ => None,
    }
}
