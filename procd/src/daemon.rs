// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Daemon entry point: owns the listener, process registry, reactor and
//! signal trampoline for the whole run.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

use crate::error::Error;
use crate::listener;
use crate::reactor::Reactor;
use crate::registry::Registry;
use crate::signal::Trampoline;

pub struct Daemon {
    reactor: Reactor,
    registry: Rc<RefCell<Registry>>,
    trampoline: Trampoline,
    running: AtomicBool,
    shutting_down: bool,
}

impl Daemon {
    pub fn bind(socket_path: &Path) -> Result<Self, Error> {
        let mut reactor = Reactor::new();
        let registry = Rc::new(RefCell::new(Registry::new()));
        let trampoline = Trampoline::install()?;

        let listener_fd = listener::bind_at(socket_path)?;
        listener::register(&mut reactor, listener_fd, registry.clone());

        Ok(Self {
            reactor,
            registry,
            trampoline,
            running: AtomicBool::new(true),
            shutting_down: false,
        })
    }

    /// Runs until `SIGINT` flips `running` false and the reactor drains, or
    /// a fatal error propagates. A second `SIGINT` while shutting down
    /// exits immediately with a nonzero status.
    pub fn run(&mut self) -> Result<(), Error> {
        while self.running.load(Ordering::SeqCst) {
            if let Err(errno) = self.reactor.run(Some(Duration::from_secs(1))) {
                warn!("reactor cycle aborted: errno {errno}");
            }

            let trampoline = &self.trampoline;
            let reactor = &mut self.reactor;
            let registry = &self.registry;
            let running = &self.running;
            let shutting_down = &mut self.shutting_down;
            let result = trampoline.drain(
                || {
                    reap_children(registry, reactor);
                    Ok(())
                },
                || {
                    if *shutting_down {
                        warn!("second SIGINT, forcing shutdown");
                        std::process::exit(1);
                    }
                    info!("SIGINT received, shutting down");
                    *shutting_down = true;
                    running.store(false, Ordering::SeqCst);
                    Ok(())
                },
            );
            if result.is_err() {
                warn!("signal drain reported an error");
            }
        }
        info!("shutdown complete");
        Ok(())
    }

    pub fn request_shutdown(&mut self) {
        self.shutting_down = true;
        self.running.store(false, Ordering::SeqCst);
    }
}

fn reap_children(registry: &Rc<RefCell<Registry>>, reactor: &mut Reactor) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                let Some(pid) = status.pid() else { continue };
                let process = registry
                    .borrow()
                    .iter()
                    .find(|p| p.borrow().pid() == pid)
                    .cloned();
                let Some(process) = process else { continue };
                process.borrow_mut().reap(status, reactor);
                let new_status = process.borrow().status();
                let process_id = process.borrow().process_id.clone();
                for session in process.borrow().consumers() {
                    session.borrow_mut().notify_status(&process_id, new_status);
                }
                registry.borrow_mut().drop_empty();
            }
            Err(nix::Error::ECHILD) => break,
            Err(_) => break,
        }
    }
}
