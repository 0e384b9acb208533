// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Daemon-wide registry of live processes, looked up by id.

use std::cell::RefCell;
use std::rc::Rc;

use crate::process::Process;

#[derive(Default)]
pub struct Registry {
    processes: Vec<Rc<RefCell<Process>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, process: Rc<RefCell<Process>>) {
        self.processes.push(process);
    }

    pub fn find(&self, process_id: &str) -> Option<Rc<RefCell<Process>>> {
        self.processes
            .iter()
            .find(|p| p.borrow().process_id == process_id)
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<RefCell<Process>>> {
        self.processes.iter()
    }

    /// A terminal process stays resident while attached consumers exist
    /// and is destroyed once empty. Called after every event that could
    /// have emptied a consumer set.
    pub fn drop_empty(&mut self) {
        self.processes.retain(|p| {
            let p = p.borrow();
            !(p.status().is_terminal() && p.consumers().next().is_none())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use crate::session::Session;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::waitpid;
    use procwire::StartArgs;

    fn spawn(reactor: &mut Reactor, path: &str) -> Rc<RefCell<Process>> {
        Process::spawn(
            &StartArgs {
                path: path.to_string(),
                argv: vec![],
                envp: vec![],
            },
            reactor,
        )
        .unwrap()
    }

    #[test]
    fn drop_empty_removes_terminal_processes_with_no_consumers() {
        let mut reactor = Reactor::new();
        let mut registry = Registry::new();

        let running = spawn(&mut reactor, "/bin/cat");
        let finished = spawn(&mut reactor, "/bin/true");
        registry.insert(running.clone());
        registry.insert(finished.clone());

        let status = waitpid(finished.borrow().pid(), None).unwrap();
        finished.borrow_mut().reap(status, &mut reactor);
        registry.drop_empty();

        assert!(registry.find(&running.borrow().process_id).is_some());
        assert!(registry.find(&finished.borrow().process_id).is_none());

        let _ = kill(running.borrow().pid(), Signal::SIGKILL);
        let _ = waitpid(running.borrow().pid(), None);
    }

    #[test]
    fn drop_empty_keeps_terminal_process_with_live_consumer() {
        let mut reactor = Reactor::new();
        let mut registry = Registry::new();

        let process = spawn(&mut reactor, "/bin/true");
        registry.insert(process.clone());

        let (session_fd, _peer) = procwire::testpipe::pair().unwrap();
        let session = Rc::new(RefCell::new(Session::new(session_fd)));
        process.borrow_mut().attach(Rc::downgrade(&session));

        let status = waitpid(process.borrow().pid(), None).unwrap();
        process.borrow_mut().reap(status, &mut reactor);
        registry.drop_empty();

        assert!(registry.find(&process.borrow().process_id).is_some());
    }
}
