//! SIGCHLD self-pipe: wakes the reactor whenever any child exits so workers
//! that closed their output pipe are still noticed.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use signal_hook::SigId;
use signal_hook::consts::SIGCHLD;
use tracing::{debug, warn};

use crate::io::process::read_available;
use crate::reactor::EventHandle;
use crate::supervisor::Supervisor;

pub struct ChildReaper {
    wakeups: UnixStream,
    signal: SigId,
    scratch: Vec<u8>,
}

impl ChildReaper {
    /// Route SIGCHLD into a socket pair the reactor can poll.
    pub fn install() -> io::Result<Self> {
        let (wakeups, writer) = UnixStream::pair()?;
        wakeups.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        let signal = signal_hook::low_level::pipe::register(SIGCHLD, writer)?;
        debug!("SIGCHLD handler installed");
        Ok(Self {
            wakeups,
            signal,
            scratch: Vec::new(),
        })
    }
}

impl Drop for ChildReaper {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.signal);
    }
}

impl EventHandle<Supervisor> for ChildReaper {
    fn fd(&self) -> BorrowedFd<'_> {
        self.wakeups.as_fd()
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn on_readable(&mut self, supervisor: &mut Supervisor) {
        if let Err(err) = read_available(&mut self.wakeups, &mut self.scratch) {
            warn!(err = %err, "failed to drain SIGCHLD pipe");
        }
        self.scratch.clear();
        supervisor.reap_exited();
    }

    fn label(&self) -> String {
        "sigchld".to_string()
    }
}
