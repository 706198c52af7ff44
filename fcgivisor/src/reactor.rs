//! Single-threaded readiness loop.
//!
//! Handles (the control socket acceptor, client connections, worker output
//! pipes, the child-exit pipe) implement [`EventHandle`]. Each iteration
//! reaps closed handles, polls the rest with a bounded timeout (for
//! readability, or writability while a handle has output queued), and
//! dispatches ready handles in ascending descriptor order. Callbacks receive the
//! shared context `C` mutably, so all state changes happen on this thread
//! with no locking.
//!
//! Components that register handles from inside callbacks hold a
//! [`ReactorHandle`]; registrations are queued and adopted at the start of
//! the next iteration, which keeps the handle set stable while dispatching.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, trace};

/// Something the reactor can poll and call back.
pub trait EventHandle<C> {
    /// Descriptor polled for readability.
    fn fd(&self) -> BorrowedFd<'_>;

    /// Closed handles are dropped at the start of the next iteration.
    fn is_closed(&self) -> bool;

    /// Readiness to wait for this iteration.
    fn interest(&self) -> Interest {
        Interest::Read
    }

    /// Called once per iteration in which `fd` is readable (or hung up).
    fn on_readable(&mut self, ctx: &mut C);

    /// Called instead of `on_readable` when a handle waiting for
    /// [`Interest::Write`] can write.
    fn on_writable(&mut self, _ctx: &mut C) {}

    /// Short label for logs.
    fn label(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn flags(self) -> PollFlags {
        match self {
            Self::Read => PollFlags::POLLIN,
            Self::Write => PollFlags::POLLOUT,
        }
    }
}

type Pending<C> = Rc<RefCell<Vec<Box<dyn EventHandle<C>>>>>;

/// Cloneable registration handle injected into components.
pub struct ReactorHandle<C> {
    pending: Pending<C>,
}

impl<C> Clone for ReactorHandle<C> {
    fn clone(&self) -> Self {
        Self {
            pending: Rc::clone(&self.pending),
        }
    }
}

impl<C> ReactorHandle<C> {
    /// Queue `handle`; it is polled from the next iteration on.
    pub fn register(&self, handle: impl EventHandle<C> + 'static) {
        debug!(handle = %handle.label(), "handle registered");
        self.pending.borrow_mut().push(Box::new(handle));
    }
}

/// Events that dispatch a handle. A hang-up or error without `POLLOUT`
/// goes to `on_readable` so the callback observes EOF.
const READY: PollFlags = PollFlags::POLLIN
    .union(PollFlags::POLLOUT)
    .union(PollFlags::POLLHUP)
    .union(PollFlags::POLLERR)
    .union(PollFlags::POLLNVAL);

pub struct Reactor<C> {
    handles: Vec<Box<dyn EventHandle<C>>>,
    pending: Pending<C>,
    stopped: Arc<AtomicBool>,
    timeout: PollTimeout,
}

impl<C> Reactor<C> {
    /// `poll_interval` bounds how long one iteration waits without I/O.
    pub fn new(poll_interval: Duration) -> Self {
        let millis = u16::try_from(poll_interval.as_millis()).unwrap_or(u16::MAX);
        Self {
            handles: Vec::new(),
            pending: Rc::new(RefCell::new(Vec::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            timeout: PollTimeout::from(millis),
        }
    }

    pub fn handle(&self) -> ReactorHandle<C> {
        ReactorHandle {
            pending: Rc::clone(&self.pending),
        }
    }

    /// Flag checked at the top of every iteration; safe to set from a signal handler.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Live handles, counting queued registrations.
    pub fn len(&self) -> usize {
        self.handles.iter().filter(|handle| !handle.is_closed()).count()
            + self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loop until stopped. Handles are left as they are on return.
    pub fn run(&mut self, ctx: &mut C) -> Result<()> {
        debug!("reactor running");
        while !self.is_stopped() {
            self.turn(ctx)?;
        }
        debug!(handles = self.handles.len(), "reactor stopped");
        Ok(())
    }

    /// One iteration: adopt and reap, poll, dispatch. Returns how many
    /// handles were dispatched.
    pub fn turn(&mut self, ctx: &mut C) -> Result<usize> {
        self.handles.append(&mut self.pending.borrow_mut());
        self.handles.retain(|handle| {
            let closed = handle.is_closed();
            if closed {
                debug!(handle = %handle.label(), "handle reaped");
            }
            !closed
        });

        let mut order: Vec<usize> = (0..self.handles.len()).collect();
        order.sort_by_key(|&index| self.handles[index].fd().as_raw_fd());

        let ready: Vec<(usize, PollFlags)> = {
            let mut fds: Vec<PollFd<'_>> = order
                .iter()
                .map(|&index| {
                    let handle = &self.handles[index];
                    PollFd::new(handle.fd(), handle.interest().flags())
                })
                .collect();
            match poll(&mut fds, self.timeout) {
                Ok(0) => return Ok(0),
                Ok(_) => {}
                Err(Errno::EINTR) => {
                    trace!("poll interrupted");
                    return Ok(0);
                }
                Err(err) => return Err(err).context("poll handles"),
            }
            fds.iter()
                .zip(&order)
                .filter_map(|(fd, &index)| {
                    fd.revents()
                        .filter(|revents| revents.intersects(READY))
                        .map(|revents| (index, revents))
                })
                .collect()
        };

        let mut dispatched = 0;
        for (index, revents) in ready {
            let handle = &mut self.handles[index];
            // Closed by an earlier callback in this same iteration.
            if handle.is_closed() {
                continue;
            }
            if revents.contains(PollFlags::POLLOUT) {
                trace!(handle = %handle.label(), "writable");
                handle.on_writable(ctx);
            } else {
                trace!(handle = %handle.label(), "readable");
                handle.on_readable(ctx);
            }
            dispatched += 1;
        }
        Ok(dispatched)
    }
}
