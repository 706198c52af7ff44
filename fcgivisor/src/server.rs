//! Control socket: an acceptor plus one line-protocol handler per client.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::protocol::{Command, Reply, take_lines};
use crate::io::process::read_available;
use crate::reactor::{EventHandle, Interest, ReactorHandle};
use crate::supervisor::Supervisor;

/// Listening socket registered with the reactor for the supervisor's lifetime.
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
    reactor: ReactorHandle<Supervisor>,
}

impl ControlListener {
    /// Bind `path`, replacing a stale socket file left by an earlier run.
    pub fn bind(path: &Path, reactor: ReactorHandle<Supervisor>) -> Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("remove stale socket {}", path.display()));
            }
        }
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("bind control socket {}", path.display()))?;
        listener
            .set_nonblocking(true)
            .context("set control socket non-blocking")?;
        info!(path = %path.display(), "control socket listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            reactor,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventHandle<Supervisor> for ControlListener {
    fn fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }

    fn is_closed(&self) -> bool {
        false
    }

    /// Accept one pending client; the rest wait for the next iteration.
    fn on_readable(&mut self, _supervisor: &mut Supervisor) {
        match self.listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    warn!(err = %err, "failed to make client socket non-blocking");
                    return;
                }
                self.reactor.register(Connection::new(stream));
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => warn!(err = %err, "accept failed"),
        }
    }

    fn label(&self) -> String {
        format!("listener {}", self.path.display())
    }
}

/// One client. Requests are answered in the order their newline arrived.
///
/// Replies go through an outbound buffer. While it holds unsent bytes the
/// connection waits for writability and leaves further requests queued.
pub struct Connection {
    stream: UnixStream,
    inbound: Vec<u8>,
    requests: VecDeque<String>,
    outbound: Vec<u8>,
    read_closed: bool,
    closed: bool,
}

impl Connection {
    fn new(stream: UnixStream) -> Self {
        debug!("client connected");
        Self {
            stream,
            inbound: Vec::new(),
            requests: VecDeque::new(),
            outbound: Vec::new(),
            read_closed: false,
            closed: false,
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.requests.clear();
        self.outbound.clear();
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Send as much of the outbound buffer as the socket takes.
    fn flush(&mut self) {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    debug!("client stopped accepting replies");
                    self.close();
                    return;
                }
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!(err = %err, "client went away before the reply");
                    self.close();
                    return;
                }
                Err(err) => {
                    warn!(err = %err, "failed to send reply");
                    self.close();
                    return;
                }
            }
        }
    }

    /// Answer queued requests until one reply is left partly unsent.
    fn process(&mut self, supervisor: &mut Supervisor) {
        self.flush();
        while !self.closed && self.outbound.is_empty() {
            let Some(line) = self.requests.pop_front() else {
                break;
            };
            let Some(reply) = handle_line(supervisor, &line) else {
                debug!("client quit");
                self.close();
                return;
            };
            self.outbound.extend_from_slice(reply.to_line().as_bytes());
            self.flush();
        }
        if !self.closed
            && self.read_closed
            && self.requests.is_empty()
            && self.outbound.is_empty()
        {
            debug!("client disconnected");
            self.close();
        }
    }
}

impl EventHandle<Supervisor> for Connection {
    fn fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::Read
        } else {
            Interest::Write
        }
    }

    fn on_readable(&mut self, supervisor: &mut Supervisor) {
        if !self.read_closed {
            self.read_closed = match read_available(&mut self.stream, &mut self.inbound) {
                Ok(eof) => eof,
                Err(err) => {
                    debug!(err = %err, "client read failed");
                    true
                }
            };
            self.requests.extend(take_lines(&mut self.inbound));
        }
        self.process(supervisor);
    }

    fn on_writable(&mut self, supervisor: &mut Supervisor) {
        self.process(supervisor);
    }

    fn label(&self) -> String {
        format!("client fd {}", self.stream.as_raw_fd())
    }
}

/// Run one request line against the supervisor. `None` means close the
/// connection without replying.
pub fn handle_line(supervisor: &mut Supervisor, line: &str) -> Option<Reply> {
    let result = match Command::parse(line) {
        Ok(Command::Quit) => return None,
        Ok(command) => supervisor.execute(command),
        Err(err) => Err(err),
    };
    if let Err(err) = &result {
        warn!(request = line, err = %err, "command failed");
    } else {
        debug!(request = line, "command ok");
    }
    Some(Reply::from_result(result))
}

/// Client side: send one request line and return the reply without its
/// newline (empty if the server closed without replying).
pub fn request(socket: &Path, line: &str, timeout: Duration) -> io::Result<String> {
    let mut stream = UnixStream::connect(socket)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.write_all(format!("{line}\n").as_bytes())?;
    stream.shutdown(Shutdown::Write)?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    Ok(reply.trim_end_matches('\n').to_string())
}
