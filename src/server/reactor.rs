//! Readiness notification
//!
//! Everything the engine waits on (sockets, pipes, spool files, child exits)
//! is a raw descriptor registered here under the `Token` of the context that
//! handles it. `Selector` is the seam: the worker only ever talks to that
//! trait, and `Reactor` backs it with `mio`.

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

const EVENT_CAPACITY: usize = 1024;

/// What a context is waiting for on its descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestKind {
    Readable,
    Writable,
    /// Only meaningful for a `ProcessExit` descriptor
    ProcessExit,
}

impl InterestKind {
    fn as_mio(self) -> mio::Interest {
        match self {
            InterestKind::Readable | InterestKind::ProcessExit => mio::Interest::READABLE,
            InterestKind::Writable => mio::Interest::WRITABLE,
        }
    }
}

/// One fired event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

impl Readiness {
    pub fn new(token: Token) -> Readiness {
        Readiness {
            token,
            readable: false,
            writable: false,
            read_closed: false,
            write_closed: false,
            error: false,
        }
    }

    fn from_event(event: &mio::event::Event) -> Readiness {
        Readiness {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// The capabilities the connection engine needs from a readiness facility.
pub trait Selector {
    /// Starts (or re-arms) watching `fd` for `kind`, reporting under `token`.
    ///
    /// Interests accumulate: a descriptor registered readable and then
    /// writable is watched for both.
    fn register_interest(&mut self, fd: RawFd, kind: InterestKind, token: Token)
                         -> io::Result<()>;

    /// Stops watching `fd` for `kind`. Unknown descriptors are ignored.
    fn deregister_interest(&mut self, fd: RawFd, kind: InterestKind) -> io::Result<()>;

    /// Forgets `fd` entirely. Must be called before the descriptor is closed.
    fn deregister_all(&mut self, fd: RawFd) -> io::Result<()>;

    /// Waits up to `timeout` and returns whatever fired.
    fn poll_ready(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>>;
}

struct Registration {
    token: Token,
    interest: mio::Interest,
    /// epoll won't watch regular files; they're reported ready every turn.
    always_ready: bool,
}

/// A `Selector` on top of `mio::Poll`
pub struct Reactor {
    poll: Poll,
    events: Events,
    table: HashMap<RawFd, Registration>,
    always_ready: BTreeSet<RawFd>,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            table: HashMap::new(),
            always_ready: BTreeSet::new(),
        })
    }

    /// Number of descriptors currently watched
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.len()
    }
}

fn is_unpollable(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EPERM)
}

impl Selector for Reactor {
    fn register_interest(&mut self, fd: RawFd, kind: InterestKind, token: Token)
                         -> io::Result<()> {
        let wanted = kind.as_mio();

        if let Some(reg) = self.table.get_mut(&fd) {
            let interest = reg.interest | wanted;
            if !reg.always_ready {
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), token, interest)?;
            }
            reg.token = token;
            reg.interest = interest;
            return Ok(());
        }

        let always_ready = match self.poll.registry().register(&mut SourceFd(&fd), token, wanted) {
            Ok(()) => false,
            Err(ref e) if is_unpollable(e) => true,
            Err(e) => return Err(e),
        };

        if always_ready {
            self.always_ready.insert(fd);
        }
        self.table.insert(fd, Registration {
            token,
            interest: wanted,
            always_ready,
        });

        Ok(())
    }

    fn deregister_interest(&mut self, fd: RawFd, kind: InterestKind) -> io::Result<()> {
        let remaining = match self.table.get(&fd) {
            Some(reg) => reg.interest.remove(kind.as_mio()),
            None => return Ok(()),
        };

        match remaining {
            None => self.deregister_all(fd),
            Some(interest) => {
                if let Some(reg) = self.table.get_mut(&fd) {
                    if !reg.always_ready {
                        self.poll
                            .registry()
                            .reregister(&mut SourceFd(&fd), reg.token, interest)?;
                    }
                    reg.interest = interest;
                }
                Ok(())
            }
        }
    }

    fn deregister_all(&mut self, fd: RawFd) -> io::Result<()> {
        match self.table.remove(&fd) {
            Some(ref reg) if reg.always_ready => {
                self.always_ready.remove(&fd);
                Ok(())
            }
            Some(_) => self.poll.registry().deregister(&mut SourceFd(&fd)),
            None => Ok(()),
        }
    }

    fn poll_ready(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        let timeout = if self.always_ready.is_empty() {
            timeout
        } else {
            Some(Duration::from_millis(0))
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => (),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }

        let mut fired: Vec<Readiness> = self.events.iter().map(Readiness::from_event).collect();

        for fd in &self.always_ready {
            if let Some(reg) = self.table.get(fd) {
                let mut ready = Readiness::new(reg.token);
                ready.readable = reg.interest.is_readable();
                ready.writable = reg.interest.is_writable();
                fired.push(ready);
            }
        }

        Ok(fired)
    }
}

/// A descriptor that turns readable once a child process has exited.
///
/// Backed by a Linux pidfd, so child exit goes through the same poll as
/// everything else instead of a signal handler.
#[derive(Debug)]
pub struct ProcessExit {
    fd: OwnedFd,
}

impl ProcessExit {
    pub fn open(pid: u32) -> io::Result<ProcessExit> {
        // SAFETY: pidfd_open takes a pid and flags and returns a new
        // descriptor or -1; nothing is borrowed.
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `fd` was just returned by the kernel and is owned by no one
        // else.
        Ok(ProcessExit {
            fd: unsafe { OwnedFd::from_raw_fd(fd as RawFd) },
        })
    }
}

impl AsRawFd for ProcessExit {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::process::Command;

    #[test]
    fn socket_readiness_is_reported_under_its_token() {
        let mut reactor = Reactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();

        reactor
            .register_interest(a.as_raw_fd(), InterestKind::Readable, Token(7))
            .unwrap();
        b.write_all(b"ping").unwrap();

        let fired = reactor.poll_ready(Some(Duration::from_secs(5))).unwrap();
        assert!(fired.iter().any(|r| r.token == Token(7) && r.readable));
    }

    #[test]
    fn regular_files_are_always_ready() {
        let mut reactor = Reactor::new().unwrap();
        let file = tempfile::tempfile().unwrap();

        reactor
            .register_interest(file.as_raw_fd(), InterestKind::Readable, Token(3))
            .unwrap();

        for _ in 0..2 {
            let fired = reactor.poll_ready(None).unwrap();
            assert_eq!(fired.len(), 1);
            assert_eq!(fired[0].token, Token(3));
            assert!(fired[0].readable);
        }

        reactor
            .deregister_interest(file.as_raw_fd(), InterestKind::Readable)
            .unwrap();
        assert_eq!(reactor.len(), 0);
        let fired = reactor.poll_ready(Some(Duration::from_millis(10))).unwrap();
        assert!(fired.is_empty());
    }

    #[test]
    fn interests_accumulate_and_drain() {
        let mut reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        reactor.register_interest(fd, InterestKind::Readable, Token(1)).unwrap();
        reactor.register_interest(fd, InterestKind::Writable, Token(1)).unwrap();

        reactor.deregister_interest(fd, InterestKind::Readable).unwrap();
        assert_eq!(reactor.len(), 1);

        let fired = reactor.poll_ready(Some(Duration::from_secs(5))).unwrap();
        assert!(fired.iter().any(|r| r.token == Token(1) && r.writable));

        reactor.deregister_interest(fd, InterestKind::Writable).unwrap();
        assert_eq!(reactor.len(), 0);
    }

    #[test]
    fn deregistering_is_idempotent() {
        let mut reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        reactor.deregister_all(fd).unwrap();
        reactor.register_interest(fd, InterestKind::Readable, Token(1)).unwrap();
        reactor.deregister_all(fd).unwrap();
        reactor.deregister_all(fd).unwrap();
        reactor.deregister_interest(fd, InterestKind::Writable).unwrap();
        assert_eq!(reactor.len(), 0);
    }

    #[test]
    fn child_exit_fires_readable() {
        let mut reactor = Reactor::new().unwrap();
        let mut child = Command::new("/bin/sh").arg("-c").arg("exit 0").spawn().unwrap();
        let exit = ProcessExit::open(child.id()).unwrap();

        reactor
            .register_interest(exit.as_raw_fd(), InterestKind::ProcessExit, Token(9))
            .unwrap();

        let fired = reactor.poll_ready(Some(Duration::from_secs(10))).unwrap();
        assert!(fired.iter().any(|r| r.token == Token(9) && r.readable));
        assert!(child.try_wait().unwrap().is_some());
    }
}
