//! Per-descriptor state and the groups that own it
//!
//! A client connection starts life as one `Context` (its socket). Serving a
//! request can add more: a spool-file reader for a response body, a pipe
//! writer feeding a CGI script, a process-exit watcher. All of them join the
//! socket's `ConnectionGroup`, which is the one owner of the request, response
//! and CGI objects they refer to. Contexts only hold `Handle`s into the
//! group's arenas, so releasing a group frees each object exactly once no
//! matter how many contexts pointed at it.

use crate::cgi::CgiProcess;
use crate::server::emitter::{BodyRelay, Transmit};
use crate::server::reactor::{ProcessExit, Selector};
use crate::server::request::Request;
use crate::server::response::Response;

use mio::net::{TcpListener, TcpStream};
use mio::unix::pipe;
use mio::Token;
use slab::Slab;

use std::fmt;
use std::fs::File;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// What to do when a context's descriptor becomes ready
#[derive(Debug)]
pub enum Handler {
    /// Listening socket
    Accept,
    /// Client socket, collecting a request
    SocketReceive,
    /// Client socket, draining the response queue
    SocketSend(Transmit),
    /// Response body source, relayed into the socket's queue
    FileRead(BodyRelay),
    /// CGI stdin, fed from the request body
    PipeWrite,
    /// CGI spool file, scanned for the end of the header block
    CgiParse,
    /// CGI exit watcher
    CgiExit,
}

impl Handler {
    pub fn name(&self) -> &'static str {
        match *self {
            Handler::Accept => "accept",
            Handler::SocketReceive => "socket-receive",
            Handler::SocketSend(_) => "socket-send",
            Handler::FileRead(_) => "file-read",
            Handler::PipeWrite => "pipe-write",
            Handler::CgiParse => "cgi-parse",
            Handler::CgiExit => "cgi-exit",
        }
    }
}

/// The descriptor a context owns; dropping it closes the descriptor.
#[derive(Debug)]
pub enum Io {
    Listener(TcpListener),
    Socket(TcpStream),
    File(File),
    Pipe(pipe::Sender),
    Process(ProcessExit),
    Closed,
}

impl Io {
    pub fn raw_fd(&self) -> Option<RawFd> {
        match *self {
            Io::Listener(ref l) => Some(l.as_raw_fd()),
            Io::Socket(ref s) => Some(s.as_raw_fd()),
            Io::File(ref f) => Some(f.as_raw_fd()),
            Io::Pipe(ref p) => Some(p.as_raw_fd()),
            Io::Process(ref p) => Some(p.as_raw_fd()),
            Io::Closed => None,
        }
    }
}

/// A non-owning reference into one of a group's arenas
pub struct Handle<T> {
    key: usize,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(key: usize) -> Handle<T> {
        Handle {
            key,
            _kind: PhantomData,
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Handle({})", self.key)
    }
}

/// Single owner of every value of one kind in a group
#[derive(Debug)]
pub struct Arena<T> {
    slots: Slab<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena { slots: Slab::new() }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> Handle<T> {
        Handle::new(self.slots.insert(value))
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots.get(handle.key)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots.get_mut(handle.key)
    }

    /// Takes a value out early, e.g. a CGI that failed and is being replaced
    /// by an error response.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        self.slots.try_remove(handle.key)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Everything spawned on behalf of one client connection.
///
/// `members[0]` is always the client socket's context.
#[derive(Debug)]
pub struct ConnectionGroup<Req = Request, Res = Response, Cgi = CgiProcess> {
    members: Vec<Token>,
    pub requests: Arena<Req>,
    pub responses: Arena<Res>,
    pub cgis: Arena<Cgi>,
}

impl<Req, Res, Cgi> ConnectionGroup<Req, Res, Cgi> {
    pub fn new(canonical: Token) -> Self {
        ConnectionGroup {
            members: vec![canonical],
            requests: Arena::default(),
            responses: Arena::default(),
            cgis: Arena::default(),
        }
    }

    /// The context of the client socket
    #[inline]
    pub fn canonical(&self) -> Token {
        self.members[0]
    }

    #[inline]
    pub fn members(&self) -> &[Token] {
        &self.members
    }

    pub fn join(&mut self, token: Token) {
        if !self.members.contains(&token) {
            self.members.push(token);
        }
    }

    /// Drops a finished helper context from the group. The canonical context
    /// never leaves.
    pub fn leave(&mut self, token: Token) {
        if token != self.canonical() {
            self.members.retain(|&t| t != token);
        }
    }
}

/// Per-descriptor unit of readiness-driven work
#[derive(Debug)]
pub struct Context {
    pub io: Io,
    pub peer: Option<SocketAddr>,
    pub handler: Handler,
    /// Key of the owning group in the worker's group table
    pub group: Option<usize>,
    pub request: Option<Handle<Request>>,
    pub response: Option<Handle<Response>>,
    pub cgi: Option<Handle<CgiProcess>>,
    /// Bytes moved so far by partial reads or writes
    pub total_io: usize,
    pub buffer: Vec<u8>,
}

impl Context {
    pub fn new(io: Io, peer: Option<SocketAddr>, handler: Handler, group: Option<usize>) -> Context {
        Context {
            io,
            peer,
            handler,
            group,
            request: None,
            response: None,
            cgi: None,
            total_io: 0,
            buffer: Vec::new(),
        }
    }

    /// A context that works for the same group and objects as `origin`.
    pub fn spawned_from(origin: &Context, io: Io, handler: Handler) -> Context {
        Context {
            request: origin.request,
            response: origin.response,
            cgi: origin.cgi,
            ..Context::new(io, origin.peer, handler, origin.group)
        }
    }

    #[inline]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.io.raw_fd()
    }
}

/// Releases everything a group owns and shrinks it to its canonical context.
///
/// Helper contexts are deregistered and dropped (closing their descriptors),
/// the request/response/CGI arenas are emptied, and the canonical context's
/// references are cleared. The canonical context itself, and its socket, are
/// left alone. Calling this again on a released group does nothing.
pub fn release_group<S, Req, Res, Cgi>(group: &mut ConnectionGroup<Req, Res, Cgi>,
                                       contexts: &mut Slab<Context>,
                                       selector: &mut S)
    where S: Selector
{
    let canonical = group.canonical();

    for &token in &group.members[1..] {
        if let Some(ctx) = contexts.try_remove(token.0) {
            if let Some(fd) = ctx.raw_fd() {
                if let Err(e) = selector.deregister_all(fd) {
                    debug!("deregistering {} context: {}", ctx.handler.name(), e);
                }
            }
        }
    }

    if let Some(ctx) = contexts.get_mut(canonical.0) {
        ctx.request = None;
        ctx.response = None;
        ctx.cgi = None;
        ctx.total_io = 0;
    }

    group.requests.clear();
    group.responses.clear();
    group.cgis.clear();
    group.members.truncate(1);
}
