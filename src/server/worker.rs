//! One reactor shard
//!
//! A `Worker` owns a `Selector`, every context it has spawned and the groups
//! those contexts belong to. Nothing in here is shared with other workers, so
//! none of it needs locking; a connection accepted by a worker lives and dies
//! on that worker.

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::log_util::{ascii_escape, peer_label};
use crate::server::context::{release_group, ConnectionGroup, Context, Handler, Io};
use crate::server::error_messages;
use crate::server::reactor::{InterestKind, Reactor, Readiness, Selector};
use crate::server::request::{self, Request};
use crate::server::response::Response;
use crate::server::router::{Router, TargetKind};
use crate::server::static_files;

use mio::net::TcpListener;
use mio::Token;
use slab::Slab;

use std::cmp;
use std::io::{self, Read};
use std::net;
use std::sync::Arc;
use std::time::Duration;

/// Most bytes pulled off a client socket per `read` call
const RECEIVE_CHUNK: usize = 4096;

enum Received {
    /// Nothing more to read for now
    Drained,
    PeerClosed,
    /// The buffer is at its limit; the socket may hold more.
    Full,
}

pub struct Worker<S: Selector = Reactor> {
    pub(crate) selector: S,
    pub(crate) contexts: Slab<Context>,
    pub(crate) groups: Slab<ConnectionGroup>,
    pub(crate) config: Arc<Config>,
    pub(crate) router: Arc<Router>,
    /// Port the listener is bound to, for `SERVER_PORT`
    pub(crate) local_port: u16,
}

impl Worker<Reactor> {
    pub fn new(listener: net::TcpListener, config: Arc<Config>, router: Arc<Router>)
               -> Result<Worker<Reactor>> {
        Worker::with_selector(Reactor::new()?, listener, config, router)
    }
}

impl<S: Selector> Worker<S> {
    /// Sets up a worker that accepts connections from `listener`.
    pub fn with_selector(selector: S, listener: net::TcpListener, config: Arc<Config>,
                         router: Arc<Router>) -> Result<Worker<S>> {
        listener.set_nonblocking(true)?;
        let local_port = listener.local_addr()?.port();

        let mut worker = Worker {
            selector,
            contexts: Slab::new(),
            groups: Slab::new(),
            config,
            router,
            local_port,
        };

        let listener = Io::Listener(TcpListener::from_std(listener));
        worker.add_context(Context::new(listener, None, Handler::Accept, None),
                           InterestKind::Readable)?;

        Ok(worker)
    }

    /// Serves forever. Only a failure of the readiness facility itself gets
    /// out of here.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.turn(None)?;
        }
    }

    /// Waits for one batch of readiness events and handles all of them.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let fired = self.selector.poll_ready(timeout)?;
        let count = fired.len();

        for ready in fired {
            self.dispatch(ready);
        }

        Ok(count)
    }

    /// Runs the handler for one event. A failing handler takes its own
    /// connection down and nothing else.
    pub(crate) fn dispatch(&mut self, ready: Readiness) {
        let token = ready.token;

        let name = match self.contexts.get(token.0) {
            Some(ctx) => ctx.handler.name(),
            // closed earlier in this batch
            None => return,
        };

        let outcome = match self.contexts.get(token.0).map(|ctx| &ctx.handler) {
            None => return,
            Some(Handler::PipeWrite) if ready.error || ready.write_closed => self.close_stdin(token),
            Some(Handler::Accept) if ready.error => {
                warn!("Listening socket reported an error");
                Ok(())
            }
            Some(_) if ready.error => Err(Error::Io(io::Error::new(io::ErrorKind::Other,
                                                                   "descriptor reported an error"))),
            Some(Handler::SocketSend(_)) if ready.write_closed => {
                Err(Error::Io(io::ErrorKind::BrokenPipe.into()))
            }
            Some(Handler::Accept) => self.accept(token),
            Some(Handler::SocketReceive) => self.receive(token),
            Some(Handler::SocketSend(_)) => self.send(token),
            Some(Handler::FileRead(_)) => self.relay_body(token),
            Some(Handler::PipeWrite) => self.write_stdin(token),
            Some(Handler::CgiParse) => self.parse_cgi(token),
            Some(Handler::CgiExit) => self.reap_child(token),
        };

        if let Err(e) = outcome {
            warn!("Aborting connection in {} handler: {:?}", name, e);
            self.abort(token);
        }
    }

    fn accept(&mut self, token: Token) -> Result<()> {
        loop {
            let accepted = match self.contexts.get(token.0).map(|ctx| &ctx.io) {
                Some(Io::Listener(listener)) => listener.accept(),
                _ => return Ok(()),
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // the listener is edge-triggered: anything still queued
                    // waits for the next connection to arrive
                    error!("Failed to accept a connection: {}", e);
                    return Ok(());
                }
            };

            debug!("connect {}", peer);

            let socket = Token(self.contexts.insert(
                Context::new(Io::Socket(stream), Some(peer), Handler::SocketReceive, None)
            ));
            let group_key = self.groups.insert(ConnectionGroup::new(socket));
            self.contexts[socket.0].group = Some(group_key);

            if let Err(e) = self.watch(socket, InterestKind::Readable) {
                warn!("Dropping connection from {}: {:?}", peer, e);
                self.teardown(group_key);
            }
        }
    }

    fn receive(&mut self, token: Token) -> Result<()> {
        // a complete request always fits in this many bytes
        let limit = request::MAX_HEAD_SIZE + self.config.server.max_body_size;

        loop {
            match self.fill_buffer(token, limit)? {
                Received::Drained => return self.process_buffered(token),
                Received::PeerClosed => {
                    let ctx = self.context(token)?;
                    debug!("{} closed the connection", peer_label(ctx.peer.as_ref()));
                    let group_key = self.group_of(token)?;
                    self.teardown(group_key);
                    return Ok(());
                }
                Received::Full => {
                    if self.context(token)?.request.is_none() {
                        self.process_buffered(token)?;
                    }

                    let ctx = match self.contexts.get(token.0) {
                        Some(ctx) => ctx,
                        None => return Ok(()),
                    };
                    // a response has started; the rest is read once it's done
                    if !matches!(ctx.handler, Handler::SocketReceive) {
                        return Ok(());
                    }
                    if ctx.buffer.len() >= limit {
                        warn!("{} sent more than {} bytes ahead of its response",
                              peer_label(ctx.peer.as_ref()), limit);
                        let group_key = self.group_of(token)?;
                        self.teardown(group_key);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Reads from a client socket until it would block, the peer closes, or
    /// the buffer holds `limit` bytes.
    fn fill_buffer(&mut self, token: Token, limit: usize) -> Result<Received> {
        let ctx = self.context_mut(token)?;
        let stream = match ctx.io {
            Io::Socket(ref mut s) => s,
            _ => return Ok(Received::Drained),
        };

        let mut chunk = [0u8; RECEIVE_CHUNK];
        while ctx.buffer.len() < limit {
            let room = cmp::min(RECEIVE_CHUNK, limit - ctx.buffer.len());
            match stream.read(&mut chunk[..room]) {
                Ok(0) => return Ok(Received::PeerClosed),
                Ok(n) => ctx.buffer.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Received::Drained),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }

        Ok(Received::Full)
    }

    /// Starts on the next complete request sitting in the socket's buffer,
    /// unless one is already being served.
    pub(crate) fn process_buffered(&mut self, token: Token) -> Result<()> {
        let max_body_size = self.config.server.max_body_size;

        let parsed = {
            let ctx = self.context_mut(token)?;
            if ctx.request.is_some() || ctx.buffer.is_empty() {
                return Ok(());
            }

            match request::parse(&ctx.buffer, max_body_size) {
                Ok(Some((request, used))) => {
                    ctx.buffer.drain(..used);
                    Ok(request)
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    debug!("Bad request from {}: {:?} in {:?}", peer_label(ctx.peer.as_ref()), e,
                           ascii_escape(&ctx.buffer[..ctx.buffer.len().min(64)]));
                    ctx.buffer.clear();
                    Err(e)
                }
            }
        };

        match parsed {
            Ok(request) => self.handle_request(token, request),
            Err(e) => self.respond_error(token, e.status_code(), true),
        }
    }

    fn handle_request(&mut self, token: Token, request: Request) -> Result<()> {
        let group_key = self.group_of(token)?;
        let target = self.router.resolve(request.path());

        let handle = self.groups[group_key].requests.insert(request);
        self.context_mut(token)?.request = Some(handle);

        let target = match target {
            Ok(Some(target)) => target,
            Ok(None) => return self.respond_error(token, 404, false),
            Err(e) => return self.respond_error(token, e.status_code(), false),
        };

        match target.kind {
            TargetKind::Cgi { interpreter } => self.dispatch_cgi(token, target.file, interpreter),
            TargetKind::Static => {
                let response = {
                    let request = self.groups[group_key]
                        .requests
                        .get(handle)
                        .ok_or(Error::MalformedResponse("request already released"))?;
                    static_files::respond(request, &target.file, &self.config.server.name)
                };
                self.respond(token, response)
            }
        }
    }

    /// Attaches `response` to the socket context `token` and starts sending it.
    pub(crate) fn respond(&mut self, token: Token, response: Response) -> Result<()> {
        let group_key = self.group_of(token)?;
        let handle = self.groups[group_key].responses.insert(response);
        self.context_mut(token)?.response = Some(handle);

        self.begin_response(token)
    }

    /// Sends one of the canned error pages.
    pub(crate) fn respond_error(&mut self, token: Token, code: u16, close: bool) -> Result<()> {
        let mut response = error_messages::page(code, &self.config.server.name);
        if close {
            response.headers_mut().insert("Connection", "close");
        }
        self.respond(token, response)
    }

    /// Inserts `ctx`, adds it to its group and starts watching it for `kind`.
    pub(crate) fn add_context(&mut self, ctx: Context, kind: InterestKind) -> Result<Token> {
        let group_key = ctx.group;
        let token = Token(self.contexts.insert(ctx));

        if let Some(group) = group_key.and_then(|g| self.groups.get_mut(g)) {
            group.join(token);
        }

        if let Err(e) = self.watch(token, kind) {
            self.remove_context(token);
            return Err(e);
        }

        Ok(token)
    }

    /// Deregisters and drops one context, closing its descriptor.
    pub(crate) fn remove_context(&mut self, token: Token) {
        if let Some(ctx) = self.contexts.try_remove(token.0) {
            if let Some(fd) = ctx.raw_fd() {
                if let Err(e) = self.selector.deregister_all(fd) {
                    debug!("deregistering {} context: {}", ctx.handler.name(), e);
                }
            }
            if let Some(group) = ctx.group.and_then(|g| self.groups.get_mut(g)) {
                group.leave(token);
            }
        }
    }

    pub(crate) fn watch(&mut self, token: Token, kind: InterestKind) -> Result<()> {
        match self.contexts.get(token.0).and_then(Context::raw_fd) {
            Some(fd) => self
                .selector
                .register_interest(fd, kind, token)
                .map_err(Error::Registration),
            None => Ok(()),
        }
    }

    pub(crate) fn unwatch(&mut self, token: Token, kind: InterestKind) {
        if let Some(fd) = self.contexts.get(token.0).and_then(Context::raw_fd) {
            if let Err(e) = self.selector.deregister_interest(fd, kind) {
                debug!("deregistering {:?} interest: {}", kind, e);
            }
        }
    }

    /// Frees what a group owns but keeps its socket, for the next request.
    pub(crate) fn release(&mut self, group_key: usize) {
        if let Some(group) = self.groups.get_mut(group_key) {
            release_group(group, &mut self.contexts, &mut self.selector);
        }
    }

    /// Closes a connection and everything spawned for it.
    pub(crate) fn teardown(&mut self, group_key: usize) {
        if let Some(mut group) = self.groups.try_remove(group_key) {
            let canonical = group.canonical();
            release_group(&mut group, &mut self.contexts, &mut self.selector);
            self.remove_context(canonical);
        }
    }

    fn abort(&mut self, token: Token) {
        match self.contexts.get(token.0).and_then(|ctx| ctx.group) {
            Some(group_key) => self.teardown(group_key),
            None => self.remove_context(token),
        }
    }

    pub(crate) fn context(&self, token: Token) -> Result<&Context> {
        self.contexts.get(token.0).ok_or_else(|| missing(token))
    }

    pub(crate) fn context_mut(&mut self, token: Token) -> Result<&mut Context> {
        self.contexts.get_mut(token.0).ok_or_else(|| missing(token))
    }

    pub(crate) fn group_of(&self, token: Token) -> Result<usize> {
        self.context(token)?.group.ok_or_else(|| missing(token))
    }
}

fn missing(token: Token) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::NotFound,
                             format!("no connection state for token {}", token.0)))
}
