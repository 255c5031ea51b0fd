//! Running CGI scripts from the reactor
//!
//! These are the `Worker` handlers for the three helper contexts a CGI
//! request spawns: the stdin writer, the exit watcher and the spool scanner.
//! Each one hands off to the next; the last hands a `Response` whose body is
//! the rest of the spool file to the emitter.

use crate::cgi::parser::doc_headers;
use crate::cgi::{self, CgiProcess, CgiState};
use crate::errors::{Error, Result};
use crate::log_util::ascii_escape;
use crate::server::context::{Context, Handler, Io};
use crate::server::reactor::{InterestKind, Selector};
use crate::server::response::{BodySource, Response};
use crate::server::worker::Worker;

use mio::Token;

use std::cmp;
use std::io::{self, Read, Write};
use std::mem;
use std::path::PathBuf;

/// Most bytes handed to the child's stdin per `write`
const PIPE_CHUNK: usize = 4096;

/// Most bytes read from the spool per readiness event while looking for the
/// end of the header block
const SCAN_CHUNK: usize = 4096;

/// A header block longer than this is treated as a broken script.
pub const MAX_CGI_HEAD: usize = 64 * 1024;

const DELIMITER: &[u8] = b"\r\n\r\n";

enum Scan {
    More,
    Found(usize),
    Eof,
    TooLarge,
}

impl<S: Selector> Worker<S> {
    /// Starts `script` for the request on socket context `token`.
    pub(crate) fn dispatch_cgi(&mut self, token: Token, script: PathBuf,
                               interpreter: Option<PathBuf>) -> Result<()> {
        let group_key = self.group_of(token)?;

        let (env, has_body) = {
            let ctx = self.context(token)?;
            let request = ctx
                .request
                .and_then(|h| self.groups[group_key].requests.get(h))
                .ok_or(Error::CgiOutput("no request to run"))?;
            let env = cgi::metavariables(request, &script, ctx.peer.as_ref(), self.local_port,
                                         &self.config.server.name);
            (env, !request.body().is_empty())
        };

        let mut process = match CgiProcess::spawn(&script, interpreter.as_deref(), env) {
            Ok(process) => process,
            Err(e) => {
                warn!("Could not start CGI script {}: {:?}", script.display(), e);
                return self.respond_bad_gateway(token);
            }
        };

        let stdin = if has_body {
            process.take_stdin()?
        } else {
            process.close_stdin();
            None
        };

        let handle = self.groups[group_key].cgis.insert(process);
        self.context_mut(token)?.cgi = Some(handle);

        match stdin {
            Some(pipe) => {
                self.cgi_mut(token)?.set_state(CgiState::WritingStdin);
                let writer = Context::spawned_from(self.context(token)?, Io::Pipe(pipe),
                                                   Handler::PipeWrite);
                self.add_context(writer, InterestKind::Writable)?;
                Ok(())
            }
            None => self.await_exit(token),
        }
    }

    /// Write readiness on the child's stdin
    pub(crate) fn write_stdin(&mut self, token: Token) -> Result<()> {
        let group_key = self.group_of(token)?;

        let finished = {
            let ctx = self
                .contexts
                .get_mut(token.0)
                .ok_or(Error::CgiOutput("stdin writer vanished"))?;
            let body = ctx
                .request
                .and_then(|h| self.groups[group_key].requests.get(h))
                .map_or(&[][..], |req| req.body());
            let pipe = match ctx.io {
                Io::Pipe(ref mut p) => p,
                _ => return Ok(()),
            };

            loop {
                if ctx.total_io >= body.len() {
                    break true;
                }

                let end = cmp::min(body.len(), ctx.total_io + PIPE_CHUNK);
                match pipe.write(&body[ctx.total_io..end]) {
                    Ok(0) => break true,
                    Ok(n) => ctx.total_io += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        debug!("CGI closed its stdin after {} of {} bytes", ctx.total_io, body.len());
                        break true;
                    }
                    Err(e) => return Err(Error::from(e)),
                }
            }
        };

        if finished {
            self.close_stdin(token)
        } else {
            Ok(())
        }
    }

    /// Closes the write half only; the script keeps running. The request
    /// body isn't needed after this.
    pub(crate) fn close_stdin(&mut self, token: Token) -> Result<()> {
        let group_key = self.group_of(token)?;
        let handle = self.context(token)?.request;
        if let Some(request) = handle.and_then(|h| self.groups[group_key].requests.get_mut(h)) {
            request.discard_body();
        }

        let socket = self.groups[group_key].canonical();
        self.remove_context(token);
        self.await_exit(socket)
    }

    fn await_exit(&mut self, socket: Token) -> Result<()> {
        let exit = {
            let process = self.cgi_mut(socket)?;
            process.set_state(CgiState::WaitingExit);
            process
                .take_exit_source()
                .ok_or(Error::CgiOutput("exit already being watched"))?
        };

        let watcher = Context::spawned_from(self.context(socket)?, Io::Process(exit), Handler::CgiExit);
        self.add_context(watcher, InterestKind::ProcessExit)?;
        Ok(())
    }

    /// The child has (probably) exited.
    pub(crate) fn reap_child(&mut self, token: Token) -> Result<()> {
        let socket = self.groups[self.group_of(token)?].canonical();

        let status = match self.cgi_mut(socket)?.try_reap()? {
            Some(status) => status,
            None => return Ok(()),
        };
        self.remove_context(token);

        if !status.success() {
            warn!("CGI script failed: {}", status);
            self.discard_cgi(socket)?;
            return self.respond_bad_gateway(socket);
        }

        let spool = {
            let process = self.cgi_mut(socket)?;
            process.set_state(CgiState::ReadingOutput);
            process.open_output()?
        };

        let scanner = Context::spawned_from(self.context(socket)?, Io::File(spool), Handler::CgiParse);
        self.add_context(scanner, InterestKind::Readable)?;
        Ok(())
    }

    /// Read readiness on the spool: look for the end of the header block.
    pub(crate) fn parse_cgi(&mut self, token: Token) -> Result<()> {
        let scan = {
            let ctx = self.context_mut(token)?;
            let file = match ctx.io {
                Io::File(ref mut f) => f,
                _ => return Ok(()),
            };

            let mut chunk = [0u8; SCAN_CHUNK];
            let read = loop {
                match file.read(&mut chunk) {
                    Ok(n) => break n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Error::from(e)),
                }
            };

            if read == 0 {
                Scan::Eof
            } else {
                // the delimiter may straddle two reads
                let from = ctx.buffer.len().saturating_sub(DELIMITER.len() - 1);
                ctx.buffer.extend_from_slice(&chunk[..read]);

                match ctx.buffer[from..].windows(DELIMITER.len()).position(|w| w == DELIMITER) {
                    Some(i) => Scan::Found(from + i + DELIMITER.len()),
                    None if ctx.buffer.len() > MAX_CGI_HEAD => Scan::TooLarge,
                    None => Scan::More,
                }
            }
        };

        let socket = self.groups[self.group_of(token)?].canonical();

        let offset = match scan {
            Scan::More => return Ok(()),
            Scan::Found(offset) => offset,
            Scan::Eof | Scan::TooLarge => {
                warn!("CGI output has no usable header block");
                self.remove_context(token);
                self.discard_cgi(socket)?;
                return self.respond_bad_gateway(socket);
            }
        };

        let head = mem::take(&mut self.context_mut(token)?.buffer);
        self.remove_context(token);

        let response = match self.cgi_response(socket, &head[..offset]) {
            Ok(response) => response,
            Err(e) => {
                warn!("Unusable CGI header block {:?}: {:?}", ascii_escape(&head[..offset]), e);
                self.discard_cgi(socket)?;
                return self.respond_bad_gateway(socket);
            }
        };

        self.respond(socket, response)?;
        if let Ok(process) = self.cgi_mut(socket) {
            process.set_state(CgiState::Done);
        }
        Ok(())
    }

    /// Turns the script's header block into a response whose body is the rest
    /// of the spool, re-read from a fresh handle.
    fn cgi_response(&mut self, socket: Token, head: &[u8]) -> Result<Response> {
        let doc = match doc_headers(head) {
            Ok((_, doc)) => doc,
            Err(_) => return Err(Error::CgiOutput("unparsable header block")),
        };
        let mut response = cgi::response_from_headers(doc, &self.config.server.name)?;

        let process = self.cgi_mut(socket)?;
        let offset = head.len() as u64;
        let length = process.output_len()?.saturating_sub(offset);
        let body = process.open_body(offset)?;
        process.set_state(CgiState::Parsed);

        response.set_content_length(length);
        response.set_body(BodySource::File(body));
        Ok(response)
    }

    /// A 502 with no body at all
    fn respond_bad_gateway(&mut self, socket: Token) -> Result<()> {
        let mut response = Response::new(502, "Bad Gateway", &self.config.server.name);
        response.set_content_length(0);
        self.respond(socket, response)
    }

    /// Drops the group's CGI right away instead of at release.
    fn discard_cgi(&mut self, socket: Token) -> Result<()> {
        let group_key = self.group_of(socket)?;
        if let Some(handle) = self.context_mut(socket)?.cgi.take() {
            if let Some(mut process) = self.groups[group_key].cgis.remove(handle) {
                process.set_state(CgiState::Errored);
            }
        }
        Ok(())
    }

    fn cgi_mut(&mut self, socket: Token) -> Result<&mut CgiProcess> {
        let group_key = self.group_of(socket)?;
        let handle = self.context(socket)?.cgi.ok_or(Error::CgiOutput("no CGI running"))?;
        self.groups[group_key]
            .cgis
            .get_mut(handle)
            .ok_or(Error::CgiOutput("CGI already released"))
    }
}
