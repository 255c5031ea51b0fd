//! Getting a response onto the client socket
//!
//! Each client socket has exactly one `Outbound` queue. The header block goes
//! in first, and body bytes are appended behind it one bounded read at a
//! time, so header and body can never be reordered no matter how the write
//! readiness events fall. A body source is paused after every read and only
//! resumed once the queue has fully drained, which keeps at most one read
//! buffer of body data in flight per connection.

use crate::errors::{Error, Result};
use crate::log_util::{ascii_escape, peer_label};
use crate::server::context::{Context, Handler, Io};
use crate::server::error_messages;
use crate::server::reactor::{InterestKind, Selector};
use crate::server::request::Method;
use crate::server::response::BodySource;
use crate::server::worker::Worker;

use mio::Token;

use std::cmp;
use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// Most bytes handed to one `write` call on the socket
pub const SEND_CHUNK: usize = 16 * 1024;

/// Most bytes taken from a body source per readiness event
pub const BODY_CHUNK: usize = 4096;

const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Outcome of draining an `Outbound`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    Drained,
    Blocked,
}

/// Bytes waiting to go out on one socket, in order
#[derive(Debug, Default)]
pub struct Outbound {
    queue: VecDeque<Vec<u8>>,
    /// How much of the front buffer has already been sent
    offset: usize,
    pending: usize,
}

impl Outbound {
    pub fn new() -> Outbound {
        Default::default()
    }

    pub fn push(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.pending += bytes.len();
            self.queue.push_back(bytes);
        }
    }

    /// Bytes not yet accepted by the socket
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Writes until the queue is empty or the sink would block.
    ///
    /// Each `write` is capped at `SEND_CHUNK` bytes. Buffers are released as
    /// soon as they've been fully accepted.
    pub fn flush_into<W: Write>(&mut self, sink: &mut W) -> io::Result<Flush> {
        while let Some(front) = self.queue.front() {
            let end = cmp::min(front.len(), self.offset + SEND_CHUNK);

            let written = match sink.write(&front[self.offset..end]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            let front_len = front.len();
            self.offset += written;
            self.pending -= written;
            if self.offset == front_len {
                self.queue.pop_front();
                self.offset = 0;
            }
        }

        Ok(Flush::Drained)
    }
}

/// Frames `data` as one chunk of a chunked transfer-encoding
pub fn frame_chunk(data: &[u8]) -> Vec<u8> {
    let mut framed = format!("{:x}\r\n", data.len()).into_bytes();
    framed.extend_from_slice(data);
    framed.extend_from_slice(b"\r\n");
    framed
}

/// Outcome of one relay step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relay {
    /// Some bytes went into the queue and more are expected
    Queued(usize),
    /// The whole body is in the queue
    Finished,
    /// The source had nothing to give
    Blocked,
}

/// Progress of a body being copied from its source into a socket's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyRelay {
    content_length: Option<u64>,
    chunked: bool,
    read_total: u64,
}

impl BodyRelay {
    pub fn new(content_length: Option<u64>, chunked: bool) -> BodyRelay {
        BodyRelay {
            content_length,
            chunked,
            read_total: 0,
        }
    }

    #[inline]
    pub fn read_total(&self) -> u64 {
        self.read_total
    }

    /// Performs one bounded read from `source` and queues what it got.
    pub fn read_once<R: Read>(&mut self, source: &mut R, out: &mut Outbound) -> io::Result<Relay> {
        let mut buffer = [0u8; BODY_CHUNK];

        let limit = match self.content_length {
            Some(len) if !self.chunked => {
                cmp::min(BODY_CHUNK as u64, len.saturating_sub(self.read_total)) as usize
            }
            _ => BODY_CHUNK,
        };
        if limit == 0 {
            return Ok(Relay::Finished);
        }

        let read = loop {
            match source.read(&mut buffer[..limit]) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Relay::Blocked),
                Err(e) => return Err(e),
            }
        };

        if read == 0 {
            if self.chunked {
                out.push(LAST_CHUNK.to_vec());
                return Ok(Relay::Finished);
            }
            if self.content_length.is_some() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                                          "body source ended before its declared length"));
            }
            return Ok(Relay::Finished);
        }

        self.read_total += read as u64;

        if self.chunked {
            out.push(frame_chunk(&buffer[..read]));
            return Ok(Relay::Queued(read));
        }

        out.push(Vec::from(&buffer[..read]));
        match self.content_length {
            Some(len) if self.read_total >= len => Ok(Relay::Finished),
            _ => Ok(Relay::Queued(read)),
        }
    }
}

/// Send-side state of a client socket
#[derive(Debug)]
pub struct Transmit {
    outbound: Outbound,
    /// The body source context, while it still has bytes to give
    body: Option<Token>,
    /// Everything that belongs to this response is in `outbound`
    finished: bool,
    keep_alive: bool,
}

impl<S: Selector> Worker<S> {
    /// Serializes the response attached to socket context `token`, queues the
    /// header block and starts relaying the body.
    pub(crate) fn begin_response(&mut self, token: Token) -> Result<()> {
        let group_key = self.group_of(token)?;
        let (peer, request_handle, response_handle) = {
            let ctx = self.context(token)?;
            (ctx.peer, ctx.request, ctx.response)
        };
        let response_handle = response_handle.ok_or(Error::MalformedResponse("no response to send"))?;

        let server_name = &self.config.server.name;
        let group = &mut self.groups[group_key];

        let (is_head, client_keep_alive, request_line) =
            match request_handle.and_then(|h| group.requests.get(h)) {
                Some(req) => (
                    req.method() == Method::Head,
                    req.keep_alive(),
                    format!("{} {}", req.method().as_str(), ascii_escape(req.target().as_bytes())),
                ),
                None => (false, false, String::from("-")),
            };

        let response = group
            .responses
            .get_mut(response_handle)
            .ok_or(Error::MalformedResponse("response already released"))?;

        if !(self.config.server.keep_alive && client_keep_alive) {
            response.headers_mut().insert("Connection", "close");
        }

        let block = match response.serialize() {
            Ok(block) => block,
            Err(e) => {
                error!("Refusing to send a malformed response: {:?}", e);
                *response = error_messages::page(500, server_name);
                response.headers_mut().insert("Connection", "close");
                response.serialize()?
            }
        };

        let status = response.status_code();
        let chunked = response.is_chunked();
        let length = response.content_length();
        let keep_alive = response.keeps_alive();
        let expects_body = !is_head
            && status >= 200
            && status != 204
            && status != 304
            && (chunked || length.map_or(false, |n| n > 0));

        info!("{} {} -> {}", peer_label(peer.as_ref()), request_line, status);

        let mut outbound = Outbound::new();
        let mut head = block.into_bytes();
        head.extend_from_slice(b"\r\n");
        outbound.push(head);

        let mut file_body = None;
        match response.take_body() {
            Some(BodySource::Inline(bytes)) if expects_body => {
                if chunked {
                    outbound.push(frame_chunk(&bytes));
                    outbound.push(LAST_CHUNK.to_vec());
                } else {
                    outbound.push(bytes);
                }
            }
            Some(BodySource::File(file)) if expects_body => {
                file_body = Some((file, BodyRelay::new(length, chunked)));
            }
            _ => (),
        }

        let body = match file_body {
            Some((file, relay)) => {
                let ctx = Context::spawned_from(self.context(token)?, Io::File(file),
                                                Handler::FileRead(relay));
                Some(self.add_context(ctx, InterestKind::Readable)?)
            }
            None => None,
        };

        self.context_mut(token)?.handler = Handler::SocketSend(Transmit {
            outbound,
            body,
            finished: body.is_none(),
            keep_alive,
        });

        self.unwatch(token, InterestKind::Readable);
        self.watch(token, InterestKind::Writable)
    }

    /// Write readiness on a client socket
    pub(crate) fn send(&mut self, token: Token) -> Result<()> {
        let (flush, body, finished, keep_alive) = {
            let ctx = self.context_mut(token)?;
            let (stream, transmit) = match (&mut ctx.io, &mut ctx.handler) {
                (&mut Io::Socket(ref mut s), &mut Handler::SocketSend(ref mut t)) => (s, t),
                _ => return Ok(()),
            };

            let flush = transmit.outbound.flush_into(stream)?;
            (flush, transmit.body, transmit.finished, transmit.keep_alive)
        };

        if flush == Flush::Blocked {
            return Ok(());
        }

        match body {
            Some(source) => self.watch(source, InterestKind::Readable),
            None if finished => self.complete_response(token, keep_alive),
            None => Ok(()),
        }
    }

    /// Read readiness on a body source
    pub(crate) fn relay_body(&mut self, token: Token) -> Result<()> {
        let socket = self.groups[self.group_of(token)?].canonical();
        if socket == token {
            return Ok(());
        }

        let outcome = {
            let (ctx, sock) = self
                .contexts
                .get2_mut(token.0, socket.0)
                .ok_or(Error::MalformedResponse("body source without a socket"))?;

            let (file, relay) = match (&mut ctx.io, &mut ctx.handler) {
                (&mut Io::File(ref mut f), &mut Handler::FileRead(ref mut r)) => (f, r),
                _ => return Ok(()),
            };
            let transmit = match sock.handler {
                Handler::SocketSend(ref mut t) => t,
                _ => return Ok(()),
            };

            if !transmit.outbound.is_empty() {
                None
            } else {
                let outcome = relay.read_once(file, &mut transmit.outbound)?;
                ctx.total_io = relay.read_total() as usize;
                if outcome == Relay::Finished {
                    transmit.body = None;
                    transmit.finished = true;
                }
                Some(outcome)
            }
        };

        match outcome {
            // socket still busy; `send` resumes us once it drains
            None | Some(Relay::Queued(_)) => self.unwatch(token, InterestKind::Readable),
            Some(Relay::Finished) => self.remove_context(token),
            Some(Relay::Blocked) => return Ok(()),
        }

        if outcome.is_some() {
            self.watch(socket, InterestKind::Writable)?;
        }
        Ok(())
    }

    /// The last byte of a response has been handed to the kernel.
    fn complete_response(&mut self, token: Token, keep_alive: bool) -> Result<()> {
        let group_key = self.group_of(token)?;

        if !keep_alive {
            self.teardown(group_key);
            return Ok(());
        }

        self.release(group_key);
        self.context_mut(token)?.handler = Handler::SocketReceive;
        self.unwatch(token, InterestKind::Writable);
        self.watch(token, InterestKind::Readable)?;

        self.process_buffered(token)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A sink that accepts a varying number of bytes per call and sometimes
    /// refuses outright, like a non-blocking socket under load.
    struct StutteringSink {
        steps: Lcg,
        received: Vec<u8>,
    }

    impl Write for StutteringSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let step = self.steps.next() % 7;
            if step == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = cmp::min(buf.len(), step * 3);
            self.received.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// A source that hands out a varying number of bytes per call and
    /// sometimes has nothing ready.
    struct StutteringSource {
        steps: Lcg,
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for StutteringSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let step = self.steps.next() % 11;
            if step == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = cmp::min(cmp::min(buf.len(), step * 5), self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> usize {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) as usize
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Plays the worker's loop: drain the queue, and only read more body once
    /// it's empty.
    fn deliver(header: &[u8], data: Vec<u8>, chunked: bool, seed: u64) -> Vec<u8> {
        let len = data.len() as u64;
        let mut source = StutteringSource { steps: Lcg(seed), data, pos: 0 };
        let mut sink = StutteringSink { steps: Lcg(seed ^ 0xdead_beef), received: Vec::new() };
        let mut relay = BodyRelay::new(if chunked { None } else { Some(len) }, chunked);
        let mut out = Outbound::new();
        out.push(Vec::from(header));

        let mut finished = false;
        for _ in 0..1_000_000 {
            if out.flush_into(&mut sink).unwrap() == Flush::Blocked {
                continue;
            }
            if finished {
                return sink.received;
            }
            match relay.read_once(&mut source, &mut out).unwrap() {
                Relay::Finished => finished = true,
                Relay::Queued(n) => assert!(out.pending() <= n + 16),
                Relay::Blocked => (),
            }
        }
        panic!("delivery never finished");
    }

    #[test]
    fn body_arrives_intact_after_header() {
        let header = b"HTTP/1.1 200 OK\r\nContent-Length: 10000\r\n\r\n";
        for seed in 1..20 {
            let data = body(10_000);
            let received = deliver(header, data.clone(), false, seed);
            assert_eq!(&received[..header.len()], &header[..]);
            assert_eq!(&received[header.len()..], &data[..]);
        }
    }

    #[test]
    fn empty_body_sends_header_only() {
        let header = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        assert_eq!(deliver(header, Vec::new(), false, 3), header.to_vec());
    }

    #[test]
    fn chunked_body_is_framed() {
        let header = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let data = body(5000);
        let received = deliver(header, data.clone(), true, 42);
        assert_eq!(&received[..header.len()], &header[..]);

        // undo the framing
        let mut rest = &received[header.len()..];
        let mut decoded = Vec::new();
        loop {
            let line_end = rest.windows(2).position(|w| w == b"\r\n").unwrap();
            let size = usize::from_str_radix(std::str::from_utf8(&rest[..line_end]).unwrap(), 16).unwrap();
            rest = &rest[line_end + 2..];
            if size == 0 {
                assert_eq!(rest, b"\r\n");
                break;
            }
            decoded.extend_from_slice(&rest[..size]);
            assert_eq!(&rest[size..size + 2], b"\r\n");
            rest = &rest[size + 2..];
        }
        assert_eq!(decoded, data);
    }

    #[test]
    fn relay_never_reads_past_declared_length() {
        let mut source: &[u8] = b"hello world";
        let mut relay = BodyRelay::new(Some(5), false);
        let mut out = Outbound::new();

        assert_eq!(relay.read_once(&mut source, &mut out).unwrap(), Relay::Finished);
        assert_eq!(relay.read_total(), 5);
        assert_eq!(source, b" world");
        assert_eq!(out.pending(), 5);
    }

    #[test]
    fn short_source_is_an_error() {
        let mut source: &[u8] = b"abc";
        let mut relay = BodyRelay::new(Some(10), false);
        let mut out = Outbound::new();

        assert_eq!(relay.read_once(&mut source, &mut out).unwrap(), Relay::Queued(3));
        let err = relay.read_once(&mut source, &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn reads_are_bounded() {
        let data = body(3 * BODY_CHUNK);
        let mut source: &[u8] = &data;
        let mut relay = BodyRelay::new(Some(data.len() as u64), false);
        let mut out = Outbound::new();

        assert_eq!(relay.read_once(&mut source, &mut out).unwrap(), Relay::Queued(BODY_CHUNK));
        assert_eq!(out.pending(), BODY_CHUNK);
    }

    #[test]
    fn writes_are_bounded_and_ordered() {
        let mut out = Outbound::new();
        out.push(vec![1; SEND_CHUNK + 10]);
        out.push(Vec::new());
        out.push(vec![2; 3]);

        let mut sink = Vec::new();
        assert_eq!(out.flush_into(&mut sink).unwrap(), Flush::Drained);
        assert!(out.is_empty());
        assert_eq!(sink.len(), SEND_CHUNK + 13);
        assert!(sink[..SEND_CHUNK + 10].iter().all(|&b| b == 1));
        assert_eq!(&sink[SEND_CHUNK + 10..], &[2, 2, 2]);
    }

    #[test]
    fn zero_length_write_is_an_error() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut out = Outbound::new();
        out.push(vec![0; 4]);
        assert_eq!(out.flush_into(&mut Full).unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn frame_chunk_uses_hex_sizes() {
        assert_eq!(frame_chunk(&[7; 26]).len(), 2 + 2 + 26 + 2);
        assert!(frame_chunk(&[7; 26]).starts_with(b"1a\r\n"));
    }
}
