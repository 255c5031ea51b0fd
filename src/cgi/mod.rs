//! CGI/1.1 scripts
//!
//! A script runs as a child process with the request body on its stdin and
//! its stdout going to a spool file. The worker drives it through
//! `CgiState` from readiness events (see `driver`): feed stdin, wait for the
//! exit notification, then scan the spool for the header block and serve the
//! rest of the file as the body.

pub mod driver;
pub mod parser;

use crate::errors::{Error, Result};
use crate::server::reactor::ProcessExit;
use crate::server::request::Request;
use crate::server::response::{reason_phrase, Response};

use mio::unix::pipe;
use tempfile::NamedTempFile;

use std::env;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::net::SocketAddr;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};

/// A status line
#[derive(Debug, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason_phrase: Vec<u8>,
}

/// A location redirect
#[derive(Debug, PartialEq, Eq)]
pub struct Location {
    pub url: Vec<u8>,
}

/// Other headers
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    pub name: Vec<u8>,
    pub content: Vec<u8>,
}

/// The header portion of a document
#[derive(Debug, PartialEq, Eq)]
pub struct DocumentHeaders {
    pub status: Option<Status>,
    pub location: Option<Location>,
    pub headers: Vec<Header>,
}

/// Where a script is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiState {
    Spawned,
    WritingStdin,
    WaitingExit,
    ReadingOutput,
    Parsed,
    Done,
    Errored,
}

/// A running (or finished) CGI child
#[derive(Debug)]
pub struct CgiProcess {
    child: Child,
    /// `None` once the child has been reaped
    pid: Option<u32>,
    spool: NamedTempFile,
    stdin: Option<ChildStdin>,
    exit: Option<ProcessExit>,
    exit_status: Option<ExitStatus>,
    state: CgiState,
}

impl CgiProcess {
    /// Starts `script`, through `interpreter` if there is one.
    ///
    /// The child gets exactly the variables in `env`, and runs in the script's
    /// directory.
    pub fn spawn<I>(script: &Path, interpreter: Option<&Path>, env: I) -> Result<CgiProcess>
        where I: IntoIterator<Item = (OsString, OsString)>
    {
        let spool = NamedTempFile::new().map_err(Error::CgiSpawn)?;
        let stdout = spool.reopen().map_err(Error::CgiSpawn)?;

        let mut command = match interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(script);
                c
            }
            None => Command::new(script),
        };
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }

        let mut child = command
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(Error::CgiSpawn)?;

        let pid = child.id();
        let exit = match ProcessExit::open(pid) {
            Ok(exit) => exit,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::CgiSpawn(e));
            }
        };

        debug!("CGI {} started as pid {}", script.display(), pid);

        Ok(CgiProcess {
            stdin: child.stdin.take(),
            child,
            pid: Some(pid),
            spool,
            exit: Some(exit),
            exit_status: None,
            state: CgiState::Spawned,
        })
    }

    pub fn set_state(&mut self, state: CgiState) {
        trace!("CGI {:?}: {:?} -> {:?}", self.pid, self.state, state);
        self.state = state;
    }

    #[cfg(test)]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The write end of the child's stdin, switched to non-blocking mode.
    pub fn take_stdin(&mut self) -> Result<Option<pipe::Sender>> {
        match self.stdin.take() {
            Some(stdin) => {
                let sender = pipe::Sender::from(stdin);
                sender.set_nonblocking(true)?;
                Ok(Some(sender))
            }
            None => Ok(None),
        }
    }

    /// Drops our end of stdin so the child sees end-of-file.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// The descriptor that turns readable once the child exits.
    pub fn take_exit_source(&mut self) -> Option<ProcessExit> {
        self.exit.take()
    }

    /// Collects the exit status if the child is done. Never blocks.
    pub fn try_reap(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit_status.is_some() {
            return Ok(self.exit_status);
        }

        match self.child.try_wait()? {
            Some(status) => {
                self.pid = None;
                self.exit_status = Some(status);
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// A fresh read handle on the spooled output, from the start.
    pub fn open_output(&self) -> Result<File> {
        Ok(self.spool.reopen()?)
    }

    /// A fresh read handle on the spooled output, positioned at `offset`.
    pub fn open_body(&self, offset: u64) -> Result<File> {
        let mut file = self.spool.reopen()?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(file)
    }

    pub fn output_len(&self) -> Result<u64> {
        Ok(self.spool.as_file().metadata()?.len())
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            debug!("Killing CGI pid {} ({:?})", pid, self.state);
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// The CGI/1.1 environment for running `script` on behalf of `request`.
pub fn metavariables(request: &Request, script: &Path, peer: Option<&SocketAddr>,
                     server_port: u16, server_software: &str) -> Vec<(OsString, OsString)> {
    let mut uri_path = vec![b'/'];
    uri_path.extend_from_slice(request.path().as_bytes());
    let uri_path = OsString::from_vec(uri_path);

    let server_name = request
        .headers()
        .get("Host")
        .map(|host| match host.iter().position(|&b| b == b':') {
            Some(colon) => &host[..colon],
            None => &host[..],
        })
        .map_or_else(|| OsString::from("localhost"), |host| OsStr::from_bytes(host).to_owned());

    let mut vars = vec![
        var("GATEWAY_INTERFACE", "CGI/1.1"),
        var("SERVER_SOFTWARE", server_software),
        var("SERVER_NAME", server_name),
        var("SERVER_PORT", server_port.to_string()),
        var("SERVER_PROTOCOL", "HTTP/1.1"),
        var("REQUEST_METHOD", request.method().as_str()),
        var("SCRIPT_NAME", &uri_path),
        var("SCRIPT_FILENAME", script),
        var("PATH_INFO", &uri_path),
        var("PATH_TRANSLATED", script),
        var("QUERY_STRING", request.query()),
        var("REMOTE_ADDR", peer.map(|p| p.ip().to_string()).unwrap_or_default()),
        var("CONTENT_LENGTH", request.body().len().to_string()),
        var("REDIRECT_STATUS", "200"),
        var("PATH", env::var_os("PATH").unwrap_or_else(|| OsString::from("/usr/bin:/bin"))),
    ];

    if let Some(content_type) = request.headers().get("Content-Type") {
        vars.push(var("CONTENT_TYPE", OsStr::from_bytes(content_type)));
    }

    for (name, value) in request.headers() {
        // these two already have their own variables; Proxy would become
        // HTTP_PROXY, which clients must not be able to set
        if name == "Content-Type" || name == "Content-Length" || name == "Proxy" {
            continue;
        }
        let name = format!("HTTP_{}", name.replace('-', "_").to_ascii_uppercase());
        vars.push(var(name, OsStr::from_bytes(value)));
    }

    vars
}

fn var<K: AsRef<OsStr>, V: AsRef<OsStr>>(key: K, value: V) -> (OsString, OsString) {
    (key.as_ref().to_owned(), value.as_ref().to_owned())
}

/// Builds the response a script asked for with its header block.
///
/// `Content-Length`, `Transfer-Encoding` and `Connection` from the script are
/// ignored; the server decides those.
pub fn response_from_headers(doc: DocumentHeaders, server_name: &str) -> Result<Response> {
    let mut response = Response::new(200, "OK", server_name);

    match (doc.status, doc.location.is_some()) {
        (Some(Status { code, reason_phrase: phrase }), _) => {
            if code < 100 || code > 599 {
                return Err(Error::CgiOutput("status code out of range"));
            }
            let reason = if phrase.is_empty() {
                String::from(reason_phrase(code))
            } else {
                String::from_utf8(phrase)?
            };
            response.set_status(code, &reason);
        }
        (None, true) => response.set_status(302, "Found"),
        (None, false) => (),
    }

    if let Some(Location { url }) = doc.location {
        response.headers_mut().insert("Location", String::from_utf8(url)?);
    }

    for Header { name, content } in doc.headers {
        let name = String::from_utf8(name)?;
        if name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
            || name.eq_ignore_ascii_case("Connection")
        {
            continue;
        }
        response.headers_mut().insert(name, String::from_utf8(content)?);
    }

    Ok(response)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::request;

    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::path::PathBuf;

    fn parsed(raw: &[u8]) -> Request {
        request::parse(raw, 1024).unwrap().unwrap().0
    }

    fn lookup<'a>(vars: &'a [(OsString, OsString)], key: &str) -> Option<&'a OsStr> {
        vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_os_str())
    }

    #[test]
    fn metavariables_describe_the_request() {
        let req = parsed(b"POST /cgi/run.sh?a=b HTTP/1.1\r\nHost: example.com:8080\r\n\
                           Content-Type: text/plain\r\nContent-Length: 3\r\nX-Thing: yes\r\n\r\nabc");
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        let vars = metavariables(&req, Path::new("/srv/cgi/run.sh"), Some(&peer), 8080, "test");

        assert_eq!(lookup(&vars, "REQUEST_METHOD"), Some(OsStr::new("POST")));
        assert_eq!(lookup(&vars, "QUERY_STRING"), Some(OsStr::new("a=b")));
        assert_eq!(lookup(&vars, "SCRIPT_NAME"), Some(OsStr::new("/cgi/run.sh")));
        assert_eq!(lookup(&vars, "SCRIPT_FILENAME"), Some(OsStr::new("/srv/cgi/run.sh")));
        assert_eq!(lookup(&vars, "SERVER_NAME"), Some(OsStr::new("example.com")));
        assert_eq!(lookup(&vars, "SERVER_PORT"), Some(OsStr::new("8080")));
        assert_eq!(lookup(&vars, "REMOTE_ADDR"), Some(OsStr::new("10.1.2.3")));
        assert_eq!(lookup(&vars, "CONTENT_LENGTH"), Some(OsStr::new("3")));
        assert_eq!(lookup(&vars, "CONTENT_TYPE"), Some(OsStr::new("text/plain")));
        assert_eq!(lookup(&vars, "HTTP_X_THING"), Some(OsStr::new("yes")));
        assert_eq!(lookup(&vars, "HTTP_CONTENT_TYPE"), None);
    }

    #[test]
    fn proxy_header_is_not_exported() {
        let req = parsed(b"GET /x.sh HTTP/1.1\r\nProxy: http://evil\r\n\r\n");
        let vars = metavariables(&req, Path::new("/x.sh"), None, 80, "test");
        assert_eq!(lookup(&vars, "HTTP_PROXY"), None);
        assert_eq!(lookup(&vars, "SERVER_NAME"), Some(OsStr::new("localhost")));
    }

    fn doc(status: Option<(u16, &[u8])>, location: Option<&[u8]>, headers: &[(&[u8], &[u8])])
           -> DocumentHeaders {
        DocumentHeaders {
            status: status.map(|(code, phrase)| Status { code, reason_phrase: Vec::from(phrase) }),
            location: location.map(|url| Location { url: Vec::from(url) }),
            headers: headers
                .iter()
                .map(|&(name, content)| Header { name: Vec::from(name), content: Vec::from(content) })
                .collect(),
        }
    }

    #[test]
    fn status_defaults_to_200() {
        let res = response_from_headers(doc(None, None, &[(b"Content-Type", b"text/plain")]), "t")
            .unwrap();
        assert_eq!(res.status_code(), 200);
        assert_eq!(res.headers().get("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn location_alone_redirects() {
        let res = response_from_headers(doc(None, Some(b"/elsewhere"), &[]), "t").unwrap();
        assert_eq!(res.status_code(), 302);
        assert_eq!(res.headers().get("Location"), Some("/elsewhere"));

        let res = response_from_headers(doc(Some((301, b"")), Some(b"/x"), &[]), "t").unwrap();
        assert_eq!(res.status_code(), 301);
        assert_eq!(res.headers().get("Location"), Some("/x"));
    }

    #[test]
    fn framing_headers_from_the_script_are_dropped() {
        let res = response_from_headers(
            doc(None, None, &[(b"Content-Length", b"99"), (b"Transfer-Encoding", b"chunked")]),
            "t",
        )
        .unwrap();
        assert!(!res.is_chunked());
        assert_eq!(res.content_length(), None);
    }

    #[test]
    fn bogus_status_is_refused() {
        assert!(response_from_headers(doc(Some((42, b"Nope")), None, &[]), "t").is_err());
    }

    fn script(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sh");
        File::create(&path).unwrap().write_all(body.as_bytes()).unwrap();
        (dir, path)
    }

    fn wait_for_exit(cgi: &mut CgiProcess) -> ExitStatus {
        let exit = cgi.take_exit_source().unwrap();
        let mut pfd = libc::pollfd { fd: exit.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        // SAFETY: one valid pollfd for the duration of the call
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 10_000) }, 1);
        cgi.try_reap().unwrap().unwrap()
    }

    #[test]
    fn output_is_spooled_and_body_reopens_at_offset() {
        let (_dir, path) = script("printf 'A: b\\r\\n\\r\\nbody'\n");
        let mut cgi = CgiProcess::spawn(&path, Some(Path::new("/bin/sh")), Vec::new()).unwrap();
        cgi.close_stdin();

        assert!(wait_for_exit(&mut cgi).success());
        assert_eq!(cgi.pid(), None);
        assert_eq!(cgi.output_len().unwrap(), 12);

        let mut all = String::new();
        cgi.open_output().unwrap().read_to_string(&mut all).unwrap();
        assert_eq!(all, "A: b\r\n\r\nbody");

        let mut body = String::new();
        cgi.open_body(8).unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "body");
    }

    #[test]
    fn environment_is_replaced() {
        let (_dir, path) = script("printf '%s|%s' \"$ONLY\" \"$HOME\"\n");
        let env = vec![var("ONLY", "this")];
        let mut cgi = CgiProcess::spawn(&path, Some(Path::new("/bin/sh")), env).unwrap();
        cgi.close_stdin();
        wait_for_exit(&mut cgi);

        let mut out = String::new();
        cgi.open_output().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "this|");
    }

    #[test]
    fn non_zero_exit_is_reported() {
        let (_dir, path) = script("exit 3\n");
        let mut cgi = CgiProcess::spawn(&path, Some(Path::new("/bin/sh")), Vec::new()).unwrap();
        cgi.close_stdin();
        assert_eq!(wait_for_exit(&mut cgi).code(), Some(3));
    }

    #[test]
    fn missing_interpreter_fails_to_spawn() {
        let (_dir, path) = script("true\n");
        match CgiProcess::spawn(&path, Some(Path::new("/no/such/interpreter")), Vec::new()) {
            Err(Error::CgiSpawn(_)) => (),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn dropping_a_running_script_kills_it() {
        let (_dir, path) = script("sleep 30\n");
        let cgi = CgiProcess::spawn(&path, Some(Path::new("/bin/sh")), Vec::new()).unwrap();
        let pid = cgi.pid().unwrap() as libc::pid_t;
        drop(cgi);

        // SAFETY: signal 0 only checks for existence
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    }
}
