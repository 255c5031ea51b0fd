//! Server functionality

pub mod context;
pub mod emitter;
pub mod reactor;
pub mod request;
pub mod response;
pub mod router;
pub mod static_files;
pub mod worker;

use crate::config::Config;
use crate::errors::Result;
use crate::server::router::Router;
use crate::server::worker::Worker;

use mime::Mime;

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

/// Binds the configured port and serves it from `config.workers` threads.
///
/// Each thread runs its own reactor over a clone of the one listening socket,
/// so a connection stays on whichever thread accepted it. Returns once every
/// worker has stopped.
pub fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))?;
    let router = Arc::new(Router::new(&config.locations)?);
    let config = Arc::new(config);

    let mut threads = Vec::with_capacity(config.workers);
    for n in 0..config.workers {
        let mut worker = Worker::new(listener.try_clone()?, config.clone(), router.clone())?;

        let thread = thread::Builder::new()
            .name(format!("worker-{}", n))
            .spawn(move || {
                if let Err(e) = worker.run() {
                    error!("Worker {} stopped: {:?}", n, e);
                }
            })?;
        threads.push(thread);
    }

    for thread in threads {
        if thread.join().is_err() {
            error!("A worker thread panicked");
        }
    }

    Ok(())
}

/// Translates a strongly-typed Mime type into a string
pub fn mime_as_string(mime: Mime) -> String {
    format!("{}/{}", mime.type_(), mime.subtype())
}

#[test]
fn mime_as_string_html() {
    assert_eq!(mime_as_string(mime::TEXT_HTML), "text/html");
}

#[test]
fn mime_as_string_css() {
    assert_eq!(mime_as_string(mime::TEXT_CSS), "text/css");
}

#[test]
fn mime_as_string_javascript() {
    assert_eq!(mime_as_string(mime::TEXT_JAVASCRIPT), "text/javascript");
}

#[test]
fn mime_as_string_drops_parameters() {
    assert_eq!(mime_as_string(mime::TEXT_PLAIN_UTF_8), "text/plain");
}

pub mod error_messages {
    use super::response::{reason_phrase, BodySource, Response};

    /// A complete response carrying the canned page for `code`.
    ///
    /// Codes without a page of their own get the 500 page.
    pub fn page(code: u16, server_name: &str) -> Response {
        let (code, body) = match code {
            400 => (400, ERROR_400),
            403 => (403, ERROR_403),
            404 => (404, ERROR_404),
            405 => (405, ERROR_405),
            411 => (411, ERROR_411),
            413 => (413, ERROR_413),
            431 => (431, ERROR_431),
            501 => (501, ERROR_501),
            502 => (502, ERROR_502),
            _ => (500, ERROR_500),
        };

        let mut res = Response::new(code, reason_phrase(code), server_name);
        res.headers_mut().insert("Content-Type", "text/html");
        res.set_content_length(body.len() as u64);
        res.set_body(BodySource::Inline(Vec::from(body)));
        res
    }

    const ERROR_500: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Internal Error</h1><p>Something went wrong on my side.</p><p>There's nothing you can do; maybe come back later.</p></body></html>";

    const ERROR_405: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Method Not Allowed</h1><p>Files here can be fetched, uploaded and deleted, and that's it.</p></body></html>";

    const ERROR_404: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Not Found</h1><p>I couldn't find that file. Sorry.</p></body></html>";

    const ERROR_403: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Forbidden</h1><p>You don't have permission to view that file. Sorry.</p></body></html>";

    const ERROR_400: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Bad Request</h1><p>Your request had some kind of bad syntax. Are you using netcat?</p></body></html>";

    const ERROR_411: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Length Required</h1><p>Send the body with a Content-Length, please; chunked uploads aren't supported.</p></body></html>";

    const ERROR_413: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Payload Too Large</h1><p>That body is bigger than this server accepts.</p></body></html>";

    const ERROR_431: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Request Header Fields Too Large</h1><p>Your request headers don't fit in my buffer.</p></body></html>";

    const ERROR_501: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Not Implemented</h1><p>This server only understands GET, HEAD, POST, PUT, PATCH and DELETE.</p></body></html>";

    const ERROR_502: &[u8] = b"<!doctype html><html><head><title>Error</title></head><body><h1>Bad Gateway</h1><p>The script behind this page didn't give a usable answer.</p></body></html>";

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn pages_declare_their_own_length() {
            for &code in &[400, 403, 404, 405, 411, 413, 431, 500, 501, 502] {
                let mut res = page(code, "test");
                assert_eq!(res.status_code(), code);
                assert!(res.serialize().is_ok());

                let len = match res.take_body() {
                    Some(BodySource::Inline(body)) => body.len() as u64,
                    other => panic!("{:?}", other),
                };
                assert_eq!(res.content_length(), Some(len));
            }
        }

        #[test]
        fn unknown_codes_fall_back_to_500() {
            assert_eq!(page(418, "test").status_code(), 500);
        }
    }
}
