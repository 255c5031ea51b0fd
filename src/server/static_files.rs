//! Handlers for static file service

use super::error_messages;
use super::mime_as_string;
use super::request::{Method, Request};
use super::response::{BodySource, Response};
use crate::errors::*;

use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::Path;

/// Methods a static location answers to
pub const ALLOWED: &str = "GET, HEAD, PUT, DELETE";

/// Decides the response to `req` for the file at `path`.
///
/// Failures come back as the matching canned error page, never as an `Err`.
pub fn respond(req: &Request, path: &Path, server_name: &str) -> Response {
    let outcome = match req.method() {
        Method::Get | Method::Head => serve_file(path, server_name),
        Method::Put => store_file(path, req.body(), server_name),
        Method::Delete => delete_file(path, server_name),
        Method::Post | Method::Patch => {
            let mut res = error_messages::page(405, server_name);
            res.headers_mut().insert("Allow", ALLOWED);
            return res;
        }
    };

    match outcome {
        Ok(res) => res,
        Err(e) => {
            debug!("{} {}: {:?}", req.method().as_str(), path.display(), e);
            error_messages::page(e.status_code(), server_name)
        }
    }
}

fn serve_file(path: &Path, server_name: &str) -> Result<Response> {
    let file = File::open(path).map_err(classify)?;
    let meta = file.metadata()?;

    if meta.is_dir() {
        return Err(Error::PermissionDenied);
    }

    let mime = mime_guess::from_path(path)
        .first()
        .map(mime_as_string)
        .unwrap_or_else(|| String::from("application/octet-stream"));

    let mut res = Response::new(200, "OK", server_name);
    res.headers_mut().insert("Content-Type", mime);
    res.set_content_length(meta.len());
    res.set_body(BodySource::File(file));

    Ok(res)
}

fn store_file(path: &Path, body: &[u8], server_name: &str) -> Result<Response> {
    if path.is_dir() {
        return Err(Error::PermissionDenied);
    }

    File::create(path)
        .and_then(|mut f| f.write_all(body))
        .map_err(classify)?;

    let mut res = Response::new(201, "Created", server_name);
    res.set_content_length(0);
    Ok(res)
}

fn delete_file(path: &Path, server_name: &str) -> Result<Response> {
    if path.is_dir() {
        return Err(Error::PermissionDenied);
    }

    fs::remove_file(path).map_err(classify)?;

    Ok(Response::new(204, "No Content", server_name))
}

fn classify(e: io::Error) -> Error {
    match e.kind() {
        ErrorKind::NotFound => Error::NotFound,
        ErrorKind::PermissionDenied => Error::PermissionDenied,
        _ => Error::from(e),
    }
}
