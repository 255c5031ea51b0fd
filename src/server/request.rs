//! Parsed requests, as handed to the connection engine

use crate::errors::{Error, Result};

use std::collections::hash_map::{self, Entry};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

/// Largest request head we'll buffer; RFC 7230's suggested minimum.
pub const MAX_HEAD_SIZE: usize = 8000;

const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

/// An incoming request from the client, with its whole body
#[derive(Debug)]
pub struct Request {
    method: Method,
    target: String,
    path: Vec<u8>,
    query: String,
    minor_version: u8,
    headers: Headers,
    body: Vec<u8>,
}

impl Request {
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The request-target exactly as the client sent it
    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The decoded path without its leading slash
    pub fn path(&self) -> &OsStr {
        OsStr::from_bytes(&self.path)
    }

    #[inline]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Drops the body once it has been handed off.
    pub fn discard_body(&mut self) {
        self.body = Vec::new();
    }

    /// Whether the client is willing to reuse the connection.
    pub fn keep_alive(&self) -> bool {
        let connection = self
            .headers
            .get("Connection")
            .map(|v| v.to_ascii_lowercase());

        match connection.as_deref() {
            Some(b"close") => false,
            Some(b"keep-alive") => true,
            _ => self.minor_version >= 1,
        }
    }
}

/// Tries to pull one complete request off the front of `buffer`.
///
/// Returns `Ok(None)` while more bytes are needed, otherwise the request and
/// how many bytes of `buffer` it used.
pub fn parse(buffer: &[u8], max_body_size: usize) -> Result<Option<(Request, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buffer)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            if buffer.len() > MAX_HEAD_SIZE {
                return Err(Error::RequestTooLarge);
            }
            return Ok(None);
        }
    };

    if head_len > MAX_HEAD_SIZE {
        return Err(Error::RequestTooLarge);
    }

    let method = match req.method.and_then(Method::from_token) {
        Some(m) => m,
        None => return Err(Error::NotImplemented),
    };
    let target = String::from(req.path.unwrap_or(""));
    let minor_version = req.version.unwrap_or(1);

    let mut parsed_headers = Headers::new();
    for header in req.headers.iter() {
        parsed_headers.insert(header.name, Vec::from(header.value));
    }

    if parsed_headers.get("Transfer-Encoding").is_some() {
        return Err(Error::LengthRequired);
    }

    let body_len = match parsed_headers.get("Content-Length") {
        Some(value) => std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or(Error::Parse(httparse::Error::HeaderValue))?,
        None => 0,
    };

    if body_len > max_body_size {
        return Err(Error::PayloadTooLarge);
    }

    if buffer.len() - head_len < body_len {
        return Ok(None);
    }

    let (raw_path, query) = match target.find('?') {
        Some(i) => (&target[..i], &target[i + 1..]),
        None => (&target[..], ""),
    };

    let request = Request {
        method,
        path: normalize_path(raw_path.as_bytes())?,
        query: String::from(query),
        target: target.clone(),
        minor_version,
        headers: parsed_headers,
        body: Vec::from(&buffer[head_len..head_len + body_len]),
    };

    Ok(Some((request, head_len + body_len)))
}

/// Normalizes a path.
///
/// The following operations are performed:
///
/// 1. Sequences of multiple `'/'` characters are collapsed into a single `'/'`.
/// 2. Any leading `'/'` is stripped. (If the request path doesn’t lead with a
///    slash, the path is ill-formed for our purposes and we return an `Err`).
/// 3. Percent-encoded bytes are decoded. Bogus percent-encoding, like `b"%bo"`,
///    will return `Err`.
pub fn normalize_path(path: &[u8]) -> Result<Vec<u8>> {
    if path.first() != Some(&b'/') {
        return Err(Error::PathNotInOriginForm);
    }

    let mut buffer = Vec::with_capacity(path.len());
    let mut i = 1;

    while i < path.len() && path[i] == b'/' {
        i += 1;
    }

    while i < path.len() {
        match path[i] {
            b'/' => {
                buffer.push(b'/');
                while i < path.len() && path[i] == b'/' {
                    i += 1;
                }
            }
            b'%' => {
                if i + 2 >= path.len() {
                    return Err(Error::IllegalPercentEncoding);
                }

                let high = hexit(path[i + 1]).ok_or(Error::IllegalPercentEncoding)?;
                let low = hexit(path[i + 2]).ok_or(Error::IllegalPercentEncoding)?;
                buffer.push(high << 4 | low);

                i += 3;
            }
            b => {
                buffer.push(b);
                i += 1;
            }
        }
    }

    Ok(buffer)
}

/// The value of an ASCII hexadecimal digit
fn hexit(x: u8) -> Option<u8> {
    match x {
        b'0'..=b'9' => Some(x - b'0'),
        b'A'..=b'F' => Some(x - b'A' + 10),
        b'a'..=b'f' => Some(x - b'a' + 10),
        _ => None,
    }
}

/// A map of HTTP request headers
///
/// This is just a newtype wrapper around a `HashMap<String, Vec<u8>>`, but the
/// keys are case-normalized on input. The first word, and any words after a
/// hyphen, are capitalized, with all other letters lowercased.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    map: HashMap<String, Vec<u8>>,
}

fn normalize_header_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut start_of_word = true;

    for ch in name.chars() {
        if start_of_word {
            normalized.push(ch.to_ascii_uppercase());
        } else {
            normalized.push(ch.to_ascii_lowercase());
        }
        start_of_word = ch == '-';
    }

    normalized
}

impl Headers {
    pub fn new() -> Headers {
        Headers {
            map: HashMap::new(),
        }
    }

    /// Adds a header; a repeated name gets its values comma-joined.
    pub fn insert(&mut self, key: &str, mut value: Vec<u8>) {
        match self.map.entry(normalize_header_name(key)) {
            Entry::Vacant(e) => {
                e.insert(value);
            }
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                entry.reserve(value.len() + 1);
                entry.push(b',');
                entry.append(&mut value);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Vec<u8>> {
        self.map.get(&normalize_header_name(key))
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a String, &'a Vec<u8>);
    type IntoIter = hash_map::Iter<'a, String, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter()
    }
}
