//! Response descriptors and the header block that goes in front of them

use crate::errors::{Error, Result};

use httpdate::fmt_http_date;

use std::collections::btree_map::{self, BTreeMap};
use std::fs::File;
use std::time::{SystemTime, UNIX_EPOCH};

/// What `build_date` hands back when the wall clock can't be read.
pub const INVALID_DATE: &str = "null";

/// Stored `Content-Length` of a response whose length isn't known yet.
const UNSET_LENGTH: &str = "-1";

/// A map of response headers.
///
/// Names are stored exactly as given, and a second insert under the same name
/// replaces the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderRecord {
    map: BTreeMap<String, String>,
}

impl HeaderRecord {
    pub fn new() -> HeaderRecord {
        HeaderRecord {
            map: BTreeMap::new(),
        }
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

}

impl<'a> IntoIterator for &'a HeaderRecord {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter()
    }
}

/// Where the bytes after the header block come from
#[derive(Debug)]
pub enum BodySource {
    /// Relayed to the socket one read at a time
    File(File),
    /// Small canned bodies that are queued whole
    Inline(Vec<u8>),
}

/// A response that has been decided on but not yet sent
#[derive(Debug)]
pub struct Response {
    version: String,
    status_code: u16,
    reason: Option<String>,
    headers: HeaderRecord,
    body: Option<BodySource>,
}

impl Response {
    /// A response with the default `Date`, `Connection` and `Content-Length`
    /// headers already filled in.
    pub fn new(status_code: u16, reason: &str, server_name: &str) -> Response {
        let mut res = Response::blank();
        res.set_status(status_code, reason);
        res.headers.insert("Server", server_name);
        res
    }

    /// A response with no status and no `Server` header; it won't serialize
    /// until both are set.
    pub fn blank() -> Response {
        let mut headers = HeaderRecord::new();
        headers.insert("Date", build_date());
        headers.insert("Connection", "keep-alive");
        headers.insert("Content-Length", UNSET_LENGTH);

        Response {
            version: String::from("HTTP/1.1"),
            status_code: 0,
            reason: None,
            headers,
            body: None,
        }
    }

    pub fn set_status(&mut self, status_code: u16, reason: &str) {
        self.status_code = status_code;
        self.reason = Some(String::from(reason));
    }

    #[inline]
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    #[inline]
    pub fn headers(&self) -> &HeaderRecord {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderRecord {
        &mut self.headers
    }

    pub fn set_content_length(&mut self, len: u64) {
        self.headers.insert("Content-Length", len.to_string());
    }

    /// The declared body length, or `None` while it's still unset.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn set_body(&mut self, body: BodySource) {
        self.body = Some(body);
    }

    pub fn take_body(&mut self) -> Option<BodySource> {
        self.body.take()
    }

    /// A response is chunked iff its `Transfer-Encoding` mentions "chunked".
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("Transfer-Encoding")
            .map_or(false, |v| v.contains("chunked"))
    }

    /// Whether the `Connection` header lets the socket be reused.
    pub fn keeps_alive(&self) -> bool {
        self.headers
            .get("Connection")
            .map_or(false, |v| v.eq_ignore_ascii_case("keep-alive"))
    }

    /// Renders the status line and one line per header.
    ///
    /// The blank line separating headers from the body is *not* included;
    /// whoever sends the block appends it.
    pub fn serialize(&self) -> Result<String> {
        if self.status_code < 100 || self.status_code > 599 {
            return Err(Error::MalformedResponse("status code out of range"));
        }

        let reason = match self.reason {
            Some(ref r) => r,
            None => return Err(Error::MalformedResponse("status message unset")),
        };

        match self.headers.get("Server") {
            Some(name) if !name.is_empty() => (),
            _ => return Err(Error::MalformedResponse("server name unset")),
        }

        // 1xx and 204 never carry a body, so they never carry framing either
        let bodiless = self.status_code < 200 || self.status_code == 204;
        let chunked = !bodiless && self.is_chunked();
        if !bodiless && !chunked && self.content_length().is_none() {
            return Err(Error::MalformedResponse("content length unset"));
        }

        let mut block = format!("{} {} {}\r\n", self.version, self.status_code, reason);
        for (name, value) in &self.headers {
            let framing = name == "Content-Length" || name == "Transfer-Encoding";
            if (bodiless && framing) || (chunked && name == "Content-Length") {
                continue;
            }
            block.push_str(name);
            block.push_str(": ");
            block.push_str(value);
            block.push_str("\r\n");
        }

        Ok(block)
    }
}

/// Today's date as `"Thu, 1 Jan 1970 GMT"`.
///
/// Never fails: an unreadable clock yields `INVALID_DATE`.
pub fn build_date() -> String {
    build_date_at(SystemTime::now())
}

pub fn build_date_at(when: SystemTime) -> String {
    if when.duration_since(UNIX_EPOCH).is_err() {
        return String::from(INVALID_DATE);
    }

    // "Thu, 01 Jan 1970 00:00:00 GMT" -> day name, day, month, year
    let full = fmt_http_date(when);
    let fields: Vec<&str> = full.split_whitespace().collect();
    match fields.as_slice() {
        [weekday, day, month, year, _, _] => format!(
            "{} {} {} {} GMT",
            weekday,
            day.trim_start_matches('0'),
            month,
            year
        ),
        _ => String::from(INVALID_DATE),
    }
}

/// The standard reason phrase for a status code.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        411 => "Length Required",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    fn ready(code: u16) -> Response {
        let mut res = Response::new(code, "Whatever", "test");
        res.set_content_length(0);
        res
    }

    #[test]
    fn codes_outside_range_never_serialize() {
        for code in (0..100).chain(600..1000) {
            match ready(code).serialize() {
                Err(Error::MalformedResponse(_)) => (),
                other => panic!("{} serialized: {:?}", code, other),
            }
        }
    }

    #[test]
    fn codes_inside_range_serialize() {
        for code in 100..600 {
            let block = ready(code).serialize().unwrap();
            assert!(block.starts_with(&format!("HTTP/1.1 {} Whatever\r\n", code)));
        }
    }

    #[test]
    fn missing_reason_is_refused() {
        let mut res = Response::blank();
        res.headers_mut().insert("Server", "test");
        res.set_content_length(0);
        assert!(res.serialize().is_err());

        res.set_status(200, "OK");
        assert!(res.serialize().is_ok());
    }

    #[test]
    fn missing_server_is_refused() {
        let mut res = Response::blank();
        res.set_status(200, "OK");
        res.set_content_length(0);
        assert!(res.serialize().is_err());
    }

    #[test]
    fn unset_length_is_refused_unless_chunked() {
        let mut res = Response::new(200, "OK", "test");
        assert!(res.serialize().is_err());

        res.headers_mut().insert("Transfer-Encoding", "chunked");
        assert!(res.serialize().is_ok());
    }

    #[test]
    fn no_content_has_no_framing_headers() {
        let mut res = Response::new(204, "No Content", "test");
        assert_eq!(res.serialize().unwrap().matches("Content-Length").count(), 0);

        res.set_content_length(0);
        res.headers_mut().insert("Transfer-Encoding", "chunked");
        let block = res.serialize().unwrap();
        assert!(!block.contains("Content-Length"), "{}", block);
        assert!(!block.contains("Transfer-Encoding"), "{}", block);

        let block = Response::new(101, "Switching Protocols", "test").serialize().unwrap();
        assert!(!block.contains("Content-Length"), "{}", block);
    }

    #[test]
    fn chunked_responses_drop_content_length() {
        for encoding in &["chunked", "gzip, chunked", "xchunkedx"] {
            let mut res = Response::new(200, "OK", "test");
            res.set_content_length(42);
            res.headers_mut().insert("Transfer-Encoding", *encoding);

            let block = res.serialize().unwrap();
            assert!(!block.contains("Content-Length"), "{}", block);
            assert!(block.contains(&format!("Transfer-Encoding: {}\r\n", encoding)));
        }
    }

    #[test]
    fn block_has_one_line_per_header_and_no_blank_line() {
        let mut res = Response::new(404, "Not Found", "test");
        res.set_content_length(3);
        res.headers_mut().insert("Content-Type", "text/html");

        let block = res.serialize().unwrap();
        assert!(block.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(block.contains("Server: test\r\n"));
        assert!(block.contains("Content-Length: 3\r\n"));
        assert!(block.contains("Content-Type: text/html\r\n"));
        assert!(block.contains("Connection: keep-alive\r\n"));
        assert!(block.contains("Date: "));
        assert!(!block.contains("\r\n\r\n"));
        assert_eq!(block.matches("\r\n").count(), 6);
    }

    #[test]
    fn last_write_wins() {
        let mut res = ready(200);
        res.headers_mut().insert("X-Thing", "one");
        res.headers_mut().insert("X-Thing", "two");
        assert_eq!(res.headers().get("X-Thing"), Some("two"));
        assert_eq!(res.serialize().unwrap().matches("X-Thing").count(), 1);
    }

    #[test]
    fn dates_match_reference_table() {
        let table: &[(u64, &str)] = &[
            (0, "Thu, 1 Jan 1970 GMT"),
            (951_782_400, "Tue, 29 Feb 2000 GMT"),
            (1_700_000_000, "Tue, 14 Nov 2023 GMT"),
        ];

        for &(secs, expected) in table {
            let when = UNIX_EPOCH + Duration::from_secs(secs);
            assert_eq!(build_date_at(when), expected);
        }
    }

    #[test]
    fn clock_before_epoch_yields_sentinel() {
        let when = UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(build_date_at(when), INVALID_DATE);
    }
}
