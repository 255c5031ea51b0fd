//! Error handling for the http server

use std::io;
use std::string::FromUtf8Error;

/// A Result for internal operations.
pub type Result<T> = ::std::result::Result<T, Error>;

/// All errors which might arise within the application
#[derive(Debug)]
pub enum Error {
    Parse(httparse::Error),
    Io(io::Error),
    Utf8(FromUtf8Error),
    RequestTooLarge,
    PayloadTooLarge,
    LengthRequired,
    PathNotInOriginForm,
    IllegalPercentEncoding,
    NotImplemented,
    PermissionDenied,
    NotFound,
    /// A response that must never reach the wire: bad status code, missing
    /// reason phrase, missing `Server` header or unresolved length.
    MalformedResponse(&'static str),
    /// The reactor refused to watch a descriptor.
    Registration(io::Error),
    CgiSpawn(io::Error),
    CgiOutput(&'static str),
}

impl Error {
    /// The status code a client should see when this error ends a request
    /// before any response was started.
    pub fn status_code(&self) -> u16 {
        match *self {
            Error::Parse(_)
            | Error::Utf8(_)
            | Error::PathNotInOriginForm
            | Error::IllegalPercentEncoding => 400,
            Error::PermissionDenied => 403,
            Error::NotFound => 404,
            Error::LengthRequired => 411,
            Error::PayloadTooLarge => 413,
            Error::RequestTooLarge => 431,
            Error::NotImplemented => 501,
            Error::CgiSpawn(_) | Error::CgiOutput(_) => 502,
            Error::Io(_) | Error::MalformedResponse(_) | Error::Registration(_) => 500,
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Error {
        Error::Parse(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(e: FromUtf8Error) -> Error {
        Error::Utf8(e)
    }
}

#[test]
fn request_errors_map_to_client_codes() {
    assert_eq!(Error::from(httparse::Error::Token).status_code(), 400);
    assert_eq!(Error::IllegalPercentEncoding.status_code(), 400);
    assert_eq!(Error::PayloadTooLarge.status_code(), 413);
    assert_eq!(Error::NotImplemented.status_code(), 501);
    assert_eq!(Error::CgiOutput("eof").status_code(), 502);
}
