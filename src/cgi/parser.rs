//! Parsers for CGI/1.1 responses

use crate::cgi::{DocumentHeaders, Header, Location, Status};

use nom::bytes::complete::{tag, take_till, take_till1, take_while, take_while_m_n};
use nom::character::complete::{line_ending, space0, space1};
use nom::character::is_digit;
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::error::{Error, ErrorKind};
use nom::multi::many0;
use nom::sequence::{preceded, terminated, tuple};
use nom::{Err, IResult};

use std::str::{self, FromStr};

/// The value of a `Status` header: a three-digit code and an optional reason.
pub fn status(input: &[u8]) -> IResult<&[u8], Status> {
    map(tuple((space0, code, opt(preceded(space1, text)))),
        |(_, code, phrase)| Status {
            code,
            reason_phrase: Vec::from(phrase.unwrap_or(&b""[..])),
        })(input)
}

fn code(input: &[u8]) -> IResult<&[u8], u16> {
    map_res(map_res(take_while_m_n(3, 3, is_digit), str::from_utf8), FromStr::from_str)(input)
}

fn text(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_till(cr_or_lf)(input)
}

fn cr_or_lf(x: u8) -> bool {
    x == b'\n' || x == b'\r'
}

fn lwsp(x: u8) -> bool {
    x == b' ' || x == b'\t'
}

/// One `Name: value` line, without its line ending.
pub fn header(input: &[u8]) -> IResult<&[u8], Header> {
    map(tuple((take_till1(|x| x == b':' || cr_or_lf(x)), tag(":"), take_while(lwsp), text)),
        |(name, _, _, content)| Header {
            name: Vec::from(name),
            content: Vec::from(content),
        })(input)
}

/// Header lines up to and including the blank line that ends them.
pub fn headers(input: &[u8]) -> IResult<&[u8], Vec<Header>> {
    terminated(many0(terminated(header, line_ending)), line_ending)(input)
}

/// A whole CGI header block, with `Status` and `Location` picked out.
pub fn doc_headers(input: &[u8]) -> IResult<&[u8], DocumentHeaders> {
    let (rest, all) = headers(input)?;

    let mut doc = DocumentHeaders {
        status: None,
        location: None,
        headers: Vec::with_capacity(all.len()),
    };

    for hdr in all {
        if hdr.name.eq_ignore_ascii_case(b"Status") {
            let (_, parsed) = all_consuming(status)(&hdr.content[..])
                .map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?;
            doc.status = Some(parsed);
        } else if hdr.name.eq_ignore_ascii_case(b"Location") {
            doc.location = Some(Location { url: hdr.content });
        } else {
            doc.headers.push(hdr);
        }
    }

    Ok((rest, doc))
}
