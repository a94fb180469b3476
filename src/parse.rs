//! Parsing of HTTP/1.0-style request heads.
//!
//! Only the parts routing needs are extracted: the request line, the header
//! block, and the normalized `host` header. The raw bytes of the head are
//! kept around so they can be replayed to a backend verbatim.

use crate::prelude::*;

/// Common characters expressed as a single byte each, according to UTF-8.
pub mod chars {
    /// Line feed
    pub const LF: u8 = 10;
    /// Carriage return
    pub const CR: u8 = 13;
    /// ` `
    pub const SPACE: u8 = 32;
    /// `:`
    pub const COLON: u8 = 58;
    /// `[`
    pub const L_SQ_BRACKET: u8 = 91;
    /// `]`
    pub const R_SQ_BRACKET: u8 = 93;
}

/// A general parsing error.
///
/// Returned by the functions in this module and by [`read::head`](crate::read::head).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// The request line carries no path.
    NoPath,
    /// The stream ended or timed out before the head was complete.
    UnexpectedEnd,
    /// The head is longer than the caller's limit.
    HeadTooLong,
    /// The [`Method`] is invalid.
    InvalidMethod,
    /// The [`Version`] is invalid.
    InvalidVersion,
    /// The path contains illegal bytes.
    InvalidPath,
    /// A syntax error in the data.
    ///
    /// Often means the request line or a header is malformed.
    Syntax,
    /// A [`HeaderName`] contains illegal bytes.
    IllegalName,
    /// A [`HeaderValue`] contains illegal bytes.
    IllegalValue,
}
impl Error {
    /// Gets a string representation of the error.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoPath => "no path was supplied in the request line",
            Self::UnexpectedEnd => "stream ended unexpectedly",
            Self::HeadTooLong => "the head is too long",
            Self::InvalidMethod => "invalid method",
            Self::InvalidVersion => "invalid version",
            Self::InvalidPath => "invalid path",
            Self::Syntax => "invalid syntax of data",
            Self::IllegalName => "illegal header name",
            Self::IllegalValue => "illegal header value",
        }
    }
}
impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl std::error::Error for Error {}
impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::UnexpectedEnd => io::Error::new(io::ErrorKind::BrokenPipe, err.as_str()),
            _ => io::Error::new(io::ErrorKind::InvalidData, err.as_str()),
        }
    }
}

/// Parses a [`Version`] from `bytes`.
#[must_use]
pub fn version(bytes: &[u8]) -> Option<Version> {
    Some(match bytes {
        b"HTTP/0.9" => Version::HTTP_09,
        b"HTTP/1.0" => Version::HTTP_10,
        b"HTTP/1.1" => Version::HTTP_11,
        b"HTTP/2" | b"HTTP/2.0" => Version::HTTP_2,
        b"HTTP/3" | b"HTTP/3.0" => Version::HTTP_3,
        _ => return None,
    })
}

/// Normalizes a `host` header value for use as a table key.
///
/// Lowercases the name and strips any `:port` suffix. Bracketed IPv6
/// authorities keep their brackets.
#[must_use]
pub fn normalize_host(raw: &str) -> CompactString {
    let trimmed = raw.trim();
    let without_port = if trimmed.as_bytes().first() == Some(&chars::L_SQ_BRACKET) {
        trimmed
            .find(chars::R_SQ_BRACKET as char)
            .map_or(trimmed, |end| &trimmed[..=end])
    } else {
        trimmed.split(':').next().unwrap_or(trimmed)
    };
    let mut host = without_port.to_compact_string();
    // `make_ascii_lowercase` doesn't touch multi-byte characters,
    // which are invalid in a host anyway
    host.make_ascii_lowercase();
    host
}

/// A parsed request head.
///
/// Keeps the raw bytes it was parsed from; [`RequestHead::raw`] is what gets
/// replayed to a backend when proxying.
#[derive(Debug)]
pub struct RequestHead {
    raw: Bytes,
    method: Method,
    path: CompactString,
    version: Version,
    headers: HeaderMap,
    host: CompactString,
    body_start: usize,
}
impl RequestHead {
    /// Parses `raw` into a request head.
    ///
    /// `raw` must contain the whole head, up to and including the blank line
    /// which terminates it. Trailing bytes are kept and exposed through
    /// [`RequestHead::overflow`].
    ///
    /// # Errors
    ///
    /// Passes errors from parsing the request line and the headers.
    pub fn parse(raw: Bytes) -> Result<Self, Error> {
        let line_end = raw
            .iter()
            .position(|byte| *byte == chars::LF)
            .ok_or(Error::Syntax)?;
        let line = &raw[..line_end];
        let line = line.strip_suffix(&[chars::CR]).unwrap_or(line);

        let mut segments = line.split(|byte| *byte == chars::SPACE);
        let method = Method::from_bytes(segments.next().ok_or(Error::InvalidMethod)?)
            .map_err(|_| Error::InvalidMethod)?;
        let path = segments.next().ok_or(Error::NoPath)?;
        if path.is_empty() {
            return Err(Error::NoPath);
        }
        let path = str::from_utf8(path)
            .map_err(|_| Error::InvalidPath)?
            .to_compact_string();
        let version = version(segments.next().ok_or(Error::InvalidVersion)?)
            .ok_or(Error::InvalidVersion)?;

        let (headers, header_len) = headers(&raw.slice(line_end + 1..))?;
        let host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(normalize_host)
            .unwrap_or_default();

        Ok(Self {
            raw,
            method,
            path,
            version,
            headers,
            host,
            body_start: line_end + 1 + header_len,
        })
    }
    /// The bytes this head was parsed from, including any body prefix.
    #[must_use]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
    /// The request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }
    /// The request path, verbatim from the request line.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
    /// The protocol version of the request.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }
    /// All parsed headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
    /// The normalized `host` header, or an empty string if it's missing
    /// or isn't valid UTF-8.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
    /// The `x-forwarded-protocol` header, if present and valid UTF-8.
    #[must_use]
    pub fn forwarded_protocol(&self) -> Option<&str> {
        self.headers
            .get("x-forwarded-protocol")
            .and_then(|value| value.to_str().ok())
    }
    /// Bytes read past the end of the head, the first part of the body.
    #[must_use]
    pub fn overflow(&self) -> Bytes {
        self.raw.slice(cmp::min(self.body_start, self.raw.len())..)
    }
}

/// Parses the header block at the start of `bytes`.
///
/// `bytes` must directly follow the line feed of the request line, so a
/// leading `\r\n` means the block is empty. Returns the headers and the
/// length of the block, including the blank line which terminates it.
///
/// # Errors
///
/// Returns [`Error::Syntax`] if the blank line is missing and errors if
/// a name or value contains illegal bytes.
pub fn headers(bytes: &Bytes) -> Result<(HeaderMap, usize), Error> {
    let mut headers = HeaderMap::new();
    let mut parse_stage = HeaderParseStage::Name;
    let mut header_name_start = 0;
    let mut header_name_end = 0;
    let mut header_value_start = 0;
    // the line feed which ended the request line counts towards the blank line
    let mut lf_in_row = 1_u8;
    let mut header_end = 0;

    for (pos, byte) in bytes.iter().copied().enumerate() {
        header_end += 1;
        if byte == chars::LF {
            lf_in_row += 1;
            if lf_in_row == 2 {
                return Ok((headers, header_end));
            }
        } else if byte != chars::CR {
            lf_in_row = 0;
        }
        match parse_stage {
            HeaderParseStage::Name => {
                if byte == chars::COLON {
                    header_name_end = pos;
                    if bytes.get(pos + 1) != Some(&chars::SPACE) {
                        header_value_start = pos + 1;
                        parse_stage = HeaderParseStage::Value;
                    }
                    continue;
                }
                if byte == chars::SPACE {
                    header_value_start = pos + 1;
                    parse_stage = HeaderParseStage::Value;
                    continue;
                }
                if byte == chars::LF {
                    // an empty line after the previous header; no more headers
                    continue;
                }
                if pos == 0 || bytes.get(pos - 1) == Some(&chars::LF) {
                    header_name_start = pos;
                }
            }
            HeaderParseStage::Value => {
                if byte == chars::LF {
                    let name = HeaderName::from_bytes(
                        &bytes[header_name_start..header_name_end],
                    )
                    .map_err(|_| Error::IllegalName)?;
                    let value_end = if bytes.get(pos - 1) == Some(&chars::CR) {
                        pos - 1
                    } else {
                        pos
                    };
                    let value =
                        HeaderValue::from_maybe_shared(bytes.slice(header_value_start..value_end))
                            .map_err(|_| Error::IllegalValue)?;
                    headers.insert(name, value);
                    parse_stage = HeaderParseStage::Name;
                }
            }
        }
    }
    Err(Error::Syntax)
}

enum HeaderParseStage {
    Name,
    Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(bytes: &'static [u8]) -> RequestHead {
        RequestHead::parse(Bytes::from_static(bytes)).unwrap()
    }

    #[test]
    fn full_request() {
        let head = head(
            b"GET /images/logo.png HTTP/1.0\r\n\
            Host: Example.COM:8080\r\n\
            User-Agent: test agent\r\n\
            Accept: */*\r\n\
            \r\n",
        );
        assert_eq!(head.method(), Method::GET);
        assert_eq!(head.path(), "/images/logo.png");
        assert_eq!(head.version(), Version::HTTP_10);
        assert_eq!(head.host(), "example.com");
        assert_eq!(head.headers().get("user-agent").unwrap(), "test agent");
        assert!(head.overflow().is_empty());
    }

    #[test]
    fn body_prefix_kept() {
        let head = head(
            b"PUT /hosts/a.example HTTP/1.0\r\n\
            Host: manager\r\n\
            Content-length: 7\r\n\
            \r\npartial",
        );
        assert_eq!(head.overflow(), Bytes::from_static(b"partial"));
        assert_eq!(head.host(), "manager");
    }

    #[test]
    fn missing_host_is_empty() {
        let head = head(b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(head.host(), "");
        assert!(head.headers().is_empty());
    }

    #[test]
    fn lf_only_line_endings() {
        let head = head(b"GET / HTTP/1.1\nHost: b.example\n\n");
        assert_eq!(head.host(), "b.example");
        assert_eq!(head.version(), Version::HTTP_11);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(
            RequestHead::parse(Bytes::from_static(b"GET /\r\n\r\n")).unwrap_err(),
            Error::InvalidVersion
        );
        assert_eq!(
            RequestHead::parse(Bytes::from_static(b"GET / HTTP/5\r\n\r\n")).unwrap_err(),
            Error::InvalidVersion
        );
        assert_eq!(
            RequestHead::parse(Bytes::from_static(b"G\x01T / HTTP/1.0\r\n\r\n")).unwrap_err(),
            Error::InvalidMethod
        );
        assert_eq!(
            RequestHead::parse(Bytes::from_static(b"GET / HTTP/1.0\r\nHost: unfinished"))
                .unwrap_err(),
            Error::Syntax
        );
    }

    #[test]
    fn forwarded_protocol() {
        let head = head(
            b"GET / HTTP/1.0\r\n\
            Host: site.example\r\n\
            X-Forwarded-Protocol: SSL\r\n\
            \r\n",
        );
        assert_eq!(head.forwarded_protocol(), Some("SSL"));
    }

    #[test]
    fn normalize() {
        assert_eq!(normalize_host("Example.COM"), "example.com");
        assert_eq!(normalize_host("example.com:8080"), "example.com");
        assert_eq!(normalize_host("127.0.0.1:30300"), "127.0.0.1");
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
        assert_eq!(normalize_host(" spaced.example "), "spaced.example");
    }
}
