//! Incremental HTTP/1.x request extraction.
//!
//! Grammar handling is delegated to `httparse`; this module owns the
//! buffer-draining contract: a request is only produced once its header
//! block and declared body are fully buffered, and the caller is told how
//! many bytes to consume.

use crate::error::SessionError;

/// Upper bound on headers per request, matching httparse's fixed table.
const MAX_HEADERS: usize = 32;

/// Upper bound on a buffered request body.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
}

impl Method {
    /// Map a request-line token to a method.
    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

/// A fully buffered request as handed to the router.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    version: u8,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Request {
    pub(crate) fn new(
        method: Method,
        path: String,
        version: u8,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Self {
        let keep_alive = keep_alive_requested(version, &headers);
        Self {
            method,
            path,
            version,
            headers,
            body,
            keep_alive,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Request target as sent, including any query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Minor HTTP version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the request asked for the connection to be kept open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

/// Keep-alive: HTTP/1.1 default unless `Connection: close`; HTTP/1.0 only
/// with an explicit `Connection: keep-alive`.
fn keep_alive_requested(version: u8, headers: &[(String, String)]) -> bool {
    let connection = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("connection"))
        .map(|(_, v)| v.as_str());

    match connection {
        Some(value) => {
            if connection_has_token(value, "close") {
                false
            } else if connection_has_token(value, "keep-alive") {
                true
            } else {
                version >= 1
            }
        }
        None => version >= 1,
    }
}

fn connection_has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Try to extract one complete request from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, or the request plus the
/// number of bytes it occupied (header block and body).
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>, SessionError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let header_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(SessionError::Protocol(format!("malformed request: {e}"))),
    };

    let method_token = parsed.method.unwrap_or_default();
    let method = Method::from_token(method_token).ok_or_else(|| {
        SessionError::Protocol(format!("unsupported method: {method_token}"))
    })?;
    let path = parsed.path.unwrap_or_default().to_string();
    let version = parsed.version.unwrap_or(1);

    let header_pairs: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| {
                    SessionError::Protocol(format!("non-utf8 value for header {}", h.name))
                })?
                .to_string();
            Ok((h.name.to_string(), value))
        })
        .collect::<Result<_, SessionError>>()?;

    let body_len = content_length(&header_pairs)?;
    if body_len > MAX_BODY_SIZE {
        return Err(SessionError::Protocol(format!(
            "request body too large: {body_len} bytes"
        )));
    }

    let total = header_len + body_len;
    if buf.len() < total {
        return Ok(None);
    }

    let body = buf[header_len..total].to_vec();
    let request = Request::new(method, path, version, header_pairs, body);
    Ok(Some((request, total)))
}

fn content_length(headers: &[(String, String)]) -> Result<usize, SessionError> {
    match headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
    {
        Some((_, value)) => value
            .trim()
            .parse()
            .map_err(|_| SessionError::Protocol(format!("bad content-length: {value}"))),
        None => Ok(0),
    }
}
