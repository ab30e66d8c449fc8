//! Response model and HTTP/1.1 serialization.

use serde::Serialize;

/// An ordinary (non-upgrade) response.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    content_type: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    /// Empty response with the given status code.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            content_type: "text/html".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// 200 with a plain-text body.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; charset=utf-8".to_string(),
            headers: Vec::new(),
            body: text.into().into_bytes(),
        }
    }

    /// 200 with a JSON body. Serialization failure degrades to a 500.
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status: 200,
                content_type: "application/json".to_string(),
                headers: Vec::new(),
                body,
            },
            Err(e) => Self::error(&format!("response serialization failed: {e}")),
        }
    }

    /// 301 redirect to `location`.
    pub fn redirect(location: &str) -> Self {
        Response::new(301).with_header("Location", location)
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain; charset=utf-8".to_string(),
            headers: Vec::new(),
            body: b"not found".to_vec(),
        }
    }

    pub fn bad_request() -> Self {
        Self {
            status: 400,
            content_type: "text/plain; charset=utf-8".to_string(),
            headers: Vec::new(),
            body: b"bad request".to_vec(),
        }
    }

    /// 500 with a plain-text reason.
    pub fn error(message: &str) -> Self {
        Self {
            status: 500,
            content_type: "text/plain; charset=utf-8".to_string(),
            headers: Vec::new(),
            body: message.as_bytes().to_vec(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize as HTTP/1.1 bytes. `keep_alive` picks the Connection header
    /// the server actually intends to honor.
    pub(crate) fn serialize(&self, keep_alive: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n\
                 Content-Type: {}\r\n\
                 Content-Length: {}\r\n\
                 Connection: {}\r\n",
                self.status,
                reason_phrase(self.status),
                self.content_type,
                self.body.len(),
                if keep_alive { "keep-alive" } else { "close" },
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}
