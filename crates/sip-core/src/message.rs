//! SIP message parsing and response building
//!
//! Only the slice of SIP the connector needs: parse an incoming request's
//! request line, the headers we must mirror back (`Via`, `From`, `To`,
//! `Call-ID`, `CSeq`) and its body, and build the responses we emit
//! (200/4xx/5xx). Header names are matched case-insensitively per RFC 3261.

use std::fmt::Write as _;

use crate::error::{Error, Result};

/// A parsed SIP request
#[derive(Debug, Clone)]
pub struct SipRequest {
    /// Request method (INVITE, BYE, ...)
    pub method: String,
    /// Request URI
    pub uri: String,
    /// Headers in arrival order, `(name, value)`
    pub headers: Vec<(String, String)>,
    /// Message body (usually SDP)
    pub body: String,
}

impl SipRequest {
    /// Parse a UDP datagram as a SIP request
    pub fn parse(data: &str) -> Result<Self> {
        let (head, body) = match data.split_once("\r\n\r\n") {
            Some((head, body)) => (head, body),
            None => (data.trim_end_matches(['\r', '\n']), ""),
        };

        let mut lines = head.lines();
        let request_line = lines
            .next()
            .ok_or_else(|| Error::MalformedMessage("empty message".into()))?;

        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| Error::MalformedMessage("missing method".into()))?
            .to_string();
        let uri = parts
            .next()
            .ok_or_else(|| Error::MalformedMessage("missing request URI".into()))?
            .to_string();
        match parts.next() {
            Some(version) if version.starts_with("SIP/") => {}
            _ => return Err(Error::MalformedMessage("missing SIP version".into())),
        }

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::MalformedMessage(format!("bad header line: {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self { method, uri, headers, body: body.to_string() })
    }

    /// First header value matching `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `Call-ID` header
    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// Whether the body claims to be SDP (absent Content-Type counts as SDP
    /// when a body is present, which is what the switch sends)
    pub fn body_is_sdp(&self) -> bool {
        match self.header("Content-Type") {
            Some(ct) => ct.eq_ignore_ascii_case("application/sdp"),
            None => !self.body.is_empty(),
        }
    }
}

/// A SIP response under construction
#[derive(Debug, Clone)]
pub struct SipResponse {
    status: u16,
    reason: &'static str,
    headers: Vec<(String, String)>,
    body: String,
}

/// Reason phrase for the status codes the connector emits
fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        405 => "Method Not Allowed",
        415 => "Unsupported Media Type",
        481 => "Call/Transaction Does Not Exist",
        488 => "Not Acceptable Here",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

impl SipResponse {
    /// Start a response to `request`, mirroring the dialog headers.
    ///
    /// `to_tag` is appended to the `To` header when the request carries none,
    /// as the server half of the dialog requires.
    pub fn to_request(request: &SipRequest, status: u16, to_tag: Option<&str>) -> Self {
        let mut headers = Vec::new();
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = request.header(name) {
                let value = if name == "To" && !value.contains("tag=") {
                    match to_tag {
                        Some(tag) => format!("{value};tag={tag}"),
                        None => value.to_string(),
                    }
                } else {
                    value.to_string()
                };
                headers.push((name.to_string(), value));
            }
        }
        Self { status, reason: reason_phrase(status), headers, body: String::new() }
    }

    /// Add a header
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Add a `Contact` header for this service
    pub fn contact(self, user: &str, host: &str, port: u16) -> Self {
        self.header("Contact", format!("<sip:{user}@{host}:{port}>"))
    }

    /// Attach an SDP body (sets `Content-Type`)
    pub fn sdp_body(mut self, sdp: impl Into<String>) -> Self {
        self.body = sdp.into();
        self.header("Content-Type", "application/sdp")
    }

    /// Status code of the response
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Serialize to wire form with a correct `Content-Length`
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "SIP/2.0 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        let _ = write!(out, "Content-Length: {}\r\n\r\n", self.body.len());
        out.push_str(&self.body);
        out
    }
}
