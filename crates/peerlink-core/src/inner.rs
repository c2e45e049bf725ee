//! Text signaling message nested in control-plane payloads.
//!
//! Control envelopes (session id 0) carry a human-readable message: a start
//! line, `Name: value` headers, a blank line and a body. The library only
//! parses it far enough for handlers to route on; the negotiation semantics
//! live with the caller.

use std::fmt;

/// First line of a signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// `METHOD target VERSION`
    Request {
        /// Method, e.g. `INVITE`
        method: String,
        /// Request target
        target: String,
        /// Protocol tag
        version: String,
    },
    /// `VERSION code reason`
    Status {
        /// Protocol tag
        version: String,
        /// Status code
        code: u16,
        /// Reason phrase
        reason: String,
    },
}

impl StartLine {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(3, ' ');
        let first = parts.next()?;
        let second = parts.next()?;
        let third = parts.next().unwrap_or_default();

        if first.contains('/') {
            Some(Self::Status {
                version: first.to_string(),
                code: second.parse().ok()?,
                reason: third.to_string(),
            })
        } else {
            Some(Self::Request {
                method: first.to_string(),
                target: second.to_string(),
                version: third.to_string(),
            })
        }
    }
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request {
                method,
                target,
                version,
            } => write!(f, "{method} {target} {version}"),
            Self::Status {
                version,
                code,
                reason,
            } => write!(f, "{version} {code} {reason}"),
        }
    }
}

/// Parsed signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    /// Start line
    pub start_line: StartLine,
    /// Headers in wire order
    pub headers: Vec<(String, String)>,
    /// Body octets after the blank line
    pub body: Vec<u8>,
}

impl SignalingMessage {
    /// Build a request message
    #[must_use]
    pub fn request(method: &str, target: &str, version: &str) -> Self {
        Self {
            start_line: StartLine::Request {
                method: method.to_string(),
                target: target.to_string(),
                version: version.to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Build a status message
    #[must_use]
    pub fn status(version: &str, code: u16, reason: &str) -> Self {
        Self {
            start_line: StartLine::Status {
                version: version.to_string(),
                code,
                reason: reason.to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Set the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a payload; `None` if it is not a text signaling message
    #[must_use]
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let split = payload.windows(4).position(|w| w == b"\r\n\r\n")?;
        let head = std::str::from_utf8(&payload[..split]).ok()?;
        let body = payload[split + 4..].to_vec();

        let mut lines = head.split("\r\n");
        let start_line = StartLine::parse(lines.next()?)?;
        let headers = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Some(Self {
            start_line,
            headers,
            body,
        })
    }

    /// Encode to payload octets
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{}\r\n", self.start_line).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// First header value with a case-insensitive name match
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Method of a request message
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Status { .. } => None,
        }
    }

    /// Code of a status message
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Status { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE MSNMSGR:bob@example.com MSNSLP/1.0\r\n\
To: <msnmsgr:bob@example.com>\r\n\
Call-ID: {1234}\r\n\
Content-Length: 5\r\n\
\r\n\
hello";

    #[test]
    fn test_parse_request() {
        let msg = SignalingMessage::parse(INVITE).unwrap();
        assert_eq!(msg.method(), Some("INVITE"));
        assert_eq!(msg.header("call-id"), Some("{1234}"));
        assert_eq!(msg.body, b"hello");
        assert_eq!(msg.to_bytes(), INVITE);
    }

    #[test]
    fn test_parse_status() {
        let msg = SignalingMessage::status("MSNSLP/1.0", 200, "OK").with_header("CSeq", "1");
        let parsed = SignalingMessage::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.status_code(), Some(200));
        assert_eq!(parsed.method(), None);
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_binary_payload_is_not_signaling() {
        assert!(SignalingMessage::parse(&[0, 0, 0, 0]).is_none());
        assert!(SignalingMessage::parse(b"no blank line").is_none());
        assert!(SignalingMessage::parse(b"\xff\xfe x\r\n\r\n").is_none());
    }
}
