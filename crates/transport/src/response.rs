//! NNTP status-line parsing.

use crate::error::{Result, TransportError};

/// One parsed status line, e.g. `240 <id@host> Article received ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub message: String,
}

impl Response {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end();
        if line.len() < 3 {
            return Err(TransportError::Protocol(format!("short status line: {line:?}")));
        }
        let code: u16 = line[..3]
            .parse()
            .map_err(|_| TransportError::Protocol(format!("bad status code: {line:?}")))?;
        let message = line.get(3..).unwrap_or("").trim_start().to_string();
        Ok(Self { code, message })
    }

    /// Multiline responses are terminated by a lone `.` line (RFC 3977
    /// lists which codes carry bodies; the ones this client issues are
    /// CAPABILITIES 101, ARTICLE 220, HEAD 221, BODY 222, LIST 215).
    pub fn is_multiline(&self) -> bool {
        matches!(self.code, 100 | 101 | 215 | 220 | 221 | 222 | 224 | 225 | 230 | 231)
    }

    /// First `<...>` token in the message, if any. Used for the 240
    /// response's server-assigned Message-ID.
    pub fn angle_token(&self) -> Option<&str> {
        let start = self.message.find('<')?;
        let end = self.message[start..].find('>')? + start;
        Some(&self.message[start..=end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_code_and_message() {
        let r = Response::parse("240 <abc@news.example.com> Article received ok\r\n").unwrap();
        assert_eq!(r.code, 240);
        assert_eq!(r.angle_token(), Some("<abc@news.example.com>"));
    }

    #[test]
    fn bare_code_is_valid() {
        let r = Response::parse("205").unwrap();
        assert_eq!(r.code, 205);
        assert!(r.message.is_empty());
        assert!(r.angle_token().is_none());
    }

    #[test]
    fn garbage_is_protocol_error() {
        assert!(Response::parse("ok").is_err());
        assert!(Response::parse("xyz hello").is_err());
    }

    #[test]
    fn multiline_detection() {
        assert!(Response::parse("220 1 <a@b> article").unwrap().is_multiline());
        assert!(!Response::parse("223 1 <a@b> exists").unwrap().is_multiline());
        assert!(!Response::parse("240 ok").unwrap().is_multiline());
    }
}
