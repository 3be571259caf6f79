use super::protocol::{Line, Reply};
use crate::transport::TransportError;
use std::io::{self, Read};

/// Longest reply line we accept; RFC 5321 says 512 including CRLF.
const MAX_LINE: usize = 4096;

pub(crate) struct Parser<'a, T>
where
    T: Read,
{
    pub(crate) stream: &'a mut T,
}

impl<'a, T> Parser<'a, T>
where
    T: Read,
{
    pub(crate) fn new(stream: &'a mut T) -> Parser<'a, T> {
        Parser { stream }
    }

    /// Reads byte by byte so nothing past the reply is consumed; the STARTTLS
    /// upgrade depends on that.
    pub(crate) fn recv_byte(&mut self) -> Result<u8, TransportError> {
        let mut buf = [0u8; 1];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(_) => return Ok(buf[0]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::from_io(err)),
            }
        }
    }

    pub(crate) fn recv_raw_line(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut raw = vec![];
        loop {
            let byte = self.recv_byte()?;
            if byte == b'\n' {
                if raw.last() == Some(&b'\r') {
                    raw.pop();
                }
                return Ok(raw);
            }
            raw.push(byte);
            if raw.len() > MAX_LINE {
                return Err(TransportError::Protocol("reply line too long".to_owned()));
            }
        }
    }

    pub(crate) fn recv_line(&mut self) -> Result<Line, TransportError> {
        let raw = self.recv_raw_line()?;
        parse_line(&raw)
    }

    pub(crate) fn recv_reply(&mut self) -> Result<Reply, TransportError> {
        let first = self.recv_line()?;
        let code = first.code();
        let mut last = first.last();
        let mut lines = vec![first];
        while !last {
            let line = self.recv_line()?;
            if line.code() != code {
                return Err(TransportError::Protocol(format!(
                    "reply code changed from {code} to {} mid-reply",
                    line.code()
                )));
            }
            last = line.last();
            lines.push(line);
        }
        Ok(Reply::new(lines))
    }
}

/// `NNN text`, `NNN-text` or a bare `NNN`.
pub(crate) fn parse_line(raw: &[u8]) -> Result<Line, TransportError> {
    let malformed = || {
        TransportError::Protocol(format!(
            "malformed reply line {:?}",
            String::from_utf8_lossy(raw)
        ))
    };

    let digits = raw.get(..3).ok_or_else(malformed)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(malformed());
    }
    let code = digits
        .iter()
        .fold(0u16, |acc, digit| acc * 10 + u16::from(digit - b'0'));

    match raw.get(3) {
        None => Ok(Line::new(code, vec![], true)),
        Some(b' ') => Ok(Line::new(code, raw[4..].to_vec(), true)),
        Some(b'-') => Ok(Line::new(code, raw[4..].to_vec(), false)),
        Some(_) => Err(malformed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reply(input: &[u8]) -> Result<Reply, TransportError> {
        let mut cursor = Cursor::new(input.to_vec());
        Parser::new(&mut cursor).recv_reply()
    }

    #[test]
    fn single_line() {
        let reply = reply(b"220 mail.example.com ESMTP ready\r\n").unwrap();
        assert_eq!(reply.code(), 220);
        assert_eq!(reply.text(), b"mail.example.com ESMTP ready".to_vec());
    }

    #[test]
    fn multi_line() {
        let reply = reply(b"250-mail.example.com\r\n250-SIZE 1000\r\n250 AUTH PLAIN\r\n").unwrap();
        assert_eq!(reply.code(), 250);
        assert_eq!(reply.lines().len(), 3);
        assert_eq!(reply.text(), b"mail.example.com\nSIZE 1000\nAUTH PLAIN".to_vec());
    }

    #[test]
    fn bare_code_and_bare_lf() {
        let reply = reply(b"354\n").unwrap();
        assert_eq!(reply.code(), 354);
        assert!(reply.text().is_empty());
    }

    #[test]
    fn stops_at_end_of_reply() {
        let mut cursor = Cursor::new(b"250 ok\r\nleftover".to_vec());
        Parser::new(&mut cursor).recv_reply().unwrap();
        assert_eq!(cursor.position(), 8);
    }

    #[test]
    fn invalid_bytes_survive() {
        let reply = reply(b"550 bad \xff\xfe user\r\n").unwrap();
        assert_eq!(reply.code(), 550);
        assert_eq!(reply.text(), b"bad \xff\xfe user".to_vec());
    }

    #[test]
    fn eof_is_a_disconnect() {
        assert!(matches!(reply(b""), Err(TransportError::Disconnected)));
        assert!(matches!(reply(b"250-partial\r\n"), Err(TransportError::Disconnected)));
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(reply(b"hello\r\n"), Err(TransportError::Protocol(_))));
        assert!(matches!(reply(b"25\r\n"), Err(TransportError::Protocol(_))));
        assert!(matches!(reply(b"250x\r\n"), Err(TransportError::Protocol(_))));
        assert!(matches!(
            reply(b"250-one\r\n550 two\r\n"),
            Err(TransportError::Protocol(_))
        ));
    }
}
