use std::fmt;

use base64::{engine::general_purpose, Engine};

use crate::transport::TransportError;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) enum StatusCode {
    ServiceReady = 220,
    ServiceClosingChannel = 221,
    AuthSuccess = 235,
    Okay = 250,
    UserNotLocal = 251,
    ServerChallenge = 334,
    StartMailInput = 354,
    ServiceNotAvailable = 421,
}

impl PartialEq<StatusCode> for u16 {
    fn eq(&self, other: &StatusCode) -> bool {
        *self == *other as u16
    }
}

/// One line of a server reply, text kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Line {
    code: u16,
    text: Vec<u8>,
    last: bool,
}

impl Line {
    pub(crate) fn new(code: u16, text: Vec<u8>, last: bool) -> Line {
        Line { code, text, last }
    }
    pub(crate) fn code(&self) -> u16 {
        self.code
    }
    pub(crate) fn text(&self) -> &[u8] {
        &self.text
    }
    pub(crate) fn last(&self) -> bool {
        self.last
    }
}

/// A complete, possibly multi-line, reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    lines: Vec<Line>,
}

impl Reply {
    pub(crate) fn new(lines: Vec<Line>) -> Reply {
        Reply { lines }
    }
    pub(crate) fn code(&self) -> u16 {
        self.lines.first().map_or(0, Line::code)
    }
    pub(crate) fn lines(&self) -> &[Line] {
        &self.lines
    }
    /// All line texts joined with `\n`.
    pub(crate) fn text(&self) -> Vec<u8> {
        self.lines
            .iter()
            .map(Line::text)
            .collect::<Vec<_>>()
            .join(&b'\n')
    }
    pub(crate) fn is(&self, code: StatusCode) -> bool {
        self.code() == code
    }
}

pub(crate) enum EhloLine {
    StartTls,
    Auth,
    Size,
}

impl EhloLine {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            EhloLine::StartTls => "STARTTLS",
            EhloLine::Auth => "AUTH",
            EhloLine::Size => "SIZE",
        }
    }

    /// Expects an upper-cased keyword.
    fn from_keyword(keyword: &str) -> Option<EhloLine> {
        match keyword {
            "STARTTLS" => Some(EhloLine::StartTls),
            "AUTH" => Some(EhloLine::Auth),
            "SIZE" => Some(EhloLine::Size),
            _ => None,
        }
    }
}

impl fmt::Display for EhloLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) enum AuthMech {
    Plain,
    Login,
}

impl AuthMech {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            AuthMech::Plain => "PLAIN",
            AuthMech::Login => "LOGIN",
        }
    }

    fn from_keyword(keyword: &str) -> Option<AuthMech> {
        match keyword {
            "PLAIN" => Some(AuthMech::Plain),
            "LOGIN" => Some(AuthMech::Login),
            _ => None,
        }
    }
}

impl fmt::Display for AuthMech {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the server advertised in its EHLO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Extensions {
    pub(crate) starttls: bool,
    /// The advertised message size limit. `Some(0)` when SIZE is offered
    /// without a fixed maximum.
    pub(crate) size: Option<usize>,
    pub(crate) auth: Vec<AuthMech>,
}

impl Extensions {
    /// The first line is the server's greeting, not an extension.
    pub(crate) fn parse(reply: &Reply) -> Extensions {
        let mut extensions = Extensions::default();
        for line in reply.lines().iter().skip(1) {
            let text = String::from_utf8_lossy(line.text()).to_uppercase();
            let mut words = text.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };
            match EhloLine::from_keyword(keyword) {
                Some(EhloLine::StartTls) => extensions.starttls = true,
                Some(EhloLine::Size) => {
                    let limit = words.next().and_then(|size| size.parse().ok());
                    extensions.size = Some(limit.unwrap_or(0));
                }
                Some(EhloLine::Auth) => {
                    for mech in words.filter_map(AuthMech::from_keyword) {
                        if !extensions.auth.contains(&mech) {
                            extensions.auth.push(mech);
                        }
                    }
                }
                None => {}
            }
        }
        extensions
    }

    /// PLAIN if offered, LOGIN otherwise.
    pub(crate) fn preferred_auth(&self) -> Option<AuthMech> {
        [AuthMech::Plain, AuthMech::Login]
            .into_iter()
            .find(|mech| self.auth.contains(mech))
    }
}

pub(crate) enum Command {
    Ehlo(String),
    Helo(String),
    Quit,
    StartTls,
    /// Sender plus the message size, sent when the server advertises SIZE.
    MailFrom(String, Option<usize>),
    RcptTo(String),
    Data,
    Rset,
    AuthPlain(String, String),
    AuthLogin,
    /// A bare base64 line answering an AUTH LOGIN challenge.
    AuthResponse(String),
}

pub(crate) fn get_auth_plain(username: &str, password: &str) -> String {
    let mut s = vec![0u8];
    s.extend_from_slice(username.as_bytes());
    s.push(0u8);
    s.extend_from_slice(password.as_bytes());
    general_purpose::STANDARD.encode(s)
}

pub(crate) fn get_auth_login(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

/// Refuses text that would end the command line early.
pub(crate) fn check_argument(argument: &str) -> Result<(), TransportError> {
    if argument.contains(['\r', '\n']) {
        Err(TransportError::InvalidArgument(argument.to_owned()))
    } else {
        Ok(())
    }
}

impl Command {
    /// Arguments are written verbatim; AUTH payloads are base64 and always safe.
    pub(crate) fn validate(&self) -> Result<(), TransportError> {
        match self {
            Command::Ehlo(arg)
            | Command::Helo(arg)
            | Command::MailFrom(arg, _)
            | Command::RcptTo(arg) => check_argument(arg),
            _ => Ok(()),
        }
    }

    /// The command as it appears in logs, credentials masked.
    pub(crate) fn redacted(&self) -> String {
        match self {
            Command::AuthPlain(..) => "AUTH PLAIN <redacted>".to_owned(),
            Command::AuthResponse(_) => "<redacted>".to_owned(),
            _ => self.to_string().trim_end().to_owned(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Data => write!(f, "DATA"),
            Command::Ehlo(me) => write!(f, "EHLO {me}"),
            Command::Helo(me) => write!(f, "HELO {me}"),
            Command::StartTls => write!(f, "STARTTLS"),
            Command::Quit => write!(f, "QUIT"),
            Command::Rset => write!(f, "RSET"),
            Command::MailFrom(from, None) => write!(f, "MAIL FROM:<{from}>"),
            Command::MailFrom(from, Some(size)) => write!(f, "MAIL FROM:<{from}> SIZE={size}"),
            Command::RcptTo(to) => write!(f, "RCPT TO:<{to}>"),
            Command::AuthPlain(un, pw) => write!(f, "AUTH PLAIN {}", get_auth_plain(un, pw)),
            Command::AuthLogin => write!(f, "AUTH LOGIN"),
            Command::AuthResponse(token) => write!(f, "{}", get_auth_login(token)),
        }?;
        f.write_str("\r\n")
    }
}

/// Doubles leading dots and turns bare LF into CRLF so the payload can't
/// end the DATA section early. The result always ends in CRLF.
pub(crate) fn dot_stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 64 + 2);
    let mut line_start = true;
    let mut prev = 0u8;
    for &byte in payload {
        if line_start && byte == b'.' {
            out.push(b'.');
        }
        if byte == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        line_start = byte == b'\n';
        prev = byte;
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}
