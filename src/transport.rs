use std::io;

use crate::{config::TransportConfig, message::MimeMessage};

/// A recipient the server would not accept during RCPT TO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefusedRecipient {
    pub address: String,
    pub code: u16,
    pub text: Vec<u8>,
}

/// Everything that can go wrong once we start talking to the mail server.
///
/// Server texts are kept as the raw bytes we received; the classifier decides
/// how to present them.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("could not connect: {reason}")]
    Connect { reason: String },
    #[error("timed out")]
    Timeout,
    #[error("authentication rejected ({code})")]
    Auth { code: u16, text: Vec<u8> },
    #[error("server disconnected")]
    Disconnected,
    #[error("HELO/EHLO rejected ({code})")]
    Helo { code: u16, text: Vec<u8> },
    #[error("sender <{sender}> refused ({code})")]
    SenderRefused {
        sender: String,
        code: u16,
        text: Vec<u8>,
    },
    #[error("{} recipient(s) refused", .0.len())]
    RecipientsRefused(Vec<RefusedRecipient>),
    #[error("message data refused ({code})")]
    Data { code: u16, text: Vec<u8> },
    #[error(transparent)]
    Network(io::Error),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("server does not support {0}")]
    NotSupported(&'static str),
    #[error("unexpected reply to {command} ({code})")]
    UnexpectedReply {
        command: &'static str,
        code: u16,
        text: Vec<u8>,
    },
    #[error("malformed reply: {0}")]
    Protocol(String),
    #[error("line break in command argument {0:?}")]
    InvalidArgument(String),
}

impl TransportError {
    /// Sorts an I/O failure on an established connection.
    pub fn from_io(err: io::Error) -> TransportError {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TransportError::Disconnected,
            _ => TransportError::Network(err),
        }
    }

    /// Short name shown to users for faults we have no better words for.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TransportError::Connect { .. } => "ConnectError",
            TransportError::Timeout => "TimeoutError",
            TransportError::Auth { .. } => "AuthError",
            TransportError::Disconnected => "Disconnected",
            TransportError::Helo { .. } => "HeloError",
            TransportError::SenderRefused { .. } => "SenderRefused",
            TransportError::RecipientsRefused(_) => "RecipientsRefused",
            TransportError::Data { .. } => "DataError",
            TransportError::Network(_) => "NetworkError",
            TransportError::Tls(_) => "TlsError",
            TransportError::NotSupported(_) => "NotSupportedError",
            TransportError::UnexpectedReply { .. } => "UnexpectedReplyError",
            TransportError::Protocol(_) => "ProtocolError",
            TransportError::InvalidArgument(_) => "InvalidArgumentError",
        }
    }
}

/// An open mail session.
pub trait Transport {
    /// Greeting, EHLO and, when configured, the STARTTLS upgrade.
    fn handshake(&mut self) -> Result<(), TransportError>;
    fn login(&mut self, username: &str, password: &str) -> Result<(), TransportError>;
    /// Returns the recipients the server accepted.
    fn send(&mut self, message: &MimeMessage) -> Result<Vec<String>, TransportError>;
    fn quit(&mut self) -> Result<(), TransportError>;
}

/// Opens sessions. The production implementation dials the SMTP server.
pub trait Connector {
    type Transport: Transport;

    fn connect(&self, config: &TransportConfig) -> Result<Self::Transport, TransportError>;
}
