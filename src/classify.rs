//! Turns failures into something we can show a user.
//!
//! Everything here is pure: no I/O, no logging. The orchestrator logs the
//! full error before asking for the sanitized version.

use std::fmt;

use crate::{
    config::ConfigError,
    message::MessageError,
    submit::ValidationError,
    transport::{RefusedRecipient, TransportError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    ConfigError,
    ValidationError,
    AttachmentError,
    ConnectError,
    TimeoutError,
    AuthError,
    Disconnected,
    HeloError,
    SenderRefused,
    RecipientsRefused,
    DataError,
    NetworkError,
    UnexpectedError,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A classified failure with its user-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub category: Category,
    pub message: String,
}

impl Failure {
    pub fn new(category: Category, message: impl Into<String>) -> Failure {
        Failure {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

/// What the classifier needs to know about the attempt.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub from_address: &'a str,
}

const DOMAIN_HINTS: [&str; 3] = [
    "domain not verified",
    "sender verification",
    "sender address rejected",
];

/// Decodes server text for display: invalid UTF-8 becomes U+FFFD, line
/// breaks and other control characters become spaces, ends are trimmed.
pub fn server_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_owned()
}

fn refused_list(refused: &[RefusedRecipient]) -> String {
    refused
        .iter()
        .map(|r| format!("{}: {} {}", r.address, r.code, server_text(&r.text)))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn classify(error: &TransportError, ctx: &Context<'_>) -> Failure {
    let Context {
        host,
        port,
        username,
        from_address,
    } = *ctx;

    match error {
        TransportError::Auth { .. } => Failure::new(
            Category::AuthError,
            "SMTP Authentication Error: Incorrect username or password. \
             Please check your configuration.",
        ),
        TransportError::Disconnected => Failure::new(
            Category::Disconnected,
            "SMTP Server Disconnected unexpectedly. \
             Please check server status and configuration.",
        ),
        TransportError::Connect { .. } => Failure::new(
            Category::ConnectError,
            format!(
                "SMTP Connection Error: Could not connect to {host}:{port}. \
                 Check server address, port, and firewall settings."
            ),
        ),
        TransportError::RecipientsRefused(refused) => Failure::new(
            Category::RecipientsRefused,
            format!(
                "Recipient(s) refused by server: {}. Check email addresses.",
                refused_list(refused)
            ),
        ),
        TransportError::Helo { code, text } => Failure::new(
            Category::HeloError,
            format!(
                "Server HELO/EHLO Error ({code}): {}. Check server configuration.",
                server_text(text)
            ),
        ),
        TransportError::SenderRefused { sender, code, text } => Failure::new(
            Category::SenderRefused,
            format!(
                "Sender address '{sender}' refused by server ({code}): '{}'. \
                 Check 'From Email' or server permissions \
                 (may need to use authenticated user '{username}' as sender).",
                server_text(text)
            ),
        ),
        TransportError::Data { code, text } => {
            let reason = server_text(text);
            let mut message =
                format!("Server Data Error ({code}): The server refused the message data.");
            if !reason.is_empty() {
                message.push_str(&format!(" Reason: '{reason}'"));
            }
            let lower = reason.to_lowercase();
            if DOMAIN_HINTS.iter().any(|hint| lower.contains(hint)) {
                message.push_str(&format!(
                    " Please ensure the 'From Email' address ('{from_address}') or its domain \
                     is verified or permitted by your email provider \
                     (e.g., in 'Verified Senders' settings)."
                ));
            }
            Failure::new(Category::DataError, message)
        }
        TransportError::Timeout => Failure::new(
            Category::TimeoutError,
            format!(
                "SMTP Timeout Error: The connection to {host}:{port} timed out. \
                 Check server address, port, and network connectivity."
            ),
        ),
        TransportError::Network(err) => Failure::new(
            Category::NetworkError,
            format!(
                "Network Error: Could not communicate with the server ({err}). \
                 Check network connection and firewall."
            ),
        ),
        TransportError::Tls(_)
        | TransportError::NotSupported(_)
        | TransportError::UnexpectedReply { .. }
        | TransportError::Protocol(_)
        | TransportError::InvalidArgument(_) => unexpected(error.kind_name()),
    }
}

pub fn unexpected(kind: &str) -> Failure {
    Failure::new(
        Category::UnexpectedError,
        format!(
            "An unexpected error occurred: {kind}. \
             Please check the application logs for details."
        ),
    )
}

impl From<&ConfigError> for Failure {
    fn from(err: &ConfigError) -> Self {
        Failure::new(Category::ConfigError, err.to_string())
    }
}

impl From<&ValidationError> for Failure {
    fn from(err: &ValidationError) -> Self {
        Failure::new(Category::ValidationError, err.to_string())
    }
}

impl From<&MessageError> for Failure {
    fn from(err: &MessageError) -> Self {
        match err {
            MessageError::Attachment { filename, .. } => Failure::new(
                Category::AttachmentError,
                format!("Error attaching file '{filename}'. Please try again or skip the file."),
            ),
            MessageError::Encode(_) => unexpected("MessageEncodeError"),
        }
    }
}
