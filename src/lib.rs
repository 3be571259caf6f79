//! A small web form that relays email through an authenticated SMTP server.
//!
//! [`submit`] runs one submission end to end. [`web::router`] exposes it
//! over HTTP.

pub mod address;
pub mod classify;
pub mod config;
mod connection;
pub mod message;
pub mod submit;
pub mod transport;
pub mod web;

pub use classify::{Category, Failure};
pub use config::{ConfigError, Settings, TransportConfig};
pub use connection::{SmtpConnection, SmtpConnector};
pub use message::{Attachment, MimeMessage, SubmissionRequest};
pub use submit::{submit, submit_with, Submission, SubmissionOutcome, ValidationError};
pub use transport::{Connector, Transport, TransportError};
