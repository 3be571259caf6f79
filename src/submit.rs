use std::ops::{Deref, DerefMut};

use tracing::{debug, error, info, warn};

use crate::{
    address::{self, AddressError},
    classify::{self, Context, Failure},
    config::TransportConfig,
    connection::SmtpConnector,
    message::{self, Attachment, MimeMessage, SubmissionRequest},
    transport::{Connector, Transport, TransportError},
};

/// The form as it was posted, nothing checked yet.
#[derive(Debug, Default)]
pub struct Submission {
    pub display_name: String,
    pub from_email: String,
    pub to_email: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Please fill in the {} fields.", quote_fields(.0))]
    MissingFields(Vec<&'static str>),
    #[error("Recipient email ('To') cannot be empty.")]
    NoRecipients,
    #[error("Invalid email format detected for: {}", .0.join(", "))]
    Recipients(Vec<String>),
    #[error("Invalid format for 'From Email': '{0}'")]
    Sender(String),
    #[error("The '{0}' field must not contain line breaks.")]
    LineBreak(&'static str),
}

fn quote_fields(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|field| format!("'{field}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<AddressError> for ValidationError {
    fn from(err: AddressError) -> Self {
        match err {
            AddressError::EmptyInput => ValidationError::NoRecipients,
            AddressError::InvalidFormat(invalid) => ValidationError::Recipients(invalid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Success { recipients: Vec<String> },
    Failure(Failure),
}

impl SubmissionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SubmissionOutcome::Success { .. })
    }
}

impl From<Failure> for SubmissionOutcome {
    fn from(failure: Failure) -> Self {
        SubmissionOutcome::Failure(failure)
    }
}

/// Holds an open transport and says QUIT when dropped.
struct Session<T: Transport> {
    transport: T,
}

impl<T: Transport> Deref for Session<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> DerefMut for Session<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        match self.transport.quit() {
            Ok(()) => debug!("connection closed"),
            Err(TransportError::Disconnected) => debug!("server already gone at close"),
            Err(err) => error!(error = %err, "failed to close SMTP connection"),
        }
    }
}

fn validate(submission: &mut Submission) -> Result<SubmissionRequest, ValidationError> {
    let mut missing = vec![];
    for (field, value) in [
        ("From Email", &submission.from_email),
        ("To", &submission.to_email),
        ("Subject", &submission.subject),
        ("Body", &submission.body),
    ] {
        if value.trim().is_empty() {
            missing.push(field);
        }
    }
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(missing));
    }

    // these end up in headers or on the SMTP command line
    for (field, value) in [
        ("Display Name", &submission.display_name),
        ("From Email", &submission.from_email),
        ("To", &submission.to_email),
        ("Subject", &submission.subject),
    ] {
        if value.contains(['\r', '\n']) {
            return Err(ValidationError::LineBreak(field));
        }
    }

    let to_addresses = address::validate_recipients(&submission.to_email)?;

    let from_address = submission.from_email.trim();
    if address::validate_single_address(from_address).is_err() {
        return Err(ValidationError::Sender(from_address.to_owned()));
    }

    let display_name = submission.display_name.trim();
    Ok(SubmissionRequest {
        display_name: (!display_name.is_empty()).then(|| display_name.to_owned()),
        from_address: from_address.to_owned(),
        to_addresses,
        subject: submission.subject.clone(),
        body: submission.body.clone(),
        attachments: std::mem::take(&mut submission.attachments),
    })
}

fn deliver<C: Connector>(
    connector: &C,
    config: &TransportConfig,
    message: &MimeMessage,
) -> Result<Vec<String>, TransportError> {
    info!(
        host = %config.host,
        port = config.port,
        implicit_tls = config.use_ssl,
        starttls = config.use_tls && !config.use_ssl,
        "connecting"
    );
    let mut session = Session {
        transport: connector.connect(config)?,
    };
    session.handshake()?;

    info!(username = %config.username, "logging in");
    session.login(&config.username, &config.password)?;

    let envelope = message.envelope();
    info!(
        sender = %envelope.sender,
        recipients = ?envelope.recipients,
        size = message.as_bytes().len(),
        "sending message"
    );
    session.send(message)
}

/// Sends a submission through the SMTP server described by `config`.
pub fn submit(submission: Submission, config: &TransportConfig) -> SubmissionOutcome {
    submit_with(submission, config, &SmtpConnector)
}

/// Like [`submit`], with the transport factory supplied by the caller.
///
/// Configuration and input problems are reported before the connector is
/// ever called. Whatever happens after that, the connection is closed
/// before this returns and a failure to close never changes the outcome.
pub fn submit_with<C: Connector>(
    mut submission: Submission,
    config: &TransportConfig,
    connector: &C,
) -> SubmissionOutcome {
    if let Err(err) = config.validate() {
        error!(error = %err, "refusing to send with invalid configuration");
        return Failure::from(&err).into();
    }

    let mut request = match validate(&mut submission) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "rejected submission");
            return Failure::from(&err).into();
        }
    };

    let message = match message::build(&mut request) {
        Ok(message) => message,
        Err(err) => {
            error!(error = ?err, "failed to build message");
            return Failure::from(&err).into();
        }
    };

    match deliver(connector, config, &message) {
        Ok(recipients) => {
            info!(?recipients, "message sent");
            SubmissionOutcome::Success { recipients }
        }
        Err(err) => {
            let failure = classify::classify(
                &err,
                &Context {
                    host: &config.host,
                    port: config.port,
                    username: &config.username,
                    from_address: &request.from_address,
                },
            );
            error!(
                kind = err.kind_name(),
                error = %err,
                detail = %failure.message,
                "delivery failed"
            );
            failure.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, cell::RefCell, io, rc::Rc, time::Duration};

    use super::*;
    use crate::{classify::Category, transport::RefusedRecipient};

    type Calls = Rc<RefCell<Vec<&'static str>>>;

    #[derive(Default)]
    struct Script {
        handshake: Option<TransportError>,
        login: Option<TransportError>,
        send: Option<TransportError>,
        quit: Option<TransportError>,
    }

    struct MockTransport {
        script: Script,
        calls: Calls,
    }

    fn step(calls: &Calls, name: &'static str, err: Option<TransportError>) -> Result<(), TransportError> {
        calls.borrow_mut().push(name);
        err.map_or(Ok(()), Err)
    }

    impl Transport for MockTransport {
        fn handshake(&mut self) -> Result<(), TransportError> {
            step(&self.calls, "handshake", self.script.handshake.take())
        }

        fn login(&mut self, _: &str, _: &str) -> Result<(), TransportError> {
            step(&self.calls, "login", self.script.login.take())
        }

        fn send(&mut self, message: &MimeMessage) -> Result<Vec<String>, TransportError> {
            step(&self.calls, "send", self.script.send.take())?;
            Ok(message.envelope().recipients.clone())
        }

        fn quit(&mut self) -> Result<(), TransportError> {
            step(&self.calls, "quit", self.script.quit.take())
        }
    }

    #[derive(Default)]
    struct MockConnector {
        connect_error: Cell<Option<TransportError>>,
        script: Cell<Option<Script>>,
        calls: Calls,
    }

    impl MockConnector {
        fn scripted(script: Script) -> MockConnector {
            MockConnector {
                script: Cell::new(Some(script)),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.borrow().clone()
        }
    }

    impl Connector for MockConnector {
        type Transport = MockTransport;

        fn connect(&self, _: &TransportConfig) -> Result<MockTransport, TransportError> {
            self.calls.borrow_mut().push("connect");
            if let Some(err) = self.connect_error.take() {
                return Err(err);
            }
            Ok(MockTransport {
                script: self.script.take().unwrap_or_default(),
                calls: Rc::clone(&self.calls),
            })
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            host: "smtp.example.com".to_owned(),
            port: 587,
            username: "relay@example.com".to_owned(),
            password: "hunter2".to_owned(),
            use_tls: true,
            use_ssl: false,
            timeout: Duration::from_secs(20),
            helo_name: "localhost".to_owned(),
        }
    }

    fn submission() -> Submission {
        Submission {
            display_name: " Jane Doe ".to_owned(),
            from_email: "jane@example.com".to_owned(),
            to_email: "x@y.com, z@w.org, ok@fine.net".to_owned(),
            subject: "Hello".to_owned(),
            body: "Hi there".to_owned(),
            attachments: vec![],
        }
    }

    fn failure(outcome: SubmissionOutcome) -> Failure {
        match outcome {
            SubmissionOutcome::Failure(failure) => failure,
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn success_returns_recipients_and_closes() {
        let connector = MockConnector::default();
        let outcome = submit_with(submission(), &config(), &connector);
        assert_eq!(
            outcome,
            SubmissionOutcome::Success {
                recipients: vec![
                    "x@y.com".to_owned(),
                    "z@w.org".to_owned(),
                    "ok@fine.net".to_owned()
                ]
            }
        );
        assert_eq!(connector.calls(), ["connect", "handshake", "login", "send", "quit"]);
    }

    #[test]
    fn tls_and_ssl_never_connect() {
        let connector = MockConnector::default();
        let mut config = config();
        config.use_ssl = true;
        let failure = failure(submit_with(submission(), &config, &connector));
        assert_eq!(failure.category, Category::ConfigError);
        assert!(connector.calls().is_empty());
    }

    #[test]
    fn missing_credentials_never_connect() {
        let connector = MockConnector::default();
        let mut config = config();
        config.password.clear();
        let failure = failure(submit_with(submission(), &config, &connector));
        assert_eq!(failure.category, Category::ConfigError);
        assert!(failure.message.contains("SMTP_PASSWORD"));
        assert!(connector.calls().is_empty());
    }

    #[test]
    fn input_problems_never_connect() {
        let cases = [
            (
                Submission {
                    subject: "  ".to_owned(),
                    body: String::new(),
                    ..submission()
                },
                "Please fill in the 'Subject', 'Body' fields.",
            ),
            (
                Submission {
                    to_email: " , ".to_owned(),
                    ..submission()
                },
                "Recipient email ('To') cannot be empty.",
            ),
            (
                Submission {
                    to_email: "good@ok.com, nope".to_owned(),
                    ..submission()
                },
                "Invalid email format detected for: nope",
            ),
            (
                Submission {
                    from_email: "jane-at-example".to_owned(),
                    ..submission()
                },
                "Invalid format for 'From Email': 'jane-at-example'",
            ),
            (
                Submission {
                    to_email: "victim@b.com>\r\nRSET\r\nRCPT TO:<x@y.com".to_owned(),
                    ..submission()
                },
                "The 'To' field must not contain line breaks.",
            ),
            (
                Submission {
                    from_email: "me@x.com>\r\nNOOP <z".to_owned(),
                    ..submission()
                },
                "The 'From Email' field must not contain line breaks.",
            ),
            (
                Submission {
                    subject: "Hi\r\nBcc: hidden@evil.com".to_owned(),
                    ..submission()
                },
                "The 'Subject' field must not contain line breaks.",
            ),
            (
                Submission {
                    display_name: "Jane\nBcc: hidden@evil.com".to_owned(),
                    ..submission()
                },
                "The 'Display Name' field must not contain line breaks.",
            ),
        ];
        for (submission, message) in cases {
            let connector = MockConnector::default();
            let failure = failure(submit_with(submission, &config(), &connector));
            assert_eq!(failure.category, Category::ValidationError);
            assert_eq!(failure.message, message);
            assert!(connector.calls().is_empty());
        }
    }

    #[test]
    fn unreadable_attachment_never_connects() {
        struct Unreadable;
        impl io::Read for Unreadable {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "gone"))
            }
        }
        impl io::Seek for Unreadable {
            fn seek(&mut self, _: io::SeekFrom) -> io::Result<u64> {
                Ok(0)
            }
        }

        let connector = MockConnector::default();
        let submission = Submission {
            attachments: vec![Attachment::new("plan.txt", Unreadable)],
            ..submission()
        };
        let failure = failure(submit_with(submission, &config(), &connector));
        assert_eq!(failure.category, Category::AttachmentError);
        assert!(failure.message.contains("'plan.txt'"));
        assert!(connector.calls().is_empty());
    }

    #[test]
    fn refused_recipients_are_never_success() {
        let connector = MockConnector::scripted(Script {
            send: Some(TransportError::RecipientsRefused(vec![
                RefusedRecipient {
                    address: "x@y.com".to_owned(),
                    code: 550,
                    text: b"no such user".to_vec(),
                },
                RefusedRecipient {
                    address: "z@w.org".to_owned(),
                    code: 551,
                    text: b"not local".to_vec(),
                },
            ])),
            ..Default::default()
        });
        let failure = failure(submit_with(submission(), &config(), &connector));
        assert_eq!(failure.category, Category::RecipientsRefused);
        assert!(failure.message.contains("x@y.com: 550 no such user"));
        assert!(failure.message.contains("z@w.org: 551 not local"));
        assert!(!failure.message.contains("ok@fine.net"));
        assert_eq!(connector.calls().last(), Some(&"quit"));
    }

    #[test]
    fn close_failure_does_not_mask_outcome() {
        let connector = MockConnector::scripted(Script {
            quit: Some(TransportError::Network(io::Error::new(
                io::ErrorKind::Other,
                "socket exploded",
            ))),
            ..Default::default()
        });
        assert!(submit_with(submission(), &config(), &connector).is_success());

        let connector = MockConnector::scripted(Script {
            send: Some(TransportError::Data {
                code: 554,
                text: b"rejected".to_vec(),
            }),
            quit: Some(TransportError::Disconnected),
            ..Default::default()
        });
        let failure = failure(submit_with(submission(), &config(), &connector));
        assert_eq!(failure.category, Category::DataError);
    }

    #[test]
    fn connect_failure_skips_close() {
        let connector = MockConnector {
            connect_error: Cell::new(Some(TransportError::Timeout)),
            ..Default::default()
        };
        let failure = failure(submit_with(submission(), &config(), &connector));
        assert_eq!(failure.category, Category::TimeoutError);
        assert_eq!(connector.calls(), ["connect"]);
    }

    #[test]
    fn auth_failure_stops_before_send() {
        let connector = MockConnector::scripted(Script {
            login: Some(TransportError::Auth {
                code: 535,
                text: b"bad credentials".to_vec(),
            }),
            ..Default::default()
        });
        let failure = failure(submit_with(submission(), &config(), &connector));
        assert_eq!(failure.category, Category::AuthError);
        assert!(!failure.message.contains("hunter2"));
        assert_eq!(connector.calls(), ["connect", "handshake", "login", "quit"]);
    }

    #[test]
    fn blank_display_name_is_dropped() {
        let mut submission = Submission {
            display_name: "   ".to_owned(),
            ..submission()
        };
        let request = validate(&mut submission).unwrap();
        assert_eq!(request.display_name, None);
        assert_eq!(request.from_address, "jane@example.com");
    }
}
