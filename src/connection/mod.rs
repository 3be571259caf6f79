mod parser;
mod protocol;

use crate::{
    config::TransportConfig,
    message::MimeMessage,
    transport::{Connector, RefusedRecipient, Transport, TransportError},
};
use parser::Parser;
use protocol::{check_argument, dot_stuff, AuthMech, Command, Extensions, Reply, StatusCode};
use std::io::{self, Write};
use std::iter;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::{OwnedTrustAnchor, RootCertStore};
use tracing::{debug, trace};

type TlsCon = rustls::ClientConnection;

fn create_tls_conn(server_address: &str) -> Result<TlsCon, TransportError> {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let name = rustls::ServerName::try_from(server_address)
        .map_err(|err| TransportError::Tls(format!("{server_address}: {err}")))?;
    TlsCon::new(Arc::new(config), name).map_err(|err| TransportError::Tls(err.to_string()))
}

/// Dials every resolved address in turn within the timeout.
fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransportError> {
    let addresses = (host, port)
        .to_socket_addrs()
        .map_err(|err| TransportError::Connect {
            reason: format!("failed to resolve {host}: {err}"),
        })?;

    let mut last_err = None;
    for address in addresses {
        debug!(%address, "dialing");
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }

    Err(match last_err {
        Some(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
            TransportError::Timeout
        }
        Some(err) => TransportError::Connect {
            reason: err.to_string(),
        },
        None => TransportError::Connect {
            reason: format!("{host} did not resolve to any address"),
        },
    })
}

pub(crate) struct Server {
    pub(crate) address: String,
    pub(crate) port: u16,
    pub(crate) extensions: Extensions,
}

/// Opens [`SmtpConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpConnector;

impl Connector for SmtpConnector {
    type Transport = SmtpConnection;

    fn connect(&self, config: &TransportConfig) -> Result<SmtpConnection, TransportError> {
        SmtpConnection::open(config)
    }
}

/// A blocking SMTP client session.
///
/// With implicit TLS the rustls session exists from the start; otherwise it
/// is installed after a successful STARTTLS.
pub struct SmtpConnection {
    name: String,
    server: Server,
    starttls: bool,
    tlscon: Option<TlsCon>,
    stream: TcpStream,
    open: bool,
}

impl SmtpConnection {
    pub fn open(config: &TransportConfig) -> Result<SmtpConnection, TransportError> {
        let stream = connect_tcp(&config.host, config.port, config.timeout)?;
        let mut connection = SmtpConnection {
            name: config.helo_name.clone(),
            server: Server {
                address: config.host.clone(),
                port: config.port,
                extensions: Extensions::default(),
            },
            starttls: config.use_tls && !config.use_ssl,
            tlscon: None,
            stream,
            open: true,
        };
        connection.set_time_out(config.timeout)?;
        if config.use_ssl {
            connection.tlscon = Some(create_tls_conn(&config.host)?);
        }
        Ok(connection)
    }

    fn set_time_out(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(TransportError::Network)?;
        self.stream
            .set_write_timeout(Some(timeout))
            .map_err(TransportError::Network)?;
        Ok(())
    }

    pub fn is_tls(&self) -> bool {
        self.tlscon.is_some()
    }

    /// Drops the socket without saying goodbye.
    fn terminate(&mut self) {
        if self.open {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.open = false;
        }
        self.tlscon.take();
        self.server.extensions = Extensions::default();
    }

    fn check(&mut self, err: TransportError) -> TransportError {
        if matches!(err, TransportError::Disconnected) {
            self.terminate();
        }
        err
    }

    fn read_reply(&mut self) -> Result<Reply, TransportError> {
        let result = match self.tlscon.as_mut() {
            Some(tlscon) => {
                let mut tls = rustls::Stream::new(tlscon, &mut self.stream);
                Parser::new(&mut tls).recv_reply()
            }
            None => Parser::new(&mut self.stream).recv_reply(),
        };
        let reply = result.map_err(|err| self.check(err))?;
        for line in reply.lines() {
            trace!(
                "S: {}{}{}",
                line.code(),
                if line.last() { ' ' } else { '-' },
                String::from_utf8_lossy(line.text())
            );
        }
        Ok(reply)
    }

    /// A 421 means the server is going away, whatever we just asked.
    fn recv_reply(&mut self) -> Result<Reply, TransportError> {
        let reply = self.read_reply()?;
        if reply.is(StatusCode::ServiceNotAvailable) {
            debug!(
                text = %String::from_utf8_lossy(&reply.text()),
                "server closing the connection"
            );
            self.terminate();
            return Err(TransportError::Disconnected);
        }
        Ok(reply)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Disconnected);
        }
        let result = match self.tlscon.as_mut() {
            Some(tlscon) => {
                let mut tls = rustls::Stream::new(tlscon, &mut self.stream);
                tls.write_all(data).and_then(|()| tls.flush())
            }
            None => self
                .stream
                .write_all(data)
                .and_then(|()| self.stream.flush()),
        };
        result.map_err(|err| {
            let err = TransportError::from_io(err);
            self.check(err)
        })
    }

    fn send_command(&mut self, cmd: Command) -> Result<(), TransportError> {
        cmd.validate()?;
        trace!("C: {}", cmd.redacted());
        self.write(cmd.to_string().as_bytes())
    }

    fn command(&mut self, cmd: Command) -> Result<Reply, TransportError> {
        self.send_command(cmd)?;
        self.recv_reply()
    }

    fn greeting(&mut self) -> Result<(), TransportError> {
        let reply = self.read_reply()?;
        if reply.is(StatusCode::ServiceReady) {
            Ok(())
        } else {
            Err(TransportError::Connect {
                reason: format!(
                    "greeting {} {}",
                    reply.code(),
                    String::from_utf8_lossy(&reply.text())
                ),
            })
        }
    }

    /// EHLO, falling back to HELO for servers that predate ESMTP.
    fn hello(&mut self) -> Result<(), TransportError> {
        let reply = self.command(Command::Ehlo(self.name.clone()))?;
        if reply.is(StatusCode::Okay) {
            self.server.extensions = Extensions::parse(&reply);
            debug!(extensions = ?self.server.extensions, "EHLO accepted");
            return Ok(());
        }

        let reply = self.command(Command::Helo(self.name.clone()))?;
        if reply.is(StatusCode::Okay) {
            self.server.extensions = Extensions::default();
            Ok(())
        } else {
            Err(TransportError::Helo {
                code: reply.code(),
                text: reply.text(),
            })
        }
    }

    fn start_tls(&mut self) -> Result<(), TransportError> {
        if !self.server.extensions.starttls {
            return Err(TransportError::NotSupported("STARTTLS"));
        }
        let reply = self.command(Command::StartTls)?;
        if !reply.is(StatusCode::ServiceReady) {
            return Err(TransportError::UnexpectedReply {
                command: "STARTTLS",
                code: reply.code(),
                text: reply.text(),
            });
        }
        self.tlscon = Some(create_tls_conn(&self.server.address)?);
        self.server.extensions = Extensions::default();
        debug!("connection upgraded to TLS");
        Ok(())
    }

    fn auth_result(reply: Reply) -> Result<(), TransportError> {
        if reply.is(StatusCode::AuthSuccess) {
            Ok(())
        } else {
            Err(TransportError::Auth {
                code: reply.code(),
                text: reply.text(),
            })
        }
    }

    fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), TransportError> {
        let reply = self.command(Command::AuthPlain(username.to_owned(), password.to_owned()))?;
        Self::auth_result(reply)
    }

    fn auth_login(&mut self, username: &str, password: &str) -> Result<(), TransportError> {
        for step in [Command::AuthLogin, Command::AuthResponse(username.to_owned())] {
            let reply = self.command(step)?;
            if !reply.is(StatusCode::ServerChallenge) {
                return Self::auth_result(reply);
            }
        }
        let reply = self.command(Command::AuthResponse(password.to_owned()))?;
        Self::auth_result(reply)
    }

    /// Best effort; the transaction has already failed.
    fn reset(&mut self) {
        if let Err(err) = self.command(Command::Rset) {
            debug!(%err, "RSET failed");
        }
    }
}

impl Transport for SmtpConnection {
    fn handshake(&mut self) -> Result<(), TransportError> {
        self.greeting()?;
        self.hello()?;
        if self.starttls && !self.is_tls() {
            self.start_tls()?;
            self.hello()?;
        }
        debug!(
            server = %self.server.address,
            port = self.server.port,
            tls = self.is_tls(),
            "handshake complete"
        );
        Ok(())
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), TransportError> {
        match self.server.extensions.preferred_auth() {
            Some(AuthMech::Plain) => self.auth_plain(username, password),
            Some(AuthMech::Login) => self.auth_login(username, password),
            None => Err(TransportError::NotSupported("AUTH")),
        }
    }

    fn send(&mut self, message: &MimeMessage) -> Result<Vec<String>, TransportError> {
        let envelope = message.envelope();
        for address in iter::once(&envelope.sender).chain(&envelope.recipients) {
            check_argument(address)?;
        }
        let payload = dot_stuff(message.as_bytes());

        let size = self.server.extensions.size.map(|_| message.as_bytes().len());
        let reply = self.command(Command::MailFrom(envelope.sender.clone(), size))?;
        if !reply.is(StatusCode::Okay) {
            self.reset();
            return Err(TransportError::SenderRefused {
                sender: envelope.sender.clone(),
                code: reply.code(),
                text: reply.text(),
            });
        }

        let mut accepted = vec![];
        let mut refused = vec![];
        for recipient in &envelope.recipients {
            let reply = self.command(Command::RcptTo(recipient.clone()))?;
            if reply.is(StatusCode::Okay) || reply.is(StatusCode::UserNotLocal) {
                accepted.push(recipient.clone());
            } else {
                refused.push(RefusedRecipient {
                    address: recipient.clone(),
                    code: reply.code(),
                    text: reply.text(),
                });
            }
        }
        if !refused.is_empty() {
            self.reset();
            return Err(TransportError::RecipientsRefused(refused));
        }

        let reply = self.command(Command::Data)?;
        if !reply.is(StatusCode::StartMailInput) {
            self.reset();
            return Err(TransportError::Data {
                code: reply.code(),
                text: reply.text(),
            });
        }

        trace!("C: <{} bytes of message data>", payload.len());
        self.write(&payload)?;
        self.write(b".\r\n")?;
        let reply = self.recv_reply()?;
        if !reply.is(StatusCode::Okay) {
            return Err(TransportError::Data {
                code: reply.code(),
                text: reply.text(),
            });
        }
        Ok(accepted)
    }

    fn quit(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        let result = self.command(Command::Quit);
        self.terminate();
        let reply = result?;
        if !reply.is(StatusCode::ServiceClosingChannel) {
            debug!(code = reply.code(), "unexpected reply to QUIT");
        }
        Ok(())
    }
}
