use std::{
    fmt, fs, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde_derive::Deserialize;

pub const DEFAULT_PORT: u16 = 587;
pub const DEFAULT_TIMEOUT: u64 = 20;
pub const DEFAULT_HELO_NAME: &str = "localhost";
pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5000);

/// Where and how to relay mail.
///
/// Loaded once at startup and never mutated. Missing credentials are not a
/// load error; [`TransportConfig::validate`] reports them on every request
/// so the form can tell the user what is wrong.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub use_ssl: bool,
    pub timeout: Duration,
    pub helo_name: String,
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("use_tls", &self.use_tls)
            .field("use_ssl", &self.use_ssl)
            .field("timeout", &self.timeout)
            .field("helo_name", &self.helo_name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "Configuration error: Cannot use both TLS and SSL. \
         Please set either USE_TLS or USE_SSL to 'false' in your .env file."
    )]
    TlsAndSsl,
    #[error(
        "Missing required environment variables: {}. \
         Please check your .env file or environment configuration.",
        .0.join(", ")
    )]
    Missing(Vec<&'static str>),
    #[error("Configuration error: SMTP_PORT must be between 1 and 65535.")]
    InvalidPort,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("failed to read configuration file at {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration file")]
    Parse(#[from] toml::de::Error),
}

impl TransportConfig {
    pub fn from_env() -> Result<TransportConfig, LoadError> {
        TransportConfig::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from a key lookup, so callers can supply something
    /// other than the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<TransportConfig, LoadError> {
        let text = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let port = match text("SMTP_PORT") {
            Some(value) => parse_port(&value)?,
            None => {
                tracing::info!("SMTP_PORT not set, using default {DEFAULT_PORT}");
                DEFAULT_PORT
            }
        };
        let timeout = match text("SMTP_TIMEOUT") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(LoadError::InvalidValue {
                    key: "SMTP_TIMEOUT",
                    value,
                })?,
            None => DEFAULT_TIMEOUT,
        };

        Ok(TransportConfig {
            host: text("SMTP_SERVER").unwrap_or_default(),
            port,
            username: text("SMTP_USERNAME").unwrap_or_default(),
            password: lookup("SMTP_PASSWORD").unwrap_or_default(),
            use_tls: text("USE_TLS").map_or(true, |value| is_true(&value)),
            use_ssl: text("USE_SSL").map_or(false, |value| is_true(&value)),
            timeout: Duration::from_secs(timeout),
            helo_name: text("SMTP_HELO_NAME").unwrap_or_else(|| DEFAULT_HELO_NAME.to_owned()),
        })
    }

    /// Checked before anything touches the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_tls && self.use_ssl {
            return Err(ConfigError::TlsAndSsl);
        }

        let mut missing = vec![];
        if self.host.trim().is_empty() {
            missing.push("SMTP_SERVER");
        }
        if self.username.trim().is_empty() {
            missing.push("SMTP_USERNAME");
        }
        if self.password.is_empty() {
            missing.push("SMTP_PASSWORD");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        Ok(())
    }
}

fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn parse_port(value: &str) -> Result<u16, LoadError> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| LoadError::InvalidValue {
            key: "SMTP_PORT",
            value: value.to_owned(),
        })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    smtp: SmtpSection,
    http: Option<HttpSection>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct SmtpSection {
    server: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    use_ssl: Option<bool>,
    timeout: Option<u64>,
    helo_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpSection {
    listen: Option<SocketAddr>,
}

impl From<SmtpSection> for TransportConfig {
    fn from(section: SmtpSection) -> Self {
        TransportConfig {
            host: section.server.unwrap_or_default(),
            port: section.port.unwrap_or(DEFAULT_PORT),
            username: section.username.unwrap_or_default(),
            password: section.password.unwrap_or_default(),
            use_tls: section.use_tls.unwrap_or(true),
            use_ssl: section.use_ssl.unwrap_or(false),
            timeout: Duration::from_secs(
                section.timeout.filter(|secs| *secs > 0).unwrap_or(DEFAULT_TIMEOUT),
            ),
            helo_name: section
                .helo_name
                .unwrap_or_else(|| DEFAULT_HELO_NAME.to_owned()),
        }
    }
}

/// Everything the server binary needs at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub transport: TransportConfig,
    pub listen: SocketAddr,
}

impl Settings {
    pub fn from_env() -> Result<Settings, LoadError> {
        Settings::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Settings, LoadError> {
        let listen = match lookup("LISTEN_ADDR").filter(|value| !value.trim().is_empty()) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| LoadError::InvalidValue {
                    key: "LISTEN_ADDR",
                    value,
                })?,
            None => DEFAULT_LISTEN,
        };
        Ok(Settings {
            transport: TransportConfig::from_lookup(lookup)?,
            listen,
        })
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Settings, LoadError> {
        let path = path.as_ref();
        let file = fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_owned(),
            source,
        })?;
        Settings::from_toml(&file)
    }

    pub fn from_toml(text: &str) -> Result<Settings, LoadError> {
        let file: ConfigFile = toml::from_str(text)?;
        Ok(Settings {
            transport: file.smtp.into(),
            listen: file
                .http
                .and_then(|http| http.listen)
                .unwrap_or(DEFAULT_LISTEN),
        })
    }
}
