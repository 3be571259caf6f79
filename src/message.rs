use std::{
    fmt,
    io::{self, Cursor, Read, Seek},
};

use mail_builder::{
    headers::{address::Address, content_type::ContentType, raw::Raw},
    mime::MimePart,
    MessageBuilder,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::{debug, info};

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// An uploaded file. The content is rewound after it has been read so the
/// owner can read it again.
pub struct Attachment {
    pub filename: String,
    content: Box<dyn ReadSeek>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

impl Attachment {
    pub fn new(filename: impl Into<String>, content: impl ReadSeek + 'static) -> Attachment {
        Attachment {
            filename: filename.into(),
            content: Box::new(content),
        }
    }

    pub fn from_bytes(filename: impl Into<String>, bytes: Vec<u8>) -> Attachment {
        Attachment::new(filename, Cursor::new(bytes))
    }

    pub fn content_mut(&mut self) -> &mut dyn ReadSeek {
        &mut *self.content
    }

    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![];
        self.content.read_to_end(&mut buf)?;
        self.content.rewind()?;
        Ok(buf)
    }
}

/// A submission that passed validation.
#[derive(Debug)]
pub struct SubmissionRequest {
    pub display_name: Option<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

/// Who the message is delivered from and to, independent of its headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
}

/// A fully serialized message, ready for DATA.
#[derive(Debug, Clone)]
pub struct MimeMessage {
    envelope: Envelope,
    formatted: Vec<u8>,
}

impl MimeMessage {
    pub fn new(envelope: Envelope, formatted: Vec<u8>) -> MimeMessage {
        MimeMessage {
            envelope,
            formatted,
        }
    }
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.formatted
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("error attaching file '{filename}'")]
    Attachment {
        filename: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize message")]
    Encode(#[source] io::Error),
}

/// Everything outside the RFC 3986 unreserved set.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn encode_rfc2231(value: &str) -> String {
    format!("utf-8''{}", utf8_percent_encode(value, ATTR_CHAR))
}

/// Header values stay on one line whatever the caller passed in.
fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Printable ASCII names go in a quoted `filename`; anything else uses the
/// RFC 2231 `filename*` form.
pub fn content_disposition(filename: &str) -> String {
    if filename.bytes().all(|b| b.is_ascii() && !b.is_ascii_control()) {
        let quoted = filename.replace('\\', "\\\\").replace('"', "\\\"");
        format!("attachment; filename=\"{quoted}\"")
    } else {
        format!("attachment; filename*={}", encode_rfc2231(filename))
    }
}

pub fn build(request: &mut SubmissionRequest) -> Result<MimeMessage, MessageError> {
    let mut files = vec![];
    for attachment in request.attachments.iter_mut() {
        if attachment.filename.is_empty() {
            debug!("skipping upload without a filename");
            continue;
        }
        let content = attachment
            .read_all()
            .map_err(|source| MessageError::Attachment {
                filename: attachment.filename.clone(),
                source,
            })?;
        info!(filename = %attachment.filename, size = content.len(), "attached file");
        files.push((attachment.filename.clone(), content));
    }

    let mut parts = vec![MimePart::new(
        ContentType::new("text/plain").attribute("charset", "utf-8"),
        request.body.as_str(),
    )];
    for (filename, content) in files {
        parts.push(
            MimePart::new(ContentType::new("application/octet-stream"), content)
                .header("Content-Disposition", Raw::new(content_disposition(&filename))),
        );
    }

    let display_name = request.display_name.as_deref().map(single_line);
    let from: Address<'_> = match display_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => (name, request.from_address.as_str()).into(),
        _ => request.from_address.as_str().into(),
    };
    let to: Vec<&str> = request.to_addresses.iter().map(String::as_str).collect();
    let subject = single_line(&request.subject);

    let formatted = MessageBuilder::new()
        .from(from)
        .to(to)
        .subject(subject.as_str())
        .body(MimePart::new(ContentType::new("multipart/mixed"), parts))
        .write_to_vec()
        .map_err(MessageError::Encode)?;

    Ok(MimeMessage::new(
        Envelope {
            sender: request.from_address.clone(),
            recipients: request.to_addresses.clone(),
        },
        formatted,
    ))
}
