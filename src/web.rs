//! HTTP front-end: the form page and the submit endpoint.

use std::sync::Arc;

use askama::Template;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::{routing, Router};
use tracing::{debug, error, warn};

use crate::classify::{self, Category, Failure};
use crate::config::TransportConfig;
use crate::connection::SmtpConnector;
use crate::message::Attachment;
use crate::submit::{self, Submission, SubmissionOutcome};
use crate::transport::Connector;

/// Largest request body we accept, attachments included.
pub const MAX_UPLOAD: usize = 25 * 1024 * 1024;

#[derive(Clone)]
struct AppState<C> {
    config: Arc<TransportConfig>,
    connector: C,
}

/// The router that relays through a real SMTP server.
pub fn router(config: Arc<TransportConfig>) -> Router {
    router_with(config, SmtpConnector)
}

pub fn router_with<C>(config: Arc<TransportConfig>, connector: C) -> Router
where
    C: Connector + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/", routing::get(index::<C>))
        .route("/send", routing::post(send::<C>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD))
        .with_state(AppState { config, connector })
}

/// `class` is `success` or `error`.
struct Notice<'a> {
    class: &'a str,
    message: &'a str,
}

#[derive(Template)]
#[template(path = "index.html")]
struct FormPage<'a> {
    notice: Option<Notice<'a>>,
}

fn page(status: StatusCode, notice: Option<Notice<'_>>) -> Response {
    match (FormPage { notice }).render() {
        Ok(html) => (status, Html(html)).into_response(),
        Err(err) => {
            error!(error = %err, "failed to render form page");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn status(category: Category) -> StatusCode {
    match category {
        Category::ValidationError | Category::AttachmentError => StatusCode::UNPROCESSABLE_ENTITY,
        Category::ConfigError | Category::UnexpectedError => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn failure_page(status: StatusCode, failure: &Failure) -> Response {
    page(
        status,
        Some(Notice {
            class: "error",
            message: &failure.message,
        }),
    )
}

/// Shows the form, warning up front if the relay is misconfigured.
#[tracing::instrument(skip_all)]
async fn index<C>(State(state): State<AppState<C>>) -> Response
where
    C: Clone + Send + Sync + 'static,
{
    match state.config.validate() {
        Ok(()) => page(StatusCode::OK, None),
        Err(err) => {
            warn!(error = %err, "serving form with invalid configuration");
            let message = err.to_string();
            page(
                StatusCode::OK,
                Some(Notice {
                    class: "error",
                    message: &message,
                }),
            )
        }
    }
}

async fn read_form(multipart: &mut Multipart) -> Result<Submission, MultipartError> {
    let mut submission = Submission::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "attachments" => {
                let filename = field.file_name().unwrap_or_default().to_owned();
                let content = field.bytes().await?;
                debug!(%filename, size = content.len(), "received upload");
                submission
                    .attachments
                    .push(Attachment::from_bytes(filename, content.to_vec()));
            }
            "display_name" => submission.display_name = field.text().await?,
            "from_email" => submission.from_email = field.text().await?,
            "to_email" => submission.to_email = field.text().await?,
            "subject" => submission.subject = field.text().await?,
            "body" => submission.body = field.text().await?,
            other => debug!(field = other, "ignoring unknown form field"),
        }
    }
    Ok(submission)
}

#[tracing::instrument(skip_all)]
async fn send<C>(
    State(state): State<AppState<C>>,
    mut multipart: Multipart,
) -> Response
where
    C: Connector + Clone + Send + Sync + 'static,
{
    let submission = match read_form(&mut multipart).await {
        Ok(submission) => submission,
        Err(err) => {
            warn!(error = %err, "unreadable form submission");
            let failure = Failure::new(
                Category::ValidationError,
                format!("Could not read the submitted form: {}", err.body_text()),
            );
            return failure_page(err.status(), &failure);
        }
    };

    let AppState { config, connector } = state;
    let outcome = tokio::task::spawn_blocking(move || {
        submit::submit_with(submission, &config, &connector)
    })
    .await
    .unwrap_or_else(|err| {
        error!(error = %err, "submission task failed");
        SubmissionOutcome::Failure(classify::unexpected("JoinError"))
    });

    match outcome {
        SubmissionOutcome::Success { recipients } => {
            let message = format!("Email successfully sent to: {}!", recipients.join(", "));
            page(
                StatusCode::OK,
                Some(Notice {
                    class: "success",
                    message: &message,
                }),
            )
        }
        SubmissionOutcome::Failure(failure) => failure_page(status(failure.category), &failure),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::message::MimeMessage;
    use crate::transport::{Transport, TransportError};

    const BOUNDARY: &str = "mailform-test-boundary";

    /// Accepts everything and counts connections.
    #[derive(Clone, Default)]
    struct Recorder {
        connects: Arc<AtomicUsize>,
    }

    impl Transport for Recorder {
        fn handshake(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn login(&mut self, _: &str, _: &str) -> Result<(), TransportError> {
            Ok(())
        }
        fn send(&mut self, message: &MimeMessage) -> Result<Vec<String>, TransportError> {
            Ok(message.envelope().recipients.clone())
        }
        fn quit(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    impl Connector for Recorder {
        type Transport = Recorder;

        fn connect(&self, _: &TransportConfig) -> Result<Recorder, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.clone())
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

    fn form(fields: &[(&str, &str)], files: &[(&str, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (filename, content) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"attachments\"; \
                     filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/send")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    const VALID: [(&str, &str); 5] = [
        ("display_name", "Jane <Doe>"),
        ("from_email", "jane@example.com"),
        ("to_email", "a@b.com, c@d.org"),
        ("subject", "Hello"),
        ("body", "Hi there"),
    ];

    #[tokio::test]
    async fn form_page_renders() {
        let app = router_with(Arc::new(config()), Recorder::default());
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = body_text(response).await;
        assert!(page.contains(r#"name="to_email""#));
        assert!(!page.contains("{%"));
        assert!(!page.contains("class=\"notice"));
    }

    #[tokio::test]
    async fn form_page_warns_about_config() {
        let mut config = config();
        config.use_ssl = true;
        let app = router_with(Arc::new(config), Recorder::default());
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let page = body_text(response).await;
        assert!(page.contains("Cannot use both TLS and SSL"));
    }

    #[tokio::test]
    async fn successful_send() {
        let recorder = Recorder::default();
        let app = router_with(Arc::new(config()), recorder.clone());
        let response = app
            .oneshot(form(&VALID, &[("notes.txt", &b"hello"[..])]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = body_text(response).await;
        assert!(page.contains("Email successfully sent to: a@b.com, c@d.org!"));
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_input_is_unprocessable() {
        let recorder = Recorder::default();
        let app = router_with(Arc::new(config()), recorder.clone());
        let mut fields = VALID;
        fields[2] = ("to_email", "<script>@x");
        let response = app.oneshot(form(&fields, &[])).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let page = body_text(response).await;
        assert!(page.contains("Invalid email format detected for: &lt;script&gt;@x"));
        assert!(!page.contains("<script>"));
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bad_config_is_a_server_error() {
        let recorder = Recorder::default();
        let mut config = config();
        config.host.clear();
        let app = router_with(Arc::new(config), recorder.clone());
        let response = app.oneshot(form(&VALID, &[])).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("SMTP_SERVER"));
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn notices_are_escaped() {
        let page = FormPage {
            notice: Some(Notice {
                class: "error",
                message: "a<b>&\"c",
            }),
        }
        .render()
        .unwrap();
        assert!(page.contains(r#"<div class="notice error">a&lt;b&gt;&amp;&quot;c</div>"#));
    }

    #[test]
    fn transport_failures_are_bad_gateway() {
        assert_eq!(status(Category::RecipientsRefused), StatusCode::BAD_GATEWAY);
        assert_eq!(status(Category::TimeoutError), StatusCode::BAD_GATEWAY);
        assert_eq!(status(Category::AttachmentError), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
