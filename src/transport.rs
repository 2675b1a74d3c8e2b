use crate::locator::ResolvedTarget;
use crate::record::LogEvent;
use crate::transform::FieldResolver;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Failure of a single or bulk write. Never retried.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("{url} responded with status {status}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to serialize log event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid target url `{0}`")]
    InvalidUrl(String),

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl TransportError {
    /// HTTP status when the server answered with an unexpected one.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            TransportError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Asynchronous writer of [`LogEvent`]s to a resolved index.
///
/// `send_one` targets the `_doc` endpoint and `send_bulk` the `_bulk`
/// endpoint; which one is used for a flush is decided by the repository.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST one document.
    ///
    /// **Returns**
    /// - `Ok(())` only when the server answered `201 Created`.
    /// - `Err(..)` for any other status, a network failure or a
    ///   serialization failure.
    async fn send_one(&self, target: &ResolvedTarget, event: &LogEvent) -> Result<(), TransportError>;

    /// POST all events as one newline-delimited bulk request.
    ///
    /// **Returns**
    /// - `Ok(())` when the server answered `200 OK` or `201 Created`.
    async fn send_bulk(&self, target: &ResolvedTarget, events: &[LogEvent]) -> Result<(), TransportError>;
}

/// Build a `_bulk` body: an `index` action line before every document and
/// a blank line at the end.
pub fn bulk_body(index: &str, documents: &[String]) -> String {
    let action = serde_json::json!({ "index": { "_index": index } }).to_string();
    let mut body = String::with_capacity(documents.iter().map(|d| d.len() + action.len() + 2).sum::<usize>() + 1);
    for doc in documents {
        body.push_str(&action);
        body.push('\n');
        body.push_str(doc);
        body.push('\n');
    }
    body.push('\n');
    body
}

/// reqwest-backed [`Transport`].
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    resolver: Arc<dyn FieldResolver>,
}

impl HttpTransport {
    pub fn new(resolver: Arc<dyn FieldResolver>) -> Self {
        Self::with_client(Client::new(), resolver)
    }

    pub fn with_client(client: Client, resolver: Arc<dyn FieldResolver>) -> Self {
        HttpTransport { client, resolver }
    }

    /// Build a transport with its own client.
    ///
    /// **Parameters**
    /// - `accept_invalid_certs`: skip TLS certificate validation (self-signed
    ///   development clusters).
    /// - `timeout`: per-request timeout enforced by the HTTP client.
    pub fn build(
        resolver: Arc<dyn FieldResolver>,
        accept_invalid_certs: bool,
        timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let mut builder = Client::builder().danger_accept_invalid_certs(accept_invalid_certs);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(TransportError::ClientBuild)?;
        Ok(Self::with_client(client, resolver))
    }

    /// Serialize one event and apply the field transform.
    pub fn document(&self, event: &LogEvent) -> Result<String, TransportError> {
        let value = match serde_json::to_value(event)? {
            Value::Object(map) => Value::Object(self.resolver.resolve(map)),
            other => other,
        };
        Ok(serde_json::to_string(&value)?)
    }

    fn request(&self, target: &ResolvedTarget, content_type: &str) -> Result<RequestBuilder, TransportError> {
        let mut url = Url::parse(&target.url()).map_err(|_| TransportError::InvalidUrl(target.to_string()))?;

        // Credentials travel in the Authorization header, not in the URL.
        let credentials = if url.username().is_empty() {
            None
        } else {
            let user = decode(url.username());
            let password = url.password().map(decode);
            let _ = url.set_username("");
            let _ = url.set_password(None);
            Some((user, password))
        };

        let mut request = self.client.post(url).header("Content-Type", content_type);
        if let Some((user, password)) = credentials {
            request = request.basic_auth(user, password);
        }
        Ok(request)
    }

    async fn execute(
        &self,
        request: RequestBuilder,
        target: &ResolvedTarget,
        accepted: &[StatusCode],
    ) -> Result<(), TransportError> {
        let resp = request.send().await.map_err(|e| {
            warn!(target_url = %target, error = %e, "elasticsearch request failed");
            TransportError::Network(e)
        })?;

        if accepted.contains(&resp.status()) {
            return Ok(());
        }
        Err(failure(resp, target).await)
    }
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Capture the response body for diagnostics; a body that cannot be read
/// never masks the status error.
async fn failure(resp: Response, target: &ResolvedTarget) -> TransportError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_else(|e| {
        debug!(error = %e, "failed to read error response body");
        String::new()
    });
    warn!(
        target_url = %target,
        status = status.as_u16(),
        body = %body,
        "elasticsearch rejected write"
    );
    TransportError::Status {
        status: status.as_u16(),
        url: target.to_string(),
        body,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_one(&self, target: &ResolvedTarget, event: &LogEvent) -> Result<(), TransportError> {
        let body = self.document(event)?;
        debug!(target_url = %target, "sending single log document");

        let request = self.request(target, "application/json")?.body(body);
        self.execute(request, target, &[StatusCode::CREATED]).await
    }

    async fn send_bulk(&self, target: &ResolvedTarget, events: &[LogEvent]) -> Result<(), TransportError> {
        let documents = events
            .iter()
            .map(|event| self.document(event))
            .collect::<Result<Vec<_>, _>>()?;
        let body = bulk_body(&target.index, &documents);
        debug!(target_url = %target, count = events.len(), "sending bulk log request");

        let request = self.request(target, "application/x-ndjson")?.body(body);
        self.execute(request, target, &[StatusCode::OK, StatusCode::CREATED]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{FieldNameOverride, FieldTransform};

    #[test]
    fn bulk_body_pairs_actions_with_documents() {
        let docs = vec![r#"{"message":"a"}"#.to_string(), r#"{"message":"b"}"#.to_string()];
        let body = bulk_body("logs-2024.03.05", &docs);

        assert_eq!(
            body,
            "{\"index\":{\"_index\":\"logs-2024.03.05\"}}\n{\"message\":\"a\"}\n\
             {\"index\":{\"_index\":\"logs-2024.03.05\"}}\n{\"message\":\"b\"}\n\n"
        );
    }

    #[test]
    fn bulk_body_of_nothing_is_blank_line() {
        assert_eq!(bulk_body("logs", &[]), "\n");
    }

    #[test]
    fn document_applies_resolver() {
        let transform = FieldTransform::new(
            &[FieldNameOverride {
                original: "message".into(),
                replacement: "msg".into(),
            }],
            &[],
        );
        let transport = HttpTransport::new(Arc::new(transform));
        let doc = transport.document(&LogEvent::new("INFO", "app", "hello")).unwrap();
        let value: Value = serde_json::from_str(&doc).unwrap();

        assert_eq!(value["msg"], "hello");
        assert!(value.get("message").is_none());
        assert!(value.get("@timestamp").is_some());
    }

    #[test]
    fn status_error_exposes_code() {
        let err = TransportError::Status {
            status: 500,
            url: "http://es/app/_doc".into(),
            body: "boom".into(),
        };
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.to_string(), "http://es/app/_doc responded with status 500: boom");
    }
}
