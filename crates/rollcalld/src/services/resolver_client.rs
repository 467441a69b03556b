//! HTTP client for the face resolver service.
//!
//! Uploads the still as multipart form data (`classroomId`, `frame`) to
//! `POST {base}/recognize-face` and normalizes the reply into candidates.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use rollcall_core::{Candidate, IdentityResolver, ResolverError, StillImage};
use serde::Deserialize;
use std::time::Duration;
use tracing::{instrument, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Body returned by the resolver, on success and on error.
#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    faces: Option<Faces>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// Structured candidates, or the legacy `[name, regNo, ...]` flat list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Faces {
    Structured(Vec<Candidate>),
    Positional(Vec<String>),
}

impl Faces {
    fn into_candidates(self) -> Result<Vec<Candidate>, ResolverError> {
        match self {
            Faces::Structured(candidates) => Ok(candidates),
            Faces::Positional(fields) => {
                if fields.len() % 2 != 0 {
                    return Err(ResolverError::MalformedResponse(format!(
                        "positional faces list has odd length {}",
                        fields.len()
                    )));
                }
                Ok(fields
                    .chunks_exact(2)
                    .map(|pair| Candidate::new(pair[0].clone(), pair[1].clone()))
                    .collect())
            }
        }
    }
}

impl RecognizeResponse {
    fn error_text(&self) -> String {
        match (&self.error, &self.details) {
            (Some(error), Some(details)) => format!("{error}: {details}"),
            (Some(error), None) => error.clone(),
            (None, _) => self.message.clone().unwrap_or_else(|| "no detail".to_string()),
        }
    }
}

#[derive(Clone)]
pub struct HttpResolver {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpResolver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ResolverError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()
            .map_err(|e| ResolverError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> ResolverError {
        if e.is_timeout() {
            ResolverError::Timeout(self.timeout)
        } else {
            ResolverError::Unreachable(e.to_string())
        }
    }
}

#[async_trait]
impl IdentityResolver for HttpResolver {
    #[instrument(skip(self, image), fields(bytes = image.len(), frame = image.sequence))]
    async fn resolve(
        &self,
        scope: Option<&str>,
        image: &StillImage,
    ) -> Result<Vec<Candidate>, ResolverError> {
        let url = format!("{}/recognize-face", self.base_url);

        let part = Part::bytes(image.data.clone())
            .file_name(image.format.file_name())
            .mime_str(image.format.mime_type())
            .map_err(|e| ResolverError::MalformedImage(e.to_string()))?;
        let mut form = Form::new().part("frame", part);
        if let Some(scope) = scope {
            form = form.text("classroomId", scope.to_string());
        }

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "rollcalld.services.resolver", error = %e, "resolver request failed");
                self.transport_error(e)
            })?;

        let status = response.status();
        let body: RecognizeResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ResolverError::Timeout(self.timeout)
            } else {
                ResolverError::MalformedResponse(format!("{status}: {e}"))
            }
        })?;

        if status.is_success() {
            return match body.faces {
                Some(faces) => faces.into_candidates(),
                None => Ok(Vec::new()),
            };
        }

        // A 400 without an error field is the resolver's "no faces" reply.
        if status == StatusCode::BAD_REQUEST && body.error.is_none() {
            return Ok(Vec::new());
        }

        warn!(
            target: "rollcalld.services.resolver",
            status = %status,
            error = %body.error_text(),
            "resolver returned error"
        );
        if status.is_client_error() {
            Err(ResolverError::MalformedImage(body.error_text()))
        } else {
            Err(ResolverError::Service(format!("{status}: {}", body.error_text())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::mock::still;
    use rollcall_core::RegistrationNumber;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn resolver_for(server: &MockServer) -> HttpResolver {
        HttpResolver::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_structured_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/recognize-face"))
            .and(body_string_contains("name=\"classroomId\""))
            .and(body_string_contains("Math101"))
            .and(body_string_contains("filename=\"captured_face.jpg\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "Face recognition completed.",
                "faces": [
                    {"displayName": "Alice", "registrationNumber": "R1"},
                    {"displayName": "Carol", "registrationNumber": "R2"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        // ASCII payload keeps the multipart body matchable as text.
        let mut image = still(1);
        image.data = b"jpeg-bytes".to_vec();
        let candidates = resolver_for(&server)
            .await
            .resolve(Some("Math101"), &image)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], Candidate::new("Alice", "R1"));
    }

    #[tokio::test]
    async fn test_legacy_positional_pair() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/recognize-face"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "Face recognition completed.",
                "faces": ["Alice", "R1"]
            })))
            .mount(&server)
            .await;

        let candidates = resolver_for(&server).await.resolve(None, &still(1)).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].display_name, "Alice");
        assert_eq!(candidates[0].registration_number, RegistrationNumber::new("R1"));
    }

    #[tokio::test]
    async fn test_no_faces_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "message": "No faces detected in the image."
            })))
            .mount(&server)
            .await;

        let candidates = resolver_for(&server).await.resolve(None, &still(1)).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_empty_faces_list() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"faces": []})))
            .mount(&server)
            .await;

        let candidates = resolver_for(&server).await.resolve(None, &still(1)).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_service_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": "Failed to recognize face.",
                "details": "model not loaded"
            })))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.resolve(None, &still(1)).await.unwrap_err();
        match err {
            ResolverError::Service(msg) => assert!(msg.contains("model not loaded")),
            other => panic!("expected Service, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_request_with_error_is_malformed_image() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "No image file uploaded"
            })))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.resolve(None, &still(1)).await.unwrap_err();
        assert_eq!(err, ResolverError::MalformedImage("No image file uploaded".into()));
    }

    #[tokio::test]
    async fn test_slow_resolver_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"faces": []}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let resolver = HttpResolver::new(server.uri(), Duration::from_millis(200)).unwrap();
        let err = resolver.resolve(None, &still(1)).await.unwrap_err();
        assert_eq!(err, ResolverError::Timeout(Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_unreachable_resolver() {
        // Nothing listens on port 9 (discard) in the test environment.
        let resolver = HttpResolver::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let err = resolver.resolve(None, &still(1)).await.unwrap_err();
        assert!(matches!(err, ResolverError::Unreachable(_) | ResolverError::Timeout(_)));
    }

    #[test]
    fn test_odd_positional_list_is_malformed() {
        let faces = Faces::Positional(vec!["Alice".into()]);
        assert!(matches!(
            faces.into_candidates(),
            Err(ResolverError::MalformedResponse(_))
        ));
    }
}
