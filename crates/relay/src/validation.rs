// Input validation for the HTTP surface.
//
// - `ValidatedJson<T>` extractor: content-type check + serde, rejected with
//   the relay error envelope instead of axum's plain-text rejections.
// - Display-name rules shared by room creation and joining.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;

use crate::error::{ErrorCode, RelayError};

pub const MAX_USERNAME_CHARS: usize = 32;

// ── ValidatedJson extractor ────────────────────────────────────────

/// A JSON body extractor that returns a structured `RelayError` on failure.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => {
                let (message, details) = classify_json_rejection(&rejection);
                Err(RelayError::new(ErrorCode::ValidationFailed, message)
                    .with_details(details)
                    .into_response())
            }
        }
    }
}

fn classify_json_rejection(rejection: &JsonRejection) -> (String, serde_json::Value) {
    match rejection {
        JsonRejection::JsonDataError(e) => {
            (format!("invalid JSON payload: {e}"), json!({ "kind": "data_error" }))
        }
        JsonRejection::JsonSyntaxError(e) => {
            (format!("malformed JSON: {e}"), json!({ "kind": "syntax_error" }))
        }
        JsonRejection::MissingJsonContentType(_) => (
            "expected Content-Type: application/json".to_string(),
            json!({ "kind": "missing_content_type" }),
        ),
        JsonRejection::BytesRejection(e) => {
            (format!("request body error: {e}"), json!({ "kind": "body_error" }))
        }
        other => (format!("request body error: {other}"), json!({ "kind": "unknown" })),
    }
}

// ── Display names ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsernameError {
    #[error("Username must be between 1 and 32 characters")]
    Length,
    #[error("Username must contain only letters, numbers and spaces")]
    Charset,
    #[error("Username must not start or end with a space")]
    EdgeSpace,
    #[error("Username must not contain double spaces")]
    DoubleSpace,
}

/// Checks a display name: 1-32 ASCII letters, digits and single inner
/// spaces.
pub fn validate_username(name: &str) -> Result<(), UsernameError> {
    let length = name.chars().count();
    if length == 0 || length > MAX_USERNAME_CHARS {
        return Err(UsernameError::Length);
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ') {
        return Err(UsernameError::Charset);
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        return Err(UsernameError::EdgeSpace);
    }
    if name.contains("  ") {
        return Err(UsernameError::DoubleSpace);
    }
    Ok(())
}

impl From<UsernameError> for RelayError {
    fn from(error: UsernameError) -> Self {
        RelayError::new(ErrorCode::ValidationFailed, error.to_string())
            .with_details(json!({ "field": "username" }))
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        response::IntoResponse,
        routing::post,
        Router,
    };
    use serde::Deserialize;
    use tower::ServiceExt;

    use super::{validate_username, UsernameError, ValidatedJson};

    #[derive(Debug, Deserialize)]
    struct TestPayload {
        username: String,
    }

    async fn echo_handler(ValidatedJson(payload): ValidatedJson<TestPayload>) -> impl IntoResponse {
        (StatusCode::OK, payload.username)
    }

    fn test_app() -> Router {
        Router::new().route("/test", post(echo_handler))
    }

    async fn post_json(content_type: Option<&str>, body: &'static str) -> axum::response::Response {
        let mut request = Request::builder().method(Method::POST).uri("/test");
        if let Some(content_type) = content_type {
            request = request.header("content-type", content_type);
        }
        test_app()
            .oneshot(request.body(Body::from(body)).expect("request should build"))
            .await
            .expect("request should return a response")
    }

    async fn error_kind(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(parsed["error"]["code"], "VALIDATION_FAILED");
        parsed["error"]["details"]["kind"].clone()
    }

    #[tokio::test]
    async fn validated_json_accepts_valid_payload() {
        let response = post_json(Some("application/json"), r#"{"username":"alice"}"#).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        assert_eq!(body.as_ref(), b"alice");
    }

    #[tokio::test]
    async fn validated_json_rejects_missing_content_type() {
        let response = post_json(None, r#"{"username":"alice"}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_kind(response).await, "missing_content_type");
    }

    #[tokio::test]
    async fn validated_json_rejects_malformed_json() {
        let response = post_json(Some("application/json"), "not json").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_kind(response).await, "syntax_error");
    }

    #[tokio::test]
    async fn validated_json_rejects_missing_field() {
        let response = post_json(Some("application/json"), r#"{"age": 42}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_kind(response).await, "data_error");
    }

    #[test]
    fn accepts_plain_names() {
        for name in ["X", "7", "Test", "Test user", "encephalomyeloradiculoneuropathy"] {
            assert_eq!(validate_username(name), Ok(()), "{name:?} should be accepted");
        }
    }

    #[test]
    fn rejects_bad_lengths() {
        assert_eq!(validate_username(""), Err(UsernameError::Length));
        assert_eq!(
            validate_username("eencephalomyeloradiculoneuropathy"),
            Err(UsernameError::Length)
        );
    }

    #[test]
    fn rejects_non_ascii_and_punctuation() {
        assert_eq!(validate_username("Блаблабла"), Err(UsernameError::Charset));
        assert_eq!(validate_username("bob!"), Err(UsernameError::Charset));
        assert_eq!(validate_username("tab\there"), Err(UsernameError::Charset));
    }

    #[test]
    fn rejects_edge_and_double_spaces() {
        for name in [" Test", "  Test", "Test ", "Test  "] {
            assert_eq!(validate_username(name), Err(UsernameError::EdgeSpace));
        }
        assert_eq!(validate_username("Test  user"), Err(UsernameError::DoubleSpace));
        assert_eq!(validate_username("Test     user"), Err(UsernameError::DoubleSpace));
    }

    #[test]
    fn errors_carry_readable_messages() {
        assert_eq!(
            UsernameError::DoubleSpace.to_string(),
            "Username must not contain double spaces"
        );
    }
}
