use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// JSON body extractor whose rejection is a `{"message": ...}` body, the
/// same shape every handler error in this API uses, instead of axum's
/// plain-text default.
#[derive(Debug)]
pub struct AppJson<T>(pub T);

impl<T, S> FromRequest<S> for AppJson<T>
where
    T: serde::de::DeserializeOwned + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(reject(rejection)),
        }
    }
}

fn reject(rejection: JsonRejection) -> Response {
    tracing::warn!(reason = %rejection, "Rejected request body");
    let body = json!({
        "message": format!("Invalid JSON body: {}", rejection),
    });
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Payload {
        answer_id: String,
    }

    fn json_request(body: &str) -> Request {
        Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn well_formed_body_deserializes() {
        let req = json_request(r#"{"answer_id": "a1"}"#);
        let AppJson(payload) = <AppJson<Payload> as FromRequest<()>>::from_request(req, &())
            .await
            .unwrap();
        assert_eq!(payload.answer_id, "a1");
    }

    #[tokio::test]
    async fn malformed_body_yields_json_error_with_message() {
        let req = json_request(r#"{"answer_id": 12"#);
        let response = <AppJson<Payload> as FromRequest<()>>::from_request(req, &())
            .await
            .unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["message"].as_str().unwrap().contains("Invalid JSON body"));
    }

    #[tokio::test]
    async fn missing_content_type_is_rejected() {
        let req = Request::builder()
            .method("POST")
            .body(Body::from(r#"{"answer_id": "a1"}"#))
            .unwrap();
        let response = <AppJson<Payload> as FromRequest<()>>::from_request(req, &())
            .await
            .unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
