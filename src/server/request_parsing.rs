//! Request body parsing helpers, grounded on `web/request_parsing.rs`.

use hyper::body::to_bytes;
use hyper::Body;
use serde::de::DeserializeOwned;

use crate::error::{AppError, AppResult};

pub async fn parse_json_body<T: DeserializeOwned>(body: Body) -> AppResult<T> {
    let bytes = to_bytes(body)
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to read request body: {e}")))?;
    if bytes.is_empty() {
        return Err(AppError::BadRequest("request body is empty".to_string()));
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_valid_json_body() {
        #[derive(serde::Deserialize)]
        struct Req {
            name: String,
        }
        let body = Body::from(r#"{"name":"llama3"}"#);
        let parsed: Req = parse_json_body(body).await.unwrap();
        assert_eq!(parsed.name, "llama3");
    }

    #[tokio::test]
    async fn rejects_empty_body() {
        #[derive(serde::Deserialize)]
        struct Req {
            #[allow(dead_code)]
            name: String,
        }
        let body = Body::empty();
        let result: AppResult<Req> = parse_json_body(body).await;
        assert!(result.is_err());
    }
}
