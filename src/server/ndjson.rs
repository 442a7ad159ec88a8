//! Streaming response adapter: turns a `mpsc::Receiver<T>` into a
//! newline-delimited-JSON `hyper::Body`, one JSON object per line. This is a
//! deliberate generalization of the teacher's SSE (`data: ...\n\n`) framing
//! in `web/routes/chat.rs` and `web/routes/download.rs` into the NDJSON
//! framing this daemon's API uses instead.

use hyper::{Body, Response, StatusCode};
use serde::Serialize;
use tokio::sync::mpsc;

pub fn ndjson_response<T>(mut rx: mpsc::Receiver<T>, origin: Option<String>) -> Response<Body>
where
    T: Serialize + Send + 'static,
{
    let (mut sender, body) = Body::channel();

    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let mut line = match serde_json::to_string(&item) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("failed to serialize NDJSON line: {e}");
                    break;
                }
            };
            line.push('\n');
            if sender.send_data(line.into()).await.is_err() {
                // Receiver (client) went away; stop producing.
                break;
            }
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .header("access-control-allow-methods", "GET, POST, DELETE, OPTIONS")
        .header("access-control-allow-headers", "content-type, authorization");
    if let Some(origin) = origin {
        builder = builder.header("access-control-allow-origin", origin);
    }
    builder.body(body).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::to_bytes;

    #[derive(Serialize)]
    struct Line {
        value: u32,
    }

    #[tokio::test]
    async fn streams_each_item_as_its_own_json_line() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Line { value: 1 }).await.unwrap();
        tx.send(Line { value: 2 }).await.unwrap();
        drop(tx);

        let resp = ndjson_response(rx, None);
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec![r#"{"value":1}"#, r#"{"value":2}"#]);
    }

    #[tokio::test]
    async fn sets_allowed_origin_header_when_provided() {
        let (tx, rx) = mpsc::channel::<Line>(1);
        drop(tx);
        let resp = ndjson_response(rx, Some("https://example.com".to_string()));
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "https://example.com"
        );
    }
}
