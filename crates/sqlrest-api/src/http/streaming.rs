//! The streaming batch gateway.
//!
//! The response is always `200 OK`: the status line is sent before the
//! batch has an outcome. The body is a JSON array written incrementally:
//!
//! ```text
//! [{"lane":0,"index":1,...},  {"lane":1,"index":0,...},{"status":409}]
//! ```
//!
//! Each element is one operation, emitted when it reaches a terminal state.
//! Whitespace between elements is a keep-alive heartbeat. The last element
//! is the trailer carrying the aggregate status, plus `errors` when the
//! batch never ran.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::stream;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

use sqlrest_domain::OperationError;
use sqlrest_server::{BatchError, BatchEvent, BatchOutcome};

use super::error::{ApiError, JsonBadRequest};
use super::state::AppState;
use sqlrest_server::handlers::batch::OperationResult;

/// Heartbeats are never written more often than this.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

pub(crate) async fn batch_streaming(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<JsonBadRequest<Value>, ApiError>,
) -> Response {
    let payload = match payload {
        Ok(JsonBadRequest(payload)) => payload,
        // The body was never read; a plain 413 is still possible.
        Err(err) if err.status() == StatusCode::PAYLOAD_TOO_LARGE => return err.into_response(),
        Err(err) => return rejected(err.error()),
    };
    let plan = match state.engine.plan(&payload, None) {
        Ok(plan) => plan,
        Err(err) => return rejected(&err.to_operation_error()),
    };

    let (events, receiver) = mpsc::unbounded_channel();
    let engine = state.engine.clone();
    let principal = state.principal(&headers);
    // The run owns the transaction; it finishes even if the client leaves.
    let run = tokio::spawn(
        async move { engine.execute_observed(plan, principal, events).await }.in_current_span(),
    );

    let feed = Feed {
        events: receiver,
        run: Some(run),
        heartbeat: state.heartbeat.max(MIN_HEARTBEAT),
        opened: false,
        closed: false,
    };
    json_stream(Body::from_stream(stream::unfold(feed, Feed::next)))
}

fn json_stream(body: Body) -> Response {
    ([(CONTENT_TYPE, "application/json")], body).into_response()
}

/// A batch that failed to parse: an array holding only the trailer.
fn rejected(error: &OperationError) -> Response {
    let body = Value::Array(vec![trailer(error.status, Some(error))]);
    json_stream(Body::from(body.to_string()))
}

fn trailer(status: u16, error: Option<&OperationError>) -> Value {
    let mut trailer = json!({ "status": status });
    if let (Some(error), Some(map)) = (error, trailer.as_object_mut()) {
        map.insert("errors".to_string(), error.to_body()["errors"].clone());
    }
    trailer
}

fn element(lane: usize, index: usize, result: &OperationResult) -> Value {
    json!({
        "lane": lane,
        "index": index,
        "href": result.href,
        "verb": result.verb,
        "status": result.status,
        "body": result.body,
    })
}

/// Turns engine events into body chunks.
struct Feed {
    events: UnboundedReceiver<BatchEvent>,
    run: Option<JoinHandle<Result<BatchOutcome, BatchError>>>,
    heartbeat: Duration,
    opened: bool,
    closed: bool,
}

impl Feed {
    async fn next(mut self) -> Option<(Result<Bytes, Infallible>, Self)> {
        if self.closed {
            return None;
        }
        if !self.opened {
            self.opened = true;
            return Some((Ok(Bytes::from_static(b"[")), self));
        }

        let chunk = match tokio::time::timeout(self.heartbeat, self.events.recv()).await {
            Err(_) => {
                debug!("stream heartbeat");
                Bytes::from_static(b" ")
            }
            Ok(Some(BatchEvent::Completed {
                lane,
                index,
                result,
            })) => {
                let mut chunk = element(lane, index, &result).to_string();
                chunk.push(',');
                Bytes::from(chunk)
            }
            Ok(Some(BatchEvent::Finished { status, .. })) => {
                self.closed = true;
                closing(&trailer(status, None))
            }
            // The run ended without a final event: it never started.
            Ok(None) => {
                self.closed = true;
                let error = self.failure().await;
                closing(&trailer(error.status, Some(&error)))
            }
        };
        Some((Ok(chunk), self))
    }

    async fn failure(&mut self) -> OperationError {
        let Some(run) = self.run.take() else {
            return OperationError::internal("batch run is gone");
        };
        match run.await {
            Ok(Err(err)) => err.to_operation_error(),
            Ok(Ok(_)) => OperationError::internal("batch finished without a final event"),
            Err(err) => {
                error!(error = %err, "streaming batch task failed");
                OperationError::internal("batch run aborted")
            }
        }
    }
}

fn closing(trailer: &Value) -> Bytes {
    Bytes::from(format!("{trailer}]"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlrest_domain::codes;

    #[test]
    fn test_trailer_shapes() {
        assert_eq!(trailer(201, None), json!({"status": 201}));

        let error = OperationError::no_verb(0);
        let value = trailer(400, Some(&error));
        assert_eq!(value["status"], 400);
        assert_eq!(value["errors"][0]["code"], codes::NO_VERB);
    }

    #[tokio::test]
    async fn test_feed_frames_events_as_a_json_array() {
        let (events, receiver) = mpsc::unbounded_channel();
        let result = OperationResult {
            href: "/items/1".to_string(),
            verb: "GET".to_string(),
            status: 200,
            body: json!({"id": 1}),
        };
        events
            .send(BatchEvent::Completed {
                lane: 0,
                index: 0,
                result,
            })
            .unwrap();
        events
            .send(BatchEvent::Finished {
                status: 200,
                committed: true,
            })
            .unwrap();
        drop(events);

        let mut feed = Feed {
            events: receiver,
            run: None,
            heartbeat: Duration::from_secs(5),
            opened: false,
            closed: false,
        };
        let mut body = Vec::new();
        while let Some((chunk, next)) = feed.next().await {
            body.extend_from_slice(&chunk.unwrap());
            feed = next;
        }

        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            parsed,
            json!([
                {"lane": 0, "index": 0, "href": "/items/1", "verb": "GET", "status": 200, "body": {"id": 1}},
                {"status": 200}
            ])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_writes_heartbeats_while_idle() {
        let (events, receiver) = mpsc::unbounded_channel::<BatchEvent>();
        let feed = Feed {
            events: receiver,
            run: None,
            heartbeat: Duration::from_millis(50),
            opened: true,
            closed: false,
        };

        let (chunk, feed) = feed.next().await.unwrap();
        assert_eq!(chunk.unwrap(), Bytes::from_static(b" "));

        events
            .send(BatchEvent::Finished {
                status: 201,
                committed: true,
            })
            .unwrap();
        let (chunk, feed) = feed.next().await.unwrap();
        assert_eq!(chunk.unwrap(), Bytes::from_static(b"{\"status\":201}]"));
        assert!(feed.next().await.is_none());
    }
}
