use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::paxos::{ClientId, Request, SequenceNumber};
use crate::replica::requests::{ClientReply, RequestManager};

// How long a request waits for its reply before the client is told to retry.
const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

// Serves client requests over HTTP:
//
// > curl -X POST localhost:12345/request/7/1 --data "set foo bar"
//
// Answers 200 with the reply, 409 if the request was refused, and 504 if no
// reply arrived in time. The latter is safe to retry with the same ids.
#[derive(Clone)]
pub struct HttpHandler {
    requests: Arc<RequestManager>,
    reply_timeout: Duration,
}

impl HttpHandler {
    pub fn new(requests: Arc<RequestManager>) -> Self {
        HttpHandler {
            requests,
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    pub fn with_reply_timeout(self, reply_timeout: Duration) -> Self {
        Self {
            reply_timeout,
            ..self
        }
    }

    pub fn routes(self) -> Router {
        Router::new()
            .route("/request/{client_id}/{sequence}", post(handle_request))
            .with_state(Arc::new(self))
    }
}

async fn handle_request(
    State(handler): State<Arc<HttpHandler>>,
    Path((client_id, sequence)): Path<(ClientId, SequenceNumber)>,
    body: Bytes,
) -> (StatusCode, Bytes) {
    let request = Request::new(client_id, sequence, body);
    let id = request.id;
    let (sender, receiver) = oneshot::channel();
    if let Err(error) = handler
        .requests
        .on_client_request(request, Box::new(sender))
        .await
    {
        warn!(%id, %error, "unable to accept request");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Bytes::from(error.to_string()),
        );
    }

    match timeout(handler.reply_timeout, receiver).await {
        Ok(Ok(ClientReply::Reply(value))) => (StatusCode::OK, value),
        Ok(Ok(ClientReply::Nack(reason))) => (StatusCode::CONFLICT, Bytes::from(reason)),
        // Replaced by a resubmission of the same request, or timed out.
        Ok(Err(_)) | Err(_) => {
            debug!(%id, "no reply in time");
            (StatusCode::GATEWAY_TIMEOUT, Bytes::new())
        }
    }
}
