use std::time::Duration;

use async_std::sync::Mutex;
use bytes::Bytes;
use futures::Future;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::client::Outcome::{NextReplica, Rejected, Success};
use crate::paxos::{ClientId, RequestId, SequenceNumber};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request {0} rejected: {1}")]
    Rejected(RequestId, String),

    #[error("No reply for request {0} after {1} attempts")]
    Unavailable(RequestId, usize),
}

// The outcome of sending a request to one replica. Used to facilitate retries
// which move on to another replica.
enum Outcome {
    // The request was executed and this is its reply.
    Success(Bytes),

    // The cluster refused the request. Sending it again won't help.
    Rejected(String),

    // The replica did not answer in time, or could not be reached. The same
    // request is sent to the next replica.
    NextReplica,
}

struct State {
    sequence: SequenceNumber,

    // The replica which answered last, tried first next time.
    current: usize,
}

// A client talking to the cluster's HTTP front-ends. Requests are numbered per
// client, and a request keeps its id across retries, so that it is executed
// at most once no matter how often it is sent.
pub struct Client {
    name: String,
    client_id: ClientId,
    replicas: Vec<String>,
    http: reqwest::Client,
    state: Mutex<State>,
    max_attempts: usize,
}

impl Client {
    // Returns a new client with a random id. The supplied addresses are the
    // "host:port" pairs of the replicas' HTTP front-ends.
    pub fn new(name: &str, replicas: Vec<String>) -> Self {
        let client_id = rand::random::<ClientId>();
        Client {
            name: name.into(),
            client_id,
            max_attempts: 10 * replicas.len().max(1),
            replicas,
            http: reqwest::Client::new(),
            state: Mutex::new(State {
                sequence: 0,
                current: 0,
            }),
        }
    }

    // Executes the supplied command on the replicated state machine. Returns
    // once the command was executed (or the operation has failed). Commands
    // of one client are executed one at a time, in order.
    pub async fn execute(&self, command: &[u8]) -> Result<Bytes, ClientError> {
        let mut state = self.state.lock().await;
        state.sequence += 1;
        let id = RequestId::new(self.client_id, state.sequence);
        let body = Bytes::copy_from_slice(command);

        let (result, current) = self
            .retry_helper(id, state.current, |replica: String| {
                Client::execute_impl(self.http.clone(), replica, id, body.clone())
            })
            .await;
        state.current = current;
        result
    }

    // Sends the request to one replica after the other, starting at "first",
    // until one of them produces a final outcome. Returns the result along
    // with the replica to start at next time.
    async fn retry_helper<Fut>(
        &self,
        id: RequestId,
        first: usize,
        operation: impl Fn(String) -> Fut,
    ) -> (Result<Bytes, ClientError>, usize)
    where
        Fut: Future<Output = Outcome>,
    {
        let count = self.replicas.len();
        if count == 0 {
            return (Err(ClientError::Unavailable(id, 0)), 0);
        }
        let mut current = first % count;
        for attempt in 0..self.max_attempts {
            match operation(self.replicas[current].clone()).await {
                Success(reply) => return (Ok(reply), current),
                Rejected(reason) => return (Err(ClientError::Rejected(id, reason)), current),
                NextReplica => {
                    current = (current + 1) % count;
                    debug!(name = %self.name, %id, attempt, next = %self.replicas[current], "retrying");
                }
            }
            sleep(Duration::from_millis(100)).await;
        }
        (Err(ClientError::Unavailable(id, self.max_attempts)), current)
    }

    // The body of an individual request sent to one replica.
    async fn execute_impl(
        http: reqwest::Client,
        replica: String,
        id: RequestId,
        body: Bytes,
    ) -> Outcome {
        let url = format!(
            "http://{}/request/{}/{}",
            replica, id.client_id, id.sequence
        );
        let response = match http
            .post(url)
            .body(body)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                debug!(%replica, %error, "request failed");
                return NextReplica;
            }
        };

        let status = response.status();
        let payload = match response.bytes().await {
            Ok(payload) => payload,
            Err(_) => return NextReplica,
        };
        match status {
            StatusCode::OK => Success(payload),
            StatusCode::CONFLICT => Rejected(String::from_utf8_lossy(&payload).into_owned()),
            _ => NextReplica,
        }
    }
}
