//! Scripted in-memory transport for tests.

use crate::api::{ApiRequest, RawResponse, Transport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

type Reply = Result<RawResponse, TransportError>;

/// Replies are queued per path and handed out in order; the last reply for a
/// path repeats once the queue is down to one.
#[derive(Default)]
pub struct FakeTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<ApiRequest>>,
    latency: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, path: &str, status: u16, body: &str) {
        self.push(
            path,
            Ok(RawResponse {
                status,
                body: body.to_string(),
            }),
        );
    }

    pub fn fail(&self, path: &str, error: TransportError) {
        self.push(path, Err(error));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    fn push(&self, path: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    fn next_reply(&self, path: &str) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        let Some(queue) = replies.get_mut(path) else {
            return Ok(RawResponse {
                status: 404,
                body: String::new(),
            });
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: ApiRequest) -> Result<RawResponse, TransportError> {
        let path = request.path.clone();
        self.requests.lock().unwrap().push(request);

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.next_reply(&path)
    }

    fn verify_tls(&self) -> bool {
        true
    }
}

pub fn token_body(access_token: &str, expires_in: i64) -> String {
    serde_json::json!({
        "access_token": access_token,
        "token_type": "bearer",
        "refresh_token": format!("refresh-{access_token}"),
        "expires_in": expires_in,
    })
    .to_string()
}
