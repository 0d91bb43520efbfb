//! Deferred webhook notifications.
//!
//! Events wait in a deadline-ordered queue until due, then are delivered
//! concurrently. Producers can cancel pending events; each event carries
//! its own URL and credentials so the queue knows nothing about sessions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Idle poll horizon when the queue is empty.
const EMPTY_QUEUE_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub send_by: Instant,
    pub name: String,
    pub document_id: String,
    pub url: String,
    pub username: String,
    pub password: String,
}

pub struct WebhookQueue {
    events: Mutex<Vec<WebhookEvent>>,
    wakeup: Notify,
    client: reqwest::Client,
}

impl WebhookQueue {
    /// Create the queue and start its sleeper task.
    pub fn spawn() -> Arc<Self> {
        let queue = Arc::new(Self {
            events: Mutex::new(Vec::new()),
            wakeup: Notify::new(),
            client: reqwest::Client::new(),
        });
        tokio::spawn(run(queue.clone()));
        queue
    }

    pub fn add(&self, event: WebhookEvent) {
        debug!(name = %event.name, doc_id = %event.document_id, "queue webhook");
        self.lock().push(event);
        self.wakeup.notify_one();
    }

    /// Drop every pending event matching the predicate. Linear scan; the
    /// queue stays small.
    pub fn remove_if(&self, pred: impl Fn(&WebhookEvent) -> bool) {
        self.lock().retain(|event| {
            if pred(event) {
                debug!(name = %event.name, doc_id = %event.document_id, "remove queued webhook");
                false
            } else {
                true
            }
        });
        self.wakeup.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WebhookEvent>> {
        self.events.lock().expect("webhook queue mutex poisoned")
    }
}

async fn run(queue: Arc<WebhookQueue>) {
    loop {
        let now = Instant::now();
        let mut due = Vec::new();
        let next = {
            let mut events = queue.lock();
            events.retain(|event| {
                if event.send_by <= now {
                    due.push(event.clone());
                    false
                } else {
                    true
                }
            });
            events
                .iter()
                .map(|event| event.send_by)
                .min()
                .unwrap_or(now + EMPTY_QUEUE_SLEEP)
        };

        for event in due {
            tokio::spawn(deliver(queue.client.clone(), event));
        }

        tokio::select! {
            _ = queue.wakeup.notified() => {}
            _ = sleep_until(next) => {}
        }
    }
}

async fn deliver(client: reqwest::Client, event: WebhookEvent) {
    let body = json!({
        "event": event.name,
        "documentID": event.document_id,
    });

    let mut request = client.post(&event.url).json(&body);
    if !event.username.is_empty() || !event.password.is_empty() {
        request = request.basic_auth(&event.username, Some(&event.password));
    }

    match request.send().await {
        Ok(response) => info!(
            name = %event.name,
            doc_id = %event.document_id,
            url = %event.url,
            status = %response.status(),
            "webhook delivered"
        ),
        Err(e) => warn!(
            name = %event.name,
            doc_id = %event.document_id,
            url = %event.url,
            "webhook delivery failed: {e}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, doc: &str, in_ms: u64) -> WebhookEvent {
        WebhookEvent {
            send_by: Instant::now() + Duration::from_millis(in_ms),
            name: name.to_string(),
            document_id: doc.to_string(),
            url: "http://127.0.0.1:9/unreachable".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }

    #[tokio::test]
    async fn remove_if_cancels_matching_events() {
        let queue = WebhookQueue::spawn();
        queue.add(event("idle-session", "a", 60_000));
        queue.add(event("idle-session", "b", 60_000));
        assert_eq!(queue.pending(), 2);

        queue.remove_if(|e| e.document_id == "a");
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn due_events_leave_the_queue() {
        let queue = WebhookQueue::spawn();
        queue.add(event("idle-session", "a", 10));
        queue.add(event("idle-session", "b", 60_000));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.pending(), 1);
    }
}
