//! Outbound side of one connection.
//!
//! Everything another task may touch lives behind a single mutex: the FIFO
//! of encoded messages, the pending key-update set, the closed flag, the
//! append high-water mark and the live permissions. A dedicated writer task
//! owns the socket sink, sleeps on a [`Notify`] waker and drains batches,
//! so exactly one task ever writes to the socket.

use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::store::{Key, Permissions};
use crate::wire::{self, ErrorCode, Message};

pub struct Outbox {
    state: Mutex<OutboxState>,
    wakeup: Notify,
}

struct OutboxState {
    /// Encoded messages other than key information, in FIFO order.
    queue: Vec<Vec<u8>>,
    /// Pending key updates, one slot per name: a newer version enqueued
    /// before the writer drains replaces the older one.
    keys: Vec<Key>,
    closed: bool,
    /// Highest `offset + len` already enqueued as an append. Appends that
    /// start below it are duplicates and are dropped.
    last_end: u64,
    protocol_version: u16,
    permissions: Permissions,
    max_size: usize,
}

/// One writer drain: everything queued at the moment of the call.
pub struct Batch {
    pub messages: Vec<Vec<u8>>,
    pub keys: Vec<Key>,
    pub closed: bool,
    pub protocol_version: u16,
    pub max_size: usize,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.keys.is_empty()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self {
            state: Mutex::new(OutboxState {
                queue: Vec::new(),
                keys: Vec::new(),
                closed: false,
                last_end: 0,
                protocol_version: 2,
                permissions: Permissions::default(),
                max_size: wire::DEFAULT_MAX_MESSAGE_SIZE,
            }),
            wakeup: Notify::new(),
        }
    }
}

impl Outbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Apply the handshake results. Called once, before the connection
    /// joins a session.
    pub fn configure(&self, protocol_version: u16, max_size: usize, permissions: Permissions) {
        let mut state = self.lock();
        state.protocol_version = protocol_version;
        if max_size != 0 {
            state.max_size = max_size;
        }
        state.permissions = permissions;
    }

    pub fn permissions(&self) -> Permissions {
        self.lock().permissions
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Record that the document now ends at `length` (after a self-issued
    /// append was committed), so echoes of older writes are dropped.
    pub fn set_last_end(&self, length: u64) {
        self.lock().last_end = length;
    }

    pub fn enqueue(&self, message: &Message) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let encoded = message.encode(state.protocol_version);
        state.queue.push(encoded);
        drop(state);
        self.wakeup.notify_one();
    }

    /// Enqueue document bytes starting at `offset`, skipping ranges the
    /// client has already been sent.
    pub fn enqueue_append(&self, offset: u64, data: &[u8]) {
        let mut state = self.lock();
        if state.closed || offset < state.last_end {
            return;
        }
        state.last_end = offset + data.len() as u64;
        let encoded = Message::Append {
            generation: 0,
            offset,
            data: data.to_vec(),
        }
        .encode(state.protocol_version);
        state.queue.push(encoded);
        drop(state);
        self.wakeup.notify_one();
    }

    pub fn enqueue_broadcast(&self, data: &[u8]) {
        self.enqueue(&Message::Broadcast {
            data: data.to_vec(),
        });
    }

    pub fn enqueue_error(&self, code: ErrorCode, text: &str) {
        let description = if text.is_empty() {
            code.default_text().to_string()
        } else {
            text.to_string()
        };
        debug!(code = code.code(), %description, "client error");
        self.enqueue(&Message::Error { code, description });
    }

    pub fn enqueue_append_ack(&self, status: u16, offset: u64) {
        self.enqueue(&Message::AppendAck { status, offset });
    }

    pub fn enqueue_set_key_ack(&self, accepted: bool, request_id: u16) {
        self.enqueue(&Message::SetKeyAck {
            status: u16::from(accepted),
            request_id,
        });
    }

    /// Stage key updates for the writer. A key may be updated again before
    /// the writer gets to it; only the newest version per name survives.
    pub fn notify_keys_updated(&self, keys: Vec<Key>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let mut added = false;
        'outer: for key in keys {
            for pending in state.keys.iter_mut() {
                if pending.name == key.name {
                    if key.version >= pending.version {
                        *pending = key;
                        added = true;
                    }
                    continue 'outer;
                }
            }
            state.keys.push(key);
            added = true;
        }
        drop(state);
        if added {
            self.wakeup.notify_one();
        }
    }

    /// The client can no longer use the document: send a final error and
    /// shut the connection down.
    pub fn notify_lost_access(&self, code: ErrorCode) {
        self.enqueue_error(code, "");
        self.close();
    }

    /// Apply a live permission change; revoking read closes the
    /// connection.
    pub fn update_permissions(&self, permissions: Permissions) {
        {
            let mut state = self.lock();
            state.permissions = permissions;
        }
        if !permissions.read {
            self.notify_lost_access(ErrorCode::AccessDenied);
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.wakeup.notify_one();
    }

    /// Drain everything queued. The writer calls this in a loop; tests call
    /// it to observe what a client would have been sent.
    pub fn take_batch(&self) -> Batch {
        let mut state = self.lock();
        Batch {
            messages: std::mem::take(&mut state.queue),
            keys: std::mem::take(&mut state.keys),
            closed: state.closed,
            protocol_version: state.protocol_version,
            max_size: state.max_size,
        }
    }

    async fn wait_for_work(&self) {
        self.wakeup.notified().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutboxState> {
        self.state.lock().expect("outbox mutex poisoned")
    }
}

/// Writer task: sole owner of the socket sink. Wakes when the outbox has
/// work or is closed, sends queued messages then the coalesced key
/// information, and closes the socket after the final drain.
pub async fn run_writer(outbox: Arc<Outbox>, mut sink: SplitSink<WebSocket, WsMessage>) {
    loop {
        let batch = outbox.take_batch();
        if batch.is_empty() && !batch.closed {
            outbox.wait_for_work().await;
            continue;
        }

        for message in batch.messages {
            if send_fragmented(&mut sink, message, batch.max_size).await.is_err() {
                outbox.close();
                return;
            }
        }

        if !batch.keys.is_empty() {
            let encoded = Message::KeyInformation { keys: batch.keys }.encode(batch.protocol_version);
            if send_fragmented(&mut sink, encoded, batch.max_size).await.is_err() {
                outbox.close();
                return;
            }
        }

        if batch.closed {
            let _ = sink.close().await;
            return;
        }
    }
}

async fn send_fragmented(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    message: Vec<u8>,
    max_size: usize,
) -> Result<(), axum::Error> {
    for frame in wire::fragment(message, max_size) {
        if let Err(e) = sink.send(WsMessage::Binary(frame.into())).await {
            trace!("socket write failed: {e}");
            return Err(e);
        }
    }
    Ok(())
}
