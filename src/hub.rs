//! The session hub: the single owner of all cross-client session state.
//!
//! Every mutation is a typed command processed one at a time by the hub
//! task, which gives sequential consistency for per-document membership
//! and key state without fine-grained locks. Callers that need an answer
//! attach a oneshot reply channel. Handlers never touch storage — the
//! client engine does that before posting, so the hub task never blocks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::session::ClientId;
use crate::session::outbox::Outbox;
use crate::store::{Key, Permissions};
use crate::webhook::{WebhookEvent, WebhookQueue};
use crate::wire::ErrorCode;

/// Event name posted when a session has stayed empty past its deadline.
pub const IDLE_SESSION_EVENT: &str = "idle-session";

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub webhook_url: Option<String>,
    pub secret_user: String,
    pub secret_password: String,
    /// How long a session must stay empty before the idle event fires.
    pub idle_deadline: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            secret_user: String::new(),
            secret_password: String::new(),
            idle_deadline: Duration::from_secs(10),
        }
    }
}

/// What the hub keeps per participant: the id and the enqueue side of the
/// connection. The connection owns everything else.
#[derive(Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    pub user_id: String,
    pub outbox: Arc<Outbox>,
}

struct Session {
    clients: Vec<ClientHandle>,
    keys: Vec<ClientKey>,
}

struct ClientKey {
    key: Key,
    owner: ClientId,
}

enum Command {
    AddClient {
        doc_id: String,
        client: ClientHandle,
    },
    RemoveClient {
        doc_id: String,
        client_id: ClientId,
    },
    Append {
        doc_id: String,
        source: ClientId,
        offset: u64,
        data: Vec<u8>,
    },
    Broadcast {
        doc_id: String,
        source: ClientId,
        data: Vec<u8>,
    },
    SetSessionKey {
        doc_id: String,
        source: ClientId,
        key: Key,
    },
    SetClientKey {
        doc_id: String,
        source: ClientId,
        old_version: u32,
        key: Key,
        reply: oneshot::Sender<bool>,
    },
    ClientKeys {
        doc_id: String,
        reply: oneshot::Sender<Vec<Key>>,
    },
    SignalDocumentDeleted {
        doc_id: String,
    },
    UpdatePermissions {
        user_id: String,
        permissions: Permissions,
    },
}

/// Cloneable handle posting commands to the hub task.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<Command>,
}

impl Hub {
    pub fn spawn(webhooks: Arc<WebhookQueue>, config: HubConfig) -> Hub {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, webhooks, config));
        Hub { tx }
    }

    pub fn add_client(&self, doc_id: &str, client: ClientHandle) {
        self.send(Command::AddClient {
            doc_id: doc_id.to_string(),
            client,
        });
    }

    pub fn remove_client(&self, doc_id: &str, client_id: ClientId) {
        self.send(Command::RemoveClient {
            doc_id: doc_id.to_string(),
            client_id,
        });
    }

    pub fn append(&self, doc_id: &str, source: ClientId, offset: u64, data: Vec<u8>) {
        self.send(Command::Append {
            doc_id: doc_id.to_string(),
            source,
            offset,
            data,
        });
    }

    pub fn broadcast(&self, doc_id: &str, source: ClientId, data: Vec<u8>) {
        self.send(Command::Broadcast {
            doc_id: doc_id.to_string(),
            source,
            data,
        });
    }

    /// Fan out a session key that storage has already accepted.
    pub fn set_session_key(&self, doc_id: &str, source: ClientId, key: Key) {
        self.send(Command::SetSessionKey {
            doc_id: doc_id.to_string(),
            source,
            key,
        });
    }

    /// Compare-and-set a client-lifetime key; returns whether it was
    /// accepted.
    pub async fn set_client_key(
        &self,
        doc_id: &str,
        source: ClientId,
        old_version: u32,
        key: Key,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetClientKey {
            doc_id: doc_id.to_string(),
            source,
            old_version,
            key,
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Snapshot of the session's live client keys.
    pub async fn client_keys(&self, doc_id: &str) -> Vec<Key> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ClientKeys {
            doc_id: doc_id.to_string(),
            reply,
        });
        rx.await.unwrap_or_default()
    }

    /// The document is gone: evict every participant.
    pub fn signal_document_deleted(&self, doc_id: &str) {
        self.send(Command::SignalDocumentDeleted {
            doc_id: doc_id.to_string(),
        });
    }

    pub fn update_permissions(&self, user_id: &str, permissions: Permissions) {
        self.send(Command::UpdatePermissions {
            user_id: user_id.to_string(),
            permissions,
        });
    }

    fn send(&self, command: Command) {
        // The hub task lives for the whole process; a send can only fail
        // during shutdown, when nobody cares about the command anymore.
        let _ = self.tx.send(command);
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Command>,
    webhooks: Arc<WebhookQueue>,
    config: HubConfig,
) {
    let mut sessions: HashMap<String, Session> = HashMap::new();
    while let Some(command) = rx.recv().await {
        handle(&mut sessions, &webhooks, &config, command);
    }
}

fn handle(
    sessions: &mut HashMap<String, Session>,
    webhooks: &WebhookQueue,
    config: &HubConfig,
    command: Command,
) {
    match command {
        Command::AddClient { doc_id, client } => {
            info!(client = %client.id, doc_id, "client registers for document");
            if !sessions.contains_key(&doc_id) {
                webhooks
                    .remove_if(|e| e.name == IDLE_SESSION_EVENT && e.document_id == doc_id);
            }
            sessions
                .entry(doc_id)
                .or_insert_with(|| Session {
                    clients: Vec::new(),
                    keys: Vec::new(),
                })
                .clients
                .push(client);
        }

        Command::RemoveClient { doc_id, client_id } => {
            let Some(session) = sessions.get_mut(&doc_id) else {
                return;
            };
            info!(client = %client_id, doc_id, "client removed from document");
            session.clients.retain(|c| c.id != client_id);

            // The departing client's keys become tombstones the others see.
            let mut tombstones = Vec::new();
            session.keys.retain(|entry| {
                if entry.owner == client_id {
                    tombstones.push(Key {
                        version: entry.key.version + 1,
                        name: entry.key.name.clone(),
                        value: String::new(),
                    });
                    false
                } else {
                    true
                }
            });
            if !tombstones.is_empty() {
                for client in &session.clients {
                    client.outbox.notify_keys_updated(tombstones.clone());
                }
            }

            if session.clients.is_empty() {
                sessions.remove(&doc_id);
                if let Some(url) = &config.webhook_url {
                    webhooks.add(WebhookEvent {
                        send_by: Instant::now() + config.idle_deadline,
                        name: IDLE_SESSION_EVENT.to_string(),
                        document_id: doc_id,
                        url: url.clone(),
                        username: config.secret_user.clone(),
                        password: config.secret_password.clone(),
                    });
                }
            }
        }

        Command::Append {
            doc_id,
            source,
            offset,
            data,
        } => {
            let Some(session) = sessions.get(&doc_id) else {
                return;
            };
            debug!(client = %source, doc_id, offset, len = data.len(), "append fan-out");
            for other in &session.clients {
                if other.id != source {
                    other.outbox.enqueue_append(offset, &data);
                }
            }
        }

        Command::Broadcast {
            doc_id,
            source,
            data,
        } => {
            let Some(session) = sessions.get(&doc_id) else {
                return;
            };
            debug!(client = %source, doc_id, len = data.len(), "broadcast fan-out");
            for other in &session.clients {
                if other.id != source {
                    other.outbox.enqueue_broadcast(&data);
                }
            }
        }

        Command::SetSessionKey {
            doc_id,
            source,
            key,
        } => {
            let Some(session) = sessions.get(&doc_id) else {
                return;
            };
            for other in &session.clients {
                if other.id != source {
                    other.outbox.notify_keys_updated(vec![key.clone()]);
                }
            }
        }

        Command::SetClientKey {
            doc_id,
            source,
            old_version,
            key,
            reply,
        } => {
            let accepted = sessions
                .get_mut(&doc_id)
                .map(|session| set_client_key(session, source, old_version, key))
                .unwrap_or(false);
            let _ = reply.send(accepted);
        }

        Command::ClientKeys { doc_id, reply } => {
            let keys = sessions
                .get(&doc_id)
                .map(|session| session.keys.iter().map(|entry| entry.key.clone()).collect())
                .unwrap_or_default();
            let _ = reply.send(keys);
        }

        Command::SignalDocumentDeleted { doc_id } => {
            let Some(session) = sessions.get(&doc_id) else {
                return;
            };
            info!(doc_id, "document deleted, evicting clients");
            for client in &session.clients {
                client.outbox.notify_lost_access(ErrorCode::DoesNotExist);
            }
        }

        Command::UpdatePermissions {
            user_id,
            permissions,
        } => {
            for session in sessions.values() {
                for client in &session.clients {
                    if client.user_id == user_id {
                        client.outbox.update_permissions(permissions);
                    }
                }
            }
        }
    }
}

fn set_client_key(session: &mut Session, source: ClientId, old_version: u32, key: Key) -> bool {
    let mut accepted = false;
    match session.keys.iter_mut().find(|entry| entry.key.name == key.name) {
        Some(entry) => {
            if entry.key.version == old_version {
                entry.key = key.clone();
                entry.owner = source;
                accepted = true;
            }
        }
        None => {
            if old_version == 0 {
                session.keys.push(ClientKey {
                    key: key.clone(),
                    owner: source,
                });
                accepted = true;
            }
        }
    }

    if accepted {
        for other in &session.clients {
            if other.id != source {
                other.outbox.notify_keys_updated(vec![key.clone()]);
            }
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ErrorCode, Message};

    fn test_hub(config: HubConfig) -> (Hub, Arc<WebhookQueue>) {
        let webhooks = WebhookQueue::spawn();
        let hub = Hub::spawn(webhooks.clone(), config);
        (hub, webhooks)
    }

    fn handle(id: u64) -> ClientHandle {
        ClientHandle {
            id: ClientId(id),
            user_id: format!("user-{id}"),
            outbox: Outbox::new(),
        }
    }

    fn key(version: u32, name: &str, value: &str) -> Key {
        Key {
            version,
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn decoded(outbox: &Outbox) -> Vec<Message> {
        outbox
            .take_batch()
            .messages
            .iter()
            .map(|m| Message::decode(m).expect("decode"))
            .collect()
    }

    #[tokio::test]
    async fn append_reaches_everyone_but_the_source() {
        let (hub, _) = test_hub(HubConfig::default());
        let (a, b) = (handle(1), handle(2));
        hub.add_client("doc", a.clone());
        hub.add_client("doc", b.clone());

        hub.append("doc", ClientId(1), 0, b"HELLO".to_vec());
        hub.client_keys("doc").await; // barrier: commands are processed in order

        assert!(a.outbox.take_batch().is_empty());
        let messages = decoded(&b.outbox);
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], Message::Append { offset: 0, data, .. } if data == b"HELLO"));
    }

    #[tokio::test]
    async fn duplicate_append_is_dropped_per_recipient() {
        let (hub, _) = test_hub(HubConfig::default());
        let (a, b) = (handle(1), handle(2));
        hub.add_client("doc", a.clone());
        hub.add_client("doc", b.clone());

        hub.append("doc", ClientId(1), 0, b"HELLO".to_vec());
        hub.append("doc", ClientId(1), 0, b"HELLO".to_vec());
        hub.client_keys("doc").await;

        assert_eq!(b.outbox.take_batch().messages.len(), 1);
    }

    #[tokio::test]
    async fn client_key_cas_rules() {
        let (hub, _) = test_hub(HubConfig::default());
        let (a, b) = (handle(1), handle(2));
        hub.add_client("doc", a.clone());
        hub.add_client("doc", b.clone());

        // Fresh insert needs old_version == 0.
        assert!(hub.set_client_key("doc", ClientId(1), 0, key(1, "cursor", "12")).await);
        assert!(!hub.set_client_key("doc", ClientId(2), 0, key(1, "cursor", "99")).await);
        // Update in place against the current version.
        assert!(hub.set_client_key("doc", ClientId(2), 1, key(2, "cursor", "34")).await);
        // Unknown name with non-zero base is rejected.
        assert!(!hub.set_client_key("doc", ClientId(1), 3, key(4, "other", "x")).await);

        let keys = hub.client_keys("doc").await;
        assert_eq!(keys, vec![key(2, "cursor", "34")]);

        // The non-source observed both accepted writes, coalesced by name.
        let batch = a.outbox.take_batch();
        assert_eq!(batch.keys, vec![key(2, "cursor", "34")]);
    }

    #[tokio::test]
    async fn disconnect_tombstones_owned_keys_exactly_once() {
        let (hub, _) = test_hub(HubConfig::default());
        let (a, b) = (handle(1), handle(2));
        hub.add_client("doc", a.clone());
        hub.add_client("doc", b.clone());

        assert!(hub.set_client_key("doc", ClientId(1), 0, key(1, "cursor", "12")).await);
        let _ = b.outbox.take_batch();

        hub.remove_client("doc", ClientId(1));
        hub.client_keys("doc").await;

        let batch = b.outbox.take_batch();
        assert_eq!(batch.keys, vec![key(2, "cursor", "")]);
        assert!(hub.client_keys("doc").await.is_empty());
    }

    #[tokio::test]
    async fn session_key_fan_out_skips_source() {
        let (hub, _) = test_hub(HubConfig::default());
        let (a, b) = (handle(1), handle(2));
        hub.add_client("doc", a.clone());
        hub.add_client("doc", b.clone());

        hub.set_session_key("doc", ClientId(1), key(1, "title", "A"));
        hub.client_keys("doc").await;

        assert!(a.outbox.take_batch().keys.is_empty());
        assert_eq!(b.outbox.take_batch().keys, vec![key(1, "title", "A")]);
    }

    #[tokio::test]
    async fn document_deleted_evicts_clients() {
        let (hub, _) = test_hub(HubConfig::default());
        let a = handle(1);
        hub.add_client("doc", a.clone());

        hub.signal_document_deleted("doc");
        hub.client_keys("doc").await;

        let batch = a.outbox.take_batch();
        assert!(batch.closed);
        let first = Message::decode(&batch.messages[0]).unwrap();
        assert!(matches!(first, Message::Error { code: ErrorCode::DoesNotExist, .. }));
    }

    #[tokio::test]
    async fn permission_revocation_closes_matching_users_only() {
        let (hub, _) = test_hub(HubConfig::default());
        let (a, b) = (handle(1), handle(2));
        hub.add_client("doc", a.clone());
        hub.add_client("doc", b.clone());

        hub.update_permissions("user-1", Permissions::parse(""));
        hub.client_keys("doc").await;

        assert!(a.outbox.is_closed());
        assert!(!b.outbox.is_closed());
    }

    #[tokio::test]
    async fn empty_session_schedules_idle_webhook_and_rejoin_cancels_it() {
        let config = HubConfig {
            webhook_url: Some("http://127.0.0.1:9/hook".to_string()),
            idle_deadline: Duration::from_secs(60),
            ..HubConfig::default()
        };
        let (hub, webhooks) = test_hub(config);

        hub.add_client("doc", handle(1));
        hub.remove_client("doc", ClientId(1));
        hub.client_keys("doc").await;
        assert_eq!(webhooks.pending(), 1);

        hub.add_client("doc", handle(2));
        hub.client_keys("doc").await;
        assert_eq!(webhooks.pending(), 0);
    }

    #[tokio::test]
    async fn operations_on_unknown_sessions_are_no_ops() {
        let (hub, _) = test_hub(HubConfig::default());
        hub.append("ghost", ClientId(1), 0, b"x".to_vec());
        hub.broadcast("ghost", ClientId(1), b"x".to_vec());
        hub.remove_client("ghost", ClientId(1));
        hub.signal_document_deleted("ghost");
        assert!(!hub.set_client_key("ghost", ClientId(1), 0, key(1, "k", "v")).await);
        assert!(hub.client_keys("ghost").await.is_empty());
    }
}
