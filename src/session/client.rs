//! Per-connection protocol engine.
//!
//! Each accepted socket runs two tasks: this reader, which drives the
//! handshake and dispatches decoded messages, and the writer spawned from
//! here, which owns the sink (see [`outbox`](super::outbox)). The reader
//! talks to storage directly and posts fan-out intents to the hub.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::error::StoreError;
use crate::hub::ClientHandle;
use crate::session::ClientId;
use crate::session::outbox::{Outbox, run_writer};
use crate::session::token;
use crate::store::{AppendOutcome, CreateMode, Key, Permissions};
use crate::wire::{self, ErrorCode, FrameAssembler, Message, ack};

/// The first logical message must arrive within this long.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

struct InitContext {
    doc_id: String,
    user_id: String,
}

/// Take over an accepted socket and run it until disconnect. Responsible
/// for leaving the hub however the reader exits.
pub async fn run_client(state: Arc<AppState>, socket: WebSocket) {
    let id = ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed) + 1);
    let (sink, mut stream) = socket.split();
    let outbox = Outbox::new();
    tokio::spawn(run_writer(outbox.clone(), sink));

    let mut assembler = FrameAssembler::new();

    let first = match timeout(INIT_TIMEOUT, read_logical(&mut stream, &mut assembler)).await {
        Ok(Some(message)) => message,
        Ok(None) | Err(_) => {
            debug!(client = %id, "no init message, closing");
            outbox.close();
            return;
        }
    };

    if first[0] == wire::SERVER_IDENTIFICATION {
        // Inter-server peering is not part of this build.
        debug!(client = %id, "peer identification received, closing");
        outbox.close();
        return;
    }

    let Some(ctx) = process_init(&state, id, &outbox, &first).await else {
        outbox.close();
        return;
    };
    info!(client = %id, doc_id = %ctx.doc_id, "client connected");

    state.hub.add_client(
        &ctx.doc_id,
        ClientHandle {
            id,
            user_id: ctx.user_id.clone(),
            outbox: outbox.clone(),
        },
    );

    // Joining snapshot: live client keys first, then the persisted session
    // keys (the per-name pending set coalesces duplicates).
    let client_keys = state.hub.client_keys(&ctx.doc_id).await;
    outbox.notify_keys_updated(client_keys);
    match state.store.get_document_keys(&ctx.doc_id).await {
        Ok(keys) => outbox.notify_keys_updated(keys),
        Err(e) => warn!(client = %id, "failed to load session keys: {e}"),
    }

    while let Some(message) = read_logical(&mut stream, &mut assembler).await {
        let keep_going = match message[0] {
            wire::APPEND_V2 | wire::APPEND => {
                process_append(&state, id, &ctx, &outbox, &message).await
            }
            wire::SET_KEY => process_set_key(&state, id, &ctx, &outbox, &message).await,
            wire::BROADCAST => process_broadcast(&state, id, &ctx, &message),
            other => {
                debug!(client = %id, "unexpected message type {other:#04x}");
                true
            }
        };
        if !keep_going {
            break;
        }
    }

    debug!(client = %id, doc_id = %ctx.doc_id, "client disconnected");
    outbox.close();
    state.hub.remove_client(&ctx.doc_id, id);
}

/// Read one reassembled logical message. `None` means the connection is
/// done for, whether by close, transport error or a malformed frame
/// sequence.
async fn read_logical(
    stream: &mut SplitStream<WebSocket>,
    assembler: &mut FrameAssembler,
) -> Option<Vec<u8>> {
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Binary(frame))) => match assembler.push(&frame) {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(e) => {
                    debug!("malformed frame: {e}");
                    return None;
                }
            },
            Some(Ok(WsMessage::Close(_))) | None => return None,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("socket read failed: {e}");
                return None;
            }
        }
    }
}

async fn process_init(
    state: &AppState,
    id: ClientId,
    outbox: &Outbox,
    raw: &[u8],
) -> Option<InitContext> {
    let message = match Message::decode(raw) {
        Ok(m) => m,
        Err(e) => {
            debug!(client = %id, "init decode failed: {e}");
            return None;
        }
    };
    let Message::Init {
        protocol_version,
        max_message_size,
        creation_mode,
        offset,
        doc_id: raw_id,
        data,
    } = message
    else {
        debug!(client = %id, "expected init message, got something else");
        return None;
    };

    if protocol_version != 2 && protocol_version != 3 {
        debug!(client = %id, "unsupported protocol version {protocol_version}");
        return None;
    }
    let Some(mut mode) = CreateMode::from_wire(creation_mode) else {
        debug!(client = %id, "unknown creation mode {creation_mode}");
        return None;
    };

    let mut error_code_on_missing = ErrorCode::DoesNotExist;

    // The document id doubles as a token: registered tokens first, then
    // (if configured) self-describing signed ones.
    let grant = match state.store.get_token(&raw_id).await {
        Ok(grant) => Some(grant),
        Err(StoreError::Missing) => match state.config.jwt_key.as_deref() {
            Some(jwt_key) => {
                match token::decode_token(jwt_key, state.config.jwt_key_is_base64, &raw_id) {
                    Ok(grant) => Some(grant),
                    Err(e) => {
                        debug!(client = %id, "token resolution failed: {e}");
                        outbox.configure(protocol_version, max_message_size as usize, Permissions::default());
                        outbox.enqueue_error(ErrorCode::AccessDenied, "");
                        return None;
                    }
                }
            }
            None => None,
        },
        Err(e) => {
            outbox.configure(protocol_version, max_message_size as usize, Permissions::default());
            outbox.enqueue_error(ErrorCode::Unspecified, &e.to_string());
            return None;
        }
    };

    let (doc_id, user_id, permissions) = match grant {
        Some(grant) => {
            debug!(client = %id, doc_id = %grant.doc_id, user_id = %grant.user_id, "token resolved");
            (grant.doc_id, grant.user_id, grant.permissions)
        }
        // Without a token system the raw id is the document id and the
        // client gets full access.
        None => (raw_id, String::new(), Permissions::full()),
    };
    outbox.configure(protocol_version, max_message_size as usize, permissions);

    if !permissions.read || (mode == CreateMode::AlwaysCreate && !permissions.write) {
        outbox.enqueue_error(ErrorCode::AccessDenied, "");
        return None;
    }
    if !permissions.write && mode == CreateMode::PossiblyCreate {
        // Read-only callers must not create; a missing document is an
        // access problem rather than a lookup failure.
        mode = CreateMode::NeverCreate;
        error_code_on_missing = ErrorCode::AccessDenied;
    }

    debug!(client = %id, doc_id, ?mode, "looking up document");
    let fetched = match state.store.get_document(&doc_id, mode, &data).await {
        Ok(fetched) => fetched,
        Err(StoreError::Exists) => {
            outbox.enqueue_error(ErrorCode::AlreadyExists, "");
            return None;
        }
        Err(StoreError::Missing) => {
            outbox.enqueue_error(error_code_on_missing, "");
            return None;
        }
        Err(e) => {
            outbox.enqueue_error(ErrorCode::Unspecified, &e.to_string());
            return None;
        }
    };

    // The creator already holds everything it sent; everyone else resumes
    // from the offset it asked for.
    let offset = if fetched.created {
        fetched.content.len() as u64
    } else {
        offset
    };
    if (fetched.content.len() as u64) < offset {
        outbox.enqueue_error(ErrorCode::InvalidOffset, "");
        return None;
    }

    // Always sent, even when empty: it doubles as the join acknowledgment.
    outbox.enqueue_append(offset, &fetched.content[offset as usize..]);

    Some(InitContext { doc_id, user_id })
}

async fn process_append(
    state: &AppState,
    id: ClientId,
    ctx: &InitContext,
    outbox: &Outbox,
    raw: &[u8],
) -> bool {
    let Ok(Message::Append { offset, data, .. }) = Message::decode(raw) else {
        debug!(client = %id, "append decode failed");
        return false;
    };

    // Without write permission the data is dropped but the append still
    // runs with an empty payload, probing the current length.
    let can_write = outbox.permissions().write;
    let payload = if can_write { data } else { Vec::new() };

    match state.store.append_document(&ctx.doc_id, offset, &payload).await {
        Ok(AppendOutcome::Appended { new_length }) if can_write => {
            outbox.enqueue_append_ack(ack::APPLIED, new_length);
            outbox.set_last_end(new_length);
            state.hub.append(&ctx.doc_id, id, offset, payload);
        }
        Ok(AppendOutcome::Appended { new_length }) => {
            outbox.enqueue_append_ack(ack::DISCARDED, new_length);
        }
        Ok(AppendOutcome::Conflict { current_length }) => {
            outbox.enqueue_append_ack(ack::NACK, current_length);
        }
        Err(StoreError::Missing) => {
            debug!(client = %id, doc_id = %ctx.doc_id, "append to missing document");
            outbox.enqueue_error(ErrorCode::DoesNotExist, "");
        }
        Err(e) => {
            warn!(client = %id, "append failed: {e}");
            return false;
        }
    }
    true
}

async fn process_set_key(
    state: &AppState,
    id: ClientId,
    ctx: &InitContext,
    outbox: &Outbox,
    raw: &[u8],
) -> bool {
    let Ok(Message::SetKey {
        request_id,
        lifetime,
        old_version,
        new_version,
        name,
        value,
    }) = Message::decode(raw)
    else {
        debug!(client = %id, "set-key decode failed");
        return false;
    };

    let permissions = outbox.permissions();
    let key = Key {
        version: new_version,
        name,
        value,
    };

    let accepted = if key.name.starts_with("admin:") && !permissions.admin {
        debug!(client = %id, name = %key.name, "admin key rejected, no admin permission");
        false
    } else if lifetime == 0 {
        state.hub.set_client_key(&ctx.doc_id, id, old_version, key).await
    } else {
        match state
            .store
            .set_document_key(&ctx.doc_id, old_version, key.clone())
            .await
        {
            Ok(()) => {
                state.hub.set_session_key(&ctx.doc_id, id, key);
                true
            }
            Err(StoreError::Conflict | StoreError::Missing) => false,
            Err(e) => {
                warn!(client = %id, "set document key failed: {e}");
                return false;
            }
        }
    };

    // An accepted write that did not move the version is a poll; stay
    // silent then.
    if !accepted || old_version != new_version {
        outbox.enqueue_set_key_ack(accepted, request_id);
    }
    true
}

fn process_broadcast(state: &AppState, id: ClientId, ctx: &InitContext, raw: &[u8]) -> bool {
    let Ok(Message::Broadcast { data }) = Message::decode(raw) else {
        debug!(client = %id, "broadcast decode failed");
        return false;
    };
    state.hub.broadcast(&ctx.doc_id, id, data);
    true
}
