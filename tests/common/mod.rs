#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use vellum::app_state::AppState;
use vellum::config::ServerConfig;
use vellum::hub::{Hub, HubConfig};
use vellum::management;
use vellum::session::run_client;
use vellum::store::{MemoryStore, SharedStore};
use vellum::webhook::WebhookQueue;
use vellum::wire::{FrameAssembler, Message};

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Spawn a server on a random port with an in-memory store.
pub async fn spawn_test_server() -> (SocketAddr, Arc<AppState>) {
    spawn_test_server_with(ServerConfig::default(), HubConfig::default()).await
}

pub async fn spawn_test_server_with(
    config: ServerConfig,
    hub_config: HubConfig,
) -> (SocketAddr, Arc<AppState>) {
    init_test_tracing();

    let store: SharedStore = Arc::new(MemoryStore::new());
    store.set_expiration(config.expiration_seconds);
    let webhooks = WebhookQueue::spawn();
    let hub = Hub::spawn(webhooks, hub_config);
    let state = Arc::new(AppState { store, hub, config });

    let app = Router::new()
        .route("/socket", get(socket_handler).post(management::handle))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Wait for the server to start accepting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

/// Mirrors the handler in main.rs.
async fn socket_handler(State(state): State<Arc<AppState>>, req: Request) -> impl IntoResponse {
    let (mut parts, _body) = req.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws
            .on_upgrade(move |socket| run_client(state, socket))
            .into_response(),
        Err(_) => "Vellum collaboration server is running.".into_response(),
    }
}

/// A raw protocol client speaking the framed binary wire format.
pub struct ProtoClient {
    socket: Socket,
    assembler: FrameAssembler,
    pub protocol_version: u16,
}

impl ProtoClient {
    pub async fn connect(addr: SocketAddr) -> TestResult<Self> {
        Self::connect_with_version(addr, 2).await
    }

    pub async fn connect_with_version(addr: SocketAddr, protocol_version: u16) -> TestResult<Self> {
        let (socket, _) = connect_async(format!("ws://{addr}/socket")).await?;
        Ok(Self {
            socket,
            assembler: FrameAssembler::new(),
            protocol_version,
        })
    }

    pub async fn send(&mut self, message: &Message) -> TestResult {
        let encoded = message.encode(self.protocol_version);
        self.socket.send(WsMessage::Binary(encoded.into())).await?;
        Ok(())
    }

    /// Send INIT with this client's protocol version and common defaults.
    pub async fn init(&mut self, doc_id: &str, creation_mode: u8, offset: u64, data: &[u8]) -> TestResult {
        let message = Message::Init {
            protocol_version: self.protocol_version,
            max_message_size: 0,
            creation_mode,
            offset,
            doc_id: doc_id.to_string(),
            data: data.to_vec(),
        };
        self.send(&message).await
    }

    pub async fn append(&mut self, offset: u64, data: &[u8]) -> TestResult {
        self.send(&Message::Append {
            generation: 0,
            offset,
            data: data.to_vec(),
        })
        .await
    }

    pub async fn set_key(
        &mut self,
        request_id: u16,
        lifetime: u8,
        old_version: u32,
        new_version: u32,
        name: &str,
        value: &str,
    ) -> TestResult {
        self.send(&Message::SetKey {
            request_id,
            lifetime,
            old_version,
            new_version,
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// Receive the next logical message, reassembling continuations.
    pub async fn recv(&mut self) -> TestResult<Message> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                .await?
                .ok_or("connection closed")??;
            match frame {
                WsMessage::Binary(data) => {
                    if let Some(logical) = self.assembler.push(&data)? {
                        return Ok(Message::decode(&logical)?);
                    }
                }
                WsMessage::Close(_) => return Err("connection closed".into()),
                _ => {}
            }
        }
    }

    /// True if the server closes (or has closed) the connection instead of
    /// sending anything further.
    pub async fn expect_closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.socket.next()).await {
                Ok(None) => return true,
                Ok(Some(Ok(WsMessage::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => return true,
                Err(_) => return false,
            }
        }
    }

    pub async fn close(mut self) -> TestResult {
        self.socket.close(None).await?;
        Ok(())
    }
}

pub fn init_test_tracing() {
    use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_test_writer().with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .try_init();
}
