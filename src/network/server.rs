//! WebSocket Game Server
//!
//! Gateway between player UIs and the engine. One task per connection
//! drives a [`PlayerClient`]; session snapshots and chat lines are pushed
//! to the socket as they change.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::game::client::{ClientError, PlayerClient};
use crate::game::engine::GameEngine;
use crate::game::feed::{ChatLine, SessionFeed};
use crate::game::matchmaker::CancelOutcome;
use crate::game::model::{ChatEvent, PlayerId, SessionId, Stage};
use crate::game::session::SessionSnapshot;
use crate::network::protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};
use crate::store::StoreError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How often finished arbiters are dropped.
    pub cleanup_interval: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            cleanup_interval: Duration::from_secs(10),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `HOA_BIND_ADDR` and `HOA_MAX_CONNECTIONS`.
    pub fn from_env() -> Result<Self, GameServerError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HOA_BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .map_err(|_| GameServerError::Config(format!("HOA_BIND_ADDR={}", addr)))?;
        }
        if let Ok(max) = std::env::var("HOA_MAX_CONNECTIONS") {
            config.max_connections = max
                .parse()
                .map_err(|_| GameServerError::Config(format!("HOA_MAX_CONNECTIONS={}", max)))?;
        }

        Ok(config)
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Bad environment value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Connected client state.
#[derive(Debug)]
struct ConnectedClient {
    /// Player identifier (after `hello`).
    player_id: Option<PlayerId>,
    /// Connection time.
    connected_at: Instant,
}

type ClientMap = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// The game server.
pub struct GameServer {
    config: ServerConfig,
    engine: Arc<GameEngine>,
    clients: ClientMap,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, engine: Arc<GameEngine>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            engine,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, GameServerError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind and serve until [`GameServer::shutdown`].
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until [`GameServer::shutdown`].
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server {} listening on {}", self.config.version, listener.local_addr()?);

        let cleanup_engine = self.engine.clone();
        let cleanup_every = self.config.cleanup_interval;
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_engine, cleanup_every).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr).await;
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Open connections.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Players that said `hello` on an open connection.
    pub async fn connected_players(&self) -> Vec<PlayerId> {
        self.clients
            .read()
            .await
            .values()
            .filter_map(|c| c.player_id.clone())
            .collect()
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let engine = self.engine.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Registered before the spawn so the limit sees it.
        clients.write().await.insert(addr, ConnectedClient {
            player_id: None,
            connected_at: Instant::now(),
        });

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    clients.write().await.remove(&addr);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let mut conn = Connection {
                addr,
                engine,
                clients: clients.clone(),
                out: msg_tx,
                client: None,
                snapshots: None,
                feed: None,
            };

            let mut ticker = interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let wake = tokio::select! {
                    msg = ws_receiver.next() => Wake::Socket(msg),
                    matched = next_match(&mut conn.client) => Wake::Matched(matched),
                    alive = snapshot_changed(&mut conn.snapshots) => Wake::Snapshot(alive),
                    event = next_chat(&mut conn.feed) => Wake::Chat(event),
                    _ = ticker.tick() => Wake::Tick,
                    _ = shutdown_rx.recv() => Wake::Shutdown,
                };

                match wake {
                    Wake::Socket(Some(Ok(Message::Text(text)))) => match ClientMessage::from_json(&text) {
                        Ok(msg) => conn.handle_message(msg).await,
                        Err(e) => {
                            debug!("Invalid message from {}: {}", addr, e);
                            conn.reply_error(ServerError::new(ErrorCode::InvalidInput, "Invalid message format"))
                                .await;
                        }
                    },
                    Wake::Socket(Some(Ok(Message::Close(_)))) | Wake::Socket(None) => {
                        debug!("Client {} disconnected", addr);
                        break;
                    }
                    Wake::Socket(Some(Err(e))) => {
                        error!("WebSocket error for {}: {}", addr, e);
                        break;
                    }
                    Wake::Socket(Some(Ok(_))) => {}
                    Wake::Matched(result) => conn.on_match_result(result).await,
                    Wake::Snapshot(true) => conn.push_view().await,
                    Wake::Snapshot(false) => conn.snapshots = None,
                    Wake::Chat(Ok(event)) => conn.push_chat(&event).await,
                    Wake::Chat(Err(e)) => {
                        debug!("Feed closed for {}: {}", addr, e);
                        conn.feed = None;
                    }
                    Wake::Tick => conn.on_tick().await,
                    Wake::Shutdown => {
                        conn.reply(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        })
                        .await;
                        break;
                    }
                }
            }

            conn.disconnect().await;
            drop(conn);
            // Let queued frames flush; the task ends once the channel drains.
            if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
                debug!("Sender for {} did not drain", addr);
            }
            info!("Client {} cleaned up", addr);
        });
    }

    /// Periodically drop finished arbiters.
    async fn run_cleanup_loop(engine: Arc<GameEngine>, every: Duration) {
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            let dropped = engine.cleanup().await;
            if dropped > 0 {
                debug!("Dropped {} finished sessions", dropped);
            }
        }
    }
}

// =============================================================================
// PER-CONNECTION STATE
// =============================================================================

enum Wake {
    Socket(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Matched(Result<Option<SessionId>, ClientError>),
    Snapshot(bool),
    Chat(Result<ChatEvent, StoreError>),
    Tick,
    Shutdown,
}

async fn next_match(client: &mut Option<PlayerClient>) -> Result<Option<SessionId>, ClientError> {
    match client {
        Some(client) => client.next_match().await,
        None => std::future::pending().await,
    }
}

async fn snapshot_changed(rx: &mut Option<watch::Receiver<SessionSnapshot>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn next_chat(feed: &mut Option<SessionFeed>) -> Result<ChatEvent, StoreError> {
    match feed {
        Some(feed) => feed.next_event().await,
        None => std::future::pending().await,
    }
}

struct Connection {
    addr: SocketAddr,
    engine: Arc<GameEngine>,
    clients: ClientMap,
    out: mpsc::Sender<ServerMessage>,
    client: Option<PlayerClient>,
    snapshots: Option<watch::Receiver<SessionSnapshot>>,
    feed: Option<SessionFeed>,
}

impl Connection {
    async fn reply(&self, msg: ServerMessage) {
        if self.out.send(msg).await.is_err() {
            debug!("Outbound channel for {} closed", self.addr);
        }
    }

    async fn reply_error(&self, err: ServerError) {
        self.reply(ServerMessage::Error(err)).await;
    }

    async fn reply_client_error(&self, err: &ClientError) {
        debug!("Request from {} failed: {}", self.addr, err);
        self.reply_error(ServerError::from(err)).await;
    }

    async fn handle_message(&mut self, msg: ClientMessage) {
        if let ClientMessage::Ping { timestamp } = msg {
            let server_time = chrono::Utc::now().timestamp_millis().max(0) as u64;
            self.reply(ServerMessage::Pong { timestamp, server_time }).await;
            return;
        }
        if let ClientMessage::Hello { player_id } = msg {
            self.hello(player_id).await;
            return;
        }
        if self.client.is_none() {
            self.reply_error(ServerError::new(ErrorCode::NotIdentified, "Say hello first")).await;
            return;
        }

        let result = match msg {
            ClientMessage::Enqueue => self.enqueue().await,
            ClientMessage::Cancel => self.cancel().await,
            ClientMessage::Send { text } => self.send(&text).await,
            ClientMessage::Guess { is_ai } => self.guess(is_ai).await,
            ClientMessage::PlayAgain => self.play_again().await,
            ClientMessage::Ping { .. } | ClientMessage::Hello { .. } => Ok(()),
        };

        if let Err(e) = result {
            self.reply_client_error(&e).await;
        }
    }

    async fn hello(&mut self, player_id: String) {
        if self.client.is_some() {
            self.reply_error(ServerError::new(ErrorCode::InvalidInput, "Already identified")).await;
            return;
        }

        let player = PlayerId::new(player_id.trim());
        if player.as_str().is_empty() || !player.is_human() {
            self.reply_error(ServerError::new(ErrorCode::InvalidInput, "Invalid player id")).await;
            return;
        }

        if let Some(entry) = self.clients.write().await.get_mut(&self.addr) {
            entry.player_id = Some(player.clone());
            debug!("{} identified after {:?}", self.addr, entry.connected_at.elapsed());
        }

        let client = PlayerClient::new(self.engine.clone(), player);
        let welcome = Self::welcome(&client).await;
        self.client = Some(client);
        match welcome {
            Ok(msg) => self.reply(msg).await,
            Err(e) => self.reply_client_error(&e).await,
        }
    }

    async fn welcome(client: &PlayerClient) -> Result<ServerMessage, ClientError> {
        Ok(ServerMessage::Welcome {
            balance: client.balance().await?,
            queue_depth: client.queue_depth().await?,
        })
    }

    fn player_client(&mut self) -> Result<&mut PlayerClient, ClientError> {
        match self.client.as_mut() {
            Some(client) => Ok(client),
            None => Err(ClientError::WrongStage {
                expected: Stage::Lobby,
                actual: Stage::Lobby,
            }),
        }
    }

    async fn enqueue(&mut self) -> Result<(), ClientError> {
        let client = self.player_client()?;
        match client.find_match().await? {
            Stage::Searching => {
                let queue_depth = client.queue_depth().await.unwrap_or_default();
                self.reply(ServerMessage::Searching { queue_depth, seconds: 0 }).await;
                Ok(())
            }
            _ => self.enter_session().await,
        }
    }

    async fn cancel(&mut self) -> Result<(), ClientError> {
        let addr = self.addr;
        let client = self.player_client()?;
        let outcome = client.cancel().await?;
        debug!("{} cancelled search: {:?}", addr, outcome);
        if let CancelOutcome::AlreadyMatched(_) = outcome {
            return self.enter_session().await;
        }
        let welcome = Self::welcome(client).await?;
        self.reply(welcome).await;
        Ok(())
    }

    async fn back_in_lobby(&self) {
        if let Some(client) = self.client.as_ref() {
            match Self::welcome(client).await {
                Ok(msg) => self.reply(msg).await,
                Err(e) => self.reply_client_error(&e).await,
            }
        }
    }

    async fn send(&mut self, text: &str) -> Result<(), ClientError> {
        // The line itself arrives through the feed.
        self.player_client()?.send(text).await?;
        Ok(())
    }

    async fn guess(&mut self, is_ai: bool) -> Result<(), ClientError> {
        let settlement = self.player_client()?.guess(is_ai).await?;
        self.reply(ServerMessage::Settled {
            outcome: settlement.outcome,
            new_balance: settlement.new_balance,
        })
        .await;
        Ok(())
    }

    async fn play_again(&mut self) -> Result<(), ClientError> {
        self.player_client()?.play_again()?;
        self.leave_session();
        self.back_in_lobby().await;
        Ok(())
    }

    async fn on_match_result(&mut self, result: Result<Option<SessionId>, ClientError>) {
        match result {
            Ok(Some(_)) => {
                if let Err(e) = self.enter_session().await {
                    self.reply_client_error(&e).await;
                }
            }
            // Ticket vanished unmatched.
            Ok(None) => self.back_in_lobby().await,
            Err(e) => self.reply_client_error(&e).await,
        }
    }

    async fn on_tick(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        if client.stage() != Stage::Searching {
            return;
        }

        let due = client.fallback_deadline().map_or(false, |d| d <= tokio::time::Instant::now());
        if due {
            match client.fall_back_to_persona().await {
                Ok(_) => {
                    if let Err(e) = self.enter_session().await {
                        self.reply_client_error(&e).await;
                    }
                }
                Err(e) => self.reply_client_error(&e).await,
            }
            return;
        }

        let seconds = client.tick_search();
        let queue_depth = client.queue_depth().await.unwrap_or_default();
        self.reply(ServerMessage::Searching { queue_depth, seconds }).await;
    }

    /// Start forwarding the client's new session.
    async fn enter_session(&mut self) -> Result<(), ClientError> {
        let Some(handle) = self.client.as_ref().and_then(|c| c.session().cloned()) else {
            return Ok(());
        };
        let session_id = handle.session_id();
        self.leave_session();

        self.reply(ServerMessage::Matched { session_id }).await;

        let mut snapshots = handle.watch();
        let view = {
            let snapshot = snapshots.borrow_and_update();
            self.client.as_ref().map(|c| snapshot.view_for(c.player()))
        };
        self.snapshots = Some(snapshots);
        if let Some(view) = view {
            self.reply(ServerMessage::Session(view)).await;
        }

        self.feed = Some(self.engine.feed(session_id).await?);
        Ok(())
    }

    async fn push_view(&mut self) {
        let view = match (self.snapshots.as_mut(), self.client.as_ref()) {
            (Some(rx), Some(client)) => rx.borrow_and_update().view_for(client.player()),
            _ => return,
        };
        self.reply(ServerMessage::Session(view)).await;
    }

    async fn push_chat(&self, event: &ChatEvent) {
        if let Some(client) = &self.client {
            self.reply(ServerMessage::Chat(ChatLine::for_viewer(event, client.player()))).await;
        }
    }

    fn leave_session(&mut self) {
        self.snapshots = None;
        if let Some(feed) = self.feed.take() {
            feed.close();
        }
    }

    async fn disconnect(&mut self) {
        self.leave_session();
        if let Some(client) = self.client.as_mut() {
            if client.stage() == Stage::Searching {
                if let Err(e) = client.cancel().await {
                    warn!("Could not withdraw ticket of {}: {}", client.player(), e);
                }
            }
        }
        self.clients.write().await.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::config::GameConfig;
    use crate::game::persona::ScriptedCompletions;
    use crate::store::{MemoryStore, SharedStore};
    use tokio_tungstenite::connect_async;

    type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    fn server() -> Arc<GameServer> {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = GameConfig {
            persona_fallback_after: None,
            ..Default::default()
        };
        let engine = GameEngine::new(store, Arc::new(ScriptedCompletions::new()), config).unwrap();
        let server_config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        Arc::new(GameServer::new(server_config, Arc::new(engine)))
    }

    async fn start(server: &Arc<GameServer>) -> SocketAddr {
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    async fn send(ws: &mut Socket, msg: ClientMessage) {
        ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
    }

    /// Next message matching `pred`, skipping the rest.
    async fn expect(ws: &mut Socket, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        let wait = async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let msg = ServerMessage::from_json(&text).unwrap();
                        if pred(&msg) {
                            return msg;
                        }
                    }
                    Some(Ok(_)) => {}
                    other => panic!("socket ended: {:?}", other),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
    }

    #[tokio::test]
    async fn test_requires_hello() {
        let server = server();
        let addr = start(&server).await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        send(&mut ws, ClientMessage::Enqueue).await;
        let msg = expect(&mut ws, |m| matches!(m, ServerMessage::Error(_))).await;
        assert!(matches!(msg, ServerMessage::Error(ServerError { code: ErrorCode::NotIdentified, .. })));

        send(&mut ws, ClientMessage::Hello { player_id: "alice".into() }).await;
        let msg = expect(&mut ws, |m| matches!(m, ServerMessage::Welcome { .. })).await;
        assert_eq!(msg, ServerMessage::Welcome { balance: 0, queue_depth: 0 });

        server.shutdown();
    }

    #[tokio::test]
    async fn test_two_sockets_meet_and_chat() {
        let server = server();
        let addr = start(&server).await;
        let (mut a, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let (mut b, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        send(&mut a, ClientMessage::Hello { player_id: "alice".into() }).await;
        expect(&mut a, |m| matches!(m, ServerMessage::Welcome { .. })).await;
        send(&mut a, ClientMessage::Enqueue).await;
        expect(&mut a, |m| matches!(m, ServerMessage::Searching { .. })).await;

        send(&mut b, ClientMessage::Hello { player_id: "bob".into() }).await;
        expect(&mut b, |m| matches!(m, ServerMessage::Welcome { .. })).await;
        send(&mut b, ClientMessage::Enqueue).await;

        let ServerMessage::Matched { session_id: id_b } =
            expect(&mut b, |m| matches!(m, ServerMessage::Matched { .. })).await
        else {
            unreachable!()
        };
        let ServerMessage::Matched { session_id: id_a } =
            expect(&mut a, |m| matches!(m, ServerMessage::Matched { .. })).await
        else {
            unreachable!()
        };
        assert_eq!(id_a, id_b);

        let ServerMessage::Session(view) = expect(&mut a, |m| matches!(m, ServerMessage::Session(_))).await else {
            unreachable!()
        };
        assert_eq!(view.stage, Stage::Chatting);
        assert_eq!(view.opponent_was_ai, None);

        let (speaker, listener) = if view.your_turn { (&mut a, &mut b) } else { (&mut b, &mut a) };
        send(speaker, ClientMessage::Send { text: "hi there".into() }).await;
        let msg = expect(listener, |m| matches!(m, ServerMessage::Chat(line) if line.content == "hi there")).await;
        let ServerMessage::Chat(line) = msg else { unreachable!() };
        assert_eq!(line.speaker, crate::game::feed::Speaker::Opponent);

        assert_eq!(server.connected_players().await.len(), 2);
        server.shutdown();
    }
}
