//! Human-or-AI Game Server
//!
//! Runs the WebSocket gateway over an in-process store. `--demo` plays one
//! short round against the persona instead and exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use human_or_ai::{
    game::{config::DelayRange, persona::ScriptedCompletions},
    network::{GameServer, ServerConfig},
    DeterministicRng, GameConfig, GameEngine, MemoryStore, PlayerClient, PlayerId, SharedStore, Stage, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    info!("Human-or-AI Server v{}", VERSION);

    if std::env::args().any(|a| a == "--demo") {
        return demo_round().await;
    }

    let config = GameConfig::from_env().context("Invalid game configuration")?;
    info!(
        "Chat: {}s, reward {}, penalty {}",
        config.chat_seconds(),
        config.reward,
        config.penalty
    );

    let store: SharedStore = Arc::new(MemoryStore::new());
    let engine = GameEngine::new(store, Arc::new(ScriptedCompletions::new()), config)?;
    let server = Arc::new(GameServer::new(ServerConfig::from_env()?, Arc::new(engine)));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_server.shutdown();
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}

/// One short round against the persona.
async fn demo_round() -> anyhow::Result<()> {
    info!("=== Starting Demo Round ===");

    let config = GameConfig {
        chat_duration: Duration::from_secs(8),
        persona_reply_delay: DelayRange::from_millis(300, 900),
        human_reply_delay: DelayRange::from_millis(500, 1_500),
        persona_opening_delay: DelayRange::from_millis(200, 500),
        persona_typing_per_char: Duration::from_millis(10),
        persona_fallback_after: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let store: SharedStore = Arc::new(MemoryStore::new());
    let human_delay = config.human_reply_delay;
    let engine = Arc::new(GameEngine::new(store, Arc::new(ScriptedCompletions::new()), config)?);

    let mut player = PlayerClient::new(engine.clone(), PlayerId::new("demo-player"));
    player.find_match().await?;
    info!("Searching...");

    let session_id = player
        .poll_match()
        .await?
        .context("Ticket vanished before a match")?;
    info!("Matched into session {}", session_id);

    let mut feed = engine.feed(session_id).await?;
    let mut snapshots = engine.watch(session_id).await?;
    let lines = ["hi, how's your day going?", "what did you have for lunch?", "nice, me too"];
    let mut said = 0;
    let mut rng = DeterministicRng::for_session(session_id.as_bytes(), &[player.player().as_str()]);

    loop {
        let view = snapshots.borrow_and_update().view_for(player.player());
        if view.stage != Stage::Chatting {
            break;
        }
        if view.your_turn && said < lines.len() {
            tokio::time::sleep(human_delay.sample(&mut rng)).await;
            if let Err(e) = player.send(lines[said]).await {
                info!("Not sent: {}", e);
            }
            said += 1;
        }

        tokio::select! {
            changed = snapshots.changed() => changed?,
            event = feed.next_event() => {
                let event = event?;
                let who = if event.sender_id == *player.player() { "you" } else if event.is_system() { "system" } else { "them" };
                info!("[{}] {}", who, event.content);
            }
        }
    }

    let settlement = player.guess(true).await?;
    info!(
        "Guessed AI: {} ({:+} points, balance {})",
        if settlement.outcome.is_correct() { "correct" } else { "wrong" },
        settlement.outcome.points_delta,
        settlement.new_balance
    );
    player.play_again()?;

    info!("=== Demo Round Complete ===");
    Ok(())
}
