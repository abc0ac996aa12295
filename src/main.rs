//! Demo: zwei Clients im selben Prozess rufen sich an
//!
//! Beide teilen sich einen In-Memory Store. Der Broadcast-Pfad läuft über
//! den lokalen Hub oder, mit `CALL_DEMO_USE_RELAY=1`, über das WebSocket-Relay.

use anyhow::{bail, Context, Result};
use call_core::call_engine::{
    CallAvailability, CallerProfile, IncomingCallWatcher, ProfileResolver, WatcherEvent,
};
use call_core::database::{CallKind, CallRecordStore, SqliteCallStore};
use call_core::media::SyntheticMediaCapture;
use call_core::peer::{provider_from_config, WebRtcPeerFactory};
use call_core::signaling::{BroadcastChannel, LocalBroadcastHub, WsRelayChannel};
use call_core::{CallConfig, CallDeps, CallEngine, CallState, EngineEvent};
use std::sync::Arc;
use std::time::Duration;

struct DemoProfiles;

#[async_trait::async_trait]
impl ProfileResolver for DemoProfiles {
    async fn resolve(&self, user_id: &str) -> Option<CallerProfile> {
        Some(CallerProfile {
            user_id: user_id.to_string(),
            display_name: format!("Demo {}", user_id),
            avatar_url: None,
        })
    }
}

fn client(
    user_id: &str,
    config: &CallConfig,
    store: &Arc<SqliteCallStore>,
    broadcast: &Arc<dyn BroadcastChannel>,
) -> CallEngine {
    let deps = CallDeps {
        records: store.clone(),
        signals: store.clone(),
        broadcast: Arc::clone(broadcast),
        media: Arc::new(SyntheticMediaCapture::new()),
        peers: Arc::new(WebRtcPeerFactory::new()),
        ice: provider_from_config(config, user_id),
    };
    CallEngine::new(user_id, config.clone(), deps)
}

async fn wait_for(engine: &CallEngine, state: CallState, limit: Duration) -> Result<()> {
    let mut events = engine.subscribe();
    if engine.status() == state {
        return Ok(());
    }

    tokio::time::timeout(limit, async {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::StatusChanged(s) if s == state => return Ok(()),
                EngineEvent::Error(e) => tracing::warn!("{} reported: {}", engine.user_id(), e),
                _ => {}
            }
        }
        bail!("event stream closed")
    })
    .await
    .with_context(|| format!("{} did not reach {}", engine.user_id(), state.as_str()))?
}

#[tokio::main]
async fn main() -> Result<()> {
    call_core::init_logging();

    let mut config = CallConfig::from_env();
    if config.turn_urls.is_empty() {
        // Ohne TURN kann Relay-Zwang nie verbinden
        config.force_relay = false;
    }

    let store = Arc::new(SqliteCallStore::open_in_memory().context("opening call store")?);
    let broadcast: Arc<dyn BroadcastChannel> = if std::env::var("CALL_DEMO_USE_RELAY").is_ok() {
        Arc::new(WsRelayChannel::new(&config.relay_url)?)
    } else {
        Arc::new(LocalBroadcastHub::new())
    };

    let alice = client("alice", &config, &store, &broadcast);
    let bob = client("bob", &config, &store, &broadcast);

    let watcher = IncomingCallWatcher::new(
        "bob",
        store.clone(),
        Arc::new(DemoProfiles),
        Arc::new(bob.clone()) as Arc<dyn CallAvailability>,
    );
    let mut incoming = watcher.subscribe();
    watcher.start();

    let record = alice.start_call("bob", None, CallKind::Audio).await?;
    tracing::info!("Placed call {}", record.id);

    let call = loop {
        match incoming.recv().await? {
            WatcherEvent::Incoming(call) => break call,
            WatcherEvent::Cleared { call_id, status } => {
                bail!("call {} cleared before answer ({})", call_id, status)
            }
        }
    };
    tracing::info!("Bob sees a call from {}", call.caller.display_name);

    let connected = tokio::join!(
        wait_for(&alice, CallState::Connected, Duration::from_secs(20)),
        async {
            bob.answer_call(&call.record).await?;
            wait_for(&bob, CallState::Connected, Duration::from_secs(20)).await
        }
    );
    connected.0?;
    connected.1?;
    tracing::info!("Connected, talking for a moment");

    tokio::time::sleep(Duration::from_secs(2)).await;
    alice.toggle_mute()?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    alice.end_call().await?;
    wait_for(&bob, CallState::Idle, Duration::from_secs(5)).await?;

    let record = store.get_record(&record.id).await?;
    tracing::info!("Call {} finished as {}", record.id, record.status);

    watcher.stop();
    Ok(())
}
