use nestline::application::call_machine::{CallMachine, SessionContext};
use nestline::config::CallConfig;
use nestline::domain::presence::AlwaysReachable;
use nestline::domain::session::repository::SessionStore;
use nestline::domain::session::entity::Participant;
use nestline::domain::session::value_object::Role;
use nestline::domain::shared::value_objects::ParticipantId;
use nestline::infrastructure::media::backend::SimulatedMediaBackend;
use nestline::infrastructure::media::manager::MediaSessionManager;
use nestline::infrastructure::persistence::memory::InMemorySessionStore;
use nestline::infrastructure::signaling::hub::{InProcessSignaling, SignalingTransport};
use nestline::interface::call_screen::CallScreenHandle;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    info!("Starting Nestline call core demo");

    let config = CallConfig::default();
    info!("Configuration loaded: {:?}", config);

    demo_call_lifecycle(config).await?;

    info!("Demo finished");
    Ok(())
}

/// Run a call end-to-end between two in-process clients: child calls
/// parent, parent answers, both sides talk briefly, child hangs up.
async fn demo_call_lifecycle(config: CallConfig) -> anyhow::Result<()> {
    let store = Arc::new(InMemorySessionStore::new());
    let signaling = Arc::new(InProcessSignaling::new());

    let child = Participant::new(ParticipantId::new(), Role::Child, Some("Mia".to_string()));
    let parent = Participant::new(ParticipantId::new(), Role::Parent, Some("Dana".to_string()));

    let child_machine = machine_for(child.clone(), config.clone(), &store, &signaling);
    let parent_machine = machine_for(parent.clone(), config.clone(), &store, &signaling);

    let child_screen = CallScreenHandle::mount(Arc::clone(&child_machine));
    let parent_screen = CallScreenHandle::mount(Arc::clone(&parent_machine));

    // Child places the call
    let call_id = child_screen.call(parent.clone()).await?;
    info!(%call_id, "child placed call to parent");

    // Give the store feed a beat to ring the parent's screen
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(phase = parent_screen.snapshot().phase.as_str(), "parent screen");

    parent_screen.accept(call_id).await?;
    info!("parent accepted");

    // Let negotiation run
    tokio::time::sleep(Duration::from_millis(300)).await;
    info!(
        child_phase = child_screen.snapshot().phase.as_str(),
        parent_phase = parent_screen.snapshot().phase.as_str(),
        "negotiation settled"
    );

    let muted = child_screen.toggle_mute().await?;
    info!(muted, "child toggled mute");
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(
        remote_muted = parent_screen.snapshot().remote_muted,
        "parent sees control state"
    );

    child_screen.hang_up().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(
        child_reason = ?child_screen.snapshot().end_reason,
        parent_reason = ?parent_screen.snapshot().end_reason,
        "call ended on both sides"
    );

    child_screen.unmount().await;
    parent_screen.unmount().await;
    Ok(())
}

fn machine_for(
    local: Participant,
    config: CallConfig,
    store: &Arc<InMemorySessionStore>,
    signaling: &Arc<InProcessSignaling>,
) -> Arc<CallMachine> {
    let backend = Arc::new(SimulatedMediaBackend::new());
    CallMachine::new(
        SessionContext { local, config },
        Arc::clone(store) as Arc<dyn SessionStore>,
        Arc::clone(signaling) as Arc<dyn SignalingTransport>,
        Arc::new(MediaSessionManager::new(backend)),
        Arc::new(AlwaysReachable),
    )
}
