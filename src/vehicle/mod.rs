//! Vehicle facade: wires a [`Link`] to the telemetry reducer, the command state machine
//! and (optionally) the supervisor loop.
pub mod command;
pub mod mission;
pub mod supervisor;

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use command::{CommandOutcome, Commander, Target};
pub use mission::{MissionOutcome, StartOutcome, VehicleError};

use crate::config::Config;
use crate::link::{Channel, Link, LinkError, Subscription};
use crate::telemetry::{Position, Telemetry, VehicleState};

pub struct Vehicle {
    link: Link,
    telemetry: Arc<Telemetry>,
    commander: Commander,
    shutdown: CancellationToken,
    reducer: Option<Subscription>,
    supervisor: Option<JoinHandle<()>>,
}

impl Vehicle {
    /// Open a link over `channel` and attach to it.
    pub fn connect<C: Channel>(channel: C, config: &Config) -> Self {
        let link = Link::open(channel, config.link.identity(), config.retry.tuning());
        Self::attach(link, config)
    }

    pub fn attach(link: Link, config: &Config) -> Self {
        let telemetry = Arc::new(Telemetry::new(config.supervisor.path_capacity));
        let reducer = telemetry.attach(&link);
        let commander = Commander::new(
            link.clone(),
            Arc::clone(&telemetry),
            config.link.target(),
            config.supervisor.auto_mode,
        );
        let shutdown = CancellationToken::new();
        let supervisor = config.supervisor.enabled.then(|| {
            tokio::spawn(supervisor::run(
                commander.clone(),
                supervisor::SupervisorSettings::from_config(config),
                shutdown.child_token(),
            ))
        });
        info!(
            "Vehicle attached (target system {}, supervisor {})",
            config.link.target_system,
            if supervisor.is_some() { "on" } else { "off" }
        );
        Self {
            link,
            telemetry,
            commander,
            shutdown,
            reducer: Some(reducer),
            supervisor,
        }
    }

    pub fn state(&self) -> VehicleState {
        self.telemetry.snapshot()
    }

    pub fn telemetry(&self) -> watch::Receiver<VehicleState> {
        self.telemetry.subscribe()
    }

    pub fn commander(&self) -> &Commander {
        &self.commander
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Token cancelled by [`Vehicle::shutdown`]; pass it (or a child) to commands.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub async fn navigate(&self, position: Position) -> Result<CommandOutcome, LinkError> {
        self.commander.navigate(position, &self.shutdown).await
    }

    /// Cancel pending sequences, stop the supervisor and destroy the link.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.supervisor.take() {
            if let Err(e) = task.await {
                warn!("Supervisor task ended abnormally: {}", e);
            }
        }
        self.reducer.take();
        self.link.destroy().await;
        info!("Vehicle shut down");
    }
}

impl Drop for Vehicle {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.supervisor.take() {
            task.abort();
        }
    }
}
