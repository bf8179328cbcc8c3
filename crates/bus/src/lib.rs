//! The platform RPC bus: request/response over a subject-addressed pub/sub
//! transport, letting the hub invoke operations on daemons living behind NAT.
//!
//! Two transports share the same semantics: [`NatsBus`] over a NATS server,
//! and [`StandaloneBus`] in-process for single-node deployments and tests.

#![forbid(unsafe_code)]

mod dispatch;
mod nats;
pub mod protocol;
mod standalone;

pub use nats::NatsBus;
pub use standalone::StandaloneBus;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use drover_core::{InstanceId, Platform, PlatformError, PlatformResult};

/// Subscriptions get an age limit: very long-lived connections give us too
/// coarse usage metrics, and rotation sheds stuck state.
pub const MAX_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// Deadline for a single request across the bus.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often presence polling pings.
pub const PRESENCE_TICK: Duration = Duration::from_millis(50);

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// A Platform proxy addressing the daemon for `instance`.
    async fn connect(&self, instance: &InstanceId) -> PlatformResult<Arc<dyn Platform>>;

    /// Register `platform` as the daemon for `instance`. The subscription
    /// ends by sending on `done`: `Some(err)` for a fatal failure (including
    /// being kicked by a newer subscriber), `None` for a clean age-out, after
    /// which the daemon is expected to resubscribe.
    async fn subscribe(
        &self,
        instance: &InstanceId,
        platform: Arc<dyn Platform>,
        done: mpsc::Sender<Option<PlatformError>>,
    );

    async fn ping(&self, instance: &InstanceId) -> PlatformResult<()>;

    /// Wait up to `deadline` for the instance's daemon to be reachable,
    /// polling every [`PRESENCE_TICK`].
    async fn await_presence(
        &self,
        instance: &InstanceId,
        deadline: Duration,
    ) -> PlatformResult<()> {
        let timer = tokio::time::sleep(deadline);
        tokio::pin!(timer);
        let mut attempts = tokio::time::interval(PRESENCE_TICK);
        attempts.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = attempts.tick() => {
                    if self.ping(instance).await.is_ok() {
                        return Ok(());
                    }
                }
                _ = &mut timer => {
                    return Err(PlatformError::Unavailable("presence timeout".to_string()));
                }
            }
        }
    }
}
