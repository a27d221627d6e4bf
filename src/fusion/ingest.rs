//! Tasks that move decoder output into the coordinator and keep snapshot
//! states current between inputs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::coordinator::FusionCoordinator;
use crate::net::decoder::BroadcastFrame;
use crate::util::shutdown::Shutdown;

/// Apply decoded frames and liveness changes until shutdown or until the
/// decoder goes away.
pub async fn run_broadcast_ingest(
    coordinator: Arc<FusionCoordinator>,
    mut frames: mpsc::Receiver<BroadcastFrame>,
    mut liveness: watch::Receiver<bool>,
    mut shutdown: Shutdown,
) {
    let initial = *liveness.borrow_and_update();
    coordinator.set_broadcast_alive(initial, Instant::now());
    let mut liveness_open = true;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,

            frame = frames.recv() => {
                let Some(frame) = frame else {
                    debug!("Broadcast frame channel closed");
                    break;
                };
                coordinator.apply_updates(frame.updates);
            }

            changed = liveness.changed(), if liveness_open => {
                if changed.is_err() {
                    liveness_open = false;
                    continue;
                }
                let alive = *liveness.borrow_and_update();
                if alive {
                    info!("Broadcast stream alive");
                } else {
                    info!("Broadcast stream silent");
                }
                coordinator.set_broadcast_alive(alive, Instant::now());
            }
        }
    }

    coordinator.set_broadcast_alive(false, Instant::now());
}

/// Periodic state sweep: activation grace, staleness, buffer expiry and
/// purging of retired ships.
pub async fn run_maintenance(coordinator: Arc<FusionCoordinator>, period: Duration, mut shutdown: Shutdown) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => coordinator.sweep(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::coordinator::{FusionSettings, PollBatch, SessionObservation};
    use crate::fusion::field::{server_fields, ship_fields, FieldUpdate, FieldValue, Scope};
    use crate::fusion::lifecycle::{ShipListing, ShipRoster};
    use crate::metrics::Metrics;
    use crate::util::shutdown::ShutdownTrigger;
    use smallvec::smallvec;

    fn coordinator_with_alpha() -> Arc<FusionCoordinator> {
        let coordinator = Arc::new(FusionCoordinator::new(FusionSettings::default(), Arc::new(Metrics::new())));
        let now = Instant::now();
        let batch = PollBatch::reachable(
            now,
            SessionObservation::Active,
            vec![FieldUpdate::query(Scope::ship("Alpha"), ship_fields::FACTION, "Human Navy", now)],
        );
        coordinator.apply_poll_cycle(batch, Some(ShipRoster::from_listing(vec![ShipListing::new(0, "Alpha")])));
        coordinator
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_frames_reach_primary_ship() {
        let coordinator = coordinator_with_alpha();
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (live_tx, live_rx) = watch::channel(false);
        let trigger = ShutdownTrigger::new();

        let task = tokio::spawn(run_broadcast_ingest(
            coordinator.clone(),
            frames_rx,
            live_rx,
            trigger.subscribe(),
        ));

        live_tx.send_replace(true);
        frames_tx
            .send(BroadcastFrame {
                received_at: Instant::now(),
                sequence: 1,
                updates: smallvec![FieldUpdate::broadcast("hull", 42.0, Instant::now())],
            })
            .await
            .unwrap();

        let c = coordinator.clone();
        wait_until(move || {
            c.snapshot(&Scope::ship("Alpha"))
                .and_then(|snap| snap.value("hull").cloned())
                == Some(FieldValue::Number(42.0))
        })
        .await;
        let c = coordinator.clone();
        wait_until(move || c.server_snapshot().value(server_fields::BROADCAST_ALIVE) == Some(&FieldValue::Flag(true)))
            .await;

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(
            coordinator.server_snapshot().value(server_fields::BROADCAST_ALIVE),
            Some(&FieldValue::Flag(false))
        );
    }

    #[tokio::test]
    async fn test_ingest_ends_when_decoder_drops() {
        let coordinator = coordinator_with_alpha();
        let (frames_tx, frames_rx) = mpsc::channel::<BroadcastFrame>(8);
        let (live_tx, live_rx) = watch::channel(false);
        let trigger = ShutdownTrigger::new();

        let task = tokio::spawn(run_broadcast_ingest(coordinator, frames_rx, live_rx, trigger.subscribe()));
        drop(live_tx);
        drop(frames_tx);

        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_stops_on_shutdown() {
        let coordinator = coordinator_with_alpha();
        let trigger = ShutdownTrigger::new();
        let task = tokio::spawn(run_maintenance(coordinator, Duration::from_millis(5), trigger.subscribe()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
