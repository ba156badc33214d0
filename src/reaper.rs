use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, EngineError};
use crate::store::LocalStore;

/// One sweep: complete every confirmed booking whose end time has passed.
/// Returns how many were completed.
pub async fn complete_elapsed_once(engine: &Engine) -> usize {
    let due = match engine.elapsed_bookings().await {
        Ok(due) => due,
        Err(e) => {
            tracing::warn!("completer: listing elapsed bookings failed: {e}");
            return 0;
        }
    };
    let mut completed = 0;
    for booking in due {
        match engine.complete_elapsed(booking.id).await {
            Ok(_) => {
                completed += 1;
                info!("auto-completed booking {}", booking.id);
            }
            // A party got there first (cancel or manual completion).
            Err(EngineError::InvalidTransition { .. }) => {
                tracing::debug!("completer skip {}: already moved on", booking.id);
            }
            Err(e) => tracing::warn!("completer failed on {}: {e}", booking.id),
        }
    }
    completed
}

/// Periodic auto-completion trigger. Runs outside the engine and goes through
/// the same transition path as the parties, with the `System` role.
pub async fn run_completer(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        complete_elapsed_once(&engine).await;
    }
}

/// Compact the WAL once enough appends have accumulated since the last one.
pub async fn run_compactor(store: Arc<LocalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends ({} bookings)", store.len()),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use ulid::Ulid;

    const H: Ms = 3_600_000;
    const T0: Ms = 1_800_000_000_000;

    #[tokio::test]
    async fn completer_completes_only_elapsed_confirmed() {
        let clock = Arc::new(ManualClock::new(T0));
        let engine = Engine::with_clock(
            Arc::new(LocalStore::in_memory()),
            Arc::new(NotifyHub::new()),
            clock.clone(),
        );
        let (p, r) = (Ulid::new(), Ulid::new());

        let confirmed = engine
            .request_booking(p, r, T0 + 3 * H, T0 + 4 * H, None)
            .await
            .unwrap();
        engine
            .transition_booking(confirmed.id, Status::Confirmed, p)
            .await
            .unwrap();
        let pending = engine
            .request_booking(p, r, T0 + 5 * H, T0 + 6 * H, None)
            .await
            .unwrap();

        assert_eq!(complete_elapsed_once(&engine).await, 0);

        clock.set(T0 + 10 * H);
        assert_eq!(complete_elapsed_once(&engine).await, 1);
        assert_eq!(
            engine.get_booking(confirmed.id).await.unwrap().status,
            Status::Completed
        );
        assert_eq!(engine.get_booking(pending.id).await.unwrap().status, Status::Pending);

        // Second sweep finds nothing left to do.
        assert_eq!(complete_elapsed_once(&engine).await, 0);
    }
}
