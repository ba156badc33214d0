use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::wal::Wal;
use super::{BookingRepository, StoreError, status_matches};

type SharedSchedule = Arc<Mutex<ProviderSchedule>>;
type Ack = oneshot::Sender<io::Result<()>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append { record: Record, response: Ack },
    Control(Control),
}

enum Control {
    Rewrite { snapshot: Vec<Record>, response: Ack },
    AppendsSinceRewrite { response: oneshot::Sender<u64> },
}

/// Owns the WAL. Appends that queue up while a commit is in flight are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (record, response) = match cmd {
            WalCommand::Append { record, response } => (record, response),
            WalCommand::Control(control) => {
                run_control(&mut wal, control);
                continue;
            }
        };

        let mut batch = vec![(record, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { record, response } => batch.push((record, response)),
                WalCommand::Control(control) => {
                    deferred = Some(control);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(control) = deferred {
            run_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Record, Ack)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch.iter().try_for_each(|(record, _)| wal.write(record));
    // Commit even after a failed write so no half-buffered entry lingers.
    let committed = wal.commit();
    if result.is_ok() {
        result = committed;
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL commit failed for {} record(s): {e}", batch.len());
    }
    for (_, ack) in batch {
        let _ = ack.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

fn run_control(wal: &mut Wal, control: Control) {
    match control {
        Control::Rewrite { snapshot, response } => {
            let _ = response.send(wal.rewrite(&snapshot));
        }
        Control::AppendsSinceRewrite { response } => {
            let _ = response.send(wal.appends_since_rewrite());
        }
    }
}

/// Run a write on its own task. The caller may stop waiting (a request
/// timeout drops this future), but the write then still finishes as a unit:
/// a record is never durable in the WAL without also being applied in memory.
async fn detached<T, F>(work: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work).await.unwrap_or_else(|e| {
        tracing::error!("store write task failed: {e}");
        Err(StoreError::Closed)
    })
}

fn replay_error(e: io::Error) -> StoreError {
    if e.kind() == io::ErrorKind::InvalidData {
        StoreError::Corrupt(e.to_string())
    } else {
        StoreError::Io(e.to_string())
    }
}

/// In-process `BookingRepository`.
///
/// Bookings live in a DashMap; each provider's active calendar sits behind its
/// own async mutex, held across the exclusion check, the WAL append and the
/// apply. That mutex is the storage-level exclusion constraint and the
/// single-writer guard for status updates. Cloning shares the same state.
#[derive(Clone)]
pub struct LocalStore {
    state: Arc<State>,
}

struct State {
    bookings: DashMap<Ulid, Booking>,
    schedules: DashMap<Ulid, SharedSchedule>,
    by_provider: DashMap<Ulid, Vec<Ulid>>,
    by_requester: DashMap<Ulid, Vec<Ulid>>,
    /// Writers hold it shared; compaction holds it exclusively.
    write_gate: RwLock<()>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
}

impl LocalStore {
    /// Volatile store, nothing is written to disk.
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(State::new()),
        }
    }

    /// Replay the WAL at `path` and start its group-commit writer.
    /// Must be called from within a tokio runtime.
    ///
    /// Fails with `StoreError::Corrupt` if the log contradicts itself: a
    /// status change for a booking never created, or two active bookings of
    /// one provider overlapping.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let records = Wal::replay(&path).map_err(replay_error)?;
        let mut state = State::new();
        for record in &records {
            state.replay_record(record)?;
        }

        let wal = Wal::open(&path).map_err(|e| StoreError::Io(e.to_string()))?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));
        state.wal_tx = Some(wal_tx);

        tracing::info!(
            "replayed {} WAL records ({} bookings) from {}",
            records.len(),
            state.bookings.len(),
            path.display()
        );
        Ok(Self {
            state: Arc::new(state),
        })
    }

    pub fn len(&self) -> usize {
        self.state.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.bookings.is_empty()
    }

    /// Rewrite the WAL with one `Created` record per booking, carrying its
    /// current status. No-op for in-memory stores.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let state = self.state.clone();
        detached(async move { state.compact().await }).await
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.state.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Control(Control::AppendsSinceRewrite { response: tx });
        if wal_tx.send(cmd).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl State {
    fn new() -> Self {
        Self {
            bookings: DashMap::new(),
            schedules: DashMap::new(),
            by_provider: DashMap::new(),
            by_requester: DashMap::new(),
            write_gate: RwLock::new(()),
            wal_tx: None,
        }
    }

    fn schedule(&self, provider_id: Ulid) -> SharedSchedule {
        self.schedules
            .entry(provider_id)
            .or_insert_with(|| Arc::new(Mutex::new(ProviderSchedule::new())))
            .value()
            .clone()
    }

    /// Replay holds the only reference, so the lock is always free.
    fn replay_record(&self, record: &Record) -> Result<(), StoreError> {
        let schedule = self.schedule(record.provider_id());
        let mut guard = schedule
            .try_lock()
            .map_err(|_| StoreError::Corrupt("provider schedule locked during replay".into()))?;
        if let Record::Created(b) = record {
            if b.status.is_active() {
                if let Some(hit) = guard.overlapping(&b.span).next() {
                    return Err(StoreError::Corrupt(format!(
                        "booking {} {} overlaps active booking {} {} of provider {}",
                        b.id, b.span, hit.id, hit.span, b.provider_id
                    )));
                }
            }
        }
        self.apply(&mut guard, record)
    }

    /// Apply a record to in-memory state (caller holds the provider lock).
    fn apply(&self, schedule: &mut ProviderSchedule, record: &Record) -> Result<(), StoreError> {
        match record {
            Record::Created(b) => {
                if b.status.is_active() {
                    schedule.insert(ConflictingBooking::from(b));
                }
                self.by_provider.entry(b.provider_id).or_default().push(b.id);
                self.by_requester.entry(b.requester_id).or_default().push(b.id);
                self.bookings.insert(b.id, b.clone());
            }
            Record::StatusChanged {
                id,
                status,
                updated_at,
                ..
            } => {
                let Some(mut b) = self.bookings.get_mut(id) else {
                    return Err(StoreError::Corrupt(format!("status change for unknown booking {id}")));
                };
                b.status = *status;
                b.updated_at = *updated_at;
                if status.is_active() {
                    schedule.set_status(*id, *status);
                } else {
                    schedule.remove(*id);
                }
            }
        }
        Ok(())
    }

    /// Durable first, then visible. In-memory stores skip the WAL.
    async fn persist_and_apply(
        &self,
        schedule: &mut ProviderSchedule,
        record: &Record,
    ) -> Result<(), StoreError> {
        if let Some(wal_tx) = &self.wal_tx {
            let (tx, rx) = oneshot::channel();
            wal_tx
                .send(WalCommand::Append {
                    record: record.clone(),
                    response: tx,
                })
                .await
                .map_err(|_| StoreError::Closed)?;
            rx.await
                .map_err(|_| StoreError::Closed)?
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        self.apply(schedule, record)
    }

    fn collect(&self, ids: Option<Vec<Ulid>>, statuses: &[Status]) -> Vec<Booking> {
        let mut out: Vec<Booking> = ids
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.bookings.get(id).map(|e| e.value().clone()))
            .filter(|b| status_matches(b.status, statuses))
            .collect();
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    async fn insert(&self, draft: BookingDraft) -> Result<Booking, StoreError> {
        let _gate = self.write_gate.read().await;
        let schedule = self.schedule(draft.provider_id);
        let mut guard = schedule.lock().await;
        if self.bookings.contains_key(&draft.id) {
            return Err(StoreError::AlreadyExists(draft.id));
        }

        let hits: Vec<ConflictingBooking> = guard.overlapping(&draft.span).copied().collect();
        if !hits.is_empty() {
            return Err(StoreError::Overlap(hits));
        }

        let booking = draft.into_booking();
        self.persist_and_apply(&mut guard, &Record::Created(booking.clone()))
            .await?;
        Ok(booking)
    }

    async fn set_status(
        &self,
        id: Ulid,
        new_status: Status,
        actor_id: Option<Ulid>,
        expected: Status,
        updated_at: Ms,
    ) -> Result<Booking, StoreError> {
        let provider_id = self
            .bookings
            .get(&id)
            .map(|e| e.value().provider_id)
            .ok_or(StoreError::NotFound(id))?;
        let _gate = self.write_gate.read().await;
        let schedule = self.schedule(provider_id);
        let mut guard = schedule.lock().await;

        // Re-read under the provider lock: this is the compare in compare-and-swap.
        let current = self
            .bookings
            .get(&id)
            .map(|e| e.value().status)
            .ok_or(StoreError::NotFound(id))?;
        if current != expected {
            return Err(StoreError::StatusMismatch {
                id,
                expected,
                actual: current,
            });
        }

        let record = Record::StatusChanged {
            id,
            provider_id,
            status: new_status,
            actor_id,
            updated_at,
        };
        self.persist_and_apply(&mut guard, &record).await?;
        tracing::debug!(
            "booking {id}: {expected} -> {new_status} (actor {})",
            actor_id.map_or_else(|| "system".to_string(), |a| a.to_string())
        );
        self.bookings
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };

        // No write may land between the snapshot and the swap.
        let _gate = self.write_gate.write().await;
        let mut snapshot: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        snapshot.sort_by_key(|b| (b.created_at, b.id));
        let snapshot = snapshot.into_iter().map(Record::Created).collect();

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Control(Control::Rewrite {
                snapshot,
                response: tx,
            }))
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await
            .map_err(|_| StoreError::Closed)?
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}

#[async_trait]
impl BookingRepository for LocalStore {
    async fn create(&self, draft: BookingDraft) -> Result<Booking, StoreError> {
        let state = self.state.clone();
        detached(async move { state.insert(draft).await }).await
    }

    async fn get_by_id(&self, id: Ulid) -> Result<Booking, StoreError> {
        self.state
            .bookings
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_for_provider(
        &self,
        provider_id: Ulid,
        statuses: &[Status],
    ) -> Result<Vec<Booking>, StoreError> {
        let ids = self.state.by_provider.get(&provider_id).map(|e| e.value().clone());
        Ok(self.state.collect(ids, statuses))
    }

    async fn list_for_requester(
        &self,
        requester_id: Ulid,
        statuses: &[Status],
    ) -> Result<Vec<Booking>, StoreError> {
        let ids = self.state.by_requester.get(&requester_id).map(|e| e.value().clone());
        Ok(self.state.collect(ids, statuses))
    }

    async fn update_status(
        &self,
        id: Ulid,
        new_status: Status,
        actor_id: Option<Ulid>,
        expected: Status,
        updated_at: Ms,
    ) -> Result<Booking, StoreError> {
        let state = self.state.clone();
        detached(async move {
            state
                .set_status(id, new_status, actor_id, expected, updated_at)
                .await
        })
        .await
    }

    async fn list_elapsed(&self, cutoff: Ms) -> Result<Vec<Booking>, StoreError> {
        let mut out: Vec<Booking> = self
            .state
            .bookings
            .iter()
            .filter(|e| e.value().status == Status::Confirmed && e.value().span.end <= cutoff)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| (b.span.end, b.id));
        Ok(out)
    }
}
