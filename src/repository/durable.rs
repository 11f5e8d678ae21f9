use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::{CommitOutcome, InMemoryRepository, Mutation, Repository, RepositoryError};

// ── Group-commit WAL channel ─────────────────────────────

type Reply = oneshot::Sender<io::Result<CommitOutcome>>;

enum WalCommand {
    Write {
        mutation: Mutation,
        response: Reply,
    },
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// State a mutation reads or changes. Two writes sharing a key never share a batch,
/// so validating each against the pre-batch state gives the same answer as
/// validating them one after another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    /// The provider-name index.
    Names,
    Provider(Ulid),
    Client(Ulid),
    Appointment(Ulid),
}

fn keys(mutation: &Mutation) -> Vec<Key> {
    match mutation {
        Mutation::SaveProvider(provider) => vec![Key::Names, Key::Provider(provider.id)],
        Mutation::DeleteProvider(id) => vec![Key::Names, Key::Provider(*id)],
        Mutation::Book { appointment, .. } => vec![
            Key::Client(appointment.client_id),
            Key::Provider(appointment.provider_id),
        ],
        Mutation::Reschedule {
            id, provider_id, ..
        } => vec![Key::Appointment(*id), Key::Provider(*provider_id)],
        Mutation::Cancel(id) => vec![Key::Appointment(*id)],
    }
}

/// Validated writes waiting for one fsync.
#[derive(Default)]
struct Batch {
    touched: HashSet<Key>,
    entries: Vec<(Event, Reply)>,
}

impl Batch {
    fn conflicts(&self, mutation: &Mutation) -> bool {
        keys(mutation).iter().any(|k| self.touched.contains(k))
    }

    fn admit(&mut self, state: &InMemoryRepository, mutation: Mutation, response: Reply) {
        // The caller gave up (timeout or cancellation) before the write was checked.
        if response.is_closed() {
            metrics::counter!(observability::WAL_ABANDONED_WRITES_TOTAL).increment(1);
            return;
        }
        match state.validate(&mutation) {
            Ok(event) => {
                self.touched.extend(keys(&mutation));
                self.entries.push((event, response));
            }
            Err(refused) => {
                let _ = response.send(Ok(refused));
            }
        }
    }
}

/// Background task that owns the WAL and the only write access to the materialized state.
/// 1. Block until the first Write arrives.
/// 2. Validate it and every Write already queued behind it, stopping at the first one
///    that touches state an admitted write also touches.
/// 3. One flush_sync for the whole batch, then apply each event and answer its sender.
///
/// Validation, logging and applying all happen here, so a caller that stops waiting
/// can never leave the log and memory disagreeing.
async fn wal_writer_loop(
    mut wal: Wal,
    state: Arc<InMemoryRepository>,
    compact_threshold: u64,
    mut rx: mpsc::Receiver<WalCommand>,
) {
    let mut carried = None;
    loop {
        let cmd = match carried.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Write { mutation, response } => {
                let mut batch = Batch::default();
                batch.admit(&state, mutation, response);
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Write { mutation, response })
                            if !batch.conflicts(&mutation) =>
                        {
                            batch.admit(&state, mutation, response)
                        }
                        Ok(other) => {
                            carried = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &state, batch);
                if compact_threshold > 0
                    && wal.appends_since_compact() >= compact_threshold
                    && let Err(e) = compact(&mut wal, &state)
                {
                    warn!("WAL compaction failed: {e}");
                }
            }
            WalCommand::Compact { response } => {
                let _ = response.send(compact(&mut wal, &state));
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
}

fn commit_batch(wal: &mut Wal, state: &InMemoryRepository, batch: Batch) {
    if batch.entries.is_empty() {
        return;
    }
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.entries.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch.entries);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            for (event, tx) in batch.entries {
                state.apply(&event);
                let _ = tx.send(Ok(CommitOutcome::Committed));
            }
        }
        Err(e) => {
            if let Err(rollback) = wal.rollback() {
                error!("WAL rollback after failed flush also failed: {rollback}");
            }
            for (_, tx) in batch.entries {
                let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string())));
            }
        }
    }
}

fn flush_batch(wal: &mut Wal, entries: &[(Event, Reply)]) -> io::Result<()> {
    for (event, _) in entries {
        wal.append_buffered(event)?;
    }
    wal.flush_sync()
}

/// Rewrite the log as the minimal stream that recreates `state`.
fn compact(wal: &mut Wal, state: &InMemoryRepository) -> io::Result<()> {
    let events = state.snapshot();
    wal.compact(&events)?;
    metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
    info!(events = events.len(), "booking log compacted");
    Ok(())
}

/// Durable repository: an [`InMemoryRepository`] rebuilt from, and kept in step with,
/// an append-only log.
///
/// Reads go straight to memory. Writes are queued to the writer task, which checks
/// them, logs them and applies them in that order. A write whose caller stops waiting
/// before the writer picks it up is dropped unwritten. Once picked up it completes in
/// both the log and memory, whether or not anyone is still listening.
pub struct WalRepository {
    state: Arc<InMemoryRepository>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl WalRepository {
    /// Replay the log at `path`, cut any damaged tail, and start the group-commit
    /// writer. Must run inside a tokio runtime.
    pub fn open(path: &Path, compact_threshold: u64) -> io::Result<Self> {
        let (wal, events) = Wal::recover(path)?;
        let state = Arc::new(InMemoryRepository::from_events(&events));
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, state.clone(), compact_threshold, wal_rx));

        info!(path = %path.display(), events = events.len(), "booking log replayed");
        Ok(Self { state, wal_tx })
    }

    async fn write(&self, mutation: Mutation) -> Result<CommitOutcome, RepositoryError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Write {
                mutation,
                response: tx,
            })
            .await
            .map_err(|_| RepositoryError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| RepositoryError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| RepositoryError::Unavailable(format!("WAL append failed: {e}")))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the log with only the events needed to recreate the current state.
    pub async fn compact(&self) -> Result<(), RepositoryError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| RepositoryError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| RepositoryError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| RepositoryError::Unavailable(format!("WAL compaction failed: {e}")))
    }
}

#[async_trait]
impl Repository for WalRepository {
    async fn find_provider(&self, id: Ulid) -> Result<Option<Provider>, RepositoryError> {
        self.state.find_provider(id).await
    }

    async fn list_providers(&self) -> Result<Vec<Provider>, RepositoryError> {
        self.state.list_providers().await
    }

    async fn save_provider(&self, provider: Provider) -> Result<CommitOutcome, RepositoryError> {
        self.write(Mutation::SaveProvider(provider)).await
    }

    async fn delete_provider(&self, id: Ulid) -> Result<CommitOutcome, RepositoryError> {
        self.write(Mutation::DeleteProvider(id)).await
    }

    async fn count_confirmed(&self, client_id: Ulid) -> Result<u32, RepositoryError> {
        Ok(self.state.count_for(&client_id))
    }

    async fn insert_appointment(
        &self,
        appointment: Appointment,
        max_confirmed: Option<u32>,
    ) -> Result<CommitOutcome, RepositoryError> {
        self.write(Mutation::Book {
            appointment,
            max_confirmed,
        })
        .await
    }

    async fn find_appointment(&self, id: Ulid) -> Result<Option<Appointment>, RepositoryError> {
        self.state.find_appointment(id).await
    }

    async fn list_appointments(
        &self,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        self.state.list_appointments(filter).await
    }

    async fn replace_appointment(
        &self,
        appointment: Appointment,
    ) -> Result<CommitOutcome, RepositoryError> {
        self.write(Mutation::reschedule(&appointment)).await
    }

    async fn delete_appointment(&self, id: Ulid) -> Result<CommitOutcome, RepositoryError> {
        self.write(Mutation::Cancel(id)).await
    }
}
