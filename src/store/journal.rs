use std::io;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::model::Event;
use crate::observability::{JOURNAL_FLUSH_BATCH_SIZE, JOURNAL_FLUSH_DURATION_SECONDS};
use crate::wal::{JournalFile, Wal};

use super::StoreError;

const CHANNEL_CAPACITY: usize = 4096;

type Ack = oneshot::Sender<io::Result<()>>;

enum JournalCommand {
    Append { event: Event, response: Ack },
    Compact { events: Vec<Event>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Handle to the background task that owns the `Wal`.
pub(super) struct Journal {
    tx: mpsc::Sender<JournalCommand>,
}

impl Journal {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub(super) fn start(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    /// Returns once the event is fsynced.
    pub(super) async fn append(&self, event: &Event) -> Result<(), StoreError> {
        let (response, rx) = oneshot::channel();
        self.send(JournalCommand::Append {
            event: event.clone(),
            response,
        })
        .await?;
        rx.await
            .map_err(|_| StoreError::Unavailable("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub(super) async fn compact(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let (response, rx) = oneshot::channel();
        self.send(JournalCommand::Compact { events, response }).await?;
        rx.await
            .map_err(|_| StoreError::Unavailable("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub(super) async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .send(JournalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn send(&self, cmd: JournalCommand) -> Result<(), StoreError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| StoreError::Unavailable("journal writer shut down".into()))
    }
}

/// Group commit: block for the first append, drain whatever else is already
/// queued, then fsync once and answer every waiter with the same result.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            JournalCommand::Append { event, response } => (event, response),
            other => {
                handle_other(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(JournalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        flush_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_other(&mut wal, other);
        }
    }
    debug!("journal writer for {} stopped", wal.path().display());
}

fn flush_batch<F: JournalFile>(wal: &mut Wal<F>, batch: Vec<(Event, Ack)>) {
    metrics::histogram!(JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    // All-or-nothing: a batch that fails to stage is never written, and a
    // failed flush is rolled back by the wal itself.
    let staged = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    let result = match staged {
        Ok(()) => wal.flush_sync(),
        Err(e) => {
            wal.discard_staged();
            Err(e)
        }
    };
    metrics::histogram!(JOURNAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        error!("journal flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_other(wal: &mut Wal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        JournalCommand::Append { event, response } => flush_batch(wal, vec![(event, response)]),
    }
}
