use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::wal::Wal;

use super::ScheduleError;

/// The durable side of the entry/conflict store. An event is applied to
/// in-memory state only after `append` returns `Ok`.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, event: &Event) -> Result<(), ScheduleError>;

    /// Replace the log with a snapshot that recreates the current state.
    async fn compact(&self, events: Vec<Event>) -> Result<(), ScheduleError>;

    async fn appends_since_compact(&self) -> u64;
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Journal backed by a WAL file and a background group-commit writer.
pub struct WalJournal {
    tx: mpsc::Sender<WalCommand>,
}

impl WalJournal {
    /// Open the WAL at `path`, returning the journal and the events to replay.
    /// A damaged tail is cut off first so new records follow the last intact one.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let events = Wal::recover(path)?;
        let wal = Wal::open(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        Ok((Self { tx }, events))
    }
}

#[async_trait]
impl Journal for WalJournal {
    async fn append(&self, event: &Event) -> Result<(), ScheduleError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| ScheduleError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| ScheduleError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| ScheduleError::Storage(e.to_string()))
    }

    async fn compact(&self, events: Vec<Event>) -> Result<(), ScheduleError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| ScheduleError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| ScheduleError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| ScheduleError::Storage(e.to_string()))
    }

    async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed: {e}");
                }
                respond_batch(batch, &result);

                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// Write and fsync the batch as a unit. On any failure the log is rolled back
/// to its pre-batch length, so no caller told `Err` finds its event on replay.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        rollback(wal);
    }
    result
}

fn rollback(wal: &mut Wal) {
    if let Err(e) = wal.rollback() {
        tracing::error!("WAL rollback failed: {e}");
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            if result.is_err() {
                rollback(wal);
            }
            let _ = response.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::MAX_WAL_RECORD_BYTES;
    use crate::model::{CatalogDetail, CatalogEntry};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorsched_test_journal");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn tutor(name: String) -> Event {
        Event::CatalogUpserted(CatalogEntry {
            id: Ulid::new(),
            name: Some(name),
            archived_at: None,
            detail: CatalogDetail::Tutor,
        })
    }

    #[test]
    fn failed_batch_leaves_nothing_behind() {
        let path = test_wal_path("failed_batch.wal");
        let before = tutor("Ada".into());
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&before).unwrap();
        wal.flush_sync().unwrap();

        // The second event cannot be encoded, after the first was already buffered.
        let batch: Vec<_> = [tutor("Grace".into()), tutor("x".repeat(MAX_WAL_RECORD_BYTES + 1))]
            .into_iter()
            .map(|e| (e, oneshot::channel().0))
            .collect();
        assert!(flush_batch(&mut wal, &batch).is_err());
        assert_eq!(wal.appends_since_compact(), 1);

        let after = tutor("Edsger".into());
        assert!(flush_batch(&mut wal, &[(after.clone(), oneshot::channel().0)]).is_ok());
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![before, after]);
    }

    #[tokio::test]
    async fn reopen_after_torn_tail_keeps_new_appends() {
        use std::io::Write;

        let path = test_wal_path("reopen_torn.wal");
        let first = tutor("Ada".into());
        let second = tutor("Grace".into());
        {
            let (journal, events) = WalJournal::open(&path).unwrap();
            assert!(events.is_empty());
            journal.append(&first).await.unwrap();
        }
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x40, 0, 0, 0, 1, 2]).unwrap();
        }
        {
            let (journal, events) = WalJournal::open(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            journal.append(&second).await.unwrap();
        }
        let (_journal, events) = WalJournal::open(&path).unwrap();
        assert_eq!(events, vec![first, second]);
    }
}
