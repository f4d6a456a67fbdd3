//! Flow control between the adapters and their record-side neighbours.
//!
//! Extraction pushes records into a [`RecordSink`] using an explicit two-step handshake: the
//! adapter offers a record and gets it back if the sink is full, then waits for
//! [`RecordSink::drained`] before offering it again.  Packing pulls records from a
//! [`RecordSource`]; each arrives with a [`Completion`] that the adapter only completes once the
//! record's entry has been handed to the encoder.
//!
//! [`record_channel`] and [`pack_channel`] provide bounded in-memory endpoints for both sides.

use std::future::Future;

use log::trace;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};

use crate::{
    error::{Error, Result},
    record::FileRecord,
};

/// The states both adapters move through.
///
/// `Idle → Awaiting → Materializing → Emitting → (AwaitingDrain)* → Awaiting → … → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    /// Waiting for the next entry (extract) or record (pack).
    Awaiting,
    /// Reading content into its final shape.
    Materializing,
    /// Handing the result to the other side.
    Emitting,
    /// Waiting for a full sink to drain.
    AwaitingDrain,
    Closed,
}

impl State {
    pub(crate) fn enter(&mut self, next: State) {
        trace!("{self:?} -> {next:?}");
        *self = next;
    }
}

/// The result of offering a record to a sink.
#[derive(Debug)]
pub enum Offer<T> {
    Accepted,
    /// The sink is full; the item is handed back to be offered again after
    /// [`RecordSink::drained`].
    Retry(T),
}

/// Receives the records produced by extraction.
pub trait RecordSink {
    /// Offers one record.  Fails if the consumer is gone.
    fn offer(&mut self, record: FileRecord) -> Result<Offer<FileRecord>>;

    /// Resolves once the sink can accept another record.
    fn drained(&mut self) -> impl Future<Output = Result<()>>;

    /// Signals that no more records will follow.
    fn finish(&mut self);

    /// Signals that production stopped because of `error`.
    fn abort(&mut self, error: &Error);
}

/// The continuation of one record handed to the pack adapter.
#[derive(Debug)]
pub struct Completion(Option<oneshot::Sender<()>>);

impl Completion {
    pub fn new(done: oneshot::Sender<()>) -> Self {
        Completion(Some(done))
    }

    /// A completion that nobody waits for.
    pub fn detached() -> Self {
        Completion(None)
    }

    pub fn complete(self) {
        if let Some(done) = self.0 {
            let _ = done.send(());
        }
    }
}

/// Supplies the records consumed by packing.
pub trait RecordSource {
    /// The next record, or `None` once the producer is done.
    fn next(&mut self) -> impl Future<Output = Result<Option<(FileRecord, Completion)>>>;

    /// Signals that consumption stopped because of `error`.
    fn abort(&mut self, error: &Error);
}

/// Creates a bounded channel of extracted records.
pub fn record_channel(capacity: usize) -> (RecordSender, RecordReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let (abort_tx, abort_rx) = oneshot::channel();
    (
        RecordSender {
            tx: Some(tx),
            abort: Some(abort_tx),
        },
        RecordReceiver {
            rx,
            abort: abort_rx,
        },
    )
}

/// The adapter end of [`record_channel`].
#[derive(Debug)]
pub struct RecordSender {
    tx: Option<mpsc::Sender<FileRecord>>,
    abort: Option<oneshot::Sender<String>>,
}

impl RecordSink for RecordSender {
    fn offer(&mut self, record: FileRecord) -> Result<Offer<FileRecord>> {
        let tx = self.tx.as_ref().ok_or(Error::Closed)?;
        match tx.try_send(record) {
            Ok(()) => Ok(Offer::Accepted),
            Err(TrySendError::Full(record)) => Ok(Offer::Retry(record)),
            Err(TrySendError::Closed(_)) => Err(Error::SinkClosed),
        }
    }

    async fn drained(&mut self) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::Closed)?;
        // the permit is released again right away; we only wanted to know there is room
        tx.reserve().await.map(drop).map_err(|_| Error::SinkClosed)
    }

    fn finish(&mut self) {
        self.tx = None;
        self.abort = None;
    }

    fn abort(&mut self, error: &Error) {
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(error.to_string());
        }
        self.tx = None;
    }
}

/// The consumer end of [`record_channel`].
#[derive(Debug)]
pub struct RecordReceiver {
    rx: mpsc::Receiver<FileRecord>,
    abort: oneshot::Receiver<String>,
}

impl RecordReceiver {
    /// Receives the next record.  Returns `None` after the last one, or the failure that stopped
    /// the adapter.
    pub async fn recv(&mut self) -> Result<Option<FileRecord>> {
        match self.rx.recv().await {
            Some(record) => Ok(Some(record)),
            None => match self.abort.try_recv() {
                Ok(reason) => Err(Error::Aborted(reason)),
                Err(_) => Ok(None),
            },
        }
    }
}

/// Creates a bounded channel of records to be packed.
pub fn pack_channel(capacity: usize) -> (RecordWriter, RecordQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    let (abort_tx, abort_rx) = oneshot::channel();
    (
        RecordWriter {
            tx,
            abort: abort_rx,
            reason: None,
        },
        RecordQueue {
            rx,
            abort: Some(abort_tx),
        },
    )
}

/// The producer end of [`pack_channel`].  Dropping it tells the adapter no more records follow.
#[derive(Debug)]
pub struct RecordWriter {
    tx: mpsc::Sender<(FileRecord, Completion)>,
    abort: oneshot::Receiver<String>,
    reason: Option<String>,
}

impl RecordWriter {
    fn aborted(&mut self) -> Error {
        if self.reason.is_none() {
            self.reason = self.abort.try_recv().ok();
        }
        Error::Aborted(
            self.reason
                .clone()
                .unwrap_or_else(|| "pack adapter closed".into()),
        )
    }

    /// Hands `record` to the pack adapter and waits until its entry has been written.
    pub async fn write(&mut self, record: FileRecord) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send((record, Completion::new(done_tx)))
            .await
            .is_err()
        {
            return Err(self.aborted());
        }
        match done_rx.await {
            Ok(()) => Ok(()),
            Err(_) => Err(self.aborted()),
        }
    }
}

/// The adapter end of [`pack_channel`].
#[derive(Debug)]
pub struct RecordQueue {
    rx: mpsc::Receiver<(FileRecord, Completion)>,
    abort: Option<oneshot::Sender<String>>,
}

impl RecordSource for RecordQueue {
    async fn next(&mut self) -> Result<Option<(FileRecord, Completion)>> {
        Ok(self.rx.recv().await)
    }

    fn abort(&mut self, error: &Error) {
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(error.to_string());
        }
        self.rx.close();
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn offer_until_full() {
        let (mut tx, mut rx) = record_channel(1);

        let offer = tx.offer(FileRecord::directory("/", "a")).unwrap();
        assert!(matches!(offer, Offer::Accepted));

        let offer = tx.offer(FileRecord::directory("/", "b")).unwrap();
        let Offer::Retry(record) = offer else {
            panic!("second offer should not fit");
        };
        assert_eq!(record.path, std::path::PathBuf::from("/b"));

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.path, std::path::PathBuf::from("/a"));

        tx.drained().await.unwrap();
        assert!(matches!(tx.offer(record).unwrap(), Offer::Accepted));

        tx.finish();
        assert!(rx.recv().await.unwrap().is_some());
        assert!(rx.recv().await.unwrap().is_none());
        assert!(matches!(tx.offer(FileRecord::directory("/", "c")), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn abort_reaches_receiver() {
        let (mut tx, mut rx) = record_channel(4);
        assert!(matches!(
            tx.offer(FileRecord::directory("/", "a")).unwrap(),
            Offer::Accepted
        ));
        tx.abort(&Error::MalformedArchive("bad".into()));

        // records sent before the failure are still delivered
        assert!(rx.recv().await.unwrap().is_some());
        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, Error::Aborted(ref reason) if reason.contains("bad")));
    }

    #[tokio::test]
    async fn dropped_receiver_closes_sink() {
        let (mut tx, rx) = record_channel(4);
        drop(rx);
        assert!(matches!(
            tx.offer(FileRecord::directory("/", "a")),
            Err(Error::SinkClosed)
        ));
    }

    #[tokio::test]
    async fn writer_sees_abort() {
        let (mut writer, mut queue) = pack_channel(1);

        let (write, _) = tokio::join!(writer.write(FileRecord::directory("/", "a")), async {
            let (record, completion) = queue.next().await.unwrap().unwrap();
            assert!(record.is_directory());
            queue.abort(&Error::UnsupportedRecordKind {
                name: "a".into(),
            });
            drop(completion);
        });

        let err = write.unwrap_err();
        assert!(matches!(err, Error::Aborted(ref reason) if reason.contains("Unknown file type")));
    }
}
