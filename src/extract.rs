//! The extract adapter: tar entries in, file records out.
//!
//! [`Extract`] drives a [`TarDecoder`] one entry at a time.  Each entry is turned into a
//! [`FileRecord`] and offered to a [`RecordSink`]; the decoder is only asked for the next entry
//! once the sink has taken the record, so the archive is never read ahead of the consumer.
//!
//! File content is either read into memory before the record is emitted (the default), or handed
//! out as a live [`ContentStream`] that is fed from the archive while the consumer reads it.

use std::path::PathBuf;

use log::debug;
use rustix::fs::FileType;
use tokio::io::AsyncBufRead;

use crate::{
    codec::{EntryKind, TarDecoder, TarHeader},
    error::{Error, Result},
    flow::{Offer, RecordSink, State},
    mode,
    record::{ContentStream, Contents, FileRecord, Stat},
};

// Chunks of live content that may be in flight towards a consumer.
const STREAM_CHUNKS: usize = 4;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Directory the records are resolved against.  Defaults to the process working directory.
    pub cwd: Option<PathBuf>,
    /// Root that entry names are joined onto.  Defaults to `cwd`.
    pub base: Option<PathBuf>,
    /// Read file content into memory before emitting the record (the default), or emit the
    /// record right away with a live content stream.
    pub buffer: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            cwd: None,
            base: None,
            buffer: true,
        }
    }
}

/// Converts the entries of a tar stream into file records.
#[derive(Debug)]
pub struct Extract<R> {
    decoder: TarDecoder<R>,
    cwd: PathBuf,
    base: PathBuf,
    buffer: bool,
    state: State,
}

fn stat_from_header(header: &TarHeader, file_type: FileType) -> Stat {
    Stat {
        st_mode: Some(mode::with_file_type(header.mode, file_type)),
        st_uid: Some(header.uid),
        st_gid: Some(header.gid),
        st_mtim_sec: Some(header.mtime),
    }
}

impl<R: AsyncBufRead + Unpin> Extract<R> {
    pub fn new(reader: R, options: ExtractOptions) -> Result<Self> {
        let cwd = match options.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir().map_err(Error::CurrentDir)?,
        };
        let base = options.base.unwrap_or_else(|| cwd.clone());

        Ok(Extract {
            decoder: TarDecoder::new(reader),
            cwd,
            base,
            buffer: options.buffer,
            state: State::Idle,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Number of archive entries read so far.
    pub fn entries(&self) -> u64 {
        self.decoder.entries()
    }

    fn record(&self, header: &TarHeader, file_type: FileType, contents: Contents) -> FileRecord {
        FileRecord {
            cwd: self.cwd.clone(),
            base: self.base.clone(),
            path: self.base.join(&header.name),
            stat: stat_from_header(header, file_type),
            contents,
        }
    }

    async fn emit(&mut self, sink: &mut impl RecordSink, mut record: FileRecord) -> Result<()> {
        self.state.enter(State::Emitting);
        loop {
            match sink.offer(record)? {
                Offer::Accepted => return Ok(()),
                Offer::Retry(returned) => {
                    record = returned;
                    self.state.enter(State::AwaitingDrain);
                    sink.drained().await?;
                    self.state.enter(State::Emitting);
                }
            }
        }
    }

    /// Feeds the rest of the current entry into a live content stream.
    async fn pump(&mut self, tx: tokio::sync::mpsc::Sender<bytes::Bytes>) -> Result<()> {
        while let Some(chunk) = self.decoder.next_chunk().await? {
            if tx.send(chunk).await.is_err() {
                debug!("content stream dropped by its consumer, discarding the rest");
                return self.decoder.skip_content().await;
            }
        }
        Ok(())
    }

    async fn advance(&mut self, sink: &mut impl RecordSink) -> Result<bool> {
        self.state.enter(State::Awaiting);
        let Some(header) = self.decoder.next_entry().await? else {
            sink.finish();
            self.state.enter(State::Closed);
            return Ok(false);
        };

        self.state.enter(State::Materializing);
        match header.kind {
            EntryKind::File if self.buffer => {
                let content = self.decoder.read_content().await?;
                let record = self.record(&header, FileType::RegularFile, Contents::Buffer(content));
                self.emit(sink, record).await?;
            }
            EntryKind::File => {
                let (tx, stream) = ContentStream::channel(header.size, STREAM_CHUNKS);
                let record = self.record(&header, FileType::RegularFile, Contents::Stream(stream));
                self.emit(sink, record).await?;
                // the entry is done once the consumer has drained the stream
                self.pump(tx).await?;
            }
            EntryKind::Directory => {
                self.decoder.skip_content().await?;
                let record = self.record(&header, FileType::Directory, Contents::Directory);
                self.emit(sink, record).await?;
            }
            EntryKind::Symlink => {
                self.decoder.skip_content().await?;
                let target = header.link_name.clone().unwrap_or_default();
                let record =
                    self.record(&header, FileType::Symlink, Contents::Symlink(target));
                self.emit(sink, record).await?;
            }
            EntryKind::Other(_) => {
                self.decoder.skip_content().await?;
                return Err(Error::UnsupportedEntryType {
                    name: header.name,
                    tag: header.kind.tag(),
                });
            }
        }

        Ok(true)
    }

    /// Processes one archive entry: reads it, emits its record and waits for the sink to take it.
    ///
    /// Returns `false` once the archive has ended, after signalling the end to the sink.  Any
    /// failure is reported to the sink as well, and leaves the adapter closed.
    pub async fn step(&mut self, sink: &mut impl RecordSink) -> Result<bool> {
        if self.state == State::Closed {
            return Err(Error::Closed);
        }

        match self.advance(sink).await {
            Ok(more) => Ok(more),
            Err(err) => {
                debug!("extraction failed: {err}");
                sink.abort(&err);
                self.state.enter(State::Closed);
                Err(err)
            }
        }
    }

    /// Processes the whole archive.
    pub async fn run(mut self, sink: &mut impl RecordSink) -> Result<()> {
        while self.step(sink).await? {}
        Ok(())
    }
}
