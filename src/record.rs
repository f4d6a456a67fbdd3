//! The file record model.
//!
//! A [`FileRecord`] is the archive-independent description of one filesystem object: where it
//! lives (`cwd`, `base`, `path`), its metadata ([`Stat`]) and its content ([`Contents`]).  The
//! content is a sum type over exactly the four shapes the adapters know how to translate; the
//! record's kind follows from the content variant, and any file type bits carried in the mode
//! must agree with it.

use std::{
    cmp, fmt, io,
    path::{Path, PathBuf},
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use rustix::fs::FileType;
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    sync::mpsc,
};

use crate::mode;

/// Metadata of a record.  `None` fields are unset and get filled in from defaults when packing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub st_mode: Option<u32>,
    pub st_uid: Option<u64>,
    pub st_gid: Option<u64>,
    pub st_mtim_sec: Option<u64>,
}

/// The content of a record.
#[derive(Debug)]
pub enum Contents {
    /// File content held in memory.
    Buffer(Bytes),
    /// File content that still has to be read, exactly once.
    Stream(ContentStream),
    /// A directory; it has no content.
    Directory,
    /// A symbolic link to the contained target.
    Symlink(PathBuf),
}

/// What a record represents, as far as the archive is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    File,
    Directory,
    Symlink,
}

impl RecordKind {
    pub fn file_type(self) -> FileType {
        match self {
            RecordKind::File => FileType::RegularFile,
            RecordKind::Directory => FileType::Directory,
            RecordKind::Symlink => FileType::Symlink,
        }
    }
}

#[derive(Debug)]
pub struct FileRecord {
    /// The directory that relative paths were resolved against.
    pub cwd: PathBuf,
    /// The root that [`FileRecord::relative`] is computed from.
    pub base: PathBuf,
    pub path: PathBuf,
    pub stat: Stat,
    pub contents: Contents,
}

impl FileRecord {
    fn new(base: impl Into<PathBuf>, relative: impl AsRef<Path>, contents: Contents) -> Self {
        let base = base.into();
        FileRecord {
            cwd: base.clone(),
            path: base.join(relative),
            base,
            stat: Stat::default(),
            contents,
        }
    }

    /// A regular file at `base/relative` whose content is already in memory.
    pub fn buffer(
        base: impl Into<PathBuf>,
        relative: impl AsRef<Path>,
        content: impl Into<Bytes>,
    ) -> Self {
        Self::new(base, relative, Contents::Buffer(content.into()))
    }

    /// A regular file at `base/relative` whose content is read from `stream`.
    pub fn stream(base: impl Into<PathBuf>, relative: impl AsRef<Path>, stream: ContentStream) -> Self {
        Self::new(base, relative, Contents::Stream(stream))
    }

    pub fn directory(base: impl Into<PathBuf>, relative: impl AsRef<Path>) -> Self {
        Self::new(base, relative, Contents::Directory)
    }

    pub fn symlink(
        base: impl Into<PathBuf>,
        relative: impl AsRef<Path>,
        target: impl Into<PathBuf>,
    ) -> Self {
        Self::new(base, relative, Contents::Symlink(target.into()))
    }

    pub fn with_stat(mut self, stat: Stat) -> Self {
        self.stat = stat;
        self
    }

    /// The record's path relative to its base, if it is below it.
    pub fn relative(&self) -> Option<&Path> {
        self.path.strip_prefix(&self.base).ok()
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.contents, Contents::Directory)
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self.contents, Contents::Symlink(_))
    }

    /// The symlink target, for symlink records.
    pub fn symlink_target(&self) -> Option<&Path> {
        match &self.contents {
            Contents::Symlink(target) => Some(target),
            _ => None,
        }
    }

    /// Classifies the record.
    ///
    /// The content variant decides the kind.  If the mode also carries file type bits they must
    /// name the same kind; a record that contradicts itself has no kind.
    pub fn kind(&self) -> Option<RecordKind> {
        let kind = match self.contents {
            Contents::Buffer(_) | Contents::Stream(_) => RecordKind::File,
            Contents::Directory => RecordKind::Directory,
            Contents::Symlink(_) => RecordKind::Symlink,
        };

        match self.stat.st_mode.and_then(mode::file_type) {
            None => Some(kind),
            Some(file_type) if file_type == kind.file_type() => Some(kind),
            Some(_) => None,
        }
    }
}

/// A once-readable stream of file content.
///
/// Streams created by the extract adapter are fed from the archive while the consumer reads
/// them; reading one to completion is what lets the adapter move on to the next entry.
pub struct ContentStream {
    inner: Pin<Box<dyn AsyncRead + Send>>,
}

impl ContentStream {
    pub fn new(reader: impl AsyncRead + Send + 'static) -> Self {
        ContentStream {
            inner: Box::pin(reader),
        }
    }

    /// Creates a stream fed by chunks sent into the returned channel.  If the channel closes
    /// before `expected` bytes went through it, reading fails with `UnexpectedEof`.
    pub(crate) fn channel(expected: u64, capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let reader = ChannelReader {
            rx,
            chunk: Bytes::new(),
            expected,
            received: 0,
        };
        (tx, ContentStream::new(reader))
    }

    pub async fn read_to_end(mut self) -> io::Result<Vec<u8>> {
        let mut content = vec![];
        self.inner.read_to_end(&mut content).await?;
        Ok(content)
    }
}

impl AsyncRead for ContentStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStream").finish_non_exhaustive()
    }
}

struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    chunk: Bytes,
    expected: u64,
    received: u64,
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        while this.chunk.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => {
                    this.received += chunk.len() as u64;
                    this.chunk = chunk;
                }
                None if this.received < this.expected => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "entry ended after {} of {} bytes",
                            this.received, this.expected
                        ),
                    )));
                }
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = cmp::min(buf.remaining(), this.chunk.len());
        buf.put_slice(&this.chunk.split_to(n));
        Poll::Ready(Ok(()))
    }
}
