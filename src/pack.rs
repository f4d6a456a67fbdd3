//! The pack adapter: file records in, tar entries out.
//!
//! Every record is resolved into a header plus its exact content before anything is written, since
//! a tar header carries the content size up front.  Streamed content therefore gets read into
//! memory completely first.  Metadata the record leaves unset is filled in from [`PackOptions`],
//! whose process-derived defaults are looked up once, when the adapter is created.

use std::{
    path::{Component, Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use log::{debug, warn};
use tokio::io::AsyncWrite;

use crate::{
    codec::{EntryKind, TarEncoder, TarHeader},
    error::{Error, Result},
    flow::{RecordSource, State},
    mode,
    record::{Contents, FileRecord, RecordKind, Stat},
};

#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Fallback root for records whose path is not below their own base.
    pub cwd: Option<PathBuf>,
    /// Bits cleared from the default modes.  Defaults to the process umask.
    pub umask: Option<u32>,
    /// Mode of files and symlinks that carry none.  Defaults to 0o666.
    pub file_mode: Option<u32>,
    /// Mode of directories that carry none.  Defaults to 0o777.
    pub dir_mode: Option<u32>,
    /// Defaults to the uid of the process.
    pub uid: Option<u64>,
    /// Defaults to the gid of the process.
    pub gid: Option<u64>,
    /// Defaults to the time the adapter was created.
    pub mtime: Option<u64>,
}

/// [`PackOptions`] with every default looked up.
#[derive(Debug, Clone)]
struct Defaults {
    cwd: Option<PathBuf>,
    file_mode: u32,
    dir_mode: u32,
    uid: u64,
    gid: u64,
    mtime: u64,
}

impl Defaults {
    fn resolve(options: PackOptions) -> Self {
        let umask = options.umask.unwrap_or_else(mode::process_umask);
        let file_mode = options.file_mode.unwrap_or(mode::DEFAULT_FILE_MODE);
        let dir_mode = options.dir_mode.unwrap_or(mode::DEFAULT_DIR_MODE);

        Defaults {
            cwd: options.cwd,
            file_mode: file_mode & !umask & mode::PERMISSION_BITS,
            dir_mode: dir_mode & !umask & mode::PERMISSION_BITS,
            uid: options.uid.unwrap_or_else(mode::process_uid),
            gid: options.gid.unwrap_or_else(mode::process_gid),
            mtime: options.mtime.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs())
            }),
        }
    }

    fn header(&self, name: PathBuf, kind: RecordKind, stat: &Stat) -> TarHeader {
        let (entry_kind, default_mode) = match kind {
            RecordKind::File => (EntryKind::File, self.file_mode),
            RecordKind::Directory => (EntryKind::Directory, self.dir_mode),
            RecordKind::Symlink => (EntryKind::Symlink, self.file_mode),
        };

        TarHeader {
            name,
            kind: entry_kind,
            size: 0,
            mode: stat
                .st_mode
                .map_or(default_mode, |m| m & mode::PERMISSION_BITS),
            uid: stat.st_uid.unwrap_or(self.uid),
            gid: stat.st_gid.unwrap_or(self.gid),
            mtime: stat.st_mtim_sec.unwrap_or(self.mtime),
            link_name: None,
        }
    }
}

/// Drops `.` components and leading root components, which have no meaning inside an archive.
fn archive_name(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_) | Component::CurDir))
        .collect()
}

/// Converts file records into the entries of a tar stream.
#[derive(Debug)]
pub struct Pack<W> {
    encoder: TarEncoder<W>,
    defaults: Defaults,
    state: State,
}

impl<W: AsyncWrite + Unpin> Pack<W> {
    pub fn new(writer: W, options: PackOptions) -> Self {
        Pack {
            encoder: TarEncoder::new(writer),
            defaults: Defaults::resolve(options),
            state: State::Idle,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Number of entries written so far.
    pub fn entries(&self) -> u64 {
        self.encoder.entries()
    }

    /// The entry name of `record`: its path relative to its base, or else to the configured cwd.
    fn entry_name(&self, record: &FileRecord) -> Result<PathBuf> {
        let relative = if let Some(relative) = record.relative() {
            relative
        } else if let Some(relative) = self
            .defaults
            .cwd
            .as_deref()
            .and_then(|cwd| record.path.strip_prefix(cwd).ok())
        {
            relative
        } else if record.path.is_relative() {
            record.path.as_path()
        } else {
            return Err(Error::PathOutsideBase {
                path: record.path.clone(),
                base: record.base.clone(),
            });
        };

        let name = archive_name(relative);
        if name.as_os_str().is_empty() {
            // the base directory itself, as in archives made with `tar -C dir .`
            if record.is_directory() {
                return Ok(PathBuf::from("."));
            }
            return Err(Error::PathOutsideBase {
                path: record.path.clone(),
                base: record.base.clone(),
            });
        }
        Ok(name)
    }

    async fn write_record(&mut self, record: FileRecord) -> Result<()> {
        self.state.enter(State::Materializing);

        let name = self.entry_name(&record)?;
        let kind = record
            .kind()
            .ok_or_else(|| Error::UnsupportedRecordKind { name: name.clone() })?;
        let mut header = self.defaults.header(name, kind, &record.stat);

        let content = match record.contents {
            Contents::Buffer(content) => content,
            Contents::Stream(stream) => {
                // the size goes into the header, so the whole stream has to be read first
                Bytes::from(stream.read_to_end().await.map_err(Error::ContentRead)?)
            }
            Contents::Symlink(target) => {
                header.link_name = Some(target);
                Bytes::new()
            }
            Contents::Directory => Bytes::new(),
        };
        header.size = content.len() as u64;

        self.state.enter(State::Emitting);
        self.encoder.append(&header, &content).await?;
        self.state.enter(State::Awaiting);
        Ok(())
    }

    /// Writes the entry for one record.  On failure the adapter is closed.
    pub async fn append(&mut self, record: FileRecord) -> Result<()> {
        if self.state == State::Closed {
            return Err(Error::Closed);
        }

        debug!("packing {:?}", record.path);
        let result = self.write_record(record).await;
        if let Err(err) = &result {
            debug!("packing failed: {err}");
            self.state.enter(State::Closed);
        }
        result
    }

    /// Writes the end-of-archive marker and returns the underlying writer.
    pub async fn finish(mut self) -> Result<W> {
        if self.state == State::Closed {
            return Err(Error::Closed);
        }

        self.encoder.finalize().await?;
        self.state.enter(State::Closed);
        debug!("archive finished after {} entries", self.encoder.entries());
        Ok(self.encoder.into_inner())
    }

    /// Packs every record from `source`, completing each one once its entry is written, and
    /// finishes the archive when the source runs dry.
    pub async fn run(mut self, source: &mut impl RecordSource) -> Result<W> {
        loop {
            self.state.enter(State::Awaiting);
            let next = match source.next().await {
                Ok(next) => next,
                Err(err) => {
                    warn!("record source failed: {err}");
                    self.state.enter(State::Closed);
                    return Err(err);
                }
            };

            let Some((record, completion)) = next else {
                break;
            };

            if let Err(err) = self.append(record).await {
                // the completion is dropped, not completed
                source.abort(&err);
                return Err(err);
            }
            completion.complete();
        }

        match self.finish().await {
            Ok(writer) => Ok(writer),
            Err(err) => {
                source.abort(&err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use similar_asserts::assert_eq;
    use tar::{Archive, EntryType};

    use super::*;
    use crate::{
        codec::BLOCK_SIZE,
        flow::pack_channel,
        record::ContentStream,
    };

    fn fixed_options() -> PackOptions {
        PackOptions {
            umask: Some(0o022),
            uid: Some(1000),
            gid: Some(1000),
            mtime: Some(1600000000),
            ..Default::default()
        }
    }

    #[derive(Debug, PartialEq)]
    struct Seen {
        path: String,
        entry_type: EntryType,
        mode: u32,
        uid: u64,
        gid: u64,
        mtime: u64,
        size: u64,
        content: Vec<u8>,
        link_name: Option<String>,
    }

    fn read_archive(data: &[u8]) -> Vec<Seen> {
        let mut archive = Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let mut content = vec![];
                entry.read_to_end(&mut content).unwrap();
                let header = entry.header();
                Seen {
                    path: entry.path().unwrap().to_string_lossy().into_owned(),
                    entry_type: header.entry_type(),
                    mode: header.mode().unwrap(),
                    uid: header.uid().unwrap(),
                    gid: header.gid().unwrap(),
                    mtime: header.mtime().unwrap(),
                    size: header.size().unwrap(),
                    link_name: entry
                        .link_name()
                        .unwrap()
                        .map(|l| l.to_string_lossy().into_owned()),
                    content,
                }
            })
            .collect()
    }

    async fn pack_all(options: PackOptions, records: Vec<FileRecord>) -> Result<Vec<u8>> {
        let mut pack = Pack::new(Vec::new(), options);
        for record in records {
            pack.append(record).await?;
        }
        pack.finish().await
    }

    #[tokio::test]
    async fn default_file_mode_respects_umask() {
        let options = PackOptions {
            umask: None,
            ..fixed_options()
        };
        let data = pack_all(options, vec![FileRecord::buffer("/src", "x.txt", "ab")])
            .await
            .unwrap();

        let seen = read_archive(&data);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path, "x.txt");
        assert_eq!(seen[0].mode, 0o666 & !mode::process_umask());
        assert_eq!(seen[0].content, b"ab");
    }

    #[tokio::test]
    async fn defaults_fill_unset_fields_only() {
        let stat = Stat {
            st_mode: Some(0o100600),
            st_uid: Some(0),
            st_gid: None,
            st_mtim_sec: Some(42),
        };
        let data = pack_all(
            fixed_options(),
            vec![
                FileRecord::buffer("/src", "explicit", "e").with_stat(stat),
                FileRecord::buffer("/src", "implicit", "i"),
                FileRecord::directory("/src", "dir"),
                FileRecord::symlink("/src", "link", "implicit"),
            ],
        )
        .await
        .unwrap();

        let seen = read_archive(&data);
        assert_eq!(seen.len(), 4);

        // uid 0 is explicit, not unset
        assert_eq!((seen[0].mode, seen[0].uid, seen[0].gid), (0o600, 0, 1000));
        assert_eq!(seen[0].mtime, 42);

        assert_eq!((seen[1].mode, seen[1].uid, seen[1].gid), (0o644, 1000, 1000));
        assert_eq!(seen[1].mtime, 1600000000);

        assert_eq!(seen[2].path, "dir/");
        assert_eq!(seen[2].entry_type, EntryType::Directory);
        assert_eq!(seen[2].mode, 0o755);
        assert_eq!(seen[2].size, 0);

        assert_eq!(seen[3].entry_type, EntryType::Symlink);
        assert_eq!(seen[3].mode, 0o644);
        assert_eq!(seen[3].link_name.as_deref(), Some("implicit"));
        assert_eq!(seen[3].size, 0);
    }

    #[tokio::test]
    async fn custom_default_modes() {
        let options = PackOptions {
            umask: Some(0),
            file_mode: Some(0o640),
            dir_mode: Some(0o750),
            ..fixed_options()
        };
        let data = pack_all(
            options,
            vec![
                FileRecord::buffer("/src", "f", "f"),
                FileRecord::directory("/src", "d"),
            ],
        )
        .await
        .unwrap();

        let seen = read_archive(&data);
        assert_eq!(seen[0].mode, 0o640);
        assert_eq!(seen[1].mode, 0o750);
    }

    #[tokio::test]
    async fn stream_size_is_exact() {
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let stream = ContentStream::new(std::io::Cursor::new(content.clone()));

        let data = pack_all(
            fixed_options(),
            vec![FileRecord::stream("/src", "streamed.bin", stream)],
        )
        .await
        .unwrap();

        let seen = read_archive(&data);
        assert_eq!(seen[0].size, content.len() as u64);
        assert_eq!(seen[0].content, content);
        // header, content rounded up to whole blocks, end marker
        assert_eq!(data.len(), BLOCK_SIZE + 10_240 + 2 * BLOCK_SIZE);
    }

    #[tokio::test]
    async fn contradictory_record_is_fatal() {
        let fifo = FileRecord::buffer("/src", "fifo", "").with_stat(Stat {
            st_mode: Some(0o10644),
            ..Default::default()
        });

        let mut pack = Pack::new(Vec::new(), fixed_options());
        pack.append(FileRecord::buffer("/src", "ok", "ok"))
            .await
            .unwrap();
        let err = pack.append(fifo).await.unwrap_err();
        assert!(
            matches!(err, Error::UnsupportedRecordKind { ref name } if name == Path::new("fifo")),
            "{err:?}"
        );
        assert_eq!(pack.state(), State::Closed);
        assert_eq!(pack.entries(), 1);

        assert!(matches!(
            pack.append(FileRecord::buffer("/src", "late", "")).await,
            Err(Error::Closed)
        ));
        assert!(matches!(pack.finish().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn entry_names() {
        let mut outside = FileRecord::buffer("/src", "a", "a");
        outside.path = PathBuf::from("/work/sub/a");

        let mut relative = FileRecord::buffer("/src", "b", "b");
        relative.path = PathBuf::from("./rel/b");

        let options = PackOptions {
            cwd: Some("/work".into()),
            ..fixed_options()
        };
        let data = pack_all(options, vec![outside, relative]).await.unwrap();
        let seen = read_archive(&data);
        assert_eq!(seen[0].path, "sub/a");
        assert_eq!(seen[1].path, "rel/b");

        let mut lost = FileRecord::buffer("/src", "c", "c");
        lost.path = PathBuf::from("/elsewhere/c");
        let err = pack_all(fixed_options(), vec![lost]).await.unwrap_err();
        assert!(matches!(err, Error::PathOutsideBase { .. }), "{err:?}");

        let file_at_base = FileRecord::buffer("/src", "", "x");
        let err = pack_all(fixed_options(), vec![file_at_base]).await.unwrap_err();
        assert!(matches!(err, Error::PathOutsideBase { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn base_directory_is_dot() {
        let mut dot = FileRecord::directory("/w", "");
        dot.path = PathBuf::from("/w/.");
        let data = pack_all(
            fixed_options(),
            vec![
                FileRecord::directory("/w", ""),
                dot,
                FileRecord::buffer("/w", "a.txt", "a"),
            ],
        )
        .await
        .unwrap();

        let seen = read_archive(&data);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].path, "./");
        assert_eq!(seen[0].entry_type, EntryType::Directory);
        assert_eq!(seen[1].path, "./");
        assert_eq!(seen[2].path, "a.txt");
    }

    #[tokio::test]
    async fn failing_stream_is_a_read_error() {
        let mock = tokio_test::io::Builder::new()
            .read(b"partial")
            .read_error(std::io::Error::other("boom"))
            .build();
        let stream = ContentStream::new(mock);

        let err = pack_all(
            fixed_options(),
            vec![FileRecord::stream("/src", "broken", stream)],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ContentRead(_)), "{err:?}");
    }

    #[tokio::test]
    async fn run_completes_records_in_order() {
        let (mut writer, mut queue) = pack_channel(1);
        let pack = Pack::new(Vec::new(), fixed_options());

        let (data, ()) = tokio::join!(pack.run(&mut queue), async move {
            writer
                .write(FileRecord::buffer("/src", "a.txt", "hello"))
                .await
                .unwrap();
            writer.write(FileRecord::directory("/src", "dir")).await.unwrap();
            writer
                .write(FileRecord::symlink("/src", "dir/link", "a.txt"))
                .await
                .unwrap();
            // dropping the writer ends the archive
        });

        let data = data.unwrap();
        assert!(data.ends_with(&[0u8; 2 * BLOCK_SIZE]));
        let paths: Vec<_> = read_archive(&data).into_iter().map(|s| s.path).collect();
        assert_eq!(paths, vec!["a.txt", "dir/", "dir/link"]);
    }

    #[tokio::test]
    async fn run_failure_reaches_writer() {
        let (mut writer, mut queue) = pack_channel(1);
        let pack = Pack::new(Vec::new(), fixed_options());

        let (result, write) = tokio::join!(pack.run(&mut queue), async move {
            writer
                .write(FileRecord::buffer("/src", "ok", "ok"))
                .await
                .unwrap();
            let mut bad = FileRecord::directory("/src", "bad");
            bad.stat.st_mode = Some(0o20644);
            writer.write(bad).await
        });

        assert!(matches!(result, Err(Error::UnsupportedRecordKind { .. })));
        assert!(matches!(write, Err(Error::Aborted(ref reason)) if reason.contains("bad")));
    }
}
