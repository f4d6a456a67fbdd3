//! The raw tar codec.
//!
//! This is the byte-level half of the transcoder: it turns a byte stream into a sequence of
//! headers (each followed by a once-readable run of content bytes) and back.  Header field layout,
//! numeric encoding and checksums are handled by the `tar` crate's [`tar::Header`]; this module
//! adds the streaming part on top of tokio byte channels, folding GNU long name/link records and
//! PAX extended headers into the entry they describe.
//!
//! Nothing in here knows about file records.  See [`crate::extract`] and [`crate::pack`] for the
//! translation layer.

use std::{
    cmp,
    ffi::OsString,
    os::unix::prelude::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use log::{debug, warn};
use tar::{EntryType, Header, PaxExtensions};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 512;

// Offset and width of the checksum field within a header block.
const CKSUM_RANGE: std::ops::Range<usize> = 148..156;

// Size of the name and linkname fields in a header block.
const NAME_FIELD_LEN: usize = 100;

// GNU long names and PAX headers are read into memory; anything larger than this is garbage.
const MAX_EXTENSION_SIZE: u64 = 1024 * 1024;

const GNU_LONG_NAME: u8 = b'L';
const GNU_LONG_LINK: u8 = b'K';

/// The type of an archive entry, reduced to what the adapters distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Anything else, with its raw typeflag.
    Other(u8),
}

impl EntryKind {
    fn from_header(entry_type: EntryType, name: &[u8]) -> Self {
        match entry_type {
            // old-style archives mark directories with a trailing slash only
            EntryType::Regular | EntryType::Continuous if name.ends_with(b"/") => {
                EntryKind::Directory
            }
            EntryType::Regular | EntryType::Continuous => EntryKind::File,
            EntryType::Directory => EntryKind::Directory,
            EntryType::Symlink => EntryKind::Symlink,
            other => EntryKind::Other(other.as_byte()),
        }
    }

    fn entry_type(self) -> EntryType {
        match self {
            EntryKind::File => EntryType::Regular,
            EntryKind::Directory => EntryType::Directory,
            EntryKind::Symlink => EntryType::Symlink,
            EntryKind::Other(tag) => EntryType::new(tag),
        }
    }

    /// The raw typeflag, as a character.
    pub fn tag(self) -> char {
        self.entry_type().as_byte() as char
    }
}

/// The decoded fields of one entry header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarHeader {
    /// Entry name, relative, without leading or trailing slashes.
    pub name: PathBuf,
    pub kind: EntryKind,
    /// Number of content bytes.  Only file entries normally have any.
    pub size: u64,
    /// Permission bits only; file type bits are never stored in the header.
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub link_name: Option<PathBuf>,
}

fn bytes_to_path(bytes: impl Into<Vec<u8>>) -> PathBuf {
    PathBuf::from(OsString::from_vec(bytes.into()))
}

/// Strips the leading and trailing slashes that archives may carry on entry names.
fn clean_name(name: &[u8]) -> &[u8] {
    let start = name.iter().position(|&b| b != b'/').unwrap_or(name.len());
    let end = name.iter().rposition(|&b| b != b'/').map_or(start, |p| p + 1);
    &name[start..end]
}

fn parse_decimal(key: &str, value: &[u8]) -> Result<u64> {
    // mtime can carry a fractional part, which tar headers can't represent anyway
    let integral = value.split(|&b| b == b'.').next().unwrap_or_default();
    std::str::from_utf8(integral)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::MalformedArchive(format!("invalid PAX {key} value")))
}

/// Zero bytes that follow `size` content bytes to fill the last block.  Sizes come from the
/// archive, so anything that doesn't fit in a `u64` once rounded up is rejected.
fn padding_for(size: u64) -> Result<u64> {
    size
        .checked_next_multiple_of(BLOCK_SIZE as u64)
        .map(|padded| padded - size)
        .ok_or_else(|| Error::MalformedArchive(format!("entry size {size} out of range")))
}

fn header_checksum(block: &[u8; BLOCK_SIZE]) -> u32 {
    block
        .iter()
        .enumerate()
        .map(|(i, &b)| u32::from(if CKSUM_RANGE.contains(&i) { b' ' } else { b }))
        .sum()
}

/// Overrides that extension records carry for the next real entry.
#[derive(Debug, Default)]
struct Extensions {
    name: Option<Vec<u8>>,
    link_name: Option<Vec<u8>>,
    size: Option<u64>,
    uid: Option<u64>,
    gid: Option<u64>,
    mtime: Option<u64>,
}

impl Extensions {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.link_name.is_none()
            && self.size.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.mtime.is_none()
    }

    fn apply_pax(&mut self, data: &[u8]) -> Result<()> {
        for extension in PaxExtensions::new(data) {
            let extension = extension.map_err(|e| Error::malformed("PAX header", e))?;
            let key = extension
                .key()
                .map_err(|e| Error::malformed("PAX header key", e))?;
            let value = extension.value_bytes();

            match key {
                "path" => self.name = Some(value.to_vec()),
                "linkpath" => self.link_name = Some(value.to_vec()),
                "size" => self.size = Some(parse_decimal(key, value)?),
                "uid" => self.uid = Some(parse_decimal(key, value)?),
                "gid" => self.gid = Some(parse_decimal(key, value)?),
                "mtime" => self.mtime = Some(parse_decimal(key, value)?),
                _ => debug!("ignoring PAX key {key}"),
            }
        }
        Ok(())
    }
}

/// Reads tar entries from a byte stream.
///
/// [`TarDecoder::next_entry`] returns the header of the next entry.  The entry's content then has
/// to be consumed through [`TarDecoder::next_chunk`], [`TarDecoder::read_content`] or
/// [`TarDecoder::skip_content`] before the following call to `next_entry()`; whatever is left
/// unread is skipped at that point.
#[derive(Debug)]
pub struct TarDecoder<R> {
    reader: R,
    remaining: u64,
    padding: u64,
    finished: bool,
    entries: u64,
}

impl<R: AsyncBufRead + Unpin> TarDecoder<R> {
    pub fn new(reader: R) -> Self {
        TarDecoder {
            reader,
            remaining: 0,
            padding: 0,
            finished: false,
            entries: 0,
        }
    }

    /// Number of entries returned so far.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    async fn skip(&mut self, mut count: u64) -> Result<()> {
        while count > 0 {
            let buf = self.reader.fill_buf().await.map_err(Error::ContentRead)?;
            if buf.is_empty() {
                return Err(Error::ContentRead(std::io::ErrorKind::UnexpectedEof.into()));
            }
            let n = cmp::min(count, buf.len() as u64) as usize;
            self.reader.consume(n);
            count -= n as u64;
        }
        Ok(())
    }

    /// Reads one header block.  A clean EOF before the first byte yields `None`; EOF anywhere
    /// after that means the archive was cut off mid-header.
    async fn read_block(&mut self) -> Result<Option<[u8; BLOCK_SIZE]>> {
        let mut block = [0u8; BLOCK_SIZE];
        let mut filled = 0;

        while filled < BLOCK_SIZE {
            let buf = match self.reader.fill_buf().await {
                Ok(buf) => buf,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Transport(err)),
            };
            if buf.is_empty() {
                return match filled {
                    0 => Ok(None),
                    _ => Err(Error::MalformedArchive(format!(
                        "truncated header ({filled} of {BLOCK_SIZE} bytes)"
                    ))),
                };
            }
            let n = cmp::min(buf.len(), BLOCK_SIZE - filled);
            block[filled..filled + n].copy_from_slice(&buf[..n]);
            self.reader.consume(n);
            filled += n;
        }

        Ok(Some(block))
    }

    async fn read_extension(&mut self, size: u64) -> Result<Vec<u8>> {
        if size > MAX_EXTENSION_SIZE {
            return Err(Error::MalformedArchive(format!(
                "{size} byte extension header"
            )));
        }
        self.remaining = size;
        self.padding = padding_for(size)?;
        self.read_content().await.map(Vec::from)
    }

    /// Reads the next entry header, or returns `None` once the archive has ended.
    pub async fn next_entry(&mut self) -> Result<Option<TarHeader>> {
        let mut extensions = Extensions::default();

        loop {
            if self.finished {
                return Ok(None);
            }

            // whatever is left of the previous entry
            let leftover = self
                .remaining
                .checked_add(self.padding)
                .ok_or_else(|| Error::MalformedArchive("entry size out of range".into()))?;
            self.remaining = 0;
            self.padding = 0;
            self.skip(leftover).await?;

            let Some(block) = self.read_block().await? else {
                warn!("archive ended without an end-of-archive marker");
                self.finished = true;
                return Ok(None);
            };

            if block == [0u8; BLOCK_SIZE] {
                self.finished = true;
                if !extensions.is_empty() {
                    return Err(Error::MalformedArchive(
                        "extension header without an entry".into(),
                    ));
                }
                return Ok(None);
            }

            let header = Header::from_byte_slice(&block);
            let stored = header.cksum().map_err(|e| Error::malformed("checksum", e))?;
            if stored != header_checksum(&block) {
                return Err(Error::MalformedArchive("header checksum mismatch".into()));
            }

            let size = header
                .entry_size()
                .map_err(|e| Error::malformed("size", e))?;
            let entry_type = header.entry_type();

            match entry_type.as_byte() {
                GNU_LONG_NAME => {
                    let mut name = self.read_extension(size).await?;
                    name.truncate(name.iter().position(|&b| b == 0).unwrap_or(name.len()));
                    extensions.name = Some(name);
                    continue;
                }
                GNU_LONG_LINK => {
                    let mut link = self.read_extension(size).await?;
                    link.truncate(link.iter().position(|&b| b == 0).unwrap_or(link.len()));
                    extensions.link_name = Some(link);
                    continue;
                }
                _ if entry_type.is_pax_local_extensions() => {
                    let data = self.read_extension(size).await?;
                    extensions.apply_pax(&data)?;
                    continue;
                }
                _ if entry_type.is_pax_global_extensions() => {
                    debug!("skipping PAX global header");
                    self.read_extension(size).await?;
                    continue;
                }
                _ => {}
            }

            let raw_name = match extensions.name.take() {
                Some(name) => name,
                None => header.path_bytes().into_owned(),
            };
            let link_name = match extensions.link_name.take() {
                Some(link) => Some(link),
                None => header.link_name_bytes().map(|l| l.into_owned()),
            };
            let size = extensions.size.unwrap_or(size);

            let decoded = TarHeader {
                name: bytes_to_path(clean_name(&raw_name)),
                kind: EntryKind::from_header(entry_type, &raw_name),
                size,
                mode: header.mode().map_err(|e| Error::malformed("mode", e))? & 0o7777,
                uid: match extensions.uid {
                    Some(uid) => uid,
                    None => header.uid().map_err(|e| Error::malformed("uid", e))?,
                },
                gid: match extensions.gid {
                    Some(gid) => gid,
                    None => header.gid().map_err(|e| Error::malformed("gid", e))?,
                },
                mtime: match extensions.mtime {
                    Some(mtime) => mtime,
                    None => header.mtime().map_err(|e| Error::malformed("mtime", e))?,
                },
                link_name: link_name.filter(|l| !l.is_empty()).map(bytes_to_path),
            };

            self.padding = padding_for(size)?;
            self.remaining = size;
            self.entries += 1;

            debug!(
                "entry {}: {:?} {:?} ({} bytes)",
                self.entries, decoded.kind, decoded.name, decoded.size
            );
            return Ok(Some(decoded));
        }
    }

    /// Returns the next chunk of the current entry's content, or `None` once it is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let buf = self.reader.fill_buf().await.map_err(Error::ContentRead)?;
        if buf.is_empty() {
            return Err(Error::ContentRead(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("entry truncated with {} bytes missing", self.remaining),
            )));
        }

        let n = cmp::min(self.remaining, buf.len() as u64) as usize;
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        self.reader.consume(n);
        self.remaining -= n as u64;
        Ok(Some(chunk))
    }

    /// Reads the rest of the current entry's content into memory.
    pub async fn read_content(&mut self) -> Result<Bytes> {
        // the size comes from the archive; don't trust it for preallocation
        let mut content = Vec::with_capacity(cmp::min(self.remaining, 1 << 20) as usize);
        while let Some(chunk) = self.next_chunk().await? {
            content.extend_from_slice(&chunk);
        }
        Ok(content.into())
    }

    /// Discards the rest of the current entry's content.
    pub async fn skip_content(&mut self) -> Result<()> {
        let remaining = self.remaining;
        self.remaining = 0;
        self.skip(remaining).await
    }
}

/// Writes tar entries to a byte stream.
#[derive(Debug)]
pub struct TarEncoder<W> {
    writer: W,
    finished: bool,
    entries: u64,
}

fn path_bytes(path: &Path) -> &[u8] {
    path.as_os_str().as_bytes()
}

fn extension_header(size: u64, entry_type: u8) -> Header {
    let mut header = Header::new_gnu();
    let name = b"././@LongLink";
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    // + 1 for the terminating NUL, as GNU tar does
    header.set_size(size + 1);
    header.set_entry_type(EntryType::new(entry_type));
    header.set_cksum();
    header
}

impl<W: AsyncWrite + Unpin> TarEncoder<W> {
    pub fn new(writer: W) -> Self {
        TarEncoder {
            writer,
            finished: false,
            entries: 0,
        }
    }

    /// Number of entries written so far.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await.map_err(Error::Transport)
    }

    async fn write_padded(&mut self, data: &[u8]) -> Result<()> {
        self.write(data).await?;
        let padding = data.len().next_multiple_of(BLOCK_SIZE) - data.len();
        self.write(&[0u8; BLOCK_SIZE][..padding]).await
    }

    async fn write_extension(&mut self, entry_type: u8, data: &[u8]) -> Result<()> {
        let header = extension_header(data.len() as u64, entry_type);
        self.write(header.as_bytes()).await?;
        let mut body = Vec::with_capacity(data.len() + 1);
        body.extend_from_slice(data);
        body.push(0);
        self.write_padded(&body).await
    }

    /// Writes one entry.  `content` must be exactly `header.size` bytes long.
    pub async fn append(&mut self, header: &TarHeader, content: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::Closed);
        }
        if content.len() as u64 != header.size {
            return Err(Error::SizeMismatch {
                name: header.name.clone(),
                declared: header.size,
                actual: content.len() as u64,
            });
        }

        let mut name = path_bytes(&header.name).to_vec();
        if header.kind == EntryKind::Directory && !name.ends_with(b"/") {
            name.push(b'/');
        }
        if name.len() > NAME_FIELD_LEN {
            self.write_extension(GNU_LONG_NAME, &name).await?;
        }

        let mut raw = Header::new_gnu();
        let len = cmp::min(name.len(), NAME_FIELD_LEN);
        raw.as_old_mut().name[..len].copy_from_slice(&name[..len]);

        if let Some(link_name) = &header.link_name {
            let link = path_bytes(link_name);
            if link.len() > NAME_FIELD_LEN {
                self.write_extension(GNU_LONG_LINK, link).await?;
            }
            let len = cmp::min(link.len(), NAME_FIELD_LEN);
            raw.as_old_mut().linkname[..len].copy_from_slice(&link[..len]);
        }

        raw.set_entry_type(header.kind.entry_type());
        raw.set_size(header.size);
        raw.set_mode(header.mode & 0o7777);
        raw.set_uid(header.uid);
        raw.set_gid(header.gid);
        raw.set_mtime(header.mtime);
        raw.set_cksum();

        self.write(raw.as_bytes()).await?;
        self.write_padded(content).await?;
        self.entries += 1;

        debug!(
            "wrote entry {}: {:?} {:?} ({} bytes)",
            self.entries, header.kind, header.name, header.size
        );
        Ok(())
    }

    /// Writes the end-of-archive marker and flushes.  Only the first call does anything.
    pub async fn finalize(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.write(&[0u8; 2 * BLOCK_SIZE]).await?;
        self.writer.flush().await.map_err(Error::Transport)
    }
}
