//! Streaming conversion between tar archives and file records.
//!
//! [`extract::Extract`] reads a tar byte stream and emits one [`record::FileRecord`] per entry;
//! [`pack::Pack`] does the reverse.  Both work one entry at a time, in archive order, and only
//! move on once the other side has taken the current entry, so they can be composed into
//! pipelines without unbounded buffering.
//!
//! ```no_run
//! use tar_records::{
//!     extract::{Extract, ExtractOptions},
//!     flow::record_channel,
//!     pack::{Pack, PackOptions},
//! };
//!
//! # async fn copy(archive: &[u8]) -> tar_records::error::Result<Vec<u8>> {
//! let (mut records, mut rx) = record_channel(16);
//! let extract = Extract::new(archive, ExtractOptions::default())?;
//! let (extracted, packed) = tokio::join!(extract.run(&mut records), async {
//!     let mut pack = Pack::new(Vec::new(), PackOptions::default());
//!     while let Some(record) = rx.recv().await? {
//!         pack.append(record).await?;
//!     }
//!     pack.finish().await
//! });
//! extracted?;
//! packed
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod extract;
pub mod flow;
pub mod mode;
pub mod pack;
pub mod record;

pub use error::{Error, Result};
