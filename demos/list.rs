//! Lists the files and directories of a tar archive read from stdin, skipping everything else.
//!
//!     cargo run --example list < in.tar

use anyhow::Result;
use tokio::io::{stdin, BufReader};

use tar_records::{
    extract::{Extract, ExtractOptions},
    flow::record_channel,
    record::{Contents, RecordKind},
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let (mut records, mut rx) = record_channel(16);
    let extract = Extract::new(BufReader::new(stdin()), ExtractOptions::default())?;

    let (extracted, listed) = tokio::join!(extract.run(&mut records), async {
        while let Some(record) = rx.recv().await? {
            let mode = record.stat.st_mode.unwrap_or_default();
            match (record.kind(), &record.contents) {
                (Some(RecordKind::File), Contents::Buffer(content)) => {
                    println!("{mode:o} {:>10} {}", content.len(), record.path.display())
                }
                (Some(RecordKind::Directory), _) => {
                    println!("{mode:o} {:>10} {}/", "-", record.path.display())
                }
                _ => {}
            }
        }
        Ok::<_, tar_records::Error>(())
    });

    extracted?;
    listed?;
    Ok(())
}
