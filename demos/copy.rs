//! Reads a tar archive on stdin, runs every entry through extraction and packing, and writes the
//! resulting archive to stdout.
//!
//!     cargo run --example copy < in.tar > out.tar

use anyhow::Result;
use log::info;
use tokio::io::{stdin, stdout, BufReader};

use tar_records::{
    extract::{Extract, ExtractOptions},
    flow::record_channel,
    pack::{Pack, PackOptions},
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let (mut records, mut rx) = record_channel(16);
    let extract = Extract::new(
        BufReader::new(stdin()),
        ExtractOptions {
            buffer: false,
            ..Default::default()
        },
    )?;

    let (extracted, packed) = tokio::join!(extract.run(&mut records), async {
        let mut pack = Pack::new(stdout(), PackOptions::default());
        while let Some(record) = rx.recv().await? {
            info!("{:?}", record.relative().unwrap_or(record.path.as_path()));
            pack.append(record).await?;
        }
        pack.finish().await
    });

    extracted?;
    packed?;
    Ok(())
}
