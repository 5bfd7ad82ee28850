//! CAR file reading utilities
//!
//! Reads CAR data into memory or streams it block by block. Each block is
//! checked against its CID as it is read.

use super::{CarMode, ParsedCar};
use crate::error::{CarError, RepoError, Result};
use atrepo_common::IpldCid;
use atrepo_common::cid::{CidError, verify_cid};
use bytes::Bytes;
use iroh_car::CarReader;
use n0_future::stream::{Stream, StreamExt};
use std::path::Path;
use std::pin::Pin;
use tokio::fs::File;
use tokio::io::AsyncRead;

fn parse_err(e: iroh_car::Error) -> RepoError {
    CarError::Parse(e.to_string()).into()
}

/// Check one block, applying the mode's policy.
///
/// Returns `Ok(false)` when a lenient read should skip the block.
fn admit_block(cid: &IpldCid, data: &[u8], mode: CarMode) -> Result<bool> {
    match verify_cid(cid, data) {
        Ok(()) => Ok(true),
        #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
        Err(e @ CidError::Mismatch { .. }) if mode == CarMode::Lenient => {
            #[cfg(feature = "tracing")]
            tracing::warn!(cid = %cid, error = %e, "dropping corrupt CAR block");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

async fn read_all<R: AsyncRead + Send + Unpin>(reader: CarReader<R>, mode: CarMode) -> Result<ParsedCar> {
    let mut parsed = ParsedCar {
        roots: reader.header().roots().to_vec(),
        ..Default::default()
    };

    let stream = reader.stream();
    n0_future::pin!(stream);

    while let Some(result) = stream.next().await {
        let (cid, data) = result.map_err(parse_err)?;
        if admit_block(&cid, &data, mode)? {
            parsed.blocks.entry(cid).or_insert_with(|| Bytes::from(data));
        } else {
            parsed.corrupt.push(cid);
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(
        roots = parsed.roots.len(),
        blocks = parsed.blocks.len(),
        corrupt = parsed.corrupt.len(),
        "parsed CAR"
    );

    Ok(parsed)
}

/// Read an entire CAR file into memory
///
/// For large CAR files, consider using [`stream_car`] instead.
pub async fn read_car(path: impl AsRef<Path>, mode: CarMode) -> Result<ParsedCar> {
    let file = File::open(path).await?;
    let reader = CarReader::new(file).await.map_err(parse_err)?;
    read_all(reader, mode).await
}

/// Read CAR file header (roots only)
pub async fn read_car_header(path: impl AsRef<Path>) -> Result<Vec<IpldCid>> {
    let file = File::open(path).await?;
    let reader = CarReader::new(file).await.map_err(parse_err)?;
    Ok(reader.header().roots().to_vec())
}

/// Parse in-memory CAR bytes
///
/// Used for archives received over the network and for proofs.
pub async fn parse_car_bytes(data: &[u8], mode: CarMode) -> Result<ParsedCar> {
    let reader = CarReader::new(data).await.map_err(parse_err)?;
    read_all(reader, mode).await
}

/// Stream CAR blocks without loading the entire file into memory
///
/// Streams are always strict: a block that fails its CID check ends the
/// stream with an error.
pub async fn stream_car(path: impl AsRef<Path>) -> Result<CarBlockStream> {
    let file = File::open(path).await?;
    let reader = CarReader::new(file).await.map_err(parse_err)?;

    let roots = reader.header().roots().to_vec();
    let stream = Box::pin(reader.stream());

    Ok(CarBlockStream { stream, roots })
}

/// Streaming CAR block reader
pub struct CarBlockStream {
    stream: Pin<
        Box<dyn Stream<Item = std::result::Result<(IpldCid, Vec<u8>), iroh_car::Error>> + Send>,
    >,
    roots: Vec<IpldCid>,
}

impl CarBlockStream {
    /// Get next block from the stream
    ///
    /// Returns `None` when stream is exhausted.
    pub async fn next(&mut self) -> Result<Option<(IpldCid, Bytes)>> {
        match self.stream.next().await {
            Some(result) => {
                let (cid, data) = result.map_err(parse_err)?;
                verify_cid(&cid, &data)?;
                Ok(Some((cid, Bytes::from(data))))
            }
            None => Ok(None),
        }
    }

    /// Get the CAR file roots
    pub fn roots(&self) -> &[IpldCid] {
        &self.roots
    }
}
