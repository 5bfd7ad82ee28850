//! `#[serde(with)]` adapter storing `bytes::Bytes` as a CBOR byte string

use bytes::Bytes;
use serde::{Deserializer, Serializer};
use serde_bytes::ByteBuf;

pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serde_bytes::serialize(bytes.as_ref(), serializer)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let buf: ByteBuf = serde::Deserialize::deserialize(deserializer)?;
    Ok(Bytes::from(buf.into_vec()))
}
