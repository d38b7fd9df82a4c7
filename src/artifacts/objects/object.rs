use bytes::Bytes;
use std::io::BufRead;

/// Binary encoding of a value stored in the chunk store.
pub trait Packable {
    fn serialize(&self) -> anyhow::Result<Bytes>;
}

pub trait Unpackable {
    fn deserialize(reader: impl BufRead) -> anyhow::Result<Self>
    where
        Self: Sized;
}
