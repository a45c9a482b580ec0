use anyhow::{Context, Result};
use bytes::Bytes;
use rand::RngCore;
use rand::rngs::OsRng;
use std::ops::Deref;

pub const PAYLOAD_SIZE: usize = 1 << 16;

/// Random bytes written over and over by every sender session. Filled once,
/// then only shared.
#[derive(Debug, Clone)]
pub struct Payload(Bytes);

impl Payload {
    pub fn generate(len: usize) -> Result<Self> {
        let mut buf = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut buf)
            .with_context(|| format!("reading {} random bytes from the OS", len))?;
        Ok(Self(Bytes::from(buf)))
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}
