use std::collections::HashMap;

use aes::cipher::{
    block_padding::Pkcs7, generic_array::GenericArray, BlockDecryptMut, KeyIvInit,
};
use reqwest::Url;
use tokio::sync::Mutex;

use crate::{
    error::{NagareError, NagareResult},
    options::RetryPolicy,
    util::http::HttpClient,
};

const BLOCK_SIZE: usize = 16;

/// Key material and IV of one AES-128-CBC encrypted segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aes128Key {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl Aes128Key {
    pub fn new(key: &[u8], iv: [u8; 16]) -> NagareResult<Self> {
        Ok(Self {
            key: key
                .try_into()
                .map_err(|_| NagareError::InvalidAes128Key(key.to_vec()))?,
            iv,
        })
    }

    pub fn decryptor(&self) -> StreamDecryptor {
        StreamDecryptor {
            cipher: cbc::Decryptor::<aes::Aes128>::new(&self.key.into(), &self.iv.into()),
            pending: Vec::with_capacity(BLOCK_SIZE * 2),
            total: 0,
        }
    }

    /// Decrypts a complete ciphertext and strips its PKCS#7 padding.
    pub fn decrypt(&self, data: &[u8]) -> NagareResult<Vec<u8>> {
        let mut decryptor = self.decryptor();
        let mut plain = decryptor.update(data);
        plain.extend(decryptor.finish()?);
        Ok(plain)
    }
}

/// Parses an `IV` attribute: hex with an optional `0x` prefix, any case,
/// left-padded to 16 bytes.
pub fn parse_iv(iv: &str) -> NagareResult<[u8; 16]> {
    let hex_str = iv
        .trim()
        .strip_prefix("0x")
        .or_else(|| iv.trim().strip_prefix("0X"))
        .unwrap_or(iv.trim());
    if hex_str.is_empty() || hex_str.len() > 32 {
        return Err(NagareError::InvalidIv(iv.to_string()));
    }

    let padded = format!("{hex_str:0>32}");
    let bytes = hex::decode(padded)?;
    bytes
        .try_into()
        .map_err(|_| NagareError::InvalidIv(iv.to_string()))
}

/// IV of a segment without an explicit one: its sequence number, big endian.
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    (sequence as u128).to_be_bytes()
}

/// Incremental AES-128-CBC decryption.
///
/// Ciphertext may arrive in arbitrary chunks. Only whole blocks are decrypted
/// and the last block is held back until [`StreamDecryptor::finish`], where its
/// padding is removed.
pub struct StreamDecryptor {
    cipher: cbc::Decryptor<aes::Aes128>,
    pending: Vec<u8>,
    total: usize,
}

impl StreamDecryptor {
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        self.total += data.len();
        self.pending.extend_from_slice(data);
        if self.pending.len() <= BLOCK_SIZE {
            return Vec::new();
        }

        // keep at least one complete block for finish()
        let ready = (self.pending.len() - 1) / BLOCK_SIZE * BLOCK_SIZE;
        let mut plain: Vec<u8> = self.pending.drain(..ready).collect();
        for block in plain.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        plain
    }

    pub fn finish(mut self) -> NagareResult<Vec<u8>> {
        if self.pending.len() != BLOCK_SIZE {
            return Err(NagareError::NotBlockAligned(self.total));
        }
        let plain = self.cipher.decrypt_padded_mut::<Pkcs7>(&mut self.pending)?;
        Ok(plain.to_vec())
    }
}

/// Per-stream cache of fetched key material, keyed by key URI.
pub struct KeyCache {
    client: HttpClient,
    policy: RetryPolicy,
    keys: Mutex<HashMap<Url, [u8; 16]>>,
}

impl KeyCache {
    pub fn new(client: HttpClient, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the 16 key bytes behind `url`, fetching them on first use.
    pub async fn get(&self, url: &Url) -> NagareResult<[u8; 16]> {
        // Held across the request so concurrent segments sharing a key fetch it once.
        let mut keys = self.keys.lock().await;
        if let Some(key) = keys.get(url) {
            return Ok(*key);
        }

        tracing::debug!(%url, "Fetching decryption key");
        let bytes = self.client.get_bytes(url, None, &self.policy).await?;
        let key: [u8; 16] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| NagareError::InvalidAes128Key(bytes.to_vec()))?;
        keys.insert(url.clone(), key);
        Ok(key)
    }
}
