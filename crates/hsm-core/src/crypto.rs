//! Symmetric primitives backing the software token's mechanisms.

use ::rand::RngCore;
use ::rand::rngs::OsRng;
use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
    block_padding::{Padding, Pkcs7},
    generic_array::GenericArray,
    typenum::U16,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{HsmError, HsmResult};

pub const AES_BLOCK_LEN: usize = 16;
pub const SHA256_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Fresh random key material from the operating system RNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut material = vec![0u8; len];
    OsRng.fill_bytes(&mut material);
    material
}

pub fn is_aes_key_len(len: usize) -> bool {
    matches!(len, 16 | 24 | 32)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

#[derive(Clone)]
enum BlockMode {
    Encrypt128(cbc::Encryptor<Aes128>),
    Encrypt192(cbc::Encryptor<Aes192>),
    Encrypt256(cbc::Encryptor<Aes256>),
    Decrypt128(cbc::Decryptor<Aes128>),
    Decrypt192(cbc::Decryptor<Aes192>),
    Decrypt256(cbc::Decryptor<Aes256>),
}

impl BlockMode {
    fn new(direction: Direction, key: &[u8], iv: &[u8]) -> HsmResult<Self> {
        if iv.len() != AES_BLOCK_LEN {
            return Err(HsmError::param(format!(
                "AES-CBC needs a {AES_BLOCK_LEN}-byte IV, got {}",
                iv.len()
            )));
        }
        let mode = match (direction, key.len()) {
            (Direction::Encrypt, 16) => {
                Self::Encrypt128(cbc::Encryptor::new_from_slices(key, iv).map_err(HsmError::crypto)?)
            }
            (Direction::Encrypt, 24) => {
                Self::Encrypt192(cbc::Encryptor::new_from_slices(key, iv).map_err(HsmError::crypto)?)
            }
            (Direction::Encrypt, 32) => {
                Self::Encrypt256(cbc::Encryptor::new_from_slices(key, iv).map_err(HsmError::crypto)?)
            }
            (Direction::Decrypt, 16) => {
                Self::Decrypt128(cbc::Decryptor::new_from_slices(key, iv).map_err(HsmError::crypto)?)
            }
            (Direction::Decrypt, 24) => {
                Self::Decrypt192(cbc::Decryptor::new_from_slices(key, iv).map_err(HsmError::crypto)?)
            }
            (Direction::Decrypt, 32) => {
                Self::Decrypt256(cbc::Decryptor::new_from_slices(key, iv).map_err(HsmError::crypto)?)
            }
            (_, len) => return Err(HsmError::KeySizeRange(len)),
        };
        Ok(mode)
    }

    /// Runs the chained cipher over whole blocks in place.
    fn apply(&mut self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(AES_BLOCK_LEN) {
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                Self::Encrypt128(c) => c.encrypt_block_mut(block),
                Self::Encrypt192(c) => c.encrypt_block_mut(block),
                Self::Encrypt256(c) => c.encrypt_block_mut(block),
                Self::Decrypt128(c) => c.decrypt_block_mut(block),
                Self::Decrypt192(c) => c.decrypt_block_mut(block),
                Self::Decrypt256(c) => c.decrypt_block_mut(block),
            }
        }
    }
}

/// Multi-part AES-CBC context. Input is buffered until whole blocks are available;
/// with padding enabled the decrypt side always holds back the final block so the
/// PKCS#7 trailer can be checked in [`CbcStream::finish`].
#[derive(Clone)]
pub struct CbcStream {
    mode: BlockMode,
    direction: Direction,
    padded: bool,
    pending: Vec<u8>,
}

impl CbcStream {
    pub fn new(direction: Direction, key: &[u8], iv: &[u8], padded: bool) -> HsmResult<Self> {
        Ok(Self {
            mode: BlockMode::new(direction, key, iv)?,
            direction,
            padded,
            pending: Vec::with_capacity(AES_BLOCK_LEN),
        })
    }

    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);
        let ready = if self.direction == Direction::Decrypt && self.padded {
            self.pending.len().saturating_sub(1) / AES_BLOCK_LEN * AES_BLOCK_LEN
        } else {
            self.pending.len() / AES_BLOCK_LEN * AES_BLOCK_LEN
        };
        let mut out: Vec<u8> = self.pending.drain(..ready).collect();
        self.mode.apply(&mut out);
        out
    }

    pub fn finish(mut self) -> HsmResult<Vec<u8>> {
        match (self.direction, self.padded) {
            (Direction::Encrypt, true) => {
                let pos = self.pending.len();
                let mut block = GenericArray::<u8, U16>::default();
                block[..pos].copy_from_slice(&self.pending);
                <Pkcs7 as Padding<U16>>::pad(&mut block, pos);
                self.mode.apply(&mut block);
                Ok(block.to_vec())
            }
            (Direction::Decrypt, true) => {
                if self.pending.len() != AES_BLOCK_LEN {
                    return Err(HsmError::EncryptedDataLenRange);
                }
                self.mode.apply(&mut self.pending);
                let block = GenericArray::<u8, U16>::from_slice(&self.pending);
                <Pkcs7 as Padding<U16>>::unpad(block)
                    .map(<[u8]>::to_vec)
                    .map_err(|_| HsmError::EncryptedDataInvalid)
            }
            (Direction::Encrypt, false) if !self.pending.is_empty() => Err(HsmError::DataLenRange),
            (Direction::Decrypt, false) if !self.pending.is_empty() => {
                Err(HsmError::EncryptedDataLenRange)
            }
            (_, false) => Ok(Vec::new()),
        }
    }

    /// Single-part convenience used by wrap and unwrap.
    pub fn oneshot(
        direction: Direction,
        key: &[u8],
        iv: &[u8],
        padded: bool,
        data: &[u8],
    ) -> HsmResult<Vec<u8>> {
        let mut stream = Self::new(direction, key, iv, padded)?;
        let mut out = stream.update(data);
        out.extend(stream.finish()?);
        Ok(out)
    }
}

/// Streaming SHA-256.
#[derive(Clone, Default)]
pub struct DigestStream(Sha256);

impl DigestStream {
    pub fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    pub fn finish(self) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

/// Streaming HMAC-SHA256.
#[derive(Clone)]
pub struct MacStream(HmacSha256);

impl MacStream {
    pub fn new(key: &[u8]) -> HsmResult<Self> {
        <HmacSha256 as Mac>::new_from_slice(key)
            .map(Self)
            .map_err(HsmError::crypto)
    }

    pub fn update(&mut self, data: &[u8]) {
        Mac::update(&mut self.0, data);
    }

    pub fn finish(self) -> Vec<u8> {
        self.0.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0x2b; 16];
    const IV: [u8; 16] = [0u8; 16];

    #[test]
    fn padded_roundtrip_across_chunks() {
        let plaintext: Vec<u8> = (0u8..37).collect();
        let mut enc = CbcStream::new(Direction::Encrypt, &KEY, &IV, true).unwrap();
        let mut ciphertext = enc.update(&plaintext[..5]);
        ciphertext.extend(enc.update(&plaintext[5..]));
        ciphertext.extend(enc.finish().unwrap());
        assert_eq!(ciphertext.len(), 48);

        let mut dec = CbcStream::new(Direction::Decrypt, &KEY, &IV, true).unwrap();
        let mut recovered = Vec::new();
        for chunk in ciphertext.chunks(7) {
            recovered.extend(dec.update(chunk));
        }
        recovered.extend(dec.finish().unwrap());
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn streaming_matches_oneshot() {
        let data = [7u8; 64];
        let oneshot = CbcStream::oneshot(Direction::Encrypt, &KEY, &IV, false, &data).unwrap();
        let mut stream = CbcStream::new(Direction::Encrypt, &KEY, &IV, false).unwrap();
        let mut streamed = stream.update(&data[..20]);
        streamed.extend(stream.update(&data[20..]));
        streamed.extend(stream.finish().unwrap());
        assert_eq!(streamed, oneshot);
    }

    #[test]
    fn unpadded_requires_block_multiple() {
        let err = CbcStream::oneshot(Direction::Encrypt, &KEY, &IV, false, &[1u8; 17]).unwrap_err();
        assert_eq!(err, HsmError::DataLenRange);
    }

    #[test]
    fn corrupted_padding_is_rejected() {
        let plaintext = [0x41u8; 37];
        let mut ciphertext =
            CbcStream::oneshot(Direction::Encrypt, &KEY, &IV, true, &plaintext).unwrap();
        // flips the final pad byte from 0x0b to 0x0a
        ciphertext[31] ^= 0x01;
        let err = CbcStream::oneshot(Direction::Decrypt, &KEY, &IV, true, &ciphertext).unwrap_err();
        assert_eq!(err, HsmError::EncryptedDataInvalid);
    }

    #[test]
    fn iv_and_key_lengths_are_checked() {
        assert!(matches!(
            CbcStream::new(Direction::Encrypt, &KEY, &[0u8; 8], true),
            Err(HsmError::MechanismParamInvalid(_))
        ));
        assert!(matches!(
            CbcStream::new(Direction::Encrypt, &[0u8; 20], &IV, true),
            Err(HsmError::KeySizeRange(20))
        ));
    }

    #[test]
    fn digest_and_mac_lengths() {
        let mut digest = DigestStream::default();
        digest.update(b"abc");
        assert_eq!(digest.finish().len(), SHA256_LEN);

        let mut mac = MacStream::new(&KEY).unwrap();
        mac.update(b"abc");
        assert_eq!(mac.finish().len(), SHA256_LEN);
    }
}
