//! Repository encryption.
//!
//! AES-256-GCM in a chunked stream framing: a 16-byte random salt leads the
//! stream, then frames of `[u32 ciphertext length][ciphertext + tag]`. Each
//! frame seals up to 64 KiB of plaintext under a nonce derived from the
//! frame counter, so files of any size stream through without buffering.
//! Keys are derived from the repository passphrase with PBKDF2-HMAC-SHA-256.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use pgvault_common::{Error, Result};
use rand::RngCore;
use sha2::Sha256;
use std::io::{self, Read, Write};

const SALT_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const FRAME_PLAIN_MAX: usize = 64 * 1024;
const KDF_ITERATIONS: u32 = 100_000;

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, KDF_ITERATIONS, &mut key);
    key
}

fn frame_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Encrypting writer. [`CipherWriter::finish`] seals the final partial frame
/// and returns the inner writer.
pub struct CipherWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    counter: u64,
    buffer: Vec<u8>,
    salt_written: bool,
    salt: [u8; SALT_SIZE],
}

impl<W: Write> CipherWriter<W> {
    pub fn new(inner: W, passphrase: &str) -> Result<Self> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_salt(inner, passphrase, salt)
    }

    fn with_salt(inner: W, passphrase: &str, salt: [u8; SALT_SIZE]) -> Result<Self> {
        let key = derive_key(passphrase, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Cipher(format!("invalid key: {e}")))?;

        Ok(CipherWriter {
            inner,
            cipher,
            counter: 0,
            buffer: Vec::with_capacity(FRAME_PLAIN_MAX),
            salt_written: false,
            salt,
        })
    }

    fn seal_frame(&mut self) -> io::Result<()> {
        if !self.salt_written {
            self.inner.write_all(&self.salt)?;
            self.salt_written = true;
        }

        if self.buffer.is_empty() {
            return Ok(());
        }

        let nonce = frame_nonce(self.counter);
        self.counter += 1;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: self.buffer.as_slice(), aad: &[] })
            .map_err(|e| io::Error::other(format!("encrypt: {e}")))?;

        self.inner.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        self.inner.write_all(&ciphertext)?;
        self.buffer.clear();
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.seal_frame()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut remaining = buf;

        while !remaining.is_empty() {
            let take = (FRAME_PLAIN_MAX - self.buffer.len()).min(remaining.len());
            self.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            if self.buffer.len() == FRAME_PLAIN_MAX {
                self.seal_frame()?;
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypting reader, the inverse of [`CipherWriter`].
pub struct CipherReader<R: Read> {
    inner: R,
    cipher: Option<Aes256Gcm>,
    passphrase: String,
    counter: u64,
    plain: Vec<u8>,
    plain_pos: usize,
    done: bool,
}

impl<R: Read> CipherReader<R> {
    pub fn new(inner: R, passphrase: &str) -> Self {
        CipherReader {
            inner,
            cipher: None,
            passphrase: passphrase.to_string(),
            counter: 0,
            plain: Vec::new(),
            plain_pos: 0,
            done: false,
        }
    }

    fn init_cipher(&mut self) -> io::Result<()> {
        let mut salt = [0u8; SALT_SIZE];
        self.inner.read_exact(&mut salt)?;

        let key = derive_key(&self.passphrase, &salt);
        self.cipher = Some(
            Aes256Gcm::new_from_slice(&key)
                .map_err(|e| io::Error::other(format!("invalid key: {e}")))?,
        );
        Ok(())
    }

    fn next_frame(&mut self) -> io::Result<bool> {
        let mut length = [0u8; 4];
        match self.inner.read_exact(&mut length) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(err) => return Err(err),
        }

        let length = u32::from_be_bytes(length) as usize;
        if length < TAG_SIZE || length > FRAME_PLAIN_MAX + TAG_SIZE {
            return Err(io::Error::other("corrupt cipher frame length"));
        }

        let mut ciphertext = vec![0u8; length];
        self.inner.read_exact(&mut ciphertext)?;

        let nonce = frame_nonce(self.counter);
        self.counter += 1;

        self.plain = self
            .cipher
            .as_ref()
            .unwrap()
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext.as_slice(), aad: &[] })
            .map_err(|_| io::Error::other("decrypt failed: wrong passphrase or corrupt data"))?;
        self.plain_pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cipher.is_none() {
            self.init_cipher()?;
        }

        loop {
            if self.plain_pos < self.plain.len() {
                let take = (self.plain.len() - self.plain_pos).min(buf.len());
                buf[..take].copy_from_slice(&self.plain[self.plain_pos..self.plain_pos + take]);
                self.plain_pos += take;
                return Ok(take);
            }

            if self.done {
                return Ok(0);
            }

            if !self.next_frame()? {
                self.done = true;
                return Ok(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut writer = CipherWriter::new(Vec::new(), "secret").unwrap();
        writer.write_all(&data).unwrap();
        let encrypted = writer.finish().unwrap();

        assert_ne!(encrypted, data);
        // Salt + three frames (64k + 64k + remainder) with length and tag
        // overhead.
        assert!(encrypted.len() > data.len());

        let mut reader = CipherReader::new(&encrypted[..], "secret");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_empty_round_trip() {
        let writer = CipherWriter::new(Vec::new(), "secret").unwrap();
        let encrypted = writer.finish().unwrap();
        assert_eq!(encrypted.len(), SALT_SIZE);

        let mut reader = CipherReader::new(&encrypted[..], "secret");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let mut writer = CipherWriter::new(Vec::new(), "secret").unwrap();
        writer.write_all(b"cluster bytes").unwrap();
        let encrypted = writer.finish().unwrap();

        let mut reader = CipherReader::new(&encrypted[..], "wrong");
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_tamper_detected() {
        let mut writer = CipherWriter::new(Vec::new(), "secret").unwrap();
        writer.write_all(b"cluster bytes").unwrap();
        let mut encrypted = writer.finish().unwrap();

        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;

        let mut reader = CipherReader::new(&encrypted[..], "secret");
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_salts_differ_between_streams() {
        let writer1 = CipherWriter::new(Vec::new(), "secret").unwrap();
        let writer2 = CipherWriter::new(Vec::new(), "secret").unwrap();
        assert_ne!(writer1.finish().unwrap(), writer2.finish().unwrap());
    }
}
