//! AEAD chunked framing
//!
//! ```text
//! [salt][len(2) sealed][len tag][payload sealed][payload tag]...
//! ```
//!
//! Each direction starts with a random salt sent in clear. The direction's
//! subkey is HKDF-SHA1(master key, salt) and every seal or open advances a
//! 12 byte little-endian nonce counter by one, so a chunk consumes two
//! nonces: N for the length field and N+1 for the payload.

use super::kdf::{derive_subkey, increment_nonce};
use super::{poll_read_full, random_iv, write_error, Cryptor, PendingWrite};
use crate::{Error, Result};
use aead::consts::U12;
use aead::generic_array::GenericArray;
use aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use bytes::{BufMut, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use std::io;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

type Aes192Gcm = AesGcm<aes::Aes192, U12>;

/// Largest payload carried by one chunk
pub const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

/// Authentication tag appended to every sealed field
pub const TAG_SIZE: usize = 16;

pub const NONCE_SIZE: usize = 12;

/// Staging capacity, enough for the largest chunk
const BUF_SIZE: usize = 17 * 1024;

const LENGTH_FIELD_SIZE: usize = 2 + TAG_SIZE;

/// AEAD cipher kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl AeadKind {
    pub const ALL: [AeadKind; 4] = [
        AeadKind::Aes128Gcm,
        AeadKind::Aes192Gcm,
        AeadKind::Aes256Gcm,
        AeadKind::ChaCha20Poly1305,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AeadKind::Aes128Gcm => "aes-128-gcm",
            AeadKind::Aes192Gcm => "aes-192-gcm",
            AeadKind::Aes256Gcm => "aes-256-gcm",
            AeadKind::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
        }
    }

    pub fn key_size(&self) -> usize {
        match self {
            AeadKind::Aes128Gcm => 16,
            AeadKind::Aes192Gcm => 24,
            AeadKind::Aes256Gcm => 32,
            AeadKind::ChaCha20Poly1305 => 32,
        }
    }

    pub fn salt_size(&self) -> usize {
        self.key_size()
    }
}

/// Keyed AEAD primitive for one direction
enum AeadCipher {
    Aes128Gcm(Aes128Gcm),
    Aes192Gcm(Aes192Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl AeadCipher {
    fn new(kind: AeadKind, subkey: &[u8]) -> Result<Self> {
        let bad_key = |_| Error::crypto(format!("invalid {} key length", kind.name()));
        Ok(match kind {
            AeadKind::Aes128Gcm => AeadCipher::Aes128Gcm(Aes128Gcm::new_from_slice(subkey).map_err(bad_key)?),
            AeadKind::Aes192Gcm => AeadCipher::Aes192Gcm(Aes192Gcm::new_from_slice(subkey).map_err(bad_key)?),
            AeadKind::Aes256Gcm => AeadCipher::Aes256Gcm(Aes256Gcm::new_from_slice(subkey).map_err(bad_key)?),
            AeadKind::ChaCha20Poly1305 => {
                AeadCipher::ChaCha20Poly1305(ChaCha20Poly1305::new_from_slice(subkey).map_err(bad_key)?)
            }
        })
    }

    /// Encrypt `buf` in place and return its tag
    fn seal(&self, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) -> Result<[u8; TAG_SIZE]> {
        match self {
            AeadCipher::Aes128Gcm(c) => seal_with(c, nonce, buf),
            AeadCipher::Aes192Gcm(c) => seal_with(c, nonce, buf),
            AeadCipher::Aes256Gcm(c) => seal_with(c, nonce, buf),
            AeadCipher::ChaCha20Poly1305(c) => seal_with(c, nonce, buf),
        }
    }

    /// Verify `tag` and decrypt `buf` in place
    fn open(&self, nonce: &[u8; NONCE_SIZE], buf: &mut [u8], tag: &[u8]) -> Result<()> {
        match self {
            AeadCipher::Aes128Gcm(c) => open_with(c, nonce, buf, tag),
            AeadCipher::Aes192Gcm(c) => open_with(c, nonce, buf, tag),
            AeadCipher::Aes256Gcm(c) => open_with(c, nonce, buf, tag),
            AeadCipher::ChaCha20Poly1305(c) => open_with(c, nonce, buf, tag),
        }
    }
}

fn seal_with<A>(cipher: &A, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) -> Result<[u8; TAG_SIZE]>
where
    A: AeadInPlace<NonceSize = U12>,
{
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], buf)
        .map_err(|_| Error::crypto("seal failed"))?;
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(&tag);
    Ok(out)
}

fn open_with<A>(cipher: &A, nonce: &[u8; NONCE_SIZE], buf: &mut [u8], tag: &[u8]) -> Result<()>
where
    A: AeadInPlace<NonceSize = U12>,
{
    if tag.len() != TAG_SIZE {
        return Err(Error::decrypt("truncated tag"));
    }
    cipher
        .decrypt_in_place_detached(GenericArray::from_slice(nonce), &[], buf, GenericArray::from_slice(tag))
        .map_err(|_| Error::decrypt("authentication tag mismatch"))
}

/// Direction state: keyed once the salt is known
enum DirectionState {
    Uninitialized,
    Established {
        cipher: AeadCipher,
        nonce: [u8; NONCE_SIZE],
    },
}

impl DirectionState {
    fn establish(kind: AeadKind, master_key: &[u8], salt: &[u8]) -> Result<Self> {
        let subkey = derive_subkey(master_key, salt)?;
        Ok(DirectionState::Established {
            cipher: AeadCipher::new(kind, &subkey)?,
            nonce: [0u8; NONCE_SIZE],
        })
    }
}

/// What the decrypting side reads next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Salt,
    Length,
    Payload(usize),
    /// A previous read failed; the stream cannot be resynchronised
    Failed,
}

/// AEAD cryptor for one connection
pub struct AeadCryptor {
    kind: AeadKind,
    key: std::sync::Arc<[u8]>,

    enc: DirectionState,
    pending: PendingWrite,

    dec: DirectionState,
    phase: ReadPhase,
    /// Ciphertext of the field being read
    buf: Box<[u8]>,
    filled: usize,
    /// Opened payload not yet handed to the reader
    plain: BytesMut,
}

impl AeadCryptor {
    pub fn new(kind: AeadKind, key: std::sync::Arc<[u8]>) -> Result<Self> {
        if key.len() != kind.key_size() {
            return Err(Error::crypto(format!(
                "{} needs a {} byte key, got {}",
                kind.name(),
                kind.key_size(),
                key.len()
            )));
        }
        Ok(AeadCryptor {
            kind,
            key,
            enc: DirectionState::Uninitialized,
            pending: PendingWrite::default(),
            dec: DirectionState::Uninitialized,
            phase: ReadPhase::Salt,
            buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            filled: 0,
            plain: BytesMut::with_capacity(MAX_PAYLOAD_SIZE),
        })
    }

    pub fn kind(&self) -> AeadKind {
        self.kind
    }

    /// Frame `data` into the pending buffer, prefixed by the salt on first use
    fn encode(&mut self, data: &[u8]) -> Result<()> {
        let out = self.pending.buffer();

        if let DirectionState::Uninitialized = self.enc {
            let salt = random_iv(self.kind.salt_size());
            self.enc = DirectionState::establish(self.kind, &self.key, &salt)?;
            out.put_slice(&salt);
        }

        let DirectionState::Established { cipher, nonce } = &mut self.enc else {
            return Err(Error::crypto("encryption state not established"));
        };

        for piece in data.chunks(MAX_PAYLOAD_SIZE) {
            out.reserve(LENGTH_FIELD_SIZE + piece.len() + TAG_SIZE);

            let start = out.len();
            out.put_slice(&(piece.len() as u16).to_be_bytes());
            let tag = cipher.seal(nonce, &mut out[start..start + 2])?;
            increment_nonce(nonce);
            out.put_slice(&tag);

            let start = out.len();
            out.put_slice(piece);
            let tag = cipher.seal(nonce, &mut out[start..])?;
            increment_nonce(nonce);
            out.put_slice(&tag);
        }

        Ok(())
    }

    fn fail(&mut self, e: Error) -> io::Error {
        self.phase = ReadPhase::Failed;
        e.into()
    }

    fn fail_io(&mut self, e: io::Error, op: &'static str) -> io::Error {
        self.fail(Error::from(e).context(op))
    }

    /// Open the field staged at `buf[..len]` whose tag follows it
    fn open_staged(&mut self, len: usize, op: &'static str) -> Result<()> {
        let DirectionState::Established { cipher, nonce } = &mut self.dec else {
            return Err(Error::crypto("decryption state not established"));
        };
        let (body, rest) = self.buf.split_at_mut(len);
        cipher
            .open(nonce, body, &rest[..TAG_SIZE])
            .map_err(|_| Error::decrypt(op))?;
        increment_nonce(nonce);
        Ok(())
    }
}

impl Cryptor for AeadCryptor {
    fn poll_decrypt_from(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut (dyn AsyncRead + Unpin),
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.plain.is_empty() {
                let n = buf.remaining().min(self.plain.len());
                buf.put_slice(&self.plain.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            match self.phase {
                ReadPhase::Failed => {
                    return Poll::Ready(Err(Error::decrypt("stream already failed").into()));
                }
                ReadPhase::Salt => {
                    let salt_size = self.kind.salt_size();
                    let complete = match ready!(poll_read_full(cx, reader, &mut self.buf[..salt_size], &mut self.filled)) {
                        Ok(complete) => complete,
                        Err(e) => return Poll::Ready(Err(self.fail_io(e, "read salt"))),
                    };
                    if !complete {
                        return Poll::Ready(Ok(()));
                    }
                    match DirectionState::establish(self.kind, &self.key, &self.buf[..salt_size]) {
                        Ok(state) => self.dec = state,
                        Err(e) => return Poll::Ready(Err(self.fail(e))),
                    }
                    trace!(cipher = self.kind.name(), "salt received");
                    self.filled = 0;
                    self.phase = ReadPhase::Length;
                }
                ReadPhase::Length => {
                    let complete = match ready!(poll_read_full(
                        cx,
                        reader,
                        &mut self.buf[..LENGTH_FIELD_SIZE],
                        &mut self.filled
                    )) {
                        Ok(complete) => complete,
                        Err(e) => return Poll::Ready(Err(self.fail_io(e, "read payload size"))),
                    };
                    if !complete {
                        return Poll::Ready(Ok(()));
                    }
                    if let Err(e) = self.open_staged(2, "open payload size") {
                        return Poll::Ready(Err(self.fail(e)));
                    }
                    let size = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize & MAX_PAYLOAD_SIZE;
                    if size + TAG_SIZE > self.buf.len() {
                        let e = Error::BufferTooSmall {
                            needed: size + TAG_SIZE,
                            capacity: self.buf.len(),
                        };
                        return Poll::Ready(Err(self.fail(e)));
                    }
                    self.filled = 0;
                    self.phase = ReadPhase::Payload(size);
                }
                ReadPhase::Payload(size) => {
                    let complete = match ready!(poll_read_full(
                        cx,
                        reader,
                        &mut self.buf[..size + TAG_SIZE],
                        &mut self.filled
                    )) {
                        Ok(complete) => complete,
                        Err(e) => return Poll::Ready(Err(self.fail_io(e, "read payload"))),
                    };
                    if !complete {
                        let e = io::Error::from(io::ErrorKind::UnexpectedEof);
                        return Poll::Ready(Err(self.fail_io(e, "read payload")));
                    }
                    if let Err(e) = self.open_staged(size, "open payload") {
                        return Poll::Ready(Err(self.fail(e)));
                    }
                    trace!(cipher = self.kind.name(), size, "chunk decrypted");
                    self.filled = 0;
                    self.plain.put_slice(&self.buf[..size]);
                    self.phase = ReadPhase::Length;
                }
            }
        }
    }

    fn poll_encrypt_to(
        &mut self,
        cx: &mut Context<'_>,
        writer: &mut (dyn AsyncWrite + Unpin),
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(self.pending.poll_drain(cx, writer)).map_err(write_error)?;
        self.encode(data)?;
        self.pending.poll_accepted(cx, writer, data.len())
    }

    fn poll_flush_to(&mut self, cx: &mut Context<'_>, writer: &mut (dyn AsyncWrite + Unpin)) -> Poll<io::Result<()>> {
        self.pending.poll_drain(cx, writer).map_err(write_error)
    }

    fn key_size(&self) -> usize {
        self.kind.key_size()
    }

    fn iv_size(&self) -> usize {
        self.kind.salt_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::evp_bytes_to_key;
    use crate::crypto::{decrypt_from, encrypt_to};
    use std::collections::HashSet;
    use std::pin::Pin;
    use std::sync::Arc;

    fn cryptor(kind: AeadKind) -> AeadCryptor {
        let key: Arc<[u8]> = evp_bytes_to_key(b"test-password", kind.key_size()).into();
        AeadCryptor::new(kind, key).unwrap()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn seal_all(kind: AeadKind, data: &[u8]) -> Vec<u8> {
        let mut enc = cryptor(kind);
        let mut wire = Vec::new();
        let n = encrypt_to(&mut enc, &mut wire, data).await.unwrap();
        assert_eq!(n, data.len());
        wire
    }

    async fn open_all(kind: AeadKind, wire: &[u8], read_size: usize) -> io::Result<Vec<u8>> {
        let mut dec = cryptor(kind);
        let mut reader = wire;
        let mut out = Vec::new();
        let mut buf = vec![0u8; read_size];
        loop {
            let n = decrypt_from(&mut dec, &mut reader, &mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_round_trip_all_suites() {
        for kind in AeadKind::ALL {
            for len in [0, 1, 2, 100, MAX_PAYLOAD_SIZE - 1, MAX_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE + 1, 40_000] {
                let data = sample(len);
                let wire = seal_all(kind, &data).await;
                assert_eq!(open_all(kind, &wire, 4096).await.unwrap(), data, "{:?} len {}", kind, len);
            }
        }
    }

    #[tokio::test]
    async fn test_chunk_layout() {
        let kind = AeadKind::Aes128Gcm;
        let data = sample(MAX_PAYLOAD_SIZE + 10);
        let wire = seal_all(kind, &data).await;
        let expected = kind.salt_size()
            + (LENGTH_FIELD_SIZE + MAX_PAYLOAD_SIZE + TAG_SIZE)
            + (LENGTH_FIELD_SIZE + 10 + TAG_SIZE);
        assert_eq!(wire.len(), expected);
    }

    #[tokio::test]
    async fn test_single_byte_reads() {
        for kind in AeadKind::ALL {
            let data = sample(MAX_PAYLOAD_SIZE * 2 + 7);
            let wire = seal_all(kind, &data).await;
            assert_eq!(open_all(kind, &wire, 1).await.unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_many_writes_then_odd_reads() {
        let kind = AeadKind::ChaCha20Poly1305;
        let mut enc = cryptor(kind);
        let mut wire = Vec::new();
        let mut expected = Vec::new();
        for i in 0..50 {
            let piece = sample(i * 13);
            encrypt_to(&mut enc, &mut wire, &piece).await.unwrap();
            expected.extend_from_slice(&piece);
        }
        assert_eq!(open_all(kind, &wire, 7).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_nonces_never_repeat() {
        let mut enc = cryptor(AeadKind::Aes256Gcm);
        let mut wire = Vec::new();
        let mut seen = HashSet::new();
        let mut last = None;
        for i in 0..300u32 {
            encrypt_to(&mut enc, &mut wire, b"x").await.unwrap();
            let DirectionState::Established { nonce, .. } = &enc.enc else {
                panic!("encryption not established");
            };
            // Two seals per chunk
            let mut expected = [0u8; NONCE_SIZE];
            expected[..4].copy_from_slice(&((i + 1) * 2).to_le_bytes());
            assert_eq!(*nonce, expected);
            assert!(seen.insert(*nonce));
            last = Some(*nonce);
        }
        assert_eq!(seen.len(), 300);

        // Decrypting side walks the same sequence independently
        let mut dec = cryptor(AeadKind::Aes256Gcm);
        let mut reader = &wire[..];
        let mut buf = [0u8; 1];
        for _ in 0..300 {
            assert_eq!(decrypt_from(&mut dec, &mut reader, &mut buf).await.unwrap(), 1);
        }
        let DirectionState::Established { nonce, .. } = &dec.dec else {
            panic!("decryption not established");
        };
        assert_eq!(Some(*nonce), last);
    }

    #[tokio::test]
    async fn test_bit_flips_fail_every_suite() {
        for kind in AeadKind::ALL {
            let wire = seal_all(kind, b"attack at dawn").await;
            for byte in kind.salt_size()..wire.len() {
                for bit in 0..8 {
                    let mut tampered = wire.clone();
                    tampered[byte] ^= 1 << bit;
                    let err = open_all(kind, &tampered, 64).await.unwrap_err();
                    assert_eq!(err.kind(), io::ErrorKind::InvalidData, "{:?} byte {}", kind, byte);
                    assert!(matches!(Error::from(err), Error::Decrypt(_)));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_failure_is_sticky() {
        let kind = AeadKind::Aes128Gcm;
        let mut wire = seal_all(kind, b"hello").await;
        let last = wire.len() - 1;
        wire[last] ^= 0x80;

        let mut dec = cryptor(kind);
        let mut reader = &wire[..];
        let mut buf = [0u8; 16];
        assert!(decrypt_from(&mut dec, &mut reader, &mut buf).await.is_err());
        assert!(decrypt_from(&mut dec, &mut reader, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let kind = AeadKind::Aes256Gcm;
        let wire = seal_all(kind, b"hello world").await;

        // Short salt
        let err = open_all(kind, &wire[..kind.salt_size() - 1], 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        // Length field cut short
        let err = open_all(kind, &wire[..kind.salt_size() + 5], 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        // Payload missing entirely after a valid length
        let err = open_all(kind, &wire[..kind.salt_size() + LENGTH_FIELD_SIZE], 16)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_empty_stream_is_eof() {
        assert!(open_all(AeadKind::Aes128Gcm, &[], 16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_write_sends_salt() {
        let wire = seal_all(AeadKind::Aes192Gcm, &[]).await;
        assert_eq!(wire.len(), 24);
    }

    #[test]
    fn test_wrong_key_length() {
        assert!(AeadCryptor::new(AeadKind::Aes256Gcm, vec![0u8; 16].into()).is_err());
    }

    /// Writer that alternates between `Pending` and short writes
    struct Trickle {
        out: Vec<u8>,
        stall: bool,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.stall = !self.stall;
            if self.stall {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            let n = buf.len().min(3);
            self.out.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_partial_writes_resume() {
        let kind = AeadKind::Aes128Gcm;
        let mut enc = cryptor(kind);
        let mut writer = Trickle { out: Vec::new(), stall: false };
        let data = sample(1000);
        assert_eq!(encrypt_to(&mut enc, &mut writer, &data).await.unwrap(), 1000);
        assert_eq!(encrypt_to(&mut enc, &mut writer, b"tail").await.unwrap(), 4);

        let mut expected = data.clone();
        expected.extend_from_slice(b"tail");
        assert_eq!(open_all(kind, &writer.out, 100).await.unwrap(), expected);
    }
}
