//! Legacy stream cipher framing: `[iv][CFB keystream XOR plaintext]`
//!
//! No chunking and no integrity. A flipped ciphertext bit silently corrupts
//! the plaintext; peers depend on this exact layout so it stays as is.

use super::{poll_read_full, random_iv, write_error, Cryptor, PendingWrite};
use crate::{Error, Result};
use aes::{Aes128, Aes192, Aes256};
use bytes::BufMut;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

pub const IV_SIZE: usize = 16;

/// Stream cipher kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Aes128Cfb, StreamKind::Aes192Cfb, StreamKind::Aes256Cfb];

    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Aes128Cfb => "aes-128-cfb",
            StreamKind::Aes192Cfb => "aes-192-cfb",
            StreamKind::Aes256Cfb => "aes-256-cfb",
        }
    }

    pub fn key_size(&self) -> usize {
        match self {
            StreamKind::Aes128Cfb => 16,
            StreamKind::Aes192Cfb => 24,
            StreamKind::Aes256Cfb => 32,
        }
    }

    pub fn iv_size(&self) -> usize {
        IV_SIZE
    }
}

enum Encryptor {
    Aes128(BufEncryptor<Aes128>),
    Aes192(BufEncryptor<Aes192>),
    Aes256(BufEncryptor<Aes256>),
}

impl Encryptor {
    fn new(kind: StreamKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        let bad = |_| Error::crypto(format!("invalid {} key or iv length", kind.name()));
        Ok(match kind {
            StreamKind::Aes128Cfb => Encryptor::Aes128(BufEncryptor::new_from_slices(key, iv).map_err(bad)?),
            StreamKind::Aes192Cfb => Encryptor::Aes192(BufEncryptor::new_from_slices(key, iv).map_err(bad)?),
            StreamKind::Aes256Cfb => Encryptor::Aes256(BufEncryptor::new_from_slices(key, iv).map_err(bad)?),
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Encryptor::Aes128(c) => c.encrypt(data),
            Encryptor::Aes192(c) => c.encrypt(data),
            Encryptor::Aes256(c) => c.encrypt(data),
        }
    }
}

enum Decryptor {
    Aes128(BufDecryptor<Aes128>),
    Aes192(BufDecryptor<Aes192>),
    Aes256(BufDecryptor<Aes256>),
}

impl Decryptor {
    fn new(kind: StreamKind, key: &[u8], iv: &[u8]) -> Result<Self> {
        let bad = |_| Error::crypto(format!("invalid {} key or iv length", kind.name()));
        Ok(match kind {
            StreamKind::Aes128Cfb => Decryptor::Aes128(BufDecryptor::new_from_slices(key, iv).map_err(bad)?),
            StreamKind::Aes192Cfb => Decryptor::Aes192(BufDecryptor::new_from_slices(key, iv).map_err(bad)?),
            StreamKind::Aes256Cfb => Decryptor::Aes256(BufDecryptor::new_from_slices(key, iv).map_err(bad)?),
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Decryptor::Aes128(c) => c.decrypt(data),
            Decryptor::Aes192(c) => c.decrypt(data),
            Decryptor::Aes256(c) => c.decrypt(data),
        }
    }
}

enum EncryptState {
    Uninitialized,
    Established(Encryptor),
}

enum DecryptState {
    /// Collecting the peer's IV
    Uninitialized { iv: [u8; IV_SIZE], filled: usize },
    Established(Decryptor),
}

/// CFB stream cryptor for one connection. The direction key is the master
/// key itself; only the IV varies the keystream.
pub struct StreamCryptor {
    kind: StreamKind,
    key: Arc<[u8]>,
    enc: EncryptState,
    pending: PendingWrite,
    dec: DecryptState,
}

impl StreamCryptor {
    pub fn new(kind: StreamKind, key: Arc<[u8]>) -> Result<Self> {
        if key.len() != kind.key_size() {
            return Err(Error::crypto(format!(
                "{} needs a {} byte key, got {}",
                kind.name(),
                kind.key_size(),
                key.len()
            )));
        }
        Ok(StreamCryptor {
            kind,
            key,
            enc: EncryptState::Uninitialized,
            pending: PendingWrite::default(),
            dec: DecryptState::Uninitialized {
                iv: [0u8; IV_SIZE],
                filled: 0,
            },
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    fn encode(&mut self, data: &[u8]) -> Result<()> {
        let out = self.pending.buffer();

        if let EncryptState::Uninitialized = self.enc {
            let iv = random_iv(IV_SIZE);
            self.enc = EncryptState::Established(Encryptor::new(self.kind, &self.key, &iv)?);
            out.put_slice(&iv);
        }

        let EncryptState::Established(cipher) = &mut self.enc else {
            return Err(Error::crypto("encryption state not established"));
        };

        let start = out.len();
        out.put_slice(data);
        cipher.apply(&mut out[start..]);
        Ok(())
    }
}

impl Cryptor for StreamCryptor {
    fn poll_decrypt_from(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut (dyn AsyncRead + Unpin),
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let DecryptState::Uninitialized { iv, filled } = &mut self.dec {
            let complete = ready!(poll_read_full(cx, reader, iv, filled))
                .map_err(|e| io::Error::from(Error::from(e).context("read iv")))?;
            if !complete {
                return Poll::Ready(Ok(()));
            }
            let cipher = Decryptor::new(self.kind, &self.key, iv.as_slice())?;
            trace!(cipher = self.kind.name(), "iv received");
            self.dec = DecryptState::Established(cipher);
        }

        let DecryptState::Established(cipher) = &mut self.dec else {
            return Poll::Ready(Err(Error::crypto("decryption state not established").into()));
        };

        let before = buf.filled().len();
        ready!(Pin::new(&mut *reader).poll_read(cx, buf))
            .map_err(|e| io::Error::from(Error::from(e).context("read ciphertext")))?;
        cipher.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
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
        self.kind.iv_size()
    }
}
