//! Shadowsocks ciphers
//!
//! Every suite is exposed through the [`Cryptor`] capability: decrypt from
//! a reader, encrypt to a writer, report key and IV sizes. Each direction is
//! initialized lazily on first use with its own salt or IV.

pub mod aead;
pub mod kdf;
pub mod registry;
pub mod stream;

pub use self::aead::{AeadCryptor, AeadKind};
pub use self::kdf::{DigestCache, KeyCache, PasswordDigest};
pub use self::registry::{CipherRegistry, CipherSuite};
pub use self::stream::{StreamCryptor, StreamKind};

use bytes::{Buf, BytesMut};
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Symmetric cipher bound to one connection
///
/// Both methods are poll based so a cryptor can sit under `AsyncRead` /
/// `AsyncWrite` implementations. `poll_encrypt_to` follows the `poll_write`
/// contract: it returns `Pending` only while ciphertext from an earlier call
/// is still queued, and once it accepts `data` the whole of it is sealed and
/// queued. Queued ciphertext goes out on later calls or through
/// `poll_flush_to`.
pub trait Cryptor: Send {
    /// Decrypt into `buf`. Filling nothing signals end of stream.
    fn poll_decrypt_from(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut (dyn AsyncRead + Unpin),
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>>;

    /// Encrypt `data` and queue the resulting ciphertext for `writer`
    fn poll_encrypt_to(
        &mut self,
        cx: &mut Context<'_>,
        writer: &mut (dyn AsyncWrite + Unpin),
        data: &[u8],
    ) -> Poll<io::Result<usize>>;

    /// Write out any ciphertext still queued
    fn poll_flush_to(&mut self, cx: &mut Context<'_>, writer: &mut (dyn AsyncWrite + Unpin)) -> Poll<io::Result<()>>;

    fn key_size(&self) -> usize;

    fn iv_size(&self) -> usize;
}

/// Encrypt `data` to `writer` and wait until all of its ciphertext is
/// written, returning the plaintext length consumed
pub async fn encrypt_to<W>(cryptor: &mut dyn Cryptor, writer: &mut W, data: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let n = poll_fn(|cx| cryptor.poll_encrypt_to(cx, &mut *writer, data)).await?;
    poll_fn(|cx| cryptor.poll_flush_to(cx, &mut *writer)).await?;
    Ok(n)
}

/// Decrypt from `reader` into `buf`, returning the number of bytes produced
pub async fn decrypt_from<R>(cryptor: &mut dyn Cryptor, reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut read_buf = ReadBuf::new(buf);
    poll_fn(|cx| cryptor.poll_decrypt_from(cx, &mut *reader, &mut read_buf)).await?;
    Ok(read_buf.filled().len())
}

/// Ciphertext waiting to be written
#[derive(Debug, Default)]
pub(crate) struct PendingWrite {
    buf: BytesMut,
}

impl PendingWrite {
    /// Buffer to encode into
    pub(crate) fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Write out everything queued
    pub(crate) fn poll_drain(
        &mut self,
        cx: &mut Context<'_>,
        writer: &mut (dyn AsyncWrite + Unpin),
    ) -> Poll<io::Result<()>> {
        while !self.buf.is_empty() {
            let n = ready!(Pin::new(&mut *writer).poll_write(cx, &self.buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    /// Report `len` plaintext bytes accepted once their ciphertext is
    /// queued, pushing out what the writer takes right away. Ciphertext the
    /// writer cannot take yet stays queued for the next call.
    pub(crate) fn poll_accepted(
        &mut self,
        cx: &mut Context<'_>,
        writer: &mut (dyn AsyncWrite + Unpin),
        len: usize,
    ) -> Poll<io::Result<usize>> {
        match self.poll_drain(cx, writer) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(write_error(e))),
            _ => Poll::Ready(Ok(len)),
        }
    }
}

pub(crate) fn write_error(e: io::Error) -> io::Error {
    crate::Error::from(e).context("write encrypted bytes").into()
}

/// Fill `buf[*filled..]` completely from `reader`.
///
/// Returns `Ok(false)` when the reader is at EOF before any byte of `buf`
/// was read and `UnexpectedEof` when it ends part way through.
pub(crate) fn poll_read_full(
    cx: &mut Context<'_>,
    reader: &mut (dyn AsyncRead + Unpin),
    buf: &mut [u8],
    filled: &mut usize,
) -> Poll<io::Result<bool>> {
    while *filled < buf.len() {
        let mut read_buf = ReadBuf::new(&mut buf[*filled..]);
        ready!(Pin::new(&mut *reader).poll_read(cx, &mut read_buf))?;
        let n = read_buf.filled().len();
        if n == 0 {
            if *filled == 0 {
                return Poll::Ready(Ok(false));
            }
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }
        *filled += n;
    }
    Poll::Ready(Ok(true))
}

/// Random salt or IV from the thread-local CSPRNG
pub(crate) fn random_iv(len: usize) -> Vec<u8> {
    use rand::RngCore;

    let mut iv = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}
