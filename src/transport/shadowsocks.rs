//! Encrypted Shadowsocks stream
//!
//! Wraps any byte stream with a [`Cryptor`]: reads decrypt from the inner
//! stream, writes encrypt to it. Handshakes and relaying then treat the
//! wrapper like a plain connection.

use crate::crypto::Cryptor;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct ShadowsocksStream<S> {
    inner: S,
    cryptor: Box<dyn Cryptor>,
}

impl<S> ShadowsocksStream<S> {
    pub fn new(inner: S, cryptor: Box<dyn Cryptor>) -> Self {
        ShadowsocksStream { inner, cryptor }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn key_size(&self) -> usize {
        self.cryptor.key_size()
    }

    pub fn iv_size(&self) -> usize {
        self.cryptor.iv_size()
    }
}

impl<S> fmt::Debug for ShadowsocksStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowsocksStream")
            .field("key_size", &self.cryptor.key_size())
            .field("iv_size", &self.cryptor.iv_size())
            .finish()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ShadowsocksStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.cryptor.poll_decrypt_from(cx, &mut this.inner, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ShadowsocksStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.cryptor.poll_encrypt_to(cx, &mut this.inner, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.cryptor.poll_flush_to(cx, &mut this.inner))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.cryptor.poll_flush_to(cx, &mut this.inner))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
