//! NAR decompression.
//!
//! Upstream caches serve NARs compressed under a handful of schemes,
//! advertised by the narinfo `Compression` key. Decompression is done
//! in-process with streaming decoders; the decompressed bytes flow
//! straight into the store restore and are never buffered whole.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, XzDecoder, ZstdDecoder};
use tokio::io::{self, AsyncRead, BufReader, ReadBuf};

/// A compression scheme recognized on ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Xz,
    Bzip2,
    Gzip,
    Zstd,
}

impl Compression {
    /// Resolves a narinfo `Compression` tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "none" => Some(Self::None),
            "xz" => Some(Self::Xz),
            "bzip2" => Some(Self::Bzip2),
            "gzip" => Some(Self::Gzip),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Xz => "xz",
            Self::Bzip2 => "bzip2",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }
}

/// Wraps a compressed byte source with the matching streaming decoder.
pub fn decoder<R>(compression: Compression, input: R) -> Box<dyn AsyncRead + Unpin + Send>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let input = BufReader::new(input);
    match compression {
        Compression::None => Box::new(input),
        Compression::Xz => Box::new(XzDecoder::new(input)),
        Compression::Bzip2 => Box::new(BzDecoder::new(input)),
        Compression::Gzip => Box::new(GzipDecoder::new(input)),
        Compression::Zstd => Box::new(ZstdDecoder::new(input)),
    }
}

/// Rejects streams that run past an advertised size.
///
/// Reading exactly `limit` bytes followed by EOF is fine; one byte more
/// fails with `InvalidData`. This keeps a lying or broken upstream from
/// expanding into unbounded local disk during a restore.
pub struct Capped<R> {
    inner: R,
    remaining: u64,
}

impl<R> Capped<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Capped<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.remaining == 0 {
            // Probe for EOF; any further byte is an overrun.
            let mut probe = [0u8; 1];
            let mut probe_buf = ReadBuf::new(&mut probe);
            return match Pin::new(&mut this.inner).poll_read(cx, &mut probe_buf) {
                Poll::Ready(Ok(())) if probe_buf.filled().is_empty() => Poll::Ready(Ok(())),
                Poll::Ready(Ok(())) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "stream exceeds advertised NAR size",
                ))),
                other => other,
            };
        }

        let limit = std::cmp::min(this.remaining, buf.remaining() as u64) as usize;
        let mut limited = buf.take(limit);
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                // The bytes were written through `limited` into the same
                // allocation; mark them initialized in the outer buffer.
                unsafe { buf.assume_init(n) };
                buf.advance(n);
                this.remaining -= n as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
