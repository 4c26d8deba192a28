use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>>;

/// Default sink a unit writes to when no stdout log file can be used
#[derive(Clone, derive_more::From)]
pub enum UnitStdio {
    Out(UnitStdOut),
    Err(UnitStdErr),
}

impl UnitStdio {
    pub fn inner(&self) -> SharedWriter {
        match self {
            UnitStdio::Out(out) => out.inner(),
            UnitStdio::Err(err) => err.inner(),
        }
    }
}

pub struct UnitStdOut(SharedWriter);

impl Clone for UnitStdOut {
    fn clone(&self) -> Self {
        UnitStdOut(self.0.clone())
    }
}

impl UnitStdOut {
    pub fn new(t: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> UnitStdOut {
        UnitStdOut(Arc::new(Mutex::new(t)))
    }

    /// Sink bound to the stdout of the current process
    pub fn stdout() -> UnitStdOut {
        UnitStdOut::new(Box::new(tokio::io::stdout()))
    }

    pub fn inner(&self) -> SharedWriter {
        self.0.clone()
    }
}

pub struct UnitStdErr(SharedWriter);

impl Clone for UnitStdErr {
    fn clone(&self) -> Self {
        UnitStdErr(self.0.clone())
    }
}

impl UnitStdErr {
    pub fn new(t: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> UnitStdErr {
        UnitStdErr(Arc::new(Mutex::new(t)))
    }

    /// Sink bound to the stderr of the current process
    pub fn stderr() -> UnitStdErr {
        UnitStdErr::new(Box::new(tokio::io::stderr()))
    }

    pub fn inner(&self) -> SharedWriter {
        self.0.clone()
    }
}

/// In-memory sink that keeps everything written to it.
///
/// Clones share one buffer, so a clone handed to a unit can be inspected later.
#[derive(Clone, Default)]
pub struct MemorySink(Arc<StdMutex<Vec<u8>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, decoded lossily
    pub fn contents(&self) -> String {
        match self.0.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }

    pub fn stdout(&self) -> UnitStdOut {
        UnitStdOut::new(Box::new(self.clone()))
    }

    pub fn stderr(&self) -> UnitStdErr {
        UnitStdErr::new(Box::new(self.clone()))
    }
}

impl AsyncWrite for MemorySink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.0.lock() {
            Ok(mut inner) => inner.extend_from_slice(buf),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(buf),
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Splits raw child output into valid UTF-8 chunks without cutting a code point in half
struct Utf8Codec;

impl Decoder for Utf8Codec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match std::str::from_utf8(src) {
            Ok(s) => {
                let out = s.to_owned();
                src.clear();
                Ok(Some(out))
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete code point at the end, keep it for the next read
                let valid = e.valid_up_to();

                if valid == 0 {
                    return Ok(None);
                }

                let out = String::from_utf8_lossy(&src[..valid]).into_owned();
                src.advance(valid);
                Ok(Some(out))
            }
            Err(_) => {
                // Not text at all, forward it lossily instead of stopping the pipe
                let out = String::from_utf8_lossy(src).into_owned();
                src.clear();
                Ok(Some(out))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let out = String::from_utf8_lossy(src).into_owned();
                src.clear();
                Ok(Some(out))
            }
        }
    }
}

/// Forward everything read from `io` into `out` until end of stream
pub async fn stream<A: AsyncRead + Unpin>(
    io: &mut A,
    out: impl Into<UnitStdio>,
) -> tokio::io::Result<()> {
    let mut frames = FramedRead::with_capacity(io, Utf8Codec, 1024);
    stream_frames(&mut frames, out.into()).await
}

async fn stream_frames<R: AsyncRead + Unpin>(
    frames: &mut FramedRead<R, Utf8Codec>,
    out: UnitStdio,
) -> tokio::io::Result<()> {
    let writer = out.inner();
    while let Some(frame) = frames.next().await {
        let text = frame?;
        let mut lock = writer.lock().await;
        lock.write_all(text.as_bytes()).await?;
        lock.flush().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_forwards_everything() {
        let capture = MemorySink::new();

        let mut input: &[u8] = b"first line\nsecond line\n";
        stream(&mut input, capture.stdout()).await.unwrap();

        assert_eq!(capture.contents(), "first line\nsecond line\n");
    }

    #[tokio::test]
    async fn test_stream_keeps_split_code_points_intact() {
        let capture = MemorySink::new();

        // "é" is two bytes, the reader hands them over one read at a time
        let (client, mut server) = tokio::io::duplex(1);
        let writer = tokio::spawn(async move {
            let mut client = client;
            client.write_all("caf\u{e9}\n".as_bytes()).await.unwrap();
        });

        stream(&mut server, capture.stderr()).await.unwrap();
        writer.await.unwrap();

        assert_eq!(capture.contents(), "caf\u{e9}\n");
    }

    #[tokio::test]
    async fn test_invalid_bytes_are_forwarded_lossily() {
        let capture = MemorySink::new();

        let mut input: &[u8] = b"ok \xff\xfe end\n";
        stream(&mut input, capture.stdout()).await.unwrap();

        assert_eq!(capture.contents(), "ok \u{fffd}\u{fffd} end\n");
    }

    #[tokio::test]
    async fn test_memory_sink_clones_share_buffer() {
        let sink = MemorySink::new();
        let out = sink.stdout();
        let err = sink.stderr();

        out.inner().lock().await.write_all(b"a").await.unwrap();
        err.inner().lock().await.write_all(b"b").await.unwrap();

        assert_eq!(sink.contents(), "ab");
    }
}
