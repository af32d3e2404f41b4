//! Sandbox capability consumed by the runner.
//!
//! Providers implement five operations: create, attach, start, wait, remove.
//! The iteration lifecycle itself (attach before start, wait on next exit,
//! teardown on every exit path) belongs to the runner, not the provider, so
//! the stream demultiplexer and stderr sink live here alongside the trait.

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Byte stream handed back by [`SandboxProvider::attach`].
pub type AttachStream = Box<dyn AsyncRead + Send + Unpin>;

/// Abstract sandbox provider. `create` returns a configured-but-not-started
/// sandbox; `wait` resolves on the sandbox's next exit, so it may be awaited
/// on a freshly created sandbox before `start`. `remove` must release the
/// sandbox and any associated resources and must be safe to call on every
/// exit path, including after failures.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self) -> Result<String>;
    async fn attach(&self, id: &str) -> Result<AttachStream>;
    async fn start(&self, id: &str) -> Result<()>;
    async fn wait(&self, id: &str) -> Result<i64>;
    async fn remove(&self, id: &str, with_volumes: bool) -> Result<()>;
}

/// Size-limited byte sink holding the newest bytes written to it. Used for
/// stderr capture during stream runs so diagnostics are available without
/// unbounded growth.
#[derive(Debug)]
pub struct BoundedBuffer {
    buf: Vec<u8>,
    cap: usize,
}

impl BoundedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap.min(4096)),
            cap,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        if data.len() >= self.cap {
            self.buf.clear();
            self.buf.extend_from_slice(&data[data.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend_from_slice(data);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_lossy_string(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// Stderr capture capacity during stream runs.
pub const STDERR_CAPTURE_BYTES: usize = 4 * 1024;

/// Stream identifiers in the multiplexed attach framing.
const STREAM_STDOUT: u8 = 1;
const STREAM_STDERR: u8 = 2;

/// Split a multiplexed attach stream into stdout and stderr.
///
/// The wire format is 8-byte frame headers — stream id, three zero bytes,
/// and a big-endian u32 payload length — followed by the payload. Stdout
/// frames are copied to `stdout`; stderr frames land in the bounded sink.
/// Returns the stderr capture on EOF; the writer side of `stdout` should be
/// dropped by the caller to propagate EOF downstream.
pub async fn demux_stream<R, W>(
    mut src: R,
    mut stdout: W,
) -> (BoundedBuffer, std::io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stderr = BoundedBuffer::new(STDERR_CAPTURE_BYTES);
    let mut header = [0u8; 8];
    let mut payload = Vec::new();

    loop {
        match src.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return (stderr, Ok(()));
            }
            Err(e) => return (stderr, Err(e)),
        }

        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        payload.resize(len, 0);
        if len > 0 {
            if let Err(e) = src.read_exact(&mut payload).await {
                return (stderr, Err(e));
            }
        }

        if header[0] == STREAM_STDERR {
            stderr.write(&payload);
        } else {
            // Stdin replay (0) and stdout both flow to the parser side.
            if let Err(e) = stdout.write_all(&payload).await {
                return (stderr, Err(e));
            }
        }
    }
}

/// Frame a payload as one stdout frame of the multiplexed format. Test
/// helper for scripted providers.
pub fn frame_stdout(payload: &[u8]) -> Vec<u8> {
    frame(STREAM_STDOUT, payload)
}

/// Frame a payload as one stderr frame of the multiplexed format.
pub fn frame_stderr(payload: &[u8]) -> Vec<u8> {
    frame(STREAM_STDERR, payload)
}

fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(8 + payload.len());
    framed.push(stream);
    framed.extend_from_slice(&[0, 0, 0]);
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn bounded_buffer_keeps_newest_bytes() {
        let mut buf = BoundedBuffer::new(8);
        buf.write(b"abcd");
        assert_eq!(buf.as_lossy_string(), "abcd");
        buf.write(b"efgh");
        assert_eq!(buf.as_lossy_string(), "abcdefgh");
        buf.write(b"ij");
        assert_eq!(buf.as_lossy_string(), "cdefghij");

        // A single write larger than the cap keeps its tail.
        buf.write(b"0123456789abcdef");
        assert_eq!(buf.as_lossy_string(), "89abcdef");
    }

    #[tokio::test]
    async fn demux_splits_stdout_and_stderr() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&frame_stdout(b"hello "));
        wire.extend_from_slice(&frame_stderr(b"warning: slow disk\n"));
        wire.extend_from_slice(&frame_stdout(b"world"));

        let mut stdout = Vec::new();
        let (stderr, result) = demux_stream(Cursor::new(wire), &mut stdout).await;
        result.expect("demux should succeed");
        assert_eq!(stdout, b"hello world");
        assert_eq!(stderr.as_lossy_string(), "warning: slow disk\n");
    }

    #[tokio::test]
    async fn demux_handles_empty_frames_and_eof() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&frame_stdout(b""));
        wire.extend_from_slice(&frame_stdout(b"data"));

        let mut stdout = Vec::new();
        let (stderr, result) = demux_stream(Cursor::new(wire), &mut stdout).await;
        result.expect("demux should succeed");
        assert_eq!(stdout, b"data");
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn demux_truncated_payload_is_an_error() {
        let mut wire = frame_stdout(b"full payload");
        wire.truncate(wire.len() - 4);

        let mut stdout = Vec::new();
        let (_, result) = demux_stream(Cursor::new(wire), &mut stdout).await;
        assert!(result.is_err());
    }
}
