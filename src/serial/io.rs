//! Async serial streams and bounded line I/O.
//!
//! - [`SerialPortIO`]: any `AsyncRead + AsyncWrite` stream (real port, duplex pipe, mock)
//! - [`SharedPort`]: buffered stream shared between tasks
//! - [`read_until`]: line read bounded by a timeout and a [`RetryPolicy`]
//! - [`open_port`]: open an OS serial port (feature `serial`)

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{DaqError, DaqResult};
use crate::error_recovery::{retry_async, with_timeout, RetryPolicy};

/// Trait alias for async serial port I/O.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Buffered serial stream shared between tasks.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Wrap a stream for sharing.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Write `command` followed by `terminator`.
pub async fn write_line(port: &SharedPort, command: &str, terminator: &str) -> DaqResult<()> {
    let mut guard = port.lock().await;
    let stream = guard.get_mut();
    stream.write_all(command.as_bytes()).await?;
    stream.write_all(terminator.as_bytes()).await?;
    stream.flush().await?;
    trace!(command, "sent");
    Ok(())
}

/// Read up to and including `terminator`, returning the line without it.
///
/// Each attempt is bounded by `timeout`; timeouts and I/O errors are retried per
/// `policy`. The port stays locked for the whole read and bytes received by an
/// attempt that timed out are kept for the next one. End of stream counts as an
/// I/O error.
pub async fn read_until(
    port: &SharedPort,
    terminator: u8,
    timeout: Duration,
    policy: &RetryPolicy,
) -> DaqResult<String> {
    let pending = Mutex::new((port.lock().await, Vec::new()));
    retry_async(policy, "serial read", |_| {
        let pending = &pending;
        with_timeout(timeout, "serial read", async move {
            let mut guard = pending.lock().await;
            let (stream, buf) = &mut *guard;
            let n = stream.read_until(terminator, buf).await?;
            if n == 0 {
                return Err(DaqError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            let mut line = std::mem::take(buf);
            if line.last() == Some(&terminator) {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).trim_end_matches('\r').to_string();
            trace!(%line, "received");
            Ok(line)
        })
    })
    .await
}

/// Write a command and read one response line terminated by `\n`.
pub async fn query(
    port: &SharedPort,
    command: &str,
    timeout: Duration,
    policy: &RetryPolicy,
) -> DaqResult<String> {
    write_line(port, command, "\r\n").await?;
    read_until(port, b'\n', timeout, policy).await
}

/// Open an OS serial port (8N1, no flow control) without blocking the runtime.
#[cfg(feature = "serial")]
pub async fn open_port(name: &str, baud_rate: u32) -> DaqResult<SharedPort> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let name = name.to_string();
    let stream = spawn_blocking(move || {
        tokio_serial::new(&name, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open serial port: {name}"))
    })
    .await
    .context("spawn_blocking for serial port opening failed")??;

    Ok(wrap_shared(Box::new(stream)))
}
