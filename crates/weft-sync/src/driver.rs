//! Runs a [`ConnectionEngine`] over an async byte stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::connection::{ConnectionEngine, ConnectionHandle};
use crate::error::Result;

/// Pump bytes both ways until the peer hangs up, the handle is closed or
/// the stream fails. The engine is shut down on every exit path.
pub async fn drive<S>(mut engine: ConnectionEngine, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let handle = engine.handle().clone();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; engine.buffer_size()];

    let result = pump(&mut engine, &handle, &mut reader, &mut writer, &mut buf).await;

    engine.shutdown();
    let _ = writer.shutdown().await;
    match &result {
        Ok(()) => tracing::debug!(connection = handle.id(), "connection finished"),
        Err(e) => tracing::debug!(connection = handle.id(), error = %e, "connection failed"),
    }
    result
}

async fn pump<R, W>(
    engine: &mut ConnectionEngine,
    handle: &ConnectionHandle,
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        while let Some(bytes) = engine.transmit()? {
            writer.write_all(&bytes).await?;
        }
        writer.flush().await?;
        if handle.is_closed() {
            return Ok(());
        }

        tokio::select! {
            read = reader.read(buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                engine.receive(&buf[..n])?;
            }
            _ = handle.notified() => {}
        }
    }
}
