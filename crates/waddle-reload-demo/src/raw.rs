//! Raw mode: a line echo protocol on the tracked listener.
//!
//! Each connection is greeted with the serving pid, then every line is
//! echoed back until the client hangs up.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use waddle_reloader::{is_listener_closed, Reloader};

/// Run the accept loop until the listener is closed, then drain.
pub async fn serve(reloader: &Reloader) -> anyhow::Result<()> {
    let listener = reloader.listener()?;
    info!(addr = %listener.local_addr()?, "Serving raw echo protocol");

    loop {
        match listener.accept().await {
            Ok((mut stream, peer)) => {
                tokio::spawn(async move {
                    if let Err(e) = echo(&mut stream).await {
                        debug!(%peer, error = %e, "Connection ended with error");
                    }
                    let _ = stream.close().await;
                });
            }
            Err(e) if is_listener_closed(&e) => break,
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }

    info!(
        active_connections = reloader.active_connections(),
        "Listener closed, waiting for connections to finish"
    );
    if reloader.drain().await {
        info!("All connections drained cleanly");
    } else {
        warn!(
            remaining_connections = reloader.active_connections(),
            "Exiting with connections still open"
        );
    }
    Ok(())
}

async fn echo<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    writer
        .write_all(format!("hello from {}\n", std::process::id()).as_bytes())
        .await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    writer.flush().await
}
