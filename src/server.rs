use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, instrument, warn};

use crate::dispatcher::RequestDispatcher;
use crate::protocol::{parse_request, render_results};

/// Accept loop (C9): one `tokio::spawn`ed task per connection, mirroring this codebase's
/// usual pattern of a dedicated background task per long-running concern.
pub async fn run(listener: TcpListener, dispatcher: Arc<RequestDispatcher>) -> anyhow::Result<()> {
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, dispatcher).await {
                warn!(%peer_addr, error = %e, "connection closed with error");
            }
        });
    }
}

/// Multiple requests may be pipelined on one connection; each is handled to completion
/// before the next frame is read, so replies never go out of order within a connection
/// (§4.9).
#[instrument(skip(socket, dispatcher))]
async fn handle_connection(socket: TcpStream, dispatcher: Arc<RequestDispatcher>) -> anyhow::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut length_line = String::new();
        let bytes_read = reader.read_line(&mut length_line).await?;
        if bytes_read == 0 {
            return Ok(()); // EOF
        }

        let frame_len: usize = match length_line.trim().parse() {
            Ok(n) => n,
            Err(_) => {
                warn!(line = %length_line.trim(), "malformed frame length, dropping connection");
                return Ok(());
            }
        };

        let mut body = vec![0u8; frame_len];
        reader.read_exact(&mut body).await?; // never a short-reading single `read`

        let xml = String::from_utf8_lossy(&body).into_owned();
        let response_xml = match parse_request(&xml) {
            Ok(request) => {
                let children = dispatcher.dispatch(request).await;
                render_results(&children)
            }
            Err(e) => {
                error!(error = %e, "failed to parse request frame");
                render_results(&[])
            }
        };

        let frame = format!("{}\n{}", response_xml.len(), response_xml);
        write_half.write_all(frame.as_bytes()).await?;
    }
}

pub async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening for connections");
    Ok(listener)
}
