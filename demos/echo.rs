//! Simple echo server and client over TCP
//!
//! ```text
//! cargo run --example echo -- server 127.0.0.1:4000
//! cargo run --example echo -- client 127.0.0.1:4000 "hello" "world"
//! ```
//!
//! The server accepts multiplexed streams and echoes back any data
//! received. The client opens one stream per message.

use p2p_mux::{MuxerAdaptor, Role, Stream, Yamux};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,p2p_mux=debug")
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [mode, addr] if mode == "server" => run_server(addr).await,
        [mode, addr, messages @ ..] if mode == "client" => run_client(addr, messages).await,
        _ => {
            eprintln!("usage: echo server <addr> | echo client <addr> <message>...");
            Ok(())
        }
    }
}

async fn run_server(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let muxer = Yamux::default();
    let listener = TcpListener::bind(addr).await?;
    info!("Echo server listening on {} ({})", addr, muxer.protocol_id());

    loop {
        let (socket, peer) = listener.accept().await?;
        info!("Accepted connection from {}", peer);

        let session = Arc::new(muxer.mux_connection(socket, Role::Responder)?);
        tokio::spawn(async move {
            loop {
                match session.accept_stream().await {
                    Ok(stream) => {
                        info!("Accepted stream {} from {}", stream.id(), peer);
                        tokio::spawn(async move {
                            if let Err(e) = handle_stream(stream).await {
                                error!("Stream error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        info!("Session with {} ended: {}", peer, e);
                        break;
                    }
                }
            }
        });
    }
}

async fn handle_stream(stream: Stream) -> Result<(), Box<dyn std::error::Error>> {
    let mut buf = vec![0u8; 1024];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            // EOF
            info!("Stream {} closed by peer", stream.id());
            break;
        }

        info!("Stream {}: received {} bytes", stream.id(), n);
        stream.write(&buf[..n]).await?;
    }

    stream.close()?;
    Ok(())
}

async fn run_client(addr: &str, messages: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let socket = TcpStream::connect(addr).await?;
    let session = Yamux::default().mux_connection(socket, Role::Initiator)?;

    for message in messages {
        let stream = session.open_stream()?;
        stream.write(message.as_bytes()).await?;
        stream.close()?;

        let mut echoed = Vec::new();
        let mut buf = vec![0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            echoed.extend_from_slice(&buf[..n]);
        }
        info!(
            "Stream {}: echoed {:?}",
            stream.id(),
            String::from_utf8_lossy(&echoed)
        );
    }

    let rtt = session.ping().await?;
    info!("Round trip time {:?}", rtt);
    session.close().await;
    Ok(())
}
