use shared_connections::{ConnectionRegistry, TcpTransport};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> shared_connections::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("shared_connections=debug")
        .init();

    // Local echo server standing in for the remote host
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    let registry = ConnectionRegistry::with_defaults(TcpTransport::new());
    let destination = addr.to_string();

    let sender = registry.acquire(destination.as_str()).await?;
    let listener_side = registry.acquire(destination.as_str()).await?;
    println!(
        "two tokens share one connection: {}",
        sender.same_connection(&listener_side)
    );

    let message = b"Hello World!";
    for byte in message {
        sender.send(*byte).await?;
    }
    registry.release(&sender).await?;

    let mut echoed = vec![0u8; message.len()];
    listener_side.receive_exact(&mut echoed).await?;
    println!("echoed: {}", String::from_utf8_lossy(&echoed));
    registry.release(&listener_side).await?;

    // A dedicated sender is never shared and is closed by its owner
    let dedicated = registry.open_dedicated(destination.as_str()).await?;
    dedicated.send_all(message).await?;
    dedicated.receive_exact(&mut echoed).await?;
    dedicated.close().await?;

    // One-shot send: shares a live connection or opens one just for this call
    registry.send_to(destination.as_str(), b"!").await?;

    let stats = registry.stats().await;
    println!(
        "sent {} bytes, received {} bytes, opens {}, closes {}",
        stats.bytes_sent, stats.bytes_received, stats.total_opens, stats.total_closes
    );

    registry.shutdown().await;
    Ok(())
}
