mod utils;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use utils::*;
use websocket_engine::{close_code, WsParameters};

#[tokio::test]
async fn test_tungstenite_client_against_engine_server() -> Result<()> {
    let params = WsParameters::default();
    let (_websocket, listener, server_events) = create_test_server(Behavior::Echo, &params)?;

    let (mut client, response) = connect_async(ws_url(&listener, "/interop")).await?;
    assert_eq!(response.status().as_u16(), 101);
    assert_eq!(server_events.open().await?, None);

    client.send(Message::Text("hello".into())).await?;
    match client.next().await {
        Some(Ok(Message::Text(text))) => assert_eq!(text.as_str(), "hello"),
        other => panic!("expected text echo, got {other:?}"),
    }

    let payload = vec![9u8; 70_000];
    client.send(Message::Binary(payload.clone().into())).await?;
    match client.next().await {
        Some(Ok(Message::Binary(data))) => assert_eq!(data.to_vec(), payload),
        other => panic!("expected binary echo, got {other:?}"),
    }

    client
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await?;
    while let Some(Ok(_)) = client.next().await {}

    assert_eq!(server_events.message().await?, (b"hello".to_vec(), true));
    assert_eq!(server_events.message().await?, (vec![9u8; 70_000], false));
    let (status, error) = server_events.close().await?;
    assert!(error.is_none());
    assert_eq!(status.code, Some(close_code::NORMAL_CLOSURE));
    assert_eq!(status.reason, "bye");
    assert!(status.was_clean);
    assert!(status.closed_remotely);
    Ok(())
}

#[tokio::test]
async fn test_engine_client_against_tungstenite_server() -> Result<()> {
    init_tracing();
    let server = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}/echo", server.local_addr()?);
    let echo = tokio::spawn(async move {
        let (stream, _) = server.accept().await?;
        let mut ws = accept_async(stream).await?;
        while let Some(message) = ws.next().await {
            match message? {
                message @ (Message::Text(_) | Message::Binary(_)) => ws.send(message).await?,
                Message::Close(_) => break,
                _ => {}
            }
        }
        // let the close echo go out
        while ws.next().await.is_some() {}
        Ok::<_, anyhow::Error>(())
    });

    let (handler, client_events) = Recorder::new(Behavior::Record);
    let client = local_endpoint()
        .connect(&url, handler, &WsParameters::default())
        .await?;
    assert_eq!(client_events.open().await?, None);

    client.send_text("ping").await?;
    assert_eq!(client_events.message().await?, (b"ping".to_vec(), true));
    client.send_binary(&[1, 2, 3]).await?;
    assert_eq!(client_events.message().await?, (vec![1, 2, 3], false));

    client.close(close_code::NORMAL_CLOSURE, "done").await;
    let (status, error) = client_events.close().await?;
    assert!(error.is_none());
    assert_eq!(status.code, Some(close_code::NORMAL_CLOSURE));
    assert!(status.was_clean);
    assert!(!status.closed_remotely);

    echo.await??;
    Ok(())
}
