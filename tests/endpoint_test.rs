mod utils;

use anyhow::Result;
use pretty_assertions::assert_eq;
use std::time::Duration;
use utils::*;
use websocket_engine::{close_code, ConnectionState, WsError, WsParameters};

#[tokio::test]
async fn test_close_all_closes_server_connections() -> Result<()> {
    let params = WsParameters::default();
    let (websocket, listener, server_events) = create_test_server(Behavior::Record, &params)?;
    let (_client, client_events) = connect_client(&listener, &params).await?;
    server_events.open().await?;

    websocket.close_all("shutdown").await;
    assert!(!listener.is_open());

    let (status, _) = client_events.close().await?;
    assert_eq!(status.code, Some(close_code::GOING_AWAY));
    assert_eq!(status.reason, "shutdown");
    assert!(status.closed_remotely);

    let (status, _) = server_events.close().await?;
    assert_eq!(status.code, Some(close_code::GOING_AWAY));
    assert!(!status.closed_remotely);

    assert!(eventually(|| websocket.list_listeners().is_empty()).await);
    Ok(())
}

#[tokio::test]
async fn test_close_all_closes_client_connections() -> Result<()> {
    let params = WsParameters::default();
    let (_websocket, listener, server_events) = create_test_server(Behavior::Record, &params)?;

    let client_endpoint = local_endpoint();
    let (handler, client_events) = Recorder::new(Behavior::Record);
    let client = client_endpoint
        .connect(&ws_url(&listener, "/"), handler, &params)
        .await?;
    assert_eq!(client_endpoint.list_connections(), vec![client.clone()]);
    client_events.open().await?;
    server_events.open().await?;

    client_endpoint.close_all("bye").await;
    let (status, _) = server_events.close().await?;
    assert_eq!(status.code, Some(close_code::GOING_AWAY));
    assert_eq!(status.reason, "bye");
    assert!(status.closed_remotely);

    client_events.close().await?;
    assert!(eventually(|| client_endpoint.list_connections().is_empty()).await);
    Ok(())
}

#[tokio::test]
async fn test_closed_listener_refuses_connections() -> Result<()> {
    let params = WsParameters::default();
    let (websocket, listener, _server_events) = create_test_server(Behavior::Record, &params)?;
    let url = ws_url(&listener, "/");

    listener.close("").await;
    assert!(!listener.is_open());
    assert!(eventually(|| websocket.list_listeners().is_empty()).await);

    let (handler, _events) = Recorder::new(Behavior::Record);
    let result = local_endpoint().connect(&url, handler, &params).await;
    assert!(matches!(result, Err(WsError::Io(_))), "{result:?}");
    Ok(())
}

#[tokio::test]
async fn test_accept_policy_rejects_peer() -> Result<()> {
    init_tracing();
    let params = WsParameters::default();
    let websocket = local_endpoint().with_accept_policy(|peer| !peer.ip().is_loopback());
    let (handler, server_events) = Recorder::new(Behavior::Record);
    let listener = websocket.listen(0, handler, &params)?;

    let (handler, client_events) = Recorder::new(Behavior::Record);
    let client = local_endpoint()
        .connect(&ws_url(&listener, "/"), handler, &params)
        .await?;

    // the handshake fails without on_open
    let (status, error) = client_events.close().await?;
    assert_eq!(status.code, Some(close_code::PROTOCOL_ERROR));
    assert!(error.is_some());
    assert!(!client.is_open());

    assert!(listener.list_connections().is_empty());
    assert!(server_events.quiet_for(Duration::from_millis(200)).await);
    Ok(())
}

#[tokio::test]
async fn test_listener_reports_its_address() -> Result<()> {
    let params = WsParameters::default().with_subprotocols(["chat"]);
    let (websocket, listener, _server_events) = create_test_server(Behavior::Record, &params)?;

    assert!(listener.local_addr().ip().is_loopback());
    assert_eq!(listener.local_addr().port(), listener.port());
    assert!(!listener.is_secure());
    assert_eq!(listener.parameters().subprotocols(), ["chat".to_string()]);
    assert_eq!(websocket.list_listeners(), vec![listener.clone()]);
    Ok(())
}

#[tokio::test]
async fn test_listener_close_races_incoming_connections() -> Result<()> {
    let params = WsParameters::default();
    let (websocket, listener, _server_events) = create_test_server(Behavior::Record, &params)?;
    let url = ws_url(&listener, "/");

    let mut pending = Vec::new();
    for _ in 0..16 {
        let url = url.clone();
        let params = params.clone();
        pending.push(tokio::spawn(async move {
            let (handler, _events) = Recorder::new(Behavior::Record);
            local_endpoint().connect(&url, handler, &params).await
        }));
    }
    tokio::task::yield_now().await;
    listener.close("bye").await;

    let mut clients = Vec::new();
    for task in pending {
        // connects that lost the race against the socket close are fine
        if let Ok(conn) = task.await? {
            clients.push(conn);
        }
    }

    // a connection registered behind the close sweep would stay here forever
    assert!(eventually(|| listener.list_connections().is_empty()).await);
    assert!(eventually(|| websocket.list_listeners().is_empty()).await);
    for client in &clients {
        assert!(eventually(|| client.status().state == ConnectionState::Closed).await);
    }
    Ok(())
}
