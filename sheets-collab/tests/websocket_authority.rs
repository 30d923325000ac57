//! End-to-end tests against a real WebSocket authority stub.
//!
//! The stub binds a free local port, accepts tungstenite connections and
//! hands each one to the test, which then speaks the authority's side of
//! the JSON protocol by hand.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use sheets_collab::protocol::{
    CellPosition, CursorMove, Envelope, Message, MessageKind, PresenceJoin, SyncResponse, UserSnapshot,
};
use sheets_collab::{CollabConfig, CollabSession, CollaborationState, ConnectionStatus, SessionTarget};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

const WAIT: Duration = Duration::from_secs(2);

type Accepted = (String, WebSocketStream<TcpStream>);

/// Start the stub; every accepted connection arrives with its request URI.
async fn start_stub_authority() -> (u16, mpsc::UnboundedReceiver<Accepted>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let uri = Arc::new(Mutex::new(String::new()));
            let seen = uri.clone();
            let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                *seen.lock().unwrap() = request.uri().to_string();
                Ok(response)
            };
            if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                let uri = uri.lock().unwrap().clone();
                if tx.send((uri, ws)).is_err() {
                    break;
                }
            }
        }
    });
    (port, rx)
}

/// Next envelope from the client; `None` once it sends a close frame.
async fn next_envelope(ws: &mut WebSocketStream<TcpStream>) -> Option<Envelope> {
    loop {
        match timeout(WAIT, ws.next()).await.ok()?? {
            Ok(WsMessage::Text(text)) => return Some(Envelope::decode(text.as_str()).unwrap()),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn push(ws: &mut WebSocketStream<TcpStream>, message: Message) {
    let frame = Envelope::new("system", message).encode().unwrap();
    ws.send(WsMessage::Text(frame.into())).await.unwrap();
}

fn session_for(port: u16) -> CollabSession {
    let target = SessionTarget::new("wb-1", "ws-1", "u1", "u1@example.com");
    let config = CollabConfig::default().with_server_url(format!("ws://127.0.0.1:{port}"));
    CollabSession::builder(target).config(config).connect_ws().unwrap()
}

async fn wait_state(session: &CollabSession, pred: impl FnMut(&CollaborationState) -> bool) {
    let mut state = session.watch_state();
    let reached = matches!(timeout(WAIT, state.wait_for(pred)).await, Ok(Ok(_)));
    assert!(reached, "state condition not reached: {:?}", session.state());
}

#[tokio::test]
async fn test_session_round_trip_over_websocket() {
    let (port, mut accepted) = start_stub_authority().await;
    let session = session_for(port);

    let (uri, mut ws) = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
    assert_eq!(
        uri,
        "/workbooks/wb-1/worksheets/ws-1/collaborate?user_id=u1&email=u1%40example.com"
    );
    let request = next_envelope(&mut ws).await.unwrap();
    assert_eq!(request.kind(), MessageKind::SyncRequest);
    assert_eq!(request.actor_id(), "u1");

    push(
        &mut ws,
        Message::SyncResponse(SyncResponse {
            workbook_id: "wb-1".into(),
            worksheet_id: "ws-1".into(),
            active_users: vec![UserSnapshot {
                user_id: "u1".into(),
                email: "u1@example.com".into(),
                cursor_position: None,
                selection_range: None,
                last_activity: None,
            }],
        }),
    )
    .await;
    push(
        &mut ws,
        Message::PresenceJoin(PresenceJoin {
            user_id: "u2".into(),
            email: "u2@example.com".into(),
            connection_id: None,
            active_users: Some(2),
        }),
    )
    .await;
    push(
        &mut ws,
        Message::CursorMove(CursorMove {
            row: 1,
            column: 1,
            user_id: Some("u2".into()),
            email: Some("u2@example.com".into()),
        }),
    )
    .await;

    wait_state(&session, |s| {
        s.user_count() == 2 && s.users_at(CellPosition::new(1, 1)) == vec!["u2"]
    })
    .await;
    assert!(session.is_connected());

    assert!(session.commands().update_cell(2, 3, "42", None));
    let edit = next_envelope(&mut ws).await.unwrap();
    assert_eq!(edit.kind(), MessageKind::CellUpdate);
    assert!(edit.message_id().is_some());

    session.close().await;
    let closing = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    match closing {
        WsMessage::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1000);
            assert_eq!(frame.reason.as_str(), "user initiated");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_dropped_connection_is_reestablished() {
    let (port, mut accepted) = start_stub_authority().await;
    let session = session_for(port);

    let (_, mut ws) = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
    assert_eq!(next_envelope(&mut ws).await.unwrap().kind(), MessageKind::SyncRequest);
    push(
        &mut ws,
        Message::PresenceJoin(PresenceJoin {
            user_id: "u2".into(),
            email: String::new(),
            connection_id: None,
            active_users: None,
        }),
    )
    .await;
    wait_state(&session, |s| s.user("u2").is_some()).await;

    // No close handshake: the client sees an abnormal closure.
    drop(ws);
    wait_state(&session, |s| s.user_count() == 0).await;

    let (_, mut ws) = timeout(Duration::from_secs(5), accepted.recv()).await.unwrap().unwrap();
    assert_eq!(next_envelope(&mut ws).await.unwrap().kind(), MessageKind::SyncRequest);
    let mut status = session.watch_status();
    let connected = matches!(
        timeout(WAIT, status.wait_for(|s| *s == ConnectionStatus::Connected)).await,
        Ok(Ok(_))
    );
    assert!(connected);
}

#[tokio::test]
async fn test_unreachable_authority_backs_off() {
    // Bind then release a port so nothing is listening on it.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let session = session_for(port);

    let mut status = session.watch_status();
    let disconnected = matches!(
        timeout(WAIT, status.wait_for(|s| *s == ConnectionStatus::Disconnected)).await,
        Ok(Ok(_))
    );
    assert!(disconnected);
    assert!(!session.commands().move_cursor(0, 0));
}
