mod common;

use common::mock_server::{MockServer, ACCEPTED_TOKEN};
use common::{drain, open_session, session_with_token, setup_temp_dir};
use cryptport_core::{Command, SessionError, SessionEvent, SessionState};
use tokio::net::TcpListener;

#[tokio::test]
async fn empty_credentials_fail_without_io() {
    let dir = setup_temp_dir();
    let (session, events) = session_with_token(dir.path(), ACCEPTED_TOKEN);

    let err = session.login("", "").await.unwrap_err();
    assert!(matches!(err, SessionError::Validation(m) if m == "Please enter email and password"));
    assert!(!session.auth().is_authenticated());
    assert_eq!(session.auth().get_token(), "");

    let reported: Vec<bool> = drain(&events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::AuthResult { success, .. } => Some(success),
            _ => None,
        })
        .collect();
    assert_eq!(reported, vec![false]);
}

#[tokio::test]
async fn open_presents_login_token_on_every_request() {
    let server = MockServer::start().await;
    server.put_file("a.txt", &b"hello"[..]);
    let dir = setup_temp_dir();

    let (session, _events) = open_session(&server, dir.path()).await;
    assert_eq!(session.state(), SessionState::Authenticated);
    let info = session.connection_info().expect("connection info");
    assert_eq!(info.host, "127.0.0.1");
    assert_eq!(info.port, server.port);

    session.list_files().await.unwrap();

    let requests = server.requests();
    assert_eq!(requests[0].0, Command::Auth);
    assert!(requests
        .iter()
        .all(|(_, token)| token.as_deref() == Some(ACCEPTED_TOKEN)));
}

#[tokio::test]
async fn state_changes_follow_connect_and_authenticate() {
    let server = MockServer::start().await;
    let dir = setup_temp_dir();
    let (session, events) = session_with_token(dir.path(), ACCEPTED_TOKEN);
    let mut watcher = session.subscribe_state();

    session.connect("127.0.0.1", server.port).await.unwrap();
    assert_eq!(session.state(), SessionState::ConnectedUnauthenticated);
    assert_eq!(*watcher.borrow_and_update(), SessionState::ConnectedUnauthenticated);

    session.authenticate(ACCEPTED_TOKEN).await.unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);

    let states: Vec<SessionState> = drain(&events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { state } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Connecting,
            SessionState::ConnectedUnauthenticated,
            SessionState::Authenticating,
            SessionState::Authenticated,
        ]
    );
}

#[tokio::test]
async fn requests_before_authentication_are_refused_locally() {
    let server = MockServer::start().await;
    let dir = setup_temp_dir();
    let (session, _events) = session_with_token(dir.path(), ACCEPTED_TOKEN);

    session.connect("127.0.0.1", server.port).await.unwrap();

    assert!(matches!(
        session.list_files().await,
        Err(SessionError::NotAuthenticated)
    ));
    assert!(matches!(
        session.delete_file("a.txt").await,
        Err(SessionError::NotAuthenticated)
    ));
    assert!(matches!(
        session.start_download("a.txt", ""),
        Err(SessionError::NotAuthenticated)
    ));
    assert_eq!(session.state(), SessionState::ConnectedUnauthenticated);
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn rejected_token_closes_connection() {
    let server = MockServer::start().await;
    let dir = setup_temp_dir();
    let (session, _events) = session_with_token(dir.path(), "stale-token");
    session.login("user@example.com", "secret").await.unwrap();

    let err = session.open("127.0.0.1", server.port).await.unwrap_err();
    assert!(matches!(err, SessionError::ServerRejected(m) if m == "Invalid token"));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.connection_info().is_none());
}

#[tokio::test]
async fn connect_refused_reports_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let dir = setup_temp_dir();
    let (session, events) = session_with_token(dir.path(), ACCEPTED_TOKEN);

    let err = session.connect("127.0.0.1", port).await.unwrap_err();
    assert!(matches!(err, SessionError::Transport(_)));
    assert_eq!(session.state(), SessionState::Disconnected);

    assert!(drain(&events).iter().any(|e| matches!(
        e,
        SessionEvent::ConnectionChanged { connected: false, .. }
    )));
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let server = MockServer::start().await;
    let dir = setup_temp_dir();
    let (session, _events) = open_session(&server, dir.path()).await;

    assert!(matches!(
        session.connect("127.0.0.1", server.port).await,
        Err(SessionError::Validation(_))
    ));
    assert_eq!(session.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn logout_clears_token_and_disconnects() {
    let server = MockServer::start().await;
    let dir = setup_temp_dir();
    let (session, events) = open_session(&server, dir.path()).await;
    drain(&events);

    session.logout().await;
    assert!(!session.auth().is_authenticated());
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.connection_info().is_none());
    assert!(drain(&events).iter().any(|e| matches!(
        e,
        SessionEvent::ConnectionChanged { connected: false, reason } if reason == "Logged out"
    )));

    // Second logout is a no-op
    session.logout().await;
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn disconnect_then_reconnect() {
    let server = MockServer::start().await;
    let dir = setup_temp_dir();
    let (session, _events) = open_session(&server, dir.path()).await;

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    session.disconnect().await;

    session.open("127.0.0.1", server.port).await.unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
}
