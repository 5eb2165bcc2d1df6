use super::*;
use shared::domain::{Credentials, ServerAddress};

fn options_for(username: &str) -> ConnectOptions {
    ConnectOptions {
        address: ServerAddress::parse("localhost:64738").expect("address"),
        credentials: Credentials::new(username),
        tls: TlsPolicy::Skip,
    }
}

#[tokio::test]
async fn rejects_second_login_with_same_username() {
    let server = LoopbackServer::new(LoopbackOptions::default());
    let connector = server.connector();

    let _first = connector.connect(options_for("bot 0")).await.expect("first");
    let err = connector
        .connect(options_for("bot 0"))
        .await
        .err()
        .expect("duplicate must fail");

    assert!(matches!(err, ConnectError::AuthRejected(_)), "{err:?}");
    assert_eq!(server.stats().rejected, 1);
}

#[tokio::test]
async fn strict_tls_requires_trusted_certificate() {
    let server = LoopbackServer::new(LoopbackOptions::default());
    let mut options = options_for("bot 0");
    options.tls = TlsPolicy::Strict;

    let err = server
        .connector()
        .connect(options.clone())
        .await
        .err()
        .expect("untrusted must fail");
    assert!(matches!(err, ConnectError::Tls(_)), "{err:?}");

    let trusted = LoopbackServer::new(LoopbackOptions {
        trusted_certificate: true,
        ..LoopbackOptions::default()
    });
    trusted
        .connector()
        .connect(options)
        .await
        .expect("trusted certificate accepted");
}

#[tokio::test]
async fn full_server_refuses_and_wrong_password_is_rejected() {
    let server = LoopbackServer::new(LoopbackOptions {
        max_users: Some(1),
        password: Some("hunter2".to_string()),
        ..LoopbackOptions::default()
    });
    let connector = server.connector();

    let mut first = options_for("bot 0");
    first.credentials = first.credentials.with_password(Some("hunter2".to_string()));
    let _conn = connector.connect(first).await.expect("first");

    let wrong = connector
        .connect(options_for("bot 1"))
        .await
        .err()
        .expect("missing password");
    assert!(matches!(wrong, ConnectError::AuthRejected(_)));

    let mut second = options_for("bot 1");
    second.credentials = second.credentials.with_password(Some("hunter2".to_string()));
    let full = connector.connect(second).await.err().expect("server full");
    assert!(matches!(full, ConnectError::Refused(_)));
}

#[tokio::test]
async fn relays_text_only_within_channel() {
    let server = LoopbackServer::new(LoopbackOptions::default());
    let connector = server.connector();

    let alice = connector.connect(options_for("alice")).await.expect("alice");
    let mut bob = connector.connect(options_for("bob")).await.expect("bob");
    let mut carol = connector.connect(options_for("carol")).await.expect("carol");

    assert!(server.move_user("carol", ChannelId(1)).await);
    assert_eq!(
        carol.events.recv().await.expect("move event"),
        TransportEvent::ChannelChanged {
            channel_id: ChannelId(1)
        }
    );

    alice
        .transport
        .send_text(ChannelId::ROOT, "testing")
        .await
        .expect("send");

    assert_eq!(
        bob.events.recv().await.expect("bob receives"),
        TransportEvent::TextReceived {
            sender: Some("alice".to_string()),
            channel_id: ChannelId::ROOT,
            body: "testing".to_string(),
        }
    );
    assert!(carol.events.try_recv().is_err());
    assert_eq!(server.stats().text_messages, 1);
}

#[tokio::test]
async fn kicked_user_gets_closed_event_and_cannot_send() {
    let server = LoopbackServer::new(LoopbackOptions::default());
    let mut conn = server
        .connector()
        .connect(options_for("bot 3"))
        .await
        .expect("connect");

    assert!(server.kick("bot 3", "stress test over").await);
    assert_eq!(
        conn.events.recv().await.expect("closed event"),
        TransportEvent::Closed {
            reason: "stress test over".to_string()
        }
    );
    assert!(conn.events.recv().await.is_none());

    let err = conn
        .transport
        .send_text(ChannelId::ROOT, "still here?")
        .await
        .expect_err("must fail");
    assert!(matches!(err, SendError::TransportClosed(_)));
    assert!(server.connected_users().await.is_empty());
}

#[tokio::test]
async fn disconnect_frees_username_for_reuse() {
    let server = LoopbackServer::new(LoopbackOptions::default());
    let connector = server.connector();

    let conn = connector.connect(options_for("bot 9")).await.expect("connect");
    conn.transport.disconnect().await.expect("disconnect");
    assert!(server.connected_users().await.is_empty());

    connector
        .connect(options_for("bot 9"))
        .await
        .expect("reconnect with same name");
}
