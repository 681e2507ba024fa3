use common::MessageId;
use transport::testing::FakeNntpServer;
use transport::{with_retries, NntpPool, NntpSession, RetryPolicy, TransportError};

#[tokio::test]
async fn post_then_fetch_roundtrip() {
    let server = FakeNntpServer::start().await;
    let mut session = NntpSession::connect(&server.profile()).await.unwrap();
    session.select_group("alt.binaries.test").await.unwrap();

    let body = b"=ybegin part=1 total=1 line=128 size=5 name=x\r\nhello\r\n=yend size=5 part=1\r\n";
    let message_id = session.post("0011aabb yEnc", &[], body).await.unwrap();
    assert!(message_id.as_str().starts_with("<srv"));

    let fetched = session.fetch(&message_id).await.unwrap();
    assert_eq!(fetched, body);

    assert!(session.exists(&message_id).await.unwrap());
    let missing = MessageId::parse("<nope@fake.test>").unwrap();
    assert!(!session.exists(&missing).await.unwrap());
    session.quit().await;
}

#[tokio::test]
async fn placeholder_ack_falls_back_to_suggested_id() {
    let server = FakeNntpServer::start().await;
    server.echo_placeholder(true);
    let mut session = NntpSession::connect(&server.profile()).await.unwrap();

    let message_id = session.post("f00dcafe yEnc", &[], b"payload\r\n").await.unwrap();
    // The recorded id is the concrete suggested one, never the placeholder.
    assert_ne!(message_id.as_str(), "<posted>");
    assert!(message_id.as_str().contains("@127.0.0.1"));

    // And the article is retrievable under it.
    let fetched = session.fetch(&message_id).await.unwrap();
    assert_eq!(fetched, b"payload\r\n");
}

#[tokio::test]
async fn dot_stuffed_payload_survives_the_wire() {
    let server = FakeNntpServer::start().await;
    let mut session = NntpSession::connect(&server.profile()).await.unwrap();

    let body = b".leading dot\r\n..two dots\r\nordinary\r\n";
    let message_id = session.post("subject yEnc", &[], body).await.unwrap();
    let fetched = session.fetch(&message_id).await.unwrap();
    assert_eq!(fetched, body);
}

#[tokio::test]
async fn missing_article_is_not_found() {
    let server = FakeNntpServer::start().await;
    let mut session = NntpSession::connect(&server.profile()).await.unwrap();
    let missing = MessageId::parse("<missing@fake.test>").unwrap();
    assert!(matches!(
        session.fetch(&missing).await,
        Err(TransportError::NotFound)
    ));
}

#[tokio::test]
async fn rejected_auth_is_permanent() {
    let server = FakeNntpServer::start().await;
    server.reject_auth(true);
    let err = NntpSession::connect(&server.profile()).await.unwrap_err();
    assert!(matches!(err, TransportError::AuthRejected(_)));
}

#[tokio::test]
async fn transient_post_failures_retry_through_the_pool() {
    let server = FakeNntpServer::start().await;
    server.fail_next_posts(2);
    let pool = NntpPool::new(server.profile());

    // Production backoff shape, compressed so the test stays fast.
    let policy = RetryPolicy {
        max_retries: 5,
        base: std::time::Duration::from_millis(5),
        cap: std::time::Duration::from_millis(40),
    };
    let message_id = with_retries(&policy, |_| {
        let pool = pool.clone();
        async move {
            let mut session = pool.checkout().await?;
            session.post("retry yEnc", &[], b"retried body\r\n").await
        }
    })
    .await
    .unwrap();

    assert!(server.article(message_id.as_str()).is_some());
    // Two failed attempts plus the success.
    assert_eq!(server.post_count(), 1);
    assert_eq!(server.article_count(), 1);
}

#[tokio::test]
async fn pool_reuses_sessions_and_respects_limit() {
    let server = FakeNntpServer::start().await;
    let pool = NntpPool::new(server.profile());

    let first = {
        let mut session = pool.checkout().await.unwrap();
        session
            .post("one yEnc", &[], b"first\r\n")
            .await
            .unwrap()
    };
    // The returned session serves the next checkout.
    let mut session = pool.checkout().await.unwrap();
    let fetched = session.fetch(&first).await.unwrap();
    assert_eq!(fetched, b"first\r\n");
}
