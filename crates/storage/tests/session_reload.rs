use storage::{SessionStore, SqliteSessionStore, StoreKey};

#[tokio::test]
async fn persisted_session_survives_reopening_the_store() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("session.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    {
        let store = SqliteSessionStore::new(&database_url).await.expect("db");
        store
            .set_many(&[
                (StoreKey::ParticipantId, "participant-1"),
                (StoreKey::ChannelId, "BirdNest-1700000000000"),
                (StoreKey::ScreenName, "Finch"),
            ])
            .await
            .expect("persist session");
        store.pool().close().await;
    }

    let reopened = SqliteSessionStore::new(&database_url).await.expect("reopen");
    let values = reopened.get_many(&StoreKey::ALL).await.expect("read");
    assert_eq!(values.len(), 3);
    assert_eq!(
        values.get(&StoreKey::ChannelId).map(String::as_str),
        Some("BirdNest-1700000000000")
    );

    reopened.remove(StoreKey::ChannelId).await.expect("clear channel");
    reopened.pool().close().await;

    let again = SqliteSessionStore::new(&database_url).await.expect("reopen");
    assert_eq!(again.get(StoreKey::ChannelId).await.expect("read"), None);
    assert_eq!(
        again.get(StoreKey::ParticipantId).await.expect("read").as_deref(),
        Some("participant-1")
    );
}
