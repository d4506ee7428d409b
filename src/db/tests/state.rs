use super::open;

#[tokio::test]
async fn test_shutdown_state_initial() {
    let (db, _file) = open().await;

    // After migration, shutdown state should be "false" (unclean)
    assert!(db.was_unclean_shutdown().await.unwrap());

    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_clean_lifecycle() {
    let (db, _file) = open().await;

    db.set_clean_start().await.unwrap();
    assert!(
        db.was_unclean_shutdown().await.unwrap(),
        "After clean start, should still indicate unclean (not yet shut down)"
    );

    db.set_clean_shutdown().await.unwrap();
    assert!(!db.was_unclean_shutdown().await.unwrap());

    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_unclean_detection() {
    let temp_file = tempfile::NamedTempFile::new().unwrap();

    // First session: start but don't shut down cleanly (simulating crash)
    {
        let db = crate::db::Database::new(temp_file.path()).await.unwrap();
        db.set_clean_start().await.unwrap();
        db.close().await;
    }

    {
        let db = crate::db::Database::new(temp_file.path()).await.unwrap();
        assert!(db.was_unclean_shutdown().await.unwrap());
        db.set_clean_start().await.unwrap();
        db.set_clean_shutdown().await.unwrap();
        db.close().await;
    }

    {
        let db = crate::db::Database::new(temp_file.path()).await.unwrap();
        assert!(!db.was_unclean_shutdown().await.unwrap());
        db.close().await;
    }
}

#[tokio::test]
async fn test_auto_delete_flag_persists() {
    let (db, _file) = open().await;

    assert_eq!(db.get_auto_delete().await.unwrap(), None);
    db.set_auto_delete(true).await.unwrap();
    assert_eq!(db.get_auto_delete().await.unwrap(), Some(true));
    db.set_auto_delete(false).await.unwrap();
    assert_eq!(db.get_auto_delete().await.unwrap(), Some(false));

    db.close().await;
}
