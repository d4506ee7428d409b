use super::open;

#[tokio::test]
async fn test_database_creation() {
    let (db, _file) = open().await;

    let mut conn = db.pool.acquire().await.unwrap();

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&mut *conn)
            .await
            .unwrap();

    assert!(tables.contains(&"jobs".to_string()));
    assert!(tables.contains(&"job_groups".to_string()));
    assert!(tables.contains(&"runtime_state".to_string()));
    assert!(tables.contains(&"schema_version".to_string()));

    drop(conn);
    db.close().await;
}

#[tokio::test]
async fn test_reopening_does_not_reapply_migrations() {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    {
        let db = crate::db::Database::new(temp_file.path()).await.unwrap();
        db.close().await;
    }

    let db = crate::db::Database::new(temp_file.path()).await.unwrap();
    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(versions, vec![1, 2, 3]);
    db.close().await;
}
