#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{collections::BTreeSet, sync::Arc};

use tablesync_core::{
    AllowAll, ColumnSpec, ConflictPolicy, EngineConfig, EngineError, ErrorKind, MemoryStore,
    Principal, RowUpdate, StorageLocation, SyncEngine, TableIdentity,
};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("name", "string"),
        ColumnSpec::new("age", "integer"),
    ]
}

fn user() -> Principal {
    Principal::new("alice")
}

async fn engine_with(config: EngineConfig) -> Result<(SyncEngine, TableIdentity), EngineError> {
    let engine = SyncEngine::open(
        StorageLocation::memory(MemoryStore::new()),
        config,
        Arc::new(AllowAll),
    )
    .await?;
    let table = engine.create_table(&user(), "app", "people", &columns()).await?;
    Ok((engine, table))
}

#[tokio::test]
async fn update_then_stale_update_then_delete() -> TestResult {
    let (engine, table) = engine_with(EngineConfig::default()).await?;
    let who = user();

    let v1 = engine
        .create_or_update_row(
            &who,
            &table,
            RowUpdate::new("r1").value("name", "A").value("age", "1"),
        )
        .await?;
    let d1 = v1.data_etag_at_modification.clone();

    let v2 = engine
        .create_or_update_row(&who, &table, v1.to_update().value("age", "2"))
        .await?;
    assert_ne!(v2.row_etag, v1.row_etag);
    assert_ne!(v2.data_etag_at_modification, d1);

    let page = engine
        .get_rows_since(&who, &table, None, None, Some(10))
        .await?;
    assert_eq!(page.rows, vec![v2.clone()]);
    assert!(!page.has_more_results);

    let err = engine
        .create_or_update_row(&who, &table, v1.to_update().value("age", "3"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    assert_eq!(engine.get_row(&who, &table, "r1").await?, v2);

    let tombstone = engine
        .delete_row(&who, &table, "r1", Some(v2.row_etag.clone()))
        .await?;
    assert!(tombstone.deleted);
    assert_ne!(tombstone.data_etag_at_modification, v2.data_etag_at_modification);

    let dead = engine
        .get_change_set_rows(&who, &table, &d1, false, None, None)
        .await?;
    assert_eq!(dead.rows, vec![tombstone]);
    let live = engine
        .get_change_set_rows(&who, &table, &d1, true, None, None)
        .await?;
    assert!(live.rows.is_empty());
    Ok(())
}

#[tokio::test]
async fn racing_writers_with_the_same_etag_under_reject() -> TestResult {
    let (engine, table) = engine_with(EngineConfig::default()).await?;
    let who = user();
    let base = engine
        .create_or_update_row(&who, &table, RowUpdate::new("r1").value("age", "1"))
        .await?;

    let left = engine.create_or_update_row(&who, &table, base.to_update().value("age", "10"));
    let right = engine.create_or_update_row(&who, &table, base.to_update().value("age", "20"));
    let (left, right) = tokio::join!(left, right);

    let winners: Vec<_> = [&left, &right].into_iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let loser = [left.as_ref(), right.as_ref()]
        .into_iter()
        .find_map(|r| r.err())
        .unwrap();
    assert_eq!(loser.kind(), ErrorKind::VersionMismatch);

    // The stored row is the winner's write, and exactly one change set landed.
    assert_eq!(&engine.get_row(&who, &table, "r1").await?, winners[0]);
    assert_eq!(engine.version(&who, &table).await?.sequence_value, 2);
    Ok(())
}

#[tokio::test]
async fn racing_writers_under_preserve_conflicts_leave_a_pair() -> TestResult {
    let config = EngineConfig::default().with_conflict_policy(ConflictPolicy::PreserveConflicts);
    let (engine, table) = engine_with(config).await?;
    let who = user();
    let base = engine
        .create_or_update_row(&who, &table, RowUpdate::new("r1").value("age", "1"))
        .await?;

    let (left, right) = tokio::join!(
        engine.create_or_update_row(&who, &table, base.to_update().value("age", "10")),
        engine.create_or_update_row(&who, &table, base.to_update().value("age", "20")),
    );
    assert_eq!(usize::from(left.is_ok()) + usize::from(right.is_ok()), 1);
    let loser = left.err().or(right.err()).unwrap();
    assert_eq!(loser.kind(), ErrorKind::Conflict);

    let pairs = engine.conflicts(&who, &table).await?;
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].row_id, "r1");
    Ok(())
}

#[tokio::test]
async fn data_etags_are_never_repeated() -> TestResult {
    let (engine, table) = engine_with(EngineConfig::default()).await?;
    let who = user();
    let mut seen = BTreeSet::new();
    let mut row = engine
        .create_or_update_row(&who, &table, RowUpdate::new("r").value("age", "0"))
        .await?;
    assert!(seen.insert(row.data_etag_at_modification.clone()));
    for age in 1..6 {
        row = engine
            .create_or_update_row(&who, &table, row.to_update().value("age", age.to_string()))
            .await?;
        assert!(seen.insert(row.data_etag_at_modification.clone()));
    }

    let list = engine
        .get_change_sets_since(&who, &table, None, None)
        .await?;
    assert_eq!(list.change_sets.len(), 6);
    assert_eq!(list.change_sets.into_iter().collect::<BTreeSet<_>>(), seen);
    Ok(())
}

#[tokio::test]
async fn restart_discards_an_unpublished_change_set() -> TestResult {
    let tmp = TempDir::new()?;
    let location = StorageLocation::local(tmp.path());
    let who = user();

    let (table, row) = {
        let engine =
            SyncEngine::open(location.clone(), EngineConfig::default(), Arc::new(AllowAll)).await?;
        let table = engine.create_table(&who, "app", "people", &columns()).await?;
        let row = engine
            .create_or_update_row(&who, &table, RowUpdate::new("r1").value("age", "1"))
            .await?;
        (table, row)
    };

    // A change set written but never published by CURRENT.
    let log_dir = tmp
        .path()
        .join("app/people")
        .join(table.schema_etag.as_str())
        .join("_sync_log");
    let pending = log_dir.join(format!("{:010}.json", 2));
    std::fs::write(&pending, b"{\"half\":")?;

    let engine = SyncEngine::open(location, EngineConfig::default(), Arc::new(AllowAll)).await?;
    assert!(!pending.exists());
    assert_eq!(engine.get_row(&who, &table, "r1").await?, row);

    let next = engine
        .create_or_update_row(&who, &table, row.to_update().value("age", "2"))
        .await?;
    assert_eq!(engine.version(&who, &table).await?.sequence_value, 2);
    assert_eq!(
        engine.version(&who, &table).await?.data_etag,
        Some(next.data_etag_at_modification)
    );
    Ok(())
}
