//! Database writer tests against a real SQLite target

mod common;

use anyhow::Result;
use commerce_sync::writer::{ConflictPolicy, DatabaseWriter, UpsertOptions};
use common::{column_values, count, row, setup_test_db};
use sea_orm::{ConnectionTrait, DatabaseConnection};
use serde_json::json;
use std::collections::HashSet;

async fn create_items(db: &DatabaseConnection) -> Result<()> {
    db.execute_unprepared(
        "CREATE TABLE items (
            sku TEXT PRIMARY KEY,
            qty INTEGER NOT NULL CHECK (qty >= 0),
            name TEXT,
            active BOOLEAN
        )",
    )
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_upsert_round_trip() -> Result<()> {
    let (db, _temp_file) = setup_test_db().await?;
    create_items(&db).await?;
    let writer = DatabaseWriter::for_connection(db.clone());
    let options = UpsertOptions::new("items", "sku");

    let first = writer
        .upsert(
            &options,
            &[row(&[("sku", json!("LMP-1")), ("qty", json!(1)), ("name", json!("Lamp"))])],
        )
        .await?;
    assert_eq!((first.inserted, first.updated), (1, 0));
    assert!(first.counts_exact);

    let second = writer
        .upsert(
            &options,
            &[row(&[("sku", json!("LMP-1")), ("qty", json!(5)), ("name", json!("Brass lamp"))])],
        )
        .await?;
    assert_eq!((second.inserted, second.updated), (0, 1));
    assert!(second.errors.is_empty());

    assert_eq!(count(&db, "items").await?, 1);
    assert_eq!(
        column_values(&db, "SELECT name AS v FROM items").await?,
        vec!["Brass lamp"]
    );
    Ok(())
}

#[tokio::test]
async fn test_skip_policy_keeps_existing_rows() -> Result<()> {
    let (db, _temp_file) = setup_test_db().await?;
    create_items(&db).await?;
    let writer = DatabaseWriter::for_connection(db.clone());

    let rows = [row(&[("sku", json!("A")), ("qty", json!(1)), ("name", json!("old"))])];
    writer.upsert(&UpsertOptions::new("items", "sku"), &rows).await?;

    let rows = [
        row(&[("sku", json!("A")), ("qty", json!(2)), ("name", json!("new"))]),
        row(&[("sku", json!("B")), ("qty", json!(3)), ("name", json!("other"))]),
    ];
    let result = writer
        .upsert(
            &UpsertOptions::new("items", "sku").on_conflict(ConflictPolicy::Skip),
            &rows,
        )
        .await?;
    assert_eq!((result.inserted, result.updated, result.skipped), (1, 0, 1));
    assert_eq!(
        column_values(&db, "SELECT name AS v FROM items ORDER BY sku").await?,
        vec!["old", "other"]
    );
    Ok(())
}

#[tokio::test]
async fn test_failing_chunk_reports_only_its_rows() -> Result<()> {
    let (db, _temp_file) = setup_test_db().await?;
    create_items(&db).await?;
    let writer = DatabaseWriter::for_connection(db.clone());

    let rows: Vec<_> = (0..6)
        .map(|i| {
            let qty = if i == 3 { -1 } else { i };
            row(&[("sku", json!(format!("SKU-{}", i))), ("qty", json!(qty))])
        })
        .collect();
    let result = writer
        .upsert(&UpsertOptions::new("items", "sku").chunk_size(2), &rows)
        .await?;

    let failed: Vec<usize> = result.errors.iter().map(|e| e.index).collect();
    assert_eq!(failed, vec![2, 3]);
    assert_eq!(result.inserted, 4);
    assert_eq!(count(&db, "items").await?, 4);
    Ok(())
}

#[tokio::test]
async fn test_delete_stale_with_empty_keys_is_a_no_op() -> Result<()> {
    let (db, _temp_file) = setup_test_db().await?;
    create_items(&db).await?;
    let writer = DatabaseWriter::for_connection(db.clone());

    let rows: Vec<_> = ["A", "B", "C"]
        .iter()
        .map(|sku| row(&[("sku", json!(sku)), ("qty", json!(1))]))
        .collect();
    writer.upsert(&UpsertOptions::new("items", "sku"), &rows).await?;

    assert_eq!(writer.delete_stale("items", "sku", &HashSet::new()).await?, 0);
    assert_eq!(count(&db, "items").await?, 3);

    let valid: HashSet<String> = ["A".to_string()].into_iter().collect();
    assert_eq!(writer.delete_stale("items", "sku", &valid).await?, 2);
    assert_eq!(
        column_values(&db, "SELECT sku AS v FROM items").await?,
        vec!["A"]
    );
    Ok(())
}

#[tokio::test]
async fn test_single_record_operations_and_lookup() -> Result<()> {
    let (db, _temp_file) = setup_test_db().await?;
    create_items(&db).await?;
    let writer = DatabaseWriter::for_connection(db.clone());

    let rows = [row(&[("sku", json!("A")), ("qty", json!(1)), ("name", json!("Lamp"))])];
    writer.upsert(&UpsertOptions::new("items", "sku"), &rows).await?;

    let changes = row(&[("name", json!("Desk lamp")), ("active", json!(true))]);
    assert_eq!(writer.update_by_key("items", "sku", &json!("A"), &changes).await?, 1);
    assert_eq!(writer.update_by_key("items", "sku", &json!("Z"), &changes).await?, 0);
    assert_eq!(
        writer.lookup("items", "sku", "name", &json!("A")).await?,
        Some(json!("Desk lamp"))
    );
    assert_eq!(writer.lookup("items", "sku", "name", &json!("Z")).await?, None);

    assert_eq!(writer.delete_by_key("items", "sku", &json!("A")).await?, 1);
    assert_eq!(count(&db, "items").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_invalid_identifiers_are_rejected() -> Result<()> {
    let (db, _temp_file) = setup_test_db().await?;
    create_items(&db).await?;
    let writer = DatabaseWriter::for_connection(db);

    let rows = [row(&[("sku", json!("A")), ("qty; DROP TABLE items", json!(1))])];
    let err = writer
        .upsert(&UpsertOptions::new("items", "sku"), &rows)
        .await
        .unwrap_err();
    assert!(err.is_client_error());
    Ok(())
}
