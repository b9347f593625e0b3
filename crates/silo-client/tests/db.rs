mod support;

use silo_client::db::{DbIterator, DbType, DbValue, Entry, Schema, Selector, SelectorMode, SelectorOp};
use silo_client::semantics::Template;
use silo_client::{Client, Error};

async fn create_variables_schema(client: &Client) -> Schema {
    let mut batch = client.batch(Template::Default);

    let schema = Schema::new("adios2", "variables").unwrap();
    schema.add_field("file", DbType::String).unwrap();
    schema.add_field("name", DbType::String).unwrap();
    schema.add_field("dimensions", DbType::Uint64).unwrap();
    schema.add_field("min", DbType::Float64).unwrap();
    schema.add_field("max", DbType::Float64).unwrap();
    schema.add_index(&["file"]).unwrap();
    schema.add_index(&["name"]).unwrap();

    schema.create(&mut batch).unwrap();
    batch.execute().await.unwrap();
    schema
}

fn file_selector(schema: &Schema, file: &str) -> Selector {
    let mut selector = Selector::new(schema, SelectorMode::And);
    selector.add_field("file", SelectorOp::Eq, file).unwrap();
    selector
}

#[tokio::test]
async fn schema_round_trip() {
    let client = support::cluster(1, 1, 1).await;
    let schema = create_variables_schema(&client).await;
    let mut batch = client.batch(Template::Default);

    // Insert one row.
    let entry = Entry::new(&schema);
    entry.set_field("file", "demo.bp").unwrap();
    entry.set_field("name", "temperature").unwrap();
    entry.set_field("dimensions", 4u64).unwrap();
    entry.set_field("min", 1.0f64).unwrap();
    entry.set_field("max", 42.0f64).unwrap();
    entry.insert(&mut batch).unwrap();
    batch.execute().await.unwrap();
    let id = entry.id().unwrap();
    assert!(id > 0);

    // Query it back by file.
    let selector = file_selector(&schema, "demo.bp");
    let mut iterator = DbIterator::new(&client, &schema, Some(&selector))
        .await
        .unwrap();

    let mut rows = 0;
    while iterator.next().await.unwrap() {
        rows += 1;
        let (db_type, value) = iterator.get_field("name").unwrap();
        assert_eq!(db_type, DbType::String);
        assert_eq!(value, DbValue::String("temperature".to_string()));

        let (db_type, value) = iterator.get_field("dimensions").unwrap();
        assert_eq!(db_type, DbType::Uint64);
        assert_eq!(value, DbValue::Uint64(4));

        let (_, value) = iterator.get_field("min").unwrap();
        assert_eq!(value, DbValue::Float64(1.0));
        let (_, value) = iterator.get_field("max").unwrap();
        assert_eq!(value, DbValue::Float64(42.0));

        assert_eq!(iterator.id().unwrap(), id);
    }
    assert_eq!(rows, 1);

    // Update min/max through a selector on file and name.
    let mut selector = file_selector(&schema, "demo.bp");
    selector
        .add_field("name", SelectorOp::Eq, "temperature")
        .unwrap();

    let update = Entry::new(&schema);
    update.set_field("min", 2.0f64).unwrap();
    update.set_field("max", 22.0f64).unwrap();
    update.update(&selector, &mut batch).unwrap();
    batch.execute().await.unwrap();

    let mut iterator = DbIterator::new(&client, &schema, Some(&selector))
        .await
        .unwrap();
    assert!(iterator.next().await.unwrap());
    assert_eq!(iterator.get_field("min").unwrap().1, DbValue::Float64(2.0));
    assert_eq!(iterator.get_field("max").unwrap().1, DbValue::Float64(22.0));
    assert!(!iterator.next().await.unwrap());

    // Delete the row; the query comes back empty.
    let remover = Entry::new(&schema);
    remover.delete(&selector, &mut batch).unwrap();
    batch.execute().await.unwrap();

    let mut iterator = DbIterator::new(&client, &schema, Some(&selector))
        .await
        .unwrap();
    assert!(!iterator.next().await.unwrap());

    // Drop the schema.
    schema.delete(&mut batch).unwrap();
    batch.execute().await.unwrap();
}

#[tokio::test]
async fn server_side_schema_rejects_mutation() {
    let client = support::cluster(1, 1, 1).await;
    let schema = create_variables_schema(&client).await;

    assert!(matches!(
        schema.add_field("extra", DbType::Uint32),
        Err(Error::State(_)),
    ));
    assert!(matches!(
        schema.add_index(&["file"]),
        Err(Error::State(_)),
    ));
}

#[tokio::test]
async fn fetch_retrieves_the_server_side_definition() {
    let client = support::cluster(1, 1, 1).await;
    let created = create_variables_schema(&client).await;
    let mut batch = client.batch(Template::Default);

    let fetched = Schema::new("adios2", "variables").unwrap();
    fetched.fetch(&mut batch).unwrap();
    batch.execute().await.unwrap();

    assert!(fetched.is_server_side());
    assert!(created.equals(&fetched));
    assert_eq!(fetched.field_type("min"), Some(DbType::Float64));
    assert_eq!(fetched.fields().len(), 5);

    // Fetching a schema that does not exist fails at execute time.
    let missing = Schema::new("adios2", "nonexistent").unwrap();
    missing.fetch(&mut batch).unwrap();
    assert!(matches!(
        batch.execute().await,
        Err(Error::NotFound(_)),
    ));
}

#[tokio::test]
async fn create_existing_schema_reports_exists() {
    let client = support::cluster(1, 1, 1).await;
    let _first = create_variables_schema(&client).await;
    let mut batch = client.batch(Template::Default);

    let duplicate = Schema::new("adios2", "variables").unwrap();
    duplicate.add_field("file", DbType::String).unwrap();
    duplicate.create(&mut batch).unwrap();
    assert!(matches!(
        batch.execute().await,
        Err(Error::Exists(_)),
    ));
}

#[tokio::test]
async fn operators_filter_rows() {
    let client = support::cluster(1, 1, 1).await;
    let schema = create_variables_schema(&client).await;
    let mut batch = client.batch(Template::Default);

    for (name, dimensions) in [("a", 1u64), ("b", 2), ("c", 3), ("d", 4)] {
        let entry = Entry::new(&schema);
        entry.set_field("file", "ops.bp").unwrap();
        entry.set_field("name", name).unwrap();
        entry.set_field("dimensions", dimensions).unwrap();
        entry.set_field("min", 0.0f64).unwrap();
        entry.set_field("max", 1.0f64).unwrap();
        entry.insert(&mut batch).unwrap();
    }
    batch.execute().await.unwrap();

    let count = |op: SelectorOp, dimensions: u64| {
        let client = client.clone();
        let schema = schema.clone();
        async move {
            let mut selector = Selector::new(&schema, SelectorMode::And);
            selector
                .add_field("dimensions", op, dimensions)
                .unwrap();
            let mut iterator = DbIterator::new(&client, &schema, Some(&selector))
                .await
                .unwrap();
            let mut rows = 0;
            while iterator.next().await.unwrap() {
                rows += 1;
            }
            rows
        }
    };

    assert_eq!(count(SelectorOp::Eq, 2).await, 1);
    assert_eq!(count(SelectorOp::Ne, 2).await, 3);
    assert_eq!(count(SelectorOp::Lt, 3).await, 2);
    assert_eq!(count(SelectorOp::Le, 3).await, 3);
    assert_eq!(count(SelectorOp::Gt, 3).await, 1);
    assert_eq!(count(SelectorOp::Ge, 3).await, 2);
}

#[tokio::test]
async fn or_mode_and_nested_selectors() {
    let client = support::cluster(1, 1, 1).await;
    let schema = create_variables_schema(&client).await;
    let mut batch = client.batch(Template::Default);

    for name in ["x", "y", "z"] {
        let entry = Entry::new(&schema);
        entry.set_field("file", "or.bp").unwrap();
        entry.set_field("name", name).unwrap();
        entry.set_field("dimensions", 1u64).unwrap();
        entry.set_field("min", 0.0f64).unwrap();
        entry.set_field("max", 1.0f64).unwrap();
        entry.insert(&mut batch).unwrap();
    }
    batch.execute().await.unwrap();

    // file == "or.bp" AND (name == "x" OR name == "z")
    let mut names = Selector::new(&schema, SelectorMode::Or);
    names.add_field("name", SelectorOp::Eq, "x").unwrap();
    names.add_field("name", SelectorOp::Eq, "z").unwrap();

    let mut selector = file_selector(&schema, "or.bp");
    selector.add_selector(names).unwrap();

    let mut iterator = DbIterator::new(&client, &schema, Some(&selector))
        .await
        .unwrap();
    let mut seen = Vec::new();
    while iterator.next().await.unwrap() {
        let (_, value) = iterator.get_field("name").unwrap();
        let DbValue::String(name) = value else { panic!() };
        seen.push(name);
    }
    assert_eq!(seen, vec!["x".to_string(), "z".to_string()]);
}

#[tokio::test]
async fn query_by_row_id() {
    let client = support::cluster(1, 1, 1).await;
    let schema = create_variables_schema(&client).await;
    let mut batch = client.batch(Template::Default);

    let entry = Entry::new(&schema);
    entry.set_field("file", "id.bp").unwrap();
    entry.set_field("name", "pressure").unwrap();
    entry.set_field("dimensions", 2u64).unwrap();
    entry.set_field("min", 0.5f64).unwrap();
    entry.set_field("max", 9.5f64).unwrap();
    entry.insert(&mut batch).unwrap();
    batch.execute().await.unwrap();
    let id = entry.id().unwrap();

    let mut selector = Selector::new(&schema, SelectorMode::And);
    selector.add_field("_id", SelectorOp::Eq, id).unwrap();

    let mut iterator = DbIterator::new(&client, &schema, Some(&selector))
        .await
        .unwrap();
    assert!(iterator.next().await.unwrap());
    // Every declared field reads back what set_field stored.
    assert_eq!(
        iterator.get_field("file").unwrap().1,
        DbValue::String("id.bp".to_string()),
    );
    assert_eq!(
        iterator.get_field("name").unwrap().1,
        DbValue::String("pressure".to_string()),
    );
    assert_eq!(iterator.get_field("dimensions").unwrap().1, DbValue::Uint64(2));
    assert_eq!(iterator.get_field("min").unwrap().1, DbValue::Float64(0.5));
    assert_eq!(iterator.get_field("max").unwrap().1, DbValue::Float64(9.5));
    assert!(!iterator.next().await.unwrap());
}

#[tokio::test]
async fn grouped_inserts_share_one_round_trip_and_all_land() {
    let client = support::cluster(1, 1, 1).await;
    let schema = create_variables_schema(&client).await;
    let mut batch = client.batch(Template::Default);

    // Adjacent inserts into one schema coalesce into a single message.
    let entries: Vec<Entry> = (0..10)
        .map(|i| {
            let entry = Entry::new(&schema);
            entry.set_field("file", "bulk.bp").unwrap();
            entry.set_field("name", &*format!("var-{i}")).unwrap();
            entry.set_field("dimensions", i as u64).unwrap();
            entry.set_field("min", 0.0f64).unwrap();
            entry.set_field("max", 0.0f64).unwrap();
            entry.insert(&mut batch).unwrap();
            entry
        })
        .collect();
    batch.execute().await.unwrap();

    // Ids are assigned in program order.
    let ids: Vec<u64> = entries.iter().map(|e| e.id().unwrap()).collect();
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1]);
    }

    let selector = file_selector(&schema, "bulk.bp");
    let mut iterator = DbIterator::new(&client, &schema, Some(&selector))
        .await
        .unwrap();
    let mut rows = 0;
    while iterator.next().await.unwrap() {
        rows += 1;
    }
    assert_eq!(rows, 10);
}

#[tokio::test]
async fn update_and_delete_require_matching_schema() {
    let client = support::cluster(1, 1, 1).await;
    let schema = create_variables_schema(&client).await;

    let other = Schema::new("adios2", "other").unwrap();
    other.add_field("file", DbType::String).unwrap();

    let selector = file_selector(&other, "demo.bp");
    let entry = Entry::new(&schema);
    entry.set_field("min", 0.0f64).unwrap();

    let mut batch = client.batch(Template::Default);
    assert!(matches!(
        entry.update(&selector, &mut batch),
        Err(Error::Invalid(_)),
    ));
    assert!(matches!(
        entry.delete(&selector, &mut batch),
        Err(Error::Invalid(_)),
    ));
}
