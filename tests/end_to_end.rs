//! Two processes' worth of façades sharing one database file.

mod common;

use std::time::Duration;

use common::{eventually, free_port, init_tracing, test_config};
use sqlite_share::{
    ConnectionState, FieldType, FieldValue, Role, ShareConfig, ShareConnection, ShareError,
};
use tempfile::TempDir;

fn config(dir: &TempDir, port: u16) -> ShareConfig {
    let mut config = test_config(port);
    config.data_source = dir.path().join("shared.db");
    config
}

async fn open_pair() -> (TempDir, ShareConnection, ShareConnection) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let port = free_port();

    let server = ShareConnection::open(config(&dir, port)).await.unwrap();
    let client = ShareConnection::open(config(&dir, port)).await.unwrap();
    assert_eq!(server.role(), Role::Server);
    assert_eq!(client.role(), Role::Client);

    (dir, server, client)
}

#[tokio::test]
async fn test_client_reads_rows_in_insertion_order() {
    let (_dir, server, client) = open_pair().await;

    server
        .create_command("create table items (name varchar, value integer)")
        .execute_non_query()
        .await
        .unwrap();

    let inserted = client
        .create_command("insert into items values ('a', 10); insert into items values ('b', 20)")
        .execute_non_query()
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    let select = client.create_command("select * from items");
    let mut reader = select.execute_reader().await.unwrap();
    assert_eq!(reader.field_count(), 2);
    assert_eq!(reader.get_name(0).unwrap(), "name");
    assert_eq!(reader.get_ordinal("VALUE").unwrap(), 1);

    assert!(reader.read().await.unwrap());
    assert_eq!(reader.get_string(0).unwrap(), "a");
    assert_eq!(reader.get_int64(1).unwrap(), 10);

    assert!(reader.read().await.unwrap());
    assert_eq!(reader.get_string(0).unwrap(), "b");
    assert_eq!(reader.get_int64(1).unwrap(), 20);
    assert_eq!(reader.get_int32(1).unwrap(), 20);
    assert_eq!(reader.get_int16(1).unwrap(), 20);
    assert_eq!(reader.get_double(1).unwrap(), 20.0);
    assert_eq!(reader.get_field_type(1).unwrap(), FieldType::Integer);
    assert_eq!(reader.get_data_type_name(1).await.unwrap(), "integer");
    assert_eq!(reader.get_table_name(0).unwrap(), None);

    assert!(!reader.read().await.unwrap());
    assert!(!reader.next_result().await.unwrap());

    select.dispose().await.unwrap();
}

#[tokio::test]
async fn test_multiple_result_sets_and_nulls() {
    let (_dir, server, client) = open_pair().await;

    server
        .create_command("create table t (id integer, note text); insert into t values (1, null)")
        .execute_non_query()
        .await
        .unwrap();

    let command = client.create_command("select note from t; select count(*) as n from t");
    let mut reader = command.execute_reader().await.unwrap();

    assert!(reader.read().await.unwrap());
    assert!(reader.is_null(0).unwrap());
    assert_eq!(reader.get_field_type(0).unwrap(), FieldType::Text);
    assert!(matches!(reader.get_string(0), Err(ShareError::Cast(_))));
    assert!(!reader.read().await.unwrap());

    assert!(reader.next_result().await.unwrap());
    assert_eq!(reader.get_name(0).unwrap(), "n");
    assert!(reader.read().await.unwrap());
    assert_eq!(reader.get_value(0).unwrap(), &FieldValue::Integer(1));

    assert!(!reader.next_result().await.unwrap());

    let scalar = client
        .create_command("select max(id) from t")
        .execute_scalar()
        .await
        .unwrap();
    assert_eq!(scalar, Some(FieldValue::Integer(1)));
}

#[tokio::test]
async fn test_remote_sql_error_surfaces_as_remote() {
    let (_dir, _server, client) = open_pair().await;

    let result = client
        .create_command("insert into nowhere values (1)")
        .execute_non_query()
        .await;
    match result {
        Err(ShareError::Remote(message)) => assert!(message.contains("nowhere"), "{}", message),
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_command_timeout_interrupts_server() {
    let (_dir, _server, client) = open_pair().await;

    let command = client
        .create_command(
            "with recursive c(x) as (select 1 union all select x + 1 from c) select count(*) from c",
        )
        .with_timeout(Duration::from_millis(300));

    let result = command.execute_reader().await;
    assert!(matches!(result, Err(ShareError::Timeout { .. })), "{:?}", result.err());

    // The engine is usable again afterwards.
    let value = client
        .create_command("select 41 + 1")
        .execute_scalar()
        .await
        .unwrap();
    assert_eq!(value, Some(FieldValue::Integer(42)));
}

#[tokio::test]
async fn test_cancel_running_command() {
    let (_dir, _server, client) = open_pair().await;

    let command = std::sync::Arc::new(
        client
            .create_command(
                "with recursive c(x) as (select 1 union all select x + 1 from c) select count(*) from c",
            )
            .with_timeout(Duration::ZERO),
    );

    let running = {
        let command = command.clone();
        tokio::spawn(async move { command.execute_reader().await })
    };

    let cancelled = eventually(|| {
        let command = command.clone();
        async move { command.cancel().await.unwrap_or(false) }
    })
    .await;
    assert!(cancelled);

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ShareError::Remote(_))));
}

#[tokio::test]
async fn test_advisory_lock_across_connections() {
    let (_dir, server, client) = open_pair().await;

    client.lock(Duration::from_secs(1)).await.unwrap();

    let result = server.lock(Duration::from_millis(200)).await;
    assert!(matches!(result, Err(ShareError::Remote(_))));

    client.unlock().await.unwrap();
    server.lock(Duration::from_millis(200)).await.unwrap();
    server.unlock().await.unwrap();
}

#[tokio::test]
async fn test_dropped_commands_are_disposed_on_server() {
    let (_dir, server, client) = open_pair().await;
    let database = server.database_server();

    let command = client.create_command("select 1 union all select 2");
    let mut reader = command.execute_reader().await.unwrap();
    assert!(database.command_count() >= 1);

    // The reader outlives its command and keeps the cursor alive.
    drop(command);
    assert!(reader.read().await.unwrap());
    assert_eq!(reader.get_int64(0).unwrap(), 1);

    drop(reader);
    assert!(eventually(|| async { database.command_count() == 0 }).await);

    // Same on the server's own side.
    let local = server.create_command("select 3");
    assert_eq!(local.execute_scalar().await.unwrap(), Some(FieldValue::Integer(3)));
    drop(local);
    assert!(eventually(|| async { database.command_count() == 0 }).await);
}

#[tokio::test]
async fn test_evicted_client_releases_lock_and_commands() {
    let (_dir, server, client) = open_pair().await;
    let database = server.database_server();

    client.lock(Duration::from_secs(1)).await.unwrap();
    let command = client.create_command("select 1");
    let reader = command.execute_reader().await.unwrap();
    assert!(database.is_locked());
    assert_eq!(database.command_count(), 1);

    client.close().await.unwrap();

    assert!(
        eventually(|| async { database.command_count() == 0 && !database.is_locked() }).await
    );
    server.lock(Duration::from_millis(500)).await.unwrap();
    server.unlock().await.unwrap();

    drop(reader);
    drop(command);
}

#[tokio::test]
async fn test_client_takes_over_when_server_leaves() {
    let (_dir, server, client) = open_pair().await;

    server
        .create_command("create table kv (k text, v integer); insert into kv values ('x', 1)")
        .execute_non_query()
        .await
        .unwrap();

    let command = client.create_command("select v from kv where k = 'x'");
    assert_eq!(command.execute_scalar().await.unwrap(), Some(FieldValue::Integer(1)));
    let epoch = client.epoch();

    server.close().await.unwrap();
    assert!(matches!(server.close().await, Err(ShareError::Closed)));

    assert!(
        eventually(|| async {
            client.state() == ConnectionState::Open && client.role() == Role::Server
        })
        .await
    );
    assert!(client.epoch() > epoch);

    // The command is re-created on the new server; the data is in the file.
    assert_eq!(command.execute_scalar().await.unwrap(), Some(FieldValue::Integer(1)));
}

#[tokio::test]
async fn test_closed_connection_rejects_work() {
    let (_dir, _server, client) = open_pair().await;

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);

    let result = client.create_command("select 1").execute_non_query().await;
    assert!(matches!(result, Err(ShareError::Closed)));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let config = ShareConfig::default().port(0);
    assert!(matches!(
        ShareConnection::open(config).await,
        Err(ShareError::Config(_))
    ));
}
