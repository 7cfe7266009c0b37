//! Failover and transaction-replay behavior across scripted server pairs.

mod common;

use common::{spawn, Reply, Request};
use mariadb_ha::{Error, HaDataSource, HaDataSourceOptions, HaMode, HostAddress};
use std::sync::Arc;

fn two_host_options(port1: u16, port2: u16) -> HaDataSourceOptions {
    HaDataSourceOptions {
        hosts: vec![
            HostAddress::new("127.0.0.1", port1),
            HostAddress::new("127.0.0.1", port2),
        ],
        username: "app".to_string(),
        password: Some("secret".to_string()),
        database: Some("test".to_string()),
        ha_mode: HaMode::Sequential,
        ..Default::default()
    }
}

/// Primary dies mid-transaction; with replay enabled the prior statements
/// are re-applied exactly once each, in original order, on the new host,
/// and the in-flight statement completes.
#[tokio::test]
async fn failover_replays_transaction_in_order() {
    // first server drops the connection when the second insert arrives
    let server1 = spawn(Arc::new(|_, req| match req {
        Request::Query(sql) if sql.contains("(2)") => Reply::Disconnect,
        _ => Reply::Ok {
            affected: 1,
            last_insert_id: 0,
        },
    }))
    .await;
    let server2 = spawn(Arc::new(|_, _| Reply::Ok {
        affected: 1,
        last_insert_id: 0,
    }))
    .await;

    let options = HaDataSourceOptions {
        transaction_replay: true,
        ..two_host_options(server1.port, server2.port)
    };
    let ds = HaDataSource::new(options).unwrap();
    let mut conn = ds.get_connection().await.unwrap();

    conn.begin_transaction().await.unwrap();
    conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    // the connection dies here; replay + retry make it invisible
    conn.execute("INSERT INTO t VALUES (2)", &[]).await.unwrap();
    conn.commit().await.unwrap();

    let replayed: Vec<String> = server2
        .log_snapshot()
        .into_iter()
        .filter(|e| e.starts_with("QUERY") && !e.contains("SET "))
        .collect();
    assert_eq!(
        replayed,
        vec![
            "QUERY BEGIN".to_string(),
            "QUERY INSERT INTO t VALUES (1)".to_string(),
            "QUERY INSERT INTO t VALUES (2)".to_string(),
            "QUERY COMMIT".to_string(),
        ]
    );
    // each prior statement was applied exactly once on the new connection
    assert_eq!(server2.count_logged("QUERY INSERT INTO t VALUES (1)"), 1);
    // session state was restored before anything else ran
    assert!(server2.log_snapshot()[0].contains("SET "));
}

/// With replay disabled the caller sees the loss, nothing continues
/// silently, and the connection is still usable afterwards.
#[tokio::test]
async fn failover_without_replay_surfaces_connection_loss() {
    let server1 = spawn(Arc::new(|_, req| match req {
        Request::Query(sql) if sql.contains("(2)") => Reply::Disconnect,
        _ => Reply::Ok {
            affected: 1,
            last_insert_id: 0,
        },
    }))
    .await;
    let server2 = spawn(Arc::new(|_, _| Reply::Ok {
        affected: 1,
        last_insert_id: 0,
    }))
    .await;

    let ds = HaDataSource::new(two_host_options(server1.port, server2.port)).unwrap();
    let mut conn = ds.get_connection().await.unwrap();

    conn.begin_transaction().await.unwrap();
    conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    let err = conn
        .execute("INSERT INTO t VALUES (2)", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)), "got {err:?}");

    // nothing of the dead transaction leaked onto the new host
    assert_eq!(server2.count_logged("QUERY INSERT"), 0);
    assert_eq!(server2.count_logged("QUERY BEGIN"), 0);

    // but the logical connection recovered onto the second host
    conn.execute("INSERT INTO t VALUES (3)", &[]).await.unwrap();
    assert_eq!(server2.count_logged("QUERY INSERT INTO t VALUES (3)"), 1);
}

/// Outside a transaction, a lost connection is retried transparently when
/// replay is enabled.
#[tokio::test]
async fn autocommit_statement_retries_on_new_host() {
    let server1 = spawn(Arc::new(|_, req| match req {
        Request::Query(sql) if sql.contains("INSERT") => Reply::Disconnect,
        _ => Reply::Ok {
            affected: 1,
            last_insert_id: 0,
        },
    }))
    .await;
    let server2 = spawn(Arc::new(|_, _| Reply::Ok {
        affected: 1,
        last_insert_id: 0,
    }))
    .await;

    let options = HaDataSourceOptions {
        transaction_replay: true,
        ..two_host_options(server1.port, server2.port)
    };
    let ds = HaDataSource::new(options).unwrap();
    let mut conn = ds.get_connection().await.unwrap();

    let affected = conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
    assert_eq!(affected, 1);
    assert_eq!(server2.count_logged("QUERY INSERT"), 1);
}

/// The statement cache is invalidated wholesale on failover: the same SQL
/// is prepared again on the new physical connection.
#[tokio::test]
async fn cache_invalidated_on_failover() {
    let server1 = spawn(Arc::new(|_, req| match req {
        Request::Query(sql) if sql.contains("poison") => Reply::Disconnect,
        Request::Execute(_) => Reply::Ok {
            affected: 1,
            last_insert_id: 0,
        },
        _ => Reply::Ok {
            affected: 0,
            last_insert_id: 0,
        },
    }))
    .await;
    let server2 = spawn(Arc::new(|_, req| match req {
        Request::Execute(_) => Reply::Ok {
            affected: 1,
            last_insert_id: 0,
        },
        _ => Reply::Ok {
            affected: 0,
            last_insert_id: 0,
        },
    }))
    .await;

    let options = HaDataSourceOptions {
        transaction_replay: true,
        ..two_host_options(server1.port, server2.port)
    };
    let ds = HaDataSource::new(options).unwrap();
    let mut conn = ds.get_connection().await.unwrap();

    let sql = "INSERT INTO t (a) VALUES (?)";
    conn.execute(sql, &[mariadb_ha::Value::Int64(1)]).await.unwrap();
    assert_eq!(server1.count_logged("PREPARE"), 1);

    // kill the physical connection, then reuse the same SQL
    let _ = conn.execute("SELECT poison", &[]).await;
    conn.execute(sql, &[mariadb_ha::Value::Int64(2)]).await.unwrap();

    // a fresh prepare happened on the new connection
    assert_eq!(server2.count_logged("PREPARE"), 1);
    assert_eq!(server2.count_logged("EXECUTE"), 1);
}

#[tokio::test]
async fn all_hosts_failed_aggregates_attempts() {
    // claim two ports, then close them so connects are refused
    let l1 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let l2 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (p1, p2) = (
        l1.local_addr().unwrap().port(),
        l2.local_addr().unwrap().port(),
    );
    drop((l1, l2));

    let ds = HaDataSource::new(two_host_options(p1, p2)).unwrap();
    match ds.get_connection().await {
        Err(Error::AllHostsFailed(failures)) => {
            assert_eq!(failures.len(), 2);
            assert!(failures[0].host.contains(&p1.to_string()));
            assert!(failures[1].host.contains(&p2.to_string()));
        }
        other => panic!("expected AllHostsFailed, got {other:?}"),
    }
}

/// Sequential mode sticks to the first host while it is healthy.
#[tokio::test]
async fn sequential_mode_prefers_first_host() {
    let server1 = spawn(Arc::new(|_, _| Reply::Ok {
        affected: 1,
        last_insert_id: 0,
    }))
    .await;
    let server2 = spawn(Arc::new(|_, _| Reply::Ok {
        affected: 1,
        last_insert_id: 0,
    }))
    .await;

    let ds = HaDataSource::new(two_host_options(server1.port, server2.port)).unwrap();
    let mut conn = ds.get_connection().await.unwrap();
    conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();

    assert!(server1.count_logged("QUERY INSERT") == 1);
    assert!(server2.log_snapshot().is_empty());
}
