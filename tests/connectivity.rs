//! End-to-end coverage of connect, query, cache and cancellation behavior
//! against the scripted mock server.

mod common;

use common::{spawn, Reply, Request};
use mariadb_ha::{Error, HaDataSource, HaDataSourceOptions, HostAddress, Value};
use std::sync::Arc;

fn options_for(port: u16) -> HaDataSourceOptions {
    HaDataSourceOptions {
        hosts: vec![HostAddress::new("127.0.0.1", port)],
        username: "app".to_string(),
        password: Some("secret".to_string()),
        database: Some("test".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn connect_and_query_text_rows() {
    let server = spawn(Arc::new(|_, req| match req {
        Request::Query(sql) if sql.contains("SELECT") => Reply::Rows {
            columns: vec![("value".to_string(), 0x08)],
            rows: vec![vec![Some("1".to_string())]],
        },
        _ => Reply::Ok {
            affected: 0,
            last_insert_id: 0,
        },
    }))
    .await;

    let ds = HaDataSource::new(options_for(server.port)).unwrap();
    let mut conn = ds.get_connection().await.unwrap();
    assert_eq!(conn.server_version(), "11.4.2-MariaDB-mock");

    let result = conn.query("SELECT 1 as value", &[]).await.unwrap();
    assert_eq!(result.columns, vec!["value"]);
    assert_eq!(result.rows, vec![vec![Value::Int64(1)]]);

    conn.close().await.unwrap();
}

#[tokio::test]
async fn server_error_keeps_connection_usable() {
    let server = spawn(Arc::new(|_, req| match req {
        Request::Query(sql) if sql.contains("broken") => Reply::Err {
            code: 1146,
            state: "42S02".to_string(),
            message: "Table 'test.broken' doesn't exist".to_string(),
        },
        _ => Reply::Ok {
            affected: 1,
            last_insert_id: 0,
        },
    }))
    .await;

    let ds = HaDataSource::new(options_for(server.port)).unwrap();
    let mut conn = ds.get_connection().await.unwrap();

    let err = conn.query("SELECT * FROM broken", &[]).await.unwrap_err();
    match &err {
        Error::Server {
            code, sql_state, ..
        } => {
            assert_eq!(*code, 1146);
            assert_eq!(sql_state, "42S02");
        }
        other => panic!("expected server error, got {other:?}"),
    }
    assert_eq!(err.sql_state(), "42S02");
    assert_eq!(err.error_code(), Some(1146));

    // a non-fatal server error must not cost the connection
    let affected = conn.execute("DELETE FROM ok_table", &[]).await.unwrap();
    assert_eq!(affected, 1);
}

#[tokio::test]
async fn statement_cache_prepares_once_per_connection() {
    let server = spawn(Arc::new(|_, req| match req {
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

    let ds = HaDataSource::new(options_for(server.port)).unwrap();
    let mut conn = ds.get_connection().await.unwrap();

    let sql = "INSERT INTO t (a) VALUES (?)";
    conn.execute(sql, &[Value::Int64(1)]).await.unwrap();
    conn.execute(sql, &[Value::Int64(2)]).await.unwrap();
    conn.execute(sql, &[Value::Int64(3)]).await.unwrap();

    // one network prepare, three executions
    assert_eq!(server.count_logged("PREPARE"), 1);
    assert_eq!(server.count_logged("EXECUTE"), 3);
}

#[tokio::test]
async fn zero_cache_capacity_prepares_every_time() {
    let server = spawn(Arc::new(|_, req| match req {
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
        prepare_cache_size: 0,
        ..options_for(server.port)
    };
    let ds = HaDataSource::new(options).unwrap();
    let mut conn = ds.get_connection().await.unwrap();

    let sql = "INSERT INTO t (a) VALUES (?)";
    conn.execute(sql, &[Value::Int64(1)]).await.unwrap();
    conn.execute(sql, &[Value::Int64(2)]).await.unwrap();

    assert_eq!(server.count_logged("PREPARE"), 2);
}

#[tokio::test]
async fn timestamp_bind_of_integer_is_rejected_locally() {
    let server = spawn(Arc::new(|_, req| match req {
        // parameters of this statement target a TIMESTAMP column
        Request::Prepare(_) => Reply::Prepared {
            param_types: vec![0x07, 0x07, 0x07],
        },
        _ => Reply::Ok {
            affected: 1,
            last_insert_id: 0,
        },
    }))
    .await;

    let ds = HaDataSource::new(options_for(server.port)).unwrap();
    let mut conn = ds.get_connection().await.unwrap();

    for params in [
        vec![Value::Int64(1), Value::Int64(9223372036854775807), Value::Int64(-9)],
        vec![
            Value::Text("1".into()),
            Value::Text("9223372036854775807".into()),
            Value::Text("-9".into()),
        ],
        vec![
            Value::Decimal("1".into()),
            Value::Decimal("9223372036854775807".into()),
            Value::Decimal("-9".into()),
        ],
        vec![Value::Double(127.0), Value::Double(-128.0), Value::Double(0.0)],
    ] {
        let err = conn
            .execute("INSERT INTO TimestampParam VALUES (?,?,?)", &params)
            .await
            .unwrap_err();
        assert_eq!(err.sql_state(), "22007", "params {params:?}");
    }

    // the rejection is local: the statement was prepared but never executed
    assert_eq!(server.count_logged("EXECUTE"), 0);

    // proper calendar values pass through
    let dt = Value::DateTime(
        chrono::NaiveDate::from_ymd_opt(2018, 12, 15)
            .unwrap()
            .and_hms_micro_opt(5, 8, 10, 123_456)
            .unwrap(),
    );
    conn.execute(
        "INSERT INTO TimestampParam VALUES (?,?,?)",
        &[dt.clone(), dt.clone(), dt],
    )
    .await
    .unwrap();
    assert_eq!(server.count_logged("EXECUTE"), 1);
}

#[tokio::test]
async fn bind_count_mismatch_fails_before_sending() {
    let server = spawn(Arc::new(|_, _| Reply::Ok {
        affected: 0,
        last_insert_id: 0,
    }))
    .await;

    let ds = HaDataSource::new(options_for(server.port)).unwrap();
    let mut conn = ds.get_connection().await.unwrap();

    let err = conn
        .execute("INSERT INTO t VALUES (?, ?)", &[Value::Int64(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Bind { .. }));
    assert_eq!(server.count_logged("PREPARE"), 0);
    assert_eq!(server.count_logged("EXECUTE"), 0);
}

#[tokio::test]
async fn cancelled_row_stream_leaves_connection_usable() {
    let big: Vec<Vec<Option<String>>> =
        (0..500).map(|i| vec![Some(i.to_string())]).collect();
    let server = spawn(Arc::new(move |_, req| match req {
        Request::Query(sql) if sql.contains("events") => Reply::Rows {
            columns: vec![("id".to_string(), 0x08)],
            rows: big.clone(),
        },
        _ => Reply::Ok {
            affected: 9,
            last_insert_id: 0,
        },
    }))
    .await;

    let ds = HaDataSource::new(options_for(server.port)).unwrap();
    let mut conn = ds.get_connection().await.unwrap();

    // consume three rows, then abandon the stream
    {
        let mut stream = conn.query_stream("SELECT id FROM events", &[]).await.unwrap();
        for i in 0..3 {
            let row = stream.next().await.unwrap().unwrap();
            assert_eq!(row.get(0), Some(&Value::Int64(i)));
        }
        stream.cancel().await.unwrap();
    }

    // an immediately following unrelated command must work
    let affected = conn.execute("UPDATE t SET a=1", &[]).await.unwrap();
    assert_eq!(affected, 9);

    // dropping the stream without explicit cancel also recovers
    {
        let mut stream = conn.query_stream("SELECT id FROM events", &[]).await.unwrap();
        let _ = stream.next().await.unwrap();
    }
    let affected = conn.execute("UPDATE t SET a=2", &[]).await.unwrap();
    assert_eq!(affected, 9);
}

#[tokio::test]
async fn streamed_rows_arrive_on_demand() {
    let server = spawn(Arc::new(|_, req| match req {
        Request::Query(_) => Reply::Rows {
            columns: vec![
                ("id".to_string(), 0x08),
                ("name".to_string(), 0xFD),
            ],
            rows: vec![
                vec![Some("1".to_string()), Some("ada".to_string())],
                vec![Some("2".to_string()), None],
            ],
        },
        _ => Reply::Ok {
            affected: 0,
            last_insert_id: 0,
        },
    }))
    .await;

    let ds = HaDataSource::new(options_for(server.port)).unwrap();
    let mut conn = ds.get_connection().await.unwrap();

    let mut stream = conn.query_stream("SELECT id, name FROM users", &[]).await.unwrap();
    assert_eq!(stream.columns().len(), 2);
    assert_eq!(stream.columns()[1].name, "name");

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.get_by_name("id"), Some(&Value::Int64(1)));
    assert_eq!(first.get_by_name("name"), Some(&Value::Text("ada".to_string())));

    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.get(1), Some(&Value::Null));

    assert!(stream.next().await.unwrap().is_none());
    assert!(!stream.next_result().await.unwrap());
}
