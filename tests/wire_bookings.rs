use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use roombook::engine::{AdmissionPolicy, Engine};
use roombook::store::LedgerStore;
use roombook::wire;

const H: i64 = 3_600_000;
const DAY: i64 = 1_767_225_600_000; // 2026-01-01T00:00:00Z

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roombook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(LedgerStore::open(&dir.join("bookings.wal")).unwrap());
    let engine = Arc::new(Engine::new(store, AdmissionPolicy::default()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "roombook".to_string()).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("roombook")
        .user("staff")
        .password("roombook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn insert_sql(room: Ulid, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO bookings (id, room_id, requester, purpose, start, "end") VALUES (NULL, '{room}', 'dosen-3', 'Networks lab', {start}, {end}) RETURNING *"#
    )
}

/// Rows of a simple query as (id, status, start, end).
async fn rows(client: &Client, sql: &str) -> Vec<(String, String, i64, i64)> {
    let messages = client.simple_query(sql).await.unwrap();
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some((
                row.get("id").unwrap().to_string(),
                row.get("status").unwrap().to_string(),
                row.get("start").unwrap().parse().unwrap(),
                row.get("end").unwrap().parse().unwrap(),
            )),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| panic!("expected a database error, got {err}"))
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_approve_and_conflict_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let room = Ulid::new();

    let created = rows(&client, &insert_sql(room, DAY + 10 * H, DAY + 11 * H)).await;
    assert_eq!(created.len(), 1);
    let (id, status, _, _) = &created[0];
    assert_eq!(status, "pending");

    client
        .simple_query(&format!(
            "UPDATE bookings SET status = 'approved' WHERE id = '{id}'"
        ))
        .await
        .unwrap();

    // Overlap is refused, adjacency is fine.
    assert_eq!(
        sqlstate(&client, &insert_sql(room, DAY + 10 * H + H / 2, DAY + 11 * H + H / 2)).await,
        "23P01"
    );
    rows(&client, &insert_sql(room, DAY + 11 * H, DAY + 12 * H)).await;

    // Second approval is an invalid state transition.
    assert_eq!(
        sqlstate(
            &client,
            &format!("UPDATE bookings SET status = 'approved' WHERE id = '{id}'")
        )
        .await,
        "55000"
    );

    let listed = rows(&client, &format!("SELECT * FROM bookings WHERE room_id = '{room}'")).await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].0, *id);
    assert_eq!(listed[0].1, "approved");
    assert_eq!(listed[1].1, "pending");
}

#[tokio::test]
async fn validation_and_not_found_map_to_sqlstates() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let room = Ulid::new();

    assert_eq!(sqlstate(&client, &insert_sql(room, DAY, DAY)).await, "22023");
    assert_eq!(
        sqlstate(
            &client,
            &format!("UPDATE bookings SET status = 'rejected' WHERE id = '{}'", Ulid::new())
        )
        .await,
        "P0002"
    );
    assert_eq!(sqlstate(&client, "DROP TABLE bookings").await, "42601");
    assert!(rows(&client, &format!("SELECT * FROM bookings WHERE room_id = '{room}'"))
        .await
        .is_empty());
}

#[tokio::test]
async fn reject_frees_slot_and_check_schedule_sees_it() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let room = Ulid::new();
    let (start, end) = (DAY + 14 * H, DAY + 15 * H);

    let (id, _, _, _) = rows(&client, &insert_sql(room, start, end)).await.remove(0);
    let conflicts_sql = format!(
        r#"SELECT * FROM conflicts WHERE room_id = '{room}' AND start >= {start} AND "end" <= {end}"#
    );
    assert_eq!(rows(&client, &conflicts_sql).await.len(), 1);

    client
        .simple_query(&format!(
            "UPDATE bookings SET status = 'rejected' WHERE id = '{id}'"
        ))
        .await
        .unwrap();
    assert!(rows(&client, &conflicts_sql).await.is_empty());

    let again = rows(&client, &insert_sql(room, start, end)).await;
    assert_eq!(again[0].1, "pending");
}

#[tokio::test]
async fn reschedule_and_delete_with_bound_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let room = Ulid::new();

    let (id, _, _, _) = rows(&client, &insert_sql(room, DAY + 8 * H, DAY + 9 * H))
        .await
        .remove(0);

    let updated = client
        .execute(
            r#"UPDATE bookings SET start = $1, "end" = $2 WHERE id = $3"#,
            &[
                &(DAY + 9 * H).to_string(),
                &(DAY + 10 * H).to_string(),
                &id,
            ],
        )
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let got = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
    assert_eq!((got[0].2, got[0].3), (DAY + 9 * H, DAY + 10 * H));

    let deleted = client
        .execute("DELETE FROM bookings WHERE id = $1", &[&id])
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(
        sqlstate(&client, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await,
        "P0002"
    );
}

#[tokio::test]
async fn concurrent_clients_admit_one_overlapping_booking() {
    let addr = start_test_server().await;
    let room = Ulid::new();

    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            let offset = i * 60_000;
            client
                .simple_query(&insert_sql(room, DAY + 10 * H + offset, DAY + 11 * H + offset))
                .await
                .map(|_| ())
                .map_err(|e| e.as_db_error().map(|db| db.code().code().to_string()))
        }));
    }

    let mut admitted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => admitted += 1,
            Err(code) => assert_eq!(code.as_deref(), Some("23P01")),
        }
    }
    assert_eq!(admitted, 1);
}
