//! Runs every scenario against a real server: the one named by
//! `PG_SESSION_TEST_URL`, or an embedded one started for this run.

use std::time::Duration;

use pg_session::{Error, Misuse, ResultStatus, Session, SessionState, params};
use postgresql_embedded::{Settings, blocking::PostgreSQL};

enum Server {
    Embedded(PostgreSQL),
    External(String),
}

impl Server {
    fn start() -> Self {
        if let Ok(url) = std::env::var("PG_SESSION_TEST_URL") {
            return Server::External(url);
        }

        // Stopped, and its data directory removed, when this drops.
        let mut pg = PostgreSQL::new(Settings::default());
        pg.setup().expect("postgres should install");
        pg.start().expect("postgres should start");
        Server::Embedded(pg)
    }

    fn url(&self) -> String {
        match self {
            Server::External(url) => url.clone(),
            Server::Embedded(pg) => {
                let Settings {
                    host,
                    port,
                    username,
                    password,
                    ..
                } = pg.settings();
                format!("postgres://{username}:{password}@{host}:{port}/postgres")
            }
        }
    }
}

fn open(url: &str) -> Session {
    Session::open(url).expect("server should accept connections")
}

/// A throwaway schema, dropped again when the guard goes away.
struct Scratch {
    session: Session,
    schema: String,
}

impl Scratch {
    fn new(url: &str, tag: &str) -> Self {
        let mut session = open(url);
        let schema = format!("pg_session_{tag}_{}", std::process::id());
        session
            .execute_script(&format!(
                "DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema}; CREATE TABLE {schema}.one(id int);"
            ))
            .unwrap();
        Scratch { session, schema }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if self.session.state() == SessionState::Idle {
            let _ = self
                .session
                .execute_script(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema));
        }
    }
}

fn live_query(url: &str) {
    let mut session = open(url);
    let table = session.query("select $1::int4 as one", &params![1]).unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table.column_count(), 1);
    assert_eq!(table.get_int(0, 0).unwrap(), 1);
    assert_eq!(table.column_name(0).unwrap(), "one");
}

fn live_execute_and_stream(url: &str) {
    let mut s = Scratch::new(url, "stream");
    let schema = s.schema.clone();

    let status = s
        .session
        .execute(&format!("INSERT INTO {schema}.one values ($1), ($2)"), &params![1, 2])
        .unwrap();
    assert_eq!(status, ResultStatus::CommandOk { rows: Some(2) });

    let mut cursor = s
        .session
        .query_stream(&format!("select id as first_col from {schema}.one order by id"), &[])
        .unwrap();
    let first_col = cursor.column_by_name("first_col").unwrap();
    let mut ids = Vec::new();
    while cursor.next_row().unwrap() {
        ids.push(cursor.get_int(first_col).unwrap());
    }
    assert_eq!(ids, vec![1, 2]);
}

fn live_execute_rejects_rows(url: &str) {
    let mut session = open(url);
    let err = session.execute("select 1", &[]).unwrap_err();
    assert!(matches!(
        err,
        Error::Misuse(Misuse::WrongStatus {
            actual: ResultStatus::TuplesOk { rows: 1 },
            ..
        })
    ));
}

fn live_binary_matches_text(url: &str) {
    let mut session = open(url);
    let sql = "select 12345678901::int8, 0.25::float8, false, 'héllo'::text, 0.1::float4, 12.50::numeric";

    let mut text = Vec::new();
    let mut cursor = session.start_query(sql, &[], false).unwrap();
    assert!(cursor.next_row().unwrap());
    text.push(cursor.value(0).unwrap());
    text.push(cursor.value(1).unwrap());
    text.push(cursor.value(2).unwrap());
    text.push(cursor.value(3).unwrap());
    text.push(cursor.value(4).unwrap());
    text.push(cursor.value(5).unwrap());
    let float4 = cursor.get_str(4).unwrap();
    cursor.close().unwrap();

    let mut cursor = session.start_query(sql, &[], true).unwrap();
    assert!(cursor.next_row().unwrap());
    for (i, expected) in text.iter().enumerate() {
        assert_eq!(&cursor.value(i).unwrap(), expected);
    }
    assert_eq!(cursor.get_str(4).unwrap(), float4);
    assert_eq!(cursor.get_str(5).unwrap(), "12.50");
}

fn live_async_execute(url: &str) {
    let mut s = Scratch::new(url, "async");
    let schema = s.schema.clone();
    s.session
        .execute_script(&format!("INSERT INTO {schema}.one SELECT generate_series(1, 10)"))
        .unwrap();

    s.session
        .start_execute(&format!("DELETE FROM {schema}.one where id in ($1,$2)"), &params![1, 2])
        .unwrap();
    assert_eq!(
        s.session.end_execute().unwrap(),
        ResultStatus::CommandOk { rows: Some(2) }
    );
}

fn live_copy_in(url: &str) {
    let mut s = Scratch::new(url, "copy");
    let schema = s.schema.clone();

    let mut copy = s
        .session
        .start_copy_in(&format!("COPY {schema}.one FROM STDIN"))
        .unwrap();
    copy.write_copy_data("1\n2\n").unwrap();
    assert_eq!(copy.end_copy().unwrap(), 2);

    let table = s
        .session
        .query(&format!("select count(*) from {schema}.one"), &[])
        .unwrap();
    assert_eq!(table.get_int(0, 0).unwrap(), 2);
}

fn live_timeout_closes_session(url: &str) {
    let mut session = open(url);
    session.set_timeout(Some(Duration::from_millis(200))).unwrap();
    let err = session.execute("select pg_sleep(5)", &[]).unwrap_err();
    assert!(err.is_fatal());
    assert!(session.is_closed());
}

fn live_cancel(url: &str) {
    let mut session = open(url);
    let token = session.cancel_token();
    session.start_execute("select pg_sleep(30)", &[]).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    token.cancel().unwrap();
    let err = session.end_execute().unwrap_err();
    assert_eq!(err.sql_state().as_deref(), Some("57014"));
}

#[test]
fn test_live_server() {
    let server = Server::start();
    let url = server.url();

    live_query(&url);
    live_execute_and_stream(&url);
    live_execute_rejects_rows(&url);
    live_binary_matches_text(&url);
    live_async_execute(&url);
    live_copy_in(&url);
    live_timeout_closes_session(&url);
    live_cancel(&url);
}
