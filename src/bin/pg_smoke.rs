use std::{
    io::Write,
    process::ExitCode,
    time::Duration,
};

use clap::Parser;
use pg_session::{Check, Outcome, ResultStatus, Session, params};

#[derive(Parser, Debug)]
#[command(name = "pg-smoke")]
#[command(about = "Exercise a Postgres server through every pg_session command shape", long_about = None)]
struct Args {
    /// Connection string, URI or keyword form
    #[arg(
        short,
        long,
        env = "PG_SESSION_TEST_URL",
        default_value = "postgres://postgres@localhost:5432/postgres"
    )]
    url: String,

    /// Scratch schema, dropped and recreated by the run
    #[arg(short, long, default_value = "pg_smoke")]
    schema: String,

    /// Per-read timeout in seconds; 0 waits indefinitely
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,
}

type Body = fn(&mut Session, &mut Check, &str) -> pg_session::Result<()>;

const CHECKS: &[(&str, Body)] = &[
    ("query", check_query),
    ("execute_script", check_script),
    ("execute", check_execute),
    ("query_stream", check_stream),
    ("start_execute", check_async_execute),
    ("copy_in", check_copy_in),
    ("cleanup", check_cleanup),
];

fn check_query(session: &mut Session, check: &mut Check, _: &str) -> pg_session::Result<()> {
    let table = session.query("select $1", &params![1])?;
    check.log(format!("{} rows, {} columns", table.len(), table.column_count()));
    check.expect(table.len() == 1, "expected one row");
    check.expect(table.column_count() == 1, "expected one column");
    check.expect(table.get_int(0, 0)? == 1, "expected the value 1");
    Ok(())
}

fn check_script(session: &mut Session, check: &mut Check, schema: &str) -> pg_session::Result<()> {
    let statuses = session.execute_script(&format!(
        "DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema}; CREATE TABLE {schema}.one(id int);"
    ))?;
    check.log(format!("statuses: {statuses:?}"));
    check.expect(statuses.len() == 3, "expected three statuses");
    Ok(())
}

fn check_execute(session: &mut Session, check: &mut Check, schema: &str) -> pg_session::Result<()> {
    let status = session.execute(
        &format!("INSERT INTO {schema}.one values ($1), ($2)"),
        &params![1, 2],
    )?;
    check.log(format!("status: {status}"));
    check.expect(status.rows() == Some(2), "expected two inserted rows");
    Ok(())
}

fn check_stream(session: &mut Session, check: &mut Check, schema: &str) -> pg_session::Result<()> {
    let mut cursor = session.query_stream(
        &format!("select id as first_col from {schema}.one where id = $1"),
        &params![1],
    )?;
    let first_col = cursor.column_by_name("first_col")?;
    let mut rows = 0;
    while cursor.next_row()? {
        rows += 1;
        check.expect(cursor.get_int(first_col)? == 1, "expected first_col = 1");
        check.expect(!cursor.is_null(first_col)?, "first_col is null");
    }
    check.expect(rows == 1, format!("expected one row, got {rows}"));
    check.expect(
        cursor.status() == Some(ResultStatus::TuplesOk { rows: 1 }),
        format!("unexpected status {:?}", cursor.status()),
    );
    Ok(())
}

fn check_async_execute(
    session: &mut Session,
    check: &mut Check,
    schema: &str,
) -> pg_session::Result<()> {
    session.start_execute(
        &format!("DELETE FROM {schema}.one where id in ($1,$2)"),
        &params![1, 2],
    )?;
    check.log("delete sent");
    let status = session.end_execute()?;
    check.expect(status.rows() == Some(2), format!("unexpected status {status}"));
    Ok(())
}

fn check_copy_in(session: &mut Session, check: &mut Check, schema: &str) -> pg_session::Result<()> {
    let mut copy = session.start_copy_in(&format!("COPY {schema}.one FROM STDIN"))?;
    copy.write_copy_data("1\n2\n")?;
    let rows = copy.end_copy()?;
    check.expect(rows == 2, format!("copied {rows} rows"));

    let table = session.query(&format!("select count(*) from {schema}.one"), &[])?;
    check.expect(table.get_int(0, 0)? == 2, "count after copy is not 2");
    Ok(())
}

fn check_cleanup(session: &mut Session, _: &mut Check, schema: &str) -> pg_session::Result<()> {
    session.execute_script(&format!("DROP SCHEMA {schema} CASCADE"))?;
    Ok(())
}

fn connect(args: &Args) -> pg_session::Result<Session> {
    let mut session = Session::open(&args.url)?;
    let timeout = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));
    session.set_timeout(timeout)?;
    Ok(session)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut session = match connect(&args) {
        Ok(session) => Some(session),
        Err(e) => {
            tracing::warn!(error = %e, "server unreachable; skipping every check");
            None
        }
    };

    let mut outcomes = Vec::with_capacity(CHECKS.len());
    for (name, body) in CHECKS {
        let mut check = Check::new();
        let result = match session.as_mut() {
            Some(session) if !session.is_closed() => body(session, &mut check, &args.schema),
            Some(_) => {
                check.skip("session closed by an earlier failure");
                Ok(())
            }
            None => {
                check.skip("");
                Ok(())
            }
        };
        let outcome = check.finish(result);
        print!("{}", outcome.render(name));
        let _ = std::io::stdout().flush();
        outcomes.push(outcome);
    }

    let count = |f: fn(&Outcome) -> bool| outcomes.iter().filter(|o| f(o)).count();
    let failed = count(Outcome::is_failed);
    println!(
        "\n{} passed, {failed} failed, {} skipped",
        count(Outcome::is_passed),
        count(Outcome::is_skipped)
    );

    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
