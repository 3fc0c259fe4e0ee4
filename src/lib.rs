//! A blocking PostgreSQL client session over the v3 wire protocol.
//!
//! A [`Session`] runs one command at a time and offers several ways to
//! consume results: a fully buffered [`Table`], a row-at-a-time [`Cursor`],
//! fire-and-wait commands through [`Session::start_execute`], multi-statement
//! scripts and `COPY ... FROM STDIN` through a [`CopyChannel`].
//!
//! ```no_run
//! use pg_session::{Session, params};
//!
//! # fn main() -> pg_session::Result<()> {
//! let mut session = Session::open("postgres://postgres@localhost/postgres")?;
//! let table = session.query("select $1::int8 as answer", &params![42])?;
//! assert_eq!(table.get_int(0, 0)?, 42);
//!
//! let mut cursor = session.query_stream("select generate_series(1, 3) as n", &[])?;
//! while cursor.next_row()? {
//!     println!("{}", cursor.get_int(0)?);
//! }
//! # Ok(())
//! # }
//! ```

mod codec;
mod columns;
mod connect;
mod copy;
mod cursor;
mod error;
pub mod messages;
mod outcome;
mod pg_stream;
mod response;
mod row;
mod session;
pub mod startup;
mod table;

pub use codec::Value;
pub use columns::{ColumnDescriptor, Columns};
pub use connect::{CancelToken, ConnectOptions, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_USER, Transport};
pub use copy::CopyChannel;
pub use cursor::Cursor;
pub use error::{ConnectionError, Error, Misuse, PgErrorResponse, Result};
pub use messages::{FormatCode, Oid, frontend::BindParameter};
pub use outcome::{Check, Outcome};
pub use pg_stream::PgStream;
pub use response::{ResultStatus, TransactionStatus};
pub use row::Row;
pub use session::{Session, SessionState};
pub use startup::{AuthenticationMode, ConnectionBuilder, ProtocolVersion, StartupResponse};
pub use table::Table;
