//! Postgres wire protocol client core.
//!
//! `pglane` speaks the v3 frontend/backend protocol over one TCP (or TLS,
//! or unix socket) connection: startup and authentication (cleartext, md5,
//! SCRAM-SHA-256), extended queries with binary parameters, prepared
//! statements, and pull-based row streaming.
//!
//! The protocol logic lives in explicit state machines
//! ([`machine`]) which turn backend messages into actions; a [`Driver`]
//! future executes those actions against the socket while cloneable
//! [`Connection`] handles feed its FIFO task queue.
//!
//! # Examples
//!
//! ```no_run
//! use pglane::{Config, Connection};
//!
//! # async fn app() -> pglane::Result<()> {
//! let config = Config::new("postgres").password("secret").dbname("app");
//! let (conn, driver) = Connection::connect(&config).await?;
//! tokio::spawn(driver);
//!
//! let deleted = conn
//!     .query("DELETE FROM sessions WHERE user_id = $1")
//!     .bind(42i64)
//!     .execute()
//!     .await?;
//! assert_eq!(deleted.rows_affected(), 1);
//!
//! let mut rows = conn.query("SELECT id, name FROM users").fetch().await?;
//! while let Some(row) = rows.next().await? {
//!     let (id, name) = row.decode::<(i32, String)>()?;
//!     println!("{id}: {name}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;

// Protocol
pub mod postgres;

// Encoding
pub mod encode;
pub mod row;

// Component
pub mod machine;
mod statement;
pub mod stream;

// Connection
pub mod config;
mod connection;
mod transport;

pub mod types;

mod error;

#[doc(inline)]
pub use config::{Config, TlsMode};
#[doc(inline)]
pub use connection::{Connection, Driver, NotificationSink, Query, Statement, StatementQuery};
#[doc(inline)]
pub use encode::Encode;
#[doc(inline)]
pub use error::{Error, ErrorKind, Result, TlsError};
pub use postgres::backend::NotificationResponse as Notification;
#[doc(inline)]
pub use row::{DecodeError, FromColumn, FromRow, Row};
#[doc(inline)]
pub use stream::{CommandTag, RowStream};

#[cfg(feature = "json")]
pub use types::Json;
