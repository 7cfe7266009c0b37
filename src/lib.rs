//! MariaDB HA - Reactive Rust client for MariaDB/MySQL
//!
//! This crate provides a non-blocking MariaDB/MySQL client with pluggable
//! authentication, a prepared-statement cache, demand-driven row streaming
//! and built-in failover with transparent transaction replay.
//!
//! # Example
//!
//! ```no_run
//! use mariadb_ha::{HaDataSource, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ds = HaDataSource::from_url(
//!         "mariadb://user:pw@db1:3306,db2:3306/app?haMode=sequential&transactionReplay=true",
//!     )?;
//!
//!     let mut conn = ds.get_connection().await?;
//!     let result = conn.query("SELECT * FROM users WHERE id = ?", &[Value::Int64(1)]).await?;
//!
//!     for row in result.rows {
//!         println!("{:?}", row);
//!     }
//!
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cache;
pub mod client;
pub mod codec;
pub mod connection;
pub mod constants;
pub mod datasource;
pub mod error;
pub mod packet;
pub mod tls;
pub mod value;

pub use auth::AuthPlugin;
pub use client::{ExecutionResult, PipelineOutcome, Row, RowSequence, UpdateResult};
pub use codec::ColumnDefinition;
pub use connection::{HaConnection, IsolationLevel};
pub use datasource::{HaDataSource, HaDataSourceOptions, HaMode, HostAddress, HostRole};
pub use error::{Error, HostFailure, Result};
pub use tls::{SslMode, SslOptions};
pub use value::Value;
