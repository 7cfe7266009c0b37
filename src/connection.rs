//! Logical connection: transactions, replay and failover orchestration.
//!
//! A [`HaConnection`] survives the loss of its physical connection. Fatal
//! errors trigger host reselection, re-authentication, session restore and,
//! when transaction replay is enabled, re-execution of the in-flight
//! transaction's statements before the caller sees control again.

use crate::cache::StatementCache;
use crate::client::{
    Client, ExecutionResult, PipelineOutcome, ResponseHead, RowSequence, UpdateResult,
};
use crate::codec;
use crate::constants::status;
use crate::datasource::{Config, HostAddress, HostRole, HostSelector};
use crate::error::{Error, Result};
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// READ UNCOMMITTED
    ReadUncommitted,
    /// READ COMMITTED
    ReadCommitted,
    /// REPEATABLE READ
    RepeatableRead,
    /// SERIALIZABLE
    Serializable,
}

impl IsolationLevel {
    fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    pub(crate) fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().replace('-', " ").as_str() {
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            other => Err(Error::InvalidParameter(format!(
                "unknown isolation level '{other}'"
            ))),
        }
    }
}

/// Statements of the open transaction, kept for replay on reconnect.
#[derive(Debug, Default)]
struct TransactionLog {
    entries: Vec<(String, Vec<Value>)>,
    bytes: usize,
    max_bytes: usize,
    /// Set once the log outgrew its budget; replay is then impossible
    poisoned: bool,
}

impl TransactionLog {
    fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            ..Default::default()
        }
    }

    fn record(&mut self, sql: &str, params: &[Value]) {
        if self.poisoned {
            return;
        }
        self.bytes += sql.len() + params.iter().map(Value::encoded_size).sum::<usize>();
        if self.bytes > self.max_bytes {
            warn!(
                budget = self.max_bytes,
                "transaction outgrew the replay budget; failover will not replay it"
            );
            self.poisoned = true;
            self.entries.clear();
            return;
        }
        self.entries.push((sql.to_string(), params.to_vec()));
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
        self.poisoned = false;
    }
}

/// One physical connection plus the local id its cache entries are keyed by.
struct Physical {
    client: Client,
    /// Local cache key; server connection ids can collide across hosts
    cache_id: u32,
    /// Host this connection landed on, for cool-down bookkeeping
    host: HostAddress,
}

/// Buffered or head-only outcome of one dispatched statement.
enum Outcome {
    Update(UpdateResult),
    Rows(ExecutionResult),
}

/// Represents a logical connection to the database, with failover.
pub struct HaConnection {
    config: Arc<Config>,
    selector: Arc<HostSelector>,
    primary: Physical,
    replica: Option<Physical>,
    cache: StatementCache,
    closed: Mutex<bool>,
    auto_commit: bool,
    isolation: Option<IsolationLevel>,
    in_transaction: bool,
    txn_log: TransactionLog,
    next_cache_id: u32,
}

impl std::fmt::Debug for HaConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaConnection")
            .field("auto_commit", &self.auto_commit)
            .field("isolation", &self.isolation)
            .field("in_transaction", &self.in_transaction)
            .field("next_cache_id", &self.next_cache_id)
            .finish_non_exhaustive()
    }
}

impl HaConnection {
    /// Connect to the first reachable candidate host and prepare the session.
    pub(crate) async fn establish(
        config: Arc<Config>,
        selector: Arc<HostSelector>,
    ) -> Result<Self> {
        let (mut client, host) = selector
            .connect_any(config.as_ref(), HostRole::Primary)
            .await?;
        setup_session(&mut client, config.as_ref(), config.autocommit, config.isolation).await?;
        Ok(Self {
            cache: StatementCache::new(config.prepare_cache_size),
            auto_commit: config.autocommit,
            isolation: config.isolation,
            primary: Physical {
                client,
                cache_id: 0,
                host,
            },
            replica: None,
            closed: Mutex::new(false),
            in_transaction: false,
            txn_log: TransactionLog::new(config.transaction_replay_size),
            next_cache_id: 1,
            config,
            selector,
        })
    }

    // ========================================================================
    // Public query surface
    // ========================================================================

    /// Execute a SELECT query, buffering the first result.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<ExecutionResult> {
        self.check_closed()?;
        match self.run_with_failover(sql, params, true).await? {
            Outcome::Rows(r) => Ok(r),
            Outcome::Update(u) => Ok(ExecutionResult {
                columns: vec![],
                rows: vec![],
                rows_affected: u.affected_rows,
            }),
        }
    }

    /// Execute an INSERT/UPDATE/DELETE statement.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.check_closed()?;
        match self.run_with_failover(sql, params, false).await? {
            Outcome::Update(u) => Ok(u.affected_rows),
            Outcome::Rows(_) => Err(Error::InvalidParameter(
                "statement returned a result set; use query()".to_string(),
            )),
        }
    }

    /// Execute any SQL statement.
    pub async fn run(&mut self, sql: &str, params: &[Value]) -> Result<ExecutionResult> {
        self.check_closed()?;
        match self.run_with_failover(sql, params, true).await? {
            Outcome::Rows(r) => Ok(r),
            Outcome::Update(u) => Ok(ExecutionResult {
                columns: vec![],
                rows: vec![],
                rows_affected: u.affected_rows,
            }),
        }
    }

    /// Execute a query and stream its rows under demand.
    ///
    /// Rows are decoded from the socket only as [`RowSequence::next`] is
    /// called. Dropping the sequence early is safe: the remainder is
    /// skipped before the next command uses the connection.
    pub async fn query_stream(&mut self, sql: &str, params: &[Value]) -> Result<RowSequence<'_>> {
        self.check_closed()?;
        let mut attempts = self.max_attempts();
        loop {
            match self.dispatch(sql, params, true).await {
                Ok(()) => break,
                Err(e) if e.is_fatal() && attempts > 1 => {
                    attempts -= 1;
                    self.failover(e).await?;
                }
                Err(e) => return Err(e),
            }
        }
        let use_replica = self.routes_to_replica(sql) && self.replica.is_some();
        let phys = if use_replica {
            self.replica.as_mut().expect("checked")
        } else {
            &mut self.primary
        };
        let head = phys.client.read_head().await?;
        Ok(RowSequence::start(&mut phys.client, head))
    }

    /// Execute several statements in one pipelined batch: every request is
    /// written before any response is read, and responses are attributed in
    /// submission order.
    pub async fn execute_pipeline(&mut self, statements: &[&str]) -> Result<Vec<PipelineOutcome>> {
        self.check_closed()?;
        if !self.config.allow_pipelining {
            return Err(Error::InvalidParameter(
                "pipelining is disabled for this connection".to_string(),
            ));
        }
        let owned: Vec<String> = statements.iter().map(|s| (*s).to_string()).collect();
        let mut attempts = self.max_attempts();
        let outcomes = loop {
            match self.primary.client.pipeline(&owned).await {
                Ok(o) => break o,
                Err(e) if e.is_fatal() && attempts > 1 => {
                    attempts -= 1;
                    self.failover(e).await?;
                }
                Err(e) => return Err(e),
            }
        };
        self.sync_transaction_state();
        if self.recording() {
            for (sql, outcome) in owned.iter().zip(&outcomes) {
                if !matches!(outcome, PipelineOutcome::ServerError(_)) {
                    self.txn_log.record(sql, &[]);
                }
            }
        }
        Ok(outcomes)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a transaction.
    pub async fn begin_transaction(&mut self) -> Result<()> {
        self.check_closed()?;
        self.run_with_failover("BEGIN", &[], false).await?;
        self.in_transaction = true;
        Ok(())
    }

    /// Commit the current transaction.
    pub async fn commit(&mut self) -> Result<()> {
        self.check_closed()?;
        self.run_with_failover("COMMIT", &[], false).await?;
        self.in_transaction = false;
        self.txn_log.clear();
        Ok(())
    }

    /// Rollback the current transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        self.check_closed()?;
        self.run_with_failover("ROLLBACK", &[], false).await?;
        self.in_transaction = false;
        self.txn_log.clear();
        Ok(())
    }

    /// Set auto-commit mode.
    pub async fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.check_closed()?;
        if auto_commit == self.auto_commit {
            return Ok(());
        }
        let sql = if auto_commit {
            "SET autocommit=1"
        } else {
            "SET autocommit=0"
        };
        self.run_with_failover(sql, &[], false).await?;
        self.auto_commit = auto_commit;
        if auto_commit {
            self.in_transaction = false;
            self.txn_log.clear();
        }
        Ok(())
    }

    /// Get auto-commit mode.
    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// Change the session isolation level.
    pub async fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()> {
        self.check_closed()?;
        let sql = format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level.as_sql());
        self.run_with_failover(&sql, &[], false).await?;
        self.isolation = Some(level);
        Ok(())
    }

    /// Current isolation level, when one was configured or set.
    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Check if the connection is valid.
    pub async fn is_valid(&mut self) -> bool {
        if *self.closed.lock() {
            return false;
        }
        self.primary.client.ping().await.is_ok()
    }

    /// Server version string of the current physical connection.
    pub fn server_version(&self) -> &str {
        &self.primary.client.server_version
    }

    /// Server-side connection id of the current physical connection.
    pub fn connection_id(&self) -> u32 {
        self.primary.client.connection_id
    }

    /// Check if the connection is closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    fn check_closed(&self) -> Result<()> {
        if *self.closed.lock() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Close the connection. Errors from dying sockets are ignored.
    pub async fn close(&mut self) -> Result<()> {
        if *self.closed.lock() {
            return Ok(());
        }
        *self.closed.lock() = true;
        self.primary.client.quit().await;
        if let Some(replica) = &mut self.replica {
            replica.client.quit().await;
        }
        Ok(())
    }

    // ========================================================================
    // Dispatch, recording, failover
    // ========================================================================

    fn max_attempts(&self) -> usize {
        self.selector.host_count().max(1) + 1
    }

    fn recording(&self) -> bool {
        self.config.transaction_replay
            && !self.txn_log.poisoned
            && (self.in_transaction || !self.auto_commit)
    }

    fn sync_transaction_state(&mut self) {
        self.in_transaction =
            self.primary.client.last_status & status::IN_TRANSACTION != 0;
        if !self.in_transaction && self.auto_commit {
            self.txn_log.clear();
        }
    }

    fn routes_to_replica(&self, sql: &str) -> bool {
        self.selector.has_replicas() && !self.in_transaction && is_read_only(sql)
    }

    /// Send one statement on the proper physical connection, leaving the
    /// response pending. Local bind validation happens before any bytes go
    /// out.
    async fn dispatch(&mut self, sql: &str, params: &[Value], replica_ok: bool) -> Result<()> {
        for v in params {
            codec::validate_bind(v)?;
        }

        let use_replica = replica_ok && self.routes_to_replica(sql);
        if use_replica && self.replica.is_none() {
            match self.connect_replica().await {
                Ok(phys) => self.replica = Some(phys),
                Err(e) => {
                    // reads fall back to the primary when no replica answers
                    warn!(error = %e, "replica connect failed; routing read to primary");
                }
            }
        }
        let (phys, cache) = if use_replica && self.replica.is_some() {
            (self.replica.as_mut().expect("checked"), &mut self.cache)
        } else {
            (&mut self.primary, &mut self.cache)
        };

        let binary = self.config.use_server_prep_stmts && !params.is_empty();
        if binary {
            let expected = codec::count_placeholders(sql);
            if expected != params.len() {
                return Err(Error::bind_mismatch(expected, params.len()));
            }
            let stmt = match cache.get(phys.cache_id, sql) {
                Some(stmt) => stmt,
                None => {
                    let stmt = phys.client.prepare(sql).await?;
                    if let Some(evicted) =
                        cache.insert(phys.cache_id, sql, stmt.clone())
                    {
                        debug!(
                            statement_id = evicted.statement_id,
                            "closing statement evicted from the cache"
                        );
                        phys.client.close_statement(evicted.statement_id).await?;
                    }
                    stmt
                }
            };
            if params.len() != stmt.num_params as usize {
                return Err(Error::bind_mismatch(stmt.num_params as usize, params.len()));
            }
            let mut bound = Vec::with_capacity(params.len());
            for (i, v) in params.iter().enumerate() {
                let target = stmt.param_types.get(i).copied().unwrap_or(0xFD);
                match codec::coerce_temporal(v, target)? {
                    Some(coerced) => bound.push(coerced),
                    None => bound.push(v.clone()),
                }
            }
            phys.client.send_execute(&stmt, &bound).await
        } else {
            let inlined = if params.is_empty() {
                sql.to_string()
            } else {
                codec::inline_parameters(sql, params)?
            };
            phys.client.send_query(&inlined).await
        }
    }

    /// Dispatch + read the full response, buffered.
    async fn attempt(&mut self, sql: &str, params: &[Value], replica_ok: bool) -> Result<Outcome> {
        self.dispatch(sql, params, replica_ok).await?;
        let use_replica = replica_ok && self.routes_to_replica(sql) && self.replica.is_some();
        let phys = if use_replica {
            self.replica.as_mut().expect("checked")
        } else {
            &mut self.primary
        };
        match phys.client.read_head().await? {
            ResponseHead::Ok(ok) => Ok(Outcome::Update(ok.into())),
            ResponseHead::ResultSet(columns) => {
                let names = columns.iter().map(|c| c.name.clone()).collect();
                let mut rows = Vec::new();
                while let Some(row) = phys.client.read_row().await? {
                    rows.push(row.into_values());
                }
                Ok(Outcome::Rows(ExecutionResult {
                    columns: names,
                    rows,
                    rows_affected: 0,
                }))
            }
        }
    }

    /// Run one statement with transparent failover and replay.
    async fn run_with_failover(
        &mut self,
        sql: &str,
        params: &[Value],
        replica_ok: bool,
    ) -> Result<Outcome> {
        let mut attempts = self.max_attempts();
        loop {
            match self.attempt(sql, params, replica_ok).await {
                Ok(outcome) => {
                    self.sync_transaction_state();
                    if self.recording() {
                        self.txn_log.record(sql, params);
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_fatal() && attempts > 1 => {
                    attempts -= 1;
                    self.failover(e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replace the dead physical connection: cool down the host, pick the
    /// next candidate, re-authenticate, restore session state, drop the
    /// dead connection's cached statements and replay the open transaction.
    async fn failover(&mut self, cause: Error) -> Result<()> {
        if !self.selector.failover_enabled() {
            return Err(cause);
        }
        info!(error = %cause, host = %self.primary.host.describe(), "connection lost; starting failover");
        self.selector.mark_down(&self.primary.host);

        let (mut client, host) = self
            .selector
            .connect_any(self.config.as_ref(), HostRole::Primary)
            .await?;
        setup_session(
            &mut client,
            self.config.as_ref(),
            self.auto_commit,
            self.isolation,
        )
        .await?;

        let dead_cache_id = self.primary.cache_id;
        self.cache.invalidate_connection(dead_cache_id);
        let cache_id = self.next_cache_id;
        self.next_cache_id += 1;
        self.primary = Physical {
            client,
            cache_id,
            host,
        };

        if self.in_transaction || !self.auto_commit {
            if !self.config.transaction_replay || self.txn_log.poisoned {
                // the transaction cannot be reconstructed; its loss is the
                // caller's to see
                self.in_transaction = false;
                self.txn_log.clear();
                return Err(cause);
            }
            let entries = std::mem::take(&mut self.txn_log.entries);
            for (sql, params) in &entries {
                debug!(sql = %sql, "replaying transaction statement");
                match self.attempt(sql, params, false).await {
                    Ok(_) => {}
                    Err(replay_err) => {
                        self.in_transaction = false;
                        self.txn_log.clear();
                        return Err(Error::Replay {
                            detail: format!("'{sql}' failed on the new connection: {replay_err}"),
                            cause: Box::new(cause),
                        });
                    }
                }
            }
            self.txn_log.entries = entries;
            self.sync_transaction_state();
            info!(
                statements = self.txn_log.entries.len(),
                "transaction replayed on new connection"
            );
        }
        Ok(())
    }

    async fn connect_replica(&mut self) -> Result<Physical> {
        let (mut client, host) = self
            .selector
            .connect_any(self.config.as_ref(), HostRole::Replica)
            .await?;
        setup_session(
            &mut client,
            self.config.as_ref(),
            self.auto_commit,
            self.isolation,
        )
        .await?;
        let cache_id = self.next_cache_id;
        self.next_cache_id += 1;
        Ok(Physical {
            client,
            cache_id,
            host,
        })
    }
}

/// Re-establish configured session state on a fresh physical connection:
/// session variables, isolation level and autocommit, in that order, before
/// control returns to the caller.
async fn setup_session(
    client: &mut Client,
    config: &Config,
    auto_commit: bool,
    isolation: Option<IsolationLevel>,
) -> Result<()> {
    let mut assignments: Vec<String> = config
        .session_variables
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    assignments.push(format!("autocommit={}", u8::from(auto_commit)));
    let sql = format!("SET {}", assignments.join(","));
    simple_ok(client, &sql).await?;
    if let Some(level) = isolation {
        let sql = format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level.as_sql());
        simple_ok(client, &sql).await?;
    }
    Ok(())
}

async fn simple_ok(client: &mut Client, sql: &str) -> Result<()> {
    client.send_query(sql).await?;
    match client.read_head().await? {
        ResponseHead::Ok(_) => Ok(()),
        ResponseHead::ResultSet(_) => Err(Error::Protocol(format!(
            "unexpected result set for '{sql}'"
        ))),
    }
}

/// Statements that may route to a replica under REPLICATION mode.
fn is_read_only(sql: &str) -> bool {
    let trimmed = sql.trim_start().to_uppercase();
    trimmed.starts_with("SELECT")
        || trimmed.starts_with("SHOW")
        || trimmed.starts_with("DESCRIBE")
        || trimmed.starts_with("EXPLAIN")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_detection() {
        assert!(is_read_only("SELECT 1"));
        assert!(is_read_only("  select * from t"));
        assert!(is_read_only("EXPLAIN SELECT 1"));
        assert!(!is_read_only("INSERT INTO t VALUES (1)"));
        assert!(!is_read_only("UPDATE t SET a=1"));
    }

    #[test]
    fn isolation_level_names() {
        assert_eq!(
            IsolationLevel::from_name("repeatable read").unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            IsolationLevel::from_name("READ-COMMITTED").unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert!(IsolationLevel::from_name("chaotic").is_err());
    }

    #[test]
    fn transaction_log_budget_poisons() {
        let mut log = TransactionLog::new(64);
        log.record("INSERT INTO t VALUES (?)", &[Value::Int64(1)]);
        assert!(!log.poisoned);
        log.record(&"x".repeat(100), &[]);
        assert!(log.poisoned);
        assert!(log.entries.is_empty());
        // once poisoned, nothing records until cleared
        log.record("INSERT INTO t VALUES (1)", &[]);
        assert!(log.entries.is_empty());
        log.clear();
        assert!(!log.poisoned);
    }
}
