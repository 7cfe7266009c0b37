//! Physical connection to one server: command dispatch and result decoding.
//!
//! One `Client` owns one authenticated socket. Commands follow the
//! at-most-one-in-flight rule unless submitted through `Client::pipeline`,
//! and every partially consumed result is drained before the next command
//! so an abandoned row stream can never desynchronize the protocol.

use crate::auth::{self, AuthenticatedSession, BoxedSocket, ConnectOptions, SessionStream};
use crate::cache::CachedStatement;
use crate::codec::{
    self, parse_err_payload, parse_ok_payload, ColumnDefinition, OkPacket,
};
use crate::constants::{client as cap, com, status};
use crate::error::{Error, Result};
use crate::packet::{PacketReader, PacketWriter, Parser};
use crate::value::Value;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Where a physical connection goes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ConnectTarget<'a> {
    /// TCP host and port
    Tcp { host: &'a str, port: u16 },
    /// Local socket path
    Socket(&'a str),
}

impl ConnectTarget<'_> {
    fn describe(&self) -> String {
        match self {
            ConnectTarget::Tcp { host, port } => format!("{host}:{port}"),
            ConnectTarget::Socket(path) => (*path).to_string(),
        }
    }

    fn sni_host(&self) -> &str {
        match self {
            ConnectTarget::Tcp { host, .. } => host,
            ConnectTarget::Socket(_) => "localhost",
        }
    }
}

async fn open_socket(target: ConnectTarget<'_>, connect_timeout: Duration) -> Result<BoxedSocket> {
    let connect = async {
        match target {
            ConnectTarget::Tcp { host, port } => {
                let stream = TcpStream::connect((host, port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream) as BoxedSocket)
            }
            #[cfg(unix)]
            ConnectTarget::Socket(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream) as BoxedSocket)
            }
            #[cfg(not(unix))]
            ConnectTarget::Socket(_) => Err(Error::InvalidParameter(
                "local sockets are not supported on this platform".to_string(),
            )),
        }
    };
    match tokio::time::timeout(connect_timeout, connect).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout),
    }
}

/// Result of a statement that does not produce rows.
#[derive(Debug, Clone, Default)]
pub struct UpdateResult {
    /// Number of rows changed
    pub affected_rows: u64,
    /// Generated AUTO_INCREMENT id, 0 when none
    pub last_insert_id: u64,
    /// Warning count reported by the server
    pub warnings: u16,
}

impl From<OkPacket> for UpdateResult {
    fn from(ok: OkPacket) -> Self {
        UpdateResult {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
        }
    }
}

/// Fully buffered result of a query.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Column names
    pub columns: Vec<String>,
    /// Row data
    pub rows: Vec<Vec<Value>>,
    /// Number of rows affected (for INSERT/UPDATE/DELETE)
    pub rows_affected: u64,
}

impl ExecutionResult {
    /// Create an empty result.
    pub fn empty() -> Self {
        Self {
            columns: vec![],
            rows: vec![],
            rows_affected: 0,
        }
    }

    /// Get the number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Get the number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// One decoded result row.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<Vec<ColumnDefinition>>,
}

impl Row {
    /// Cell by ordinal position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Cell by column alias.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(idx)
    }

    /// Column metadata for this row.
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Consume the row into its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Row format of the result being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Text,
    Binary,
}

/// Protocol position of the connection, used to drain abandoned work.
#[derive(Debug, Clone, Copy)]
enum ClientState {
    /// Nothing in flight
    Ready,
    /// A command was sent; the response head has not been read
    AwaitingHead(Protocol),
    /// Reading column definitions
    ReadingColumns(Protocol, u64),
    /// Reading rows
    ReadingRows(Protocol),
    /// Unrecoverable protocol position; the connection must be closed
    Broken,
}

/// Head of one response.
pub(crate) enum ResponseHead {
    Ok(OkPacket),
    ResultSet(Arc<Vec<ColumnDefinition>>),
}

/// One outcome inside a pipelined batch.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Statement succeeded without rows
    Update(UpdateResult),
    /// Statement produced rows (buffered)
    Rows(ExecutionResult),
    /// The server rejected this statement; later statements still ran
    ServerError(Error),
}

/// An authenticated physical connection.
pub(crate) struct Client {
    reader: PacketReader<ReadHalf<SessionStream>>,
    writer: PacketWriter<WriteHalf<SessionStream>>,
    pub(crate) capabilities: u32,
    pub(crate) server_version: String,
    pub(crate) connection_id: u32,
    state: ClientState,
    columns: Arc<Vec<ColumnDefinition>>,
    /// Status flags from the most recent OK/terminator
    pub(crate) last_status: u16,
    /// Pipelined responses submitted but not yet read
    pending_responses: usize,
}

impl Client {
    /// Open a socket, run the auth negotiation and wrap the session.
    pub(crate) async fn connect(
        target: ConnectTarget<'_>,
        opts: &ConnectOptions,
        connect_timeout: Duration,
    ) -> Result<Self> {
        debug!(target = %target.describe(), "connecting");
        let socket = open_socket(target, connect_timeout).await?;
        let AuthenticatedSession {
            reader,
            writer,
            capabilities,
            server_version,
            connection_id,
        } = auth::negotiate(socket, target.sni_host(), opts).await?;
        Ok(Client {
            reader,
            writer,
            capabilities,
            server_version,
            connection_id,
            state: ClientState::Ready,
            columns: Arc::new(Vec::new()),
            last_status: 0,
            pending_responses: 0,
        })
    }

    fn eof_deprecated(&self) -> bool {
        self.capabilities & cap::DEPRECATE_EOF != 0
    }

    /// Record a fatal failure so no further commands touch the socket, and
    /// normalize I/O failures into connection-loss errors.
    fn register(&mut self, e: Error) -> Error {
        let e = match e {
            Error::Io(io) => Error::ConnectionLost(io.to_string()),
            other => other,
        };
        if e.is_fatal() {
            self.state = ClientState::Broken;
        }
        e
    }

    async fn read_packet(&mut self) -> Result<Bytes> {
        match self.reader.read_packet().await {
            Ok(p) => Ok(p),
            Err(e) => Err(self.register(e)),
        }
    }

    async fn send_payload(&mut self) -> Result<()> {
        match self.writer.send().await {
            Ok(()) => {
                // responses continue the command's sequence numbering
                self.reader.seq = self.writer.seq;
                Ok(())
            }
            Err(e) => Err(self.register(e)),
        }
    }

    /// Whether a classic EOF payload (0xFE, length < 9) terminates here.
    fn is_terminator(&self, payload: &[u8]) -> bool {
        payload.first() == Some(&0xFE) && (self.eof_deprecated() || payload.len() < 9)
    }

    fn parse_terminator(&mut self, payload: &[u8]) -> Result<u16> {
        let mut p = Parser::new(payload);
        p.skip(1)?;
        let flags = if self.eof_deprecated() {
            parse_ok_payload(&mut p)?.status_flags
        } else {
            p.get_u16()?; // warnings
            p.get_u16()?
        };
        self.last_status = flags;
        Ok(flags)
    }

    /// Drain whatever a previous, possibly cancelled, operation left on the
    /// wire so the connection is clean for the next command.
    pub(crate) async fn cleanup(&mut self) -> Result<()> {
        loop {
            match self.state {
                ClientState::Ready => {
                    if self.pending_responses > 0 {
                        self.reader.seq = 1;
                        self.state = ClientState::AwaitingHead(Protocol::Text);
                        self.pending_responses -= 1;
                        continue;
                    }
                    return Ok(());
                }
                ClientState::Broken => {
                    return Err(Error::Protocol(
                        "connection is in a broken state".to_string(),
                    ))
                }
                ClientState::AwaitingHead(protocol) => {
                    let payload = self.read_packet().await?;
                    let mut p = Parser::new(&payload);
                    match p.peek_u8() {
                        Some(0xFF) => {
                            // the error belongs to the abandoned statement
                            p.skip(1)?;
                            let e = parse_err_payload(&mut p);
                            debug!(error = %e, "discarding error of cancelled statement");
                            self.state = ClientState::Ready;
                        }
                        Some(0x00) => {
                            p.skip(1)?;
                            let ok = parse_ok_payload(&mut p)?;
                            self.last_status = ok.status_flags;
                            self.state = if ok.status_flags & status::MORE_RESULTS_EXISTS != 0 {
                                ClientState::AwaitingHead(protocol)
                            } else {
                                ClientState::Ready
                            };
                        }
                        _ => {
                            let count = p.get_lenenc().map_err(|e| self.register(e))?;
                            self.state = ClientState::ReadingColumns(protocol, count);
                        }
                    }
                }
                ClientState::ReadingColumns(protocol, remaining) => {
                    if remaining == 0 {
                        if !self.eof_deprecated() {
                            self.read_packet().await?;
                        }
                        self.state = ClientState::ReadingRows(protocol);
                    } else {
                        self.read_packet().await?;
                        self.state = ClientState::ReadingColumns(protocol, remaining - 1);
                    }
                }
                ClientState::ReadingRows(protocol) => {
                    let payload = self.read_packet().await?;
                    if payload.first() == Some(&0xFF) {
                        let mut p = Parser::new(&payload);
                        p.skip(1)?;
                        let e = parse_err_payload(&mut p);
                        debug!(error = %e, "discarding error of cancelled result");
                        self.state = ClientState::Ready;
                    } else if self.is_terminator(&payload) {
                        let flags = self.parse_terminator(&payload)?;
                        self.state = if flags & status::MORE_RESULTS_EXISTS != 0 {
                            ClientState::AwaitingHead(protocol)
                        } else {
                            ClientState::Ready
                        };
                    }
                }
            }
        }
    }

    // ========================================================================
    // Command dispatch
    // ========================================================================

    /// Send a text-protocol query; the response is read separately.
    pub(crate) async fn send_query(&mut self, sql: &str) -> Result<()> {
        self.cleanup().await?;
        self.writer.reset_seq();
        self.writer.begin().put_u8(com::QUERY).put_bytes(sql.as_bytes());
        self.send_payload().await?;
        self.state = ClientState::AwaitingHead(Protocol::Text);
        Ok(())
    }

    /// Read the head of the pending response.
    pub(crate) async fn read_head(&mut self) -> Result<ResponseHead> {
        let protocol = match self.state {
            ClientState::AwaitingHead(p) => p,
            _ => {
                return Err(Error::Protocol(
                    "no response is pending on this connection".to_string(),
                ))
            }
        };
        let payload = self.read_packet().await?;
        let mut p = Parser::new(&payload);
        match p.peek_u8() {
            Some(0xFF) => {
                p.skip(1)?;
                self.state = ClientState::Ready;
                let e = parse_err_payload(&mut p);
                Err(self.register(e))
            }
            Some(0x00) => {
                p.skip(1)?;
                let ok = parse_ok_payload(&mut p).map_err(|e| self.register(e))?;
                self.last_status = ok.status_flags;
                self.state = if ok.status_flags & status::MORE_RESULTS_EXISTS != 0 {
                    ClientState::AwaitingHead(protocol)
                } else {
                    ClientState::Ready
                };
                Ok(ResponseHead::Ok(ok))
            }
            _ => {
                let count = p.get_lenenc().map_err(|e| self.register(e))?;
                let mut columns = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let payload = self.read_packet().await?;
                    let mut p = Parser::new(&payload);
                    columns.push(
                        ColumnDefinition::parse(&mut p).map_err(|e| self.register(e))?,
                    );
                }
                if !self.eof_deprecated() {
                    self.read_packet().await?;
                }
                let columns = Arc::new(columns);
                self.columns = Arc::clone(&columns);
                self.state = ClientState::ReadingRows(protocol);
                Ok(ResponseHead::ResultSet(columns))
            }
        }
    }

    /// Decode one row on demand; `None` closes the result set.
    pub(crate) async fn read_row(&mut self) -> Result<Option<Row>> {
        let protocol = match self.state {
            ClientState::ReadingRows(p) => p,
            // the set was already terminated (or never existed)
            _ => return Ok(None),
        };
        let payload = self.read_packet().await?;
        if payload.first() == Some(&0xFF) {
            let mut p = Parser::new(&payload);
            p.skip(1)?;
            self.state = ClientState::Ready;
            let e = parse_err_payload(&mut p);
            return Err(self.register(e));
        }
        if self.is_terminator(&payload) {
            let flags = self.parse_terminator(&payload)?;
            self.state = if flags & status::MORE_RESULTS_EXISTS != 0 {
                ClientState::AwaitingHead(protocol)
            } else {
                ClientState::Ready
            };
            return Ok(None);
        }
        let columns = Arc::clone(&self.columns);
        let values = match protocol {
            Protocol::Text => decode_text_row(&payload, &columns)?,
            Protocol::Binary => decode_binary_row(&payload, &columns)?,
        };
        Ok(Some(Row { values, columns }))
    }

    /// Whether another result follows the one just terminated.
    pub(crate) fn has_more_results(&self) -> bool {
        matches!(self.state, ClientState::AwaitingHead(_))
    }

    /// Send COM_STMT_PREPARE and consume the full prepare response.
    pub(crate) async fn prepare(&mut self, sql: &str) -> Result<CachedStatement> {
        self.cleanup().await?;
        self.writer.reset_seq();
        self.writer
            .begin()
            .put_u8(com::STMT_PREPARE)
            .put_bytes(sql.as_bytes());
        self.send_payload().await?;

        let payload = self.read_packet().await?;
        let mut p = Parser::new(&payload);
        match p.get_u8().map_err(|e| self.register(e))? {
            0x00 => {}
            0xFF => {
                let e = parse_err_payload(&mut p);
                return Err(self.register(e));
            }
            v => {
                return Err(self.register(Error::Protocol(format!(
                    "unexpected prepare response {v:#04x}"
                ))))
            }
        }
        let parse = |p: &mut Parser<'_>| -> Result<(u32, u16, u16)> {
            let stmt_id = p.get_u32()?;
            let num_columns = p.get_u16()?;
            let num_params = p.get_u16()?;
            Ok((stmt_id, num_columns, num_params))
        };
        let (stmt_id, num_columns, num_params) =
            parse(&mut p).map_err(|e| self.register(e))?;

        let mut param_types = Vec::with_capacity(num_params as usize);
        for _ in 0..num_params {
            let payload = self.read_packet().await?;
            let mut p = Parser::new(&payload);
            let def = ColumnDefinition::parse(&mut p).map_err(|e| self.register(e))?;
            param_types.push(def.column_type);
        }
        if num_params > 0 && !self.eof_deprecated() {
            self.read_packet().await?;
        }
        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            let payload = self.read_packet().await?;
            let mut p = Parser::new(&payload);
            columns.push(ColumnDefinition::parse(&mut p).map_err(|e| self.register(e))?);
        }
        if num_columns > 0 && !self.eof_deprecated() {
            self.read_packet().await?;
        }
        debug!(stmt_id, num_params, num_columns, "statement prepared");
        Ok(CachedStatement {
            statement_id: stmt_id,
            num_params,
            param_types,
            columns,
        })
    }

    /// Send COM_STMT_EXECUTE with bound parameters; the response is read
    /// separately. Parameters must already be validated against the
    /// statement's arity and target types.
    pub(crate) async fn send_execute(
        &mut self,
        stmt: &CachedStatement,
        params: &[Value],
    ) -> Result<()> {
        self.cleanup().await?;
        self.writer.reset_seq();
        self.writer
            .begin()
            .put_u8(com::STMT_EXECUTE)
            .put_u32(stmt.statement_id)
            .put_u8(0) // flags: CURSOR_TYPE_NO_CURSOR
            .put_u32(1); // iteration count

        if !params.is_empty() {
            let mut bitmap = vec![0u8; (params.len() + 7) / 8];
            for (i, v) in params.iter().enumerate() {
                if v.is_null() {
                    bitmap[i / 8] |= 1 << (i % 8);
                }
            }
            self.writer.put_bytes(&bitmap);
            self.writer.put_u8(1); // types follow

            let mut values = BytesMut::new();
            for v in params {
                let tag = codec::param_type_tag(v);
                self.writer.payload_mut().put_slice(&tag);
                codec::encode_binary_value(&mut values, v);
            }
            self.writer.put_bytes(&values);
        }
        self.send_payload().await?;
        self.state = ClientState::AwaitingHead(Protocol::Binary);
        Ok(())
    }

    /// Close a server-side prepared statement. Fire-and-forget: the server
    /// sends no response.
    pub(crate) async fn close_statement(&mut self, statement_id: u32) -> Result<()> {
        self.cleanup().await?;
        self.writer.reset_seq();
        self.writer
            .begin()
            .put_u8(com::STMT_CLOSE)
            .put_u32(statement_id);
        self.send_payload().await?;
        // no response follows; the connection stays Ready
        Ok(())
    }

    /// COM_PING round trip, used for connection validation.
    pub(crate) async fn ping(&mut self) -> Result<()> {
        self.cleanup().await?;
        self.writer.reset_seq();
        self.writer.begin().put_u8(com::PING);
        self.send_payload().await?;
        let payload = self.read_packet().await?;
        let mut p = Parser::new(&payload);
        match p.get_u8()? {
            0x00 => {
                parse_ok_payload(&mut p)?;
                Ok(())
            }
            0xFF => {
                let e = parse_err_payload(&mut p);
                Err(self.register(e))
            }
            v => Err(self.register(Error::Protocol(format!(
                "unexpected ping response {v:#04x}"
            )))),
        }
    }

    /// Best-effort COM_QUIT; errors from a dying socket are ignored.
    pub(crate) async fn quit(&mut self) {
        if matches!(self.state, ClientState::Broken) {
            return;
        }
        self.writer.reset_seq();
        self.writer.begin().put_u8(com::QUIT);
        if let Err(e) = self.writer.send().await {
            debug!(error = %e, "ignoring error while closing connection");
        }
        self.state = ClientState::Broken;
    }

    // ========================================================================
    // Pipelining
    // ========================================================================

    /// Submit several text-protocol statements before reading any response,
    /// then attribute each response to its statement in submission order.
    pub(crate) async fn pipeline(&mut self, statements: &[String]) -> Result<Vec<PipelineOutcome>> {
        self.cleanup().await?;
        for sql in statements {
            self.writer.reset_seq();
            self.writer.begin().put_u8(com::QUERY).put_bytes(sql.as_bytes());
            if let Err(e) = self.writer.send().await {
                return Err(self.register(e));
            }
        }
        self.pending_responses = statements.len();

        let mut outcomes = Vec::with_capacity(statements.len());
        for _ in statements {
            self.pending_responses -= 1;
            // each response restarts numbering after its own request
            self.reader.seq = 1;
            self.state = ClientState::AwaitingHead(Protocol::Text);
            match self.read_head().await {
                Ok(ResponseHead::Ok(ok)) => {
                    // drain any multi-result tail of this statement
                    while self.has_more_results() {
                        self.read_head().await?;
                        while self.read_row().await?.is_some() {}
                    }
                    outcomes.push(PipelineOutcome::Update(ok.into()));
                }
                Ok(ResponseHead::ResultSet(columns)) => {
                    let names = columns.iter().map(|c| c.name.clone()).collect();
                    let mut rows = Vec::new();
                    while let Some(row) = self.read_row().await? {
                        rows.push(row.into_values());
                    }
                    while self.has_more_results() {
                        self.read_head().await?;
                        while self.read_row().await?.is_some() {}
                    }
                    outcomes.push(PipelineOutcome::Rows(ExecutionResult {
                        columns: names,
                        rows,
                        rows_affected: 0,
                    }));
                }
                Err(e) if !e.is_fatal() => outcomes.push(PipelineOutcome::ServerError(e)),
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }
}

/// A lazy, finite sequence of rows, decoded from the socket only on demand.
///
/// Dropping the sequence part-way is safe: whatever remains on the wire is
/// skipped before the connection runs its next command, so cancellation
/// never desynchronizes the protocol.
pub struct RowSequence<'a> {
    client: &'a mut Client,
    columns: Arc<Vec<ColumnDefinition>>,
    update: Option<UpdateResult>,
    exhausted: bool,
}

impl<'a> RowSequence<'a> {
    pub(crate) fn start(client: &'a mut Client, head: ResponseHead) -> RowSequence<'a> {
        match head {
            ResponseHead::Ok(ok) => RowSequence {
                client,
                columns: Arc::new(Vec::new()),
                update: Some(ok.into()),
                exhausted: true,
            },
            ResponseHead::ResultSet(columns) => RowSequence {
                client,
                columns,
                update: None,
                exhausted: false,
            },
        }
    }

    /// Column metadata of the current result.
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Update counts, when the current result carries no rows.
    pub fn update_result(&self) -> Option<&UpdateResult> {
        self.update.as_ref()
    }

    /// Pull the next row. `None` ends the current result.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        if self.exhausted {
            return Ok(None);
        }
        match self.client.read_row().await? {
            Some(row) => Ok(Some(row)),
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Advance to the next result of a multi-statement execution, skipping
    /// any unread rows of the current one. Returns false when no further
    /// result exists.
    pub async fn next_result(&mut self) -> Result<bool> {
        while !self.exhausted {
            if self.next().await?.is_none() {
                break;
            }
        }
        if !self.client.has_more_results() {
            return Ok(false);
        }
        match self.client.read_head().await? {
            ResponseHead::Ok(ok) => {
                self.columns = Arc::new(Vec::new());
                self.update = Some(ok.into());
                self.exhausted = true;
            }
            ResponseHead::ResultSet(columns) => {
                self.columns = columns;
                self.update = None;
                self.exhausted = false;
            }
        }
        Ok(true)
    }

    /// Stop consuming: skip whatever the server still has to say for this
    /// statement so the connection is immediately reusable.
    pub async fn cancel(self) -> Result<()> {
        self.client.cleanup().await
    }
}

fn decode_text_row(payload: &[u8], columns: &[ColumnDefinition]) -> Result<Vec<Value>> {
    let mut p = Parser::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for col in columns {
        match p.get_lenenc_opt()? {
            None => values.push(Value::Null),
            Some(len) => {
                let raw = p.get_bytes(len as usize)?;
                values.push(codec::decode_text_value(raw, col)?);
            }
        }
    }
    Ok(values)
}

fn decode_binary_row(payload: &[u8], columns: &[ColumnDefinition]) -> Result<Vec<Value>> {
    let mut p = Parser::new(payload);
    let header = p.get_u8()?;
    if header != 0x00 {
        return Err(Error::Protocol(format!(
            "unexpected binary row header {header:#04x}"
        )));
    }
    let bitmap = p.get_bytes((columns.len() + 7 + 2) / 8)?.to_vec();
    let mut values = Vec::with_capacity(columns.len());
    for (i, col) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
        } else {
            values.push(codec::decode_binary_value(&mut p, col)?);
        }
    }
    Ok(values)
}

impl Drop for Client {
    fn drop(&mut self) {
        if !matches!(self.state, ClientState::Broken | ClientState::Ready) {
            warn!(
                connection_id = self.connection_id,
                "connection dropped with an unfinished result on the wire"
            );
        }
    }
}
