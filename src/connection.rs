//! The connection handle and its driver.
//!
//! [`connect`] yields a cloneable [`Connection`] handle and a [`Driver`]
//! future. The driver owns the socket and the
//! [`ConnectionSm`][crate::machine::ConnectionSm]; it turns socket bytes
//! into machine events and machine [`Action`]s into socket writes, settled
//! sinks and row-stream pushes. Spawn it wherever the socket should live:
//!
//! ```no_run
//! use pglane::{Config, Connection};
//!
//! # async fn app() -> pglane::Result<()> {
//! let (conn, driver) = Connection::connect(&Config::from_env()).await?;
//! tokio::spawn(driver);
//!
//! let mut rows = conn.query("SELECT $1::int4").bind(420).fetch().await?;
//! while let Some(row) = rows.next().await? {
//!     let value: i32 = row.try_get(0)?;
//!     assert_eq!(value, 420);
//! }
//! # Ok(())
//! # }
//! ```
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    num::NonZeroUsize,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use lru::LruCache;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};

use crate::{
    common::ByteStr,
    config::Config,
    encode::{Encode, Encoded},
    error::{Error, ErrorKind, Result},
    machine::{
        check_bind_len, Action, CleanUp, CloseContext, ConnectionSm, PrepareContext,
        QueryContext, QueryTarget, ResultSink, StartupContext, StatementDescription, Task,
    },
    postgres::{backend::NotificationResponse, frontend, Oid},
    row::{Row, RowSchema},
    statement::{next_statement_name, UNNAMED_PORTAL},
    stream::{CommandTag, RowStream, StreamEvent, StreamSource},
    transport::PgStream,
};

/// Prepared statements cached per connection, keyed by the query text hash.
const STATEMENT_CACHE_SIZE: usize = 256;

/// Receiver for server `NOTIFY` traffic.
///
/// Notifications can arrive between any two protocol messages and are
/// delivered out of band, without affecting task ordering.
pub trait NotificationSink: Send {
    fn notification(&mut self, notification: NotificationResponse);
}

impl<F> NotificationSink for F
where
    F: FnMut(NotificationResponse) + Send,
{
    fn notification(&mut self, notification: NotificationResponse) {
        self(notification)
    }
}

/// A prepared statement, reusable across queries on its connection.
#[derive(Debug, Clone)]
pub struct Statement {
    name: ByteStr,
    param_oids: Vec<Oid>,
    schema: Option<Arc<RowSchema>>,
}

impl Statement {
    /// The statement's wire name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter type oids, as described by the server.
    pub fn param_oids(&self) -> &[Oid] {
        &self.param_oids
    }

    /// Result layout, `None` for statements which return no rows.
    pub fn schema(&self) -> Option<&RowSchema> {
        self.schema.as_deref()
    }
}

enum Command {
    Query {
        sql: ByteStr,
        params: Vec<Encoded>,
        persistent: bool,
        sink: ResultSink<RowStream>,
    },
    QueryStatement {
        statement: ByteStr,
        schema: Option<Arc<RowSchema>>,
        params: Vec<Encoded>,
        sink: ResultSink<RowStream>,
    },
    Prepare {
        sql: ByteStr,
        sink: ResultSink<StatementDescription>,
    },
    Close {
        target: frontend::Close,
        sink: ResultSink<()>,
    },
    StreamDemand(u64),
    StreamCancel(u64),
    Terminate(oneshot::Sender<()>),
}

/// A cloneable handle to one postgres connection.
///
/// All handles feed the same FIFO task queue; queries run strictly in
/// submission order. Dropping every handle (and every live [`RowStream`])
/// closes the connection gracefully.
#[derive(Clone)]
pub struct Connection {
    send: UnboundedSender<Command>,
}

impl Connection {
    /// Connect and authenticate per `config`.
    ///
    /// The returned [`Driver`] must be polled (usually via `tokio::spawn`)
    /// for the connection to make progress.
    pub async fn connect(config: &Config) -> Result<(Connection, Driver)> {
        let stream = PgStream::connect(config).await?;
        let mut sm = ConnectionSm::new(StartupContext::from(config));
        let stream = startup(stream, &mut sm, config).await?;
        Ok(assemble(sm, stream))
    }

    /// Connect using [`Config::from_env`].
    pub async fn connect_env() -> Result<(Connection, Driver)> {
        Self::connect(&Config::from_env()).await
    }

    /// Start building an extended query.
    pub fn query(&self, sql: impl Into<ByteStr>) -> Query<'_> {
        Query {
            conn: self,
            sql: sql.into(),
            params: Vec::new(),
            persistent: true,
        }
    }

    /// Parse and describe `sql` as a named prepared statement.
    pub async fn prepare(&self, sql: impl Into<ByteStr>) -> Result<Statement> {
        let (sink, rx) = ResultSink::new();
        self.submit(Command::Prepare { sql: sql.into(), sink })?;
        let description = settled(rx).await?;
        Ok(Statement {
            name: description.statement,
            param_oids: description.param_oids,
            schema: description.columns.map(RowSchema::new),
        })
    }

    /// Execute a previously prepared statement, skipping Parse/Describe.
    pub fn query_statement<'a>(&'a self, statement: &Statement) -> StatementQuery<'a> {
        StatementQuery {
            conn: self,
            statement: statement.name.clone(),
            schema: statement.schema.clone(),
            params: Vec::new(),
        }
    }

    /// Close a prepared statement on the server.
    pub async fn close_statement(&self, statement: &Statement) -> Result<()> {
        self.close_target(frontend::Close::statement(statement.name.clone())).await
    }

    /// Close a named portal on the server.
    pub async fn close_portal(&self, portal: impl Into<ByteStr>) -> Result<()> {
        self.close_target(frontend::Close::portal(portal.into())).await
    }

    async fn close_target(&self, target: frontend::Close) -> Result<()> {
        let (sink, rx) = ResultSink::new();
        self.submit(Command::Close { target, sink })?;
        settled(rx).await
    }

    /// Gracefully close the connection once queued work drains.
    ///
    /// Closing an already-closed connection succeeds.
    pub async fn close(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        if self.send.send(Command::Terminate(ack)).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.send.send(command).map_err(|_| Error::closed())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Await a sink's receiver, mapping a dropped sink to a closed connection.
async fn settled<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await.map_err(|_| Error::closed())?
}

/// Builder for one extended query.
#[derive(Debug)]
#[must_use = "queries do nothing until fetched or executed"]
pub struct Query<'a> {
    conn: &'a Connection,
    sql: ByteStr,
    params: Vec<Encoded>,
    persistent: bool,
}

impl Query<'_> {
    /// Bind the next `$n` parameter.
    pub fn bind<V: Encode>(mut self, value: V) -> Self {
        self.params.push(value.encode());
        self
    }

    /// Skip the prepared-statement cache for this query.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Run the query, streaming rows back with backpressure.
    pub async fn fetch(self) -> Result<RowStream> {
        check_bind_len(&self.params)?;
        let (sink, rx) = ResultSink::new();
        self.conn.submit(Command::Query {
            sql: self.sql,
            params: self.params,
            persistent: self.persistent,
            sink,
        })?;
        settled(rx).await
    }

    /// Run the query and collect every row.
    pub async fn fetch_all(self) -> Result<Vec<Row>> {
        self.fetch().await?.all().await
    }

    /// Run the query and return the command tag.
    pub async fn execute(self) -> Result<CommandTag> {
        let mut stream = self.fetch().await?;
        stream.all().await?;
        Ok(stream.command_tag().clone())
    }
}

/// Builder for executing a prepared [`Statement`].
#[derive(Debug)]
#[must_use = "queries do nothing until fetched or executed"]
pub struct StatementQuery<'a> {
    conn: &'a Connection,
    statement: ByteStr,
    schema: Option<Arc<RowSchema>>,
    params: Vec<Encoded>,
}

impl StatementQuery<'_> {
    pub fn bind<V: Encode>(mut self, value: V) -> Self {
        self.params.push(value.encode());
        self
    }

    pub async fn fetch(self) -> Result<RowStream> {
        check_bind_len(&self.params)?;
        let (sink, rx) = ResultSink::new();
        self.conn.submit(Command::QueryStatement {
            statement: self.statement,
            schema: self.schema,
            params: self.params,
            sink,
        })?;
        settled(rx).await
    }

    pub async fn fetch_all(self) -> Result<Vec<Row>> {
        self.fetch().await?.all().await
    }

    pub async fn execute(self) -> Result<CommandTag> {
        let mut stream = self.fetch().await?;
        stream.all().await?;
        Ok(stream.command_tag().clone())
    }
}

/// Drive the startup phase inline: SSL negotiation, authentication, and the
/// parameter/key-data exchange up to the first `ReadyForQuery`.
async fn startup(mut stream: PgStream, sm: &mut ConnectionSm, config: &Config) -> Result<PgStream> {
    let mut action = sm.connected();

    loop {
        action = match action {
            Action::SendSslRequest => {
                stream.send_ssl_request();
                stream.flush().await?;
                match stream.recv_ssl_reply().await? {
                    b'S' => sm.ssl_supported(),
                    _ => sm.ssl_unsupported(),
                }
            },
            Action::EstablishSsl => {
                stream = stream.establish_tls(config).await?;
                sm.tls_established()
            },
            Action::SendStartup { user, database } => {
                stream.send_startup(&frontend::Startup {
                    user: &user,
                    database: database.as_deref(),
                    replication: None,
                });
                stream.flush().await?;
                Action::Read
            },
            Action::SendPassword { password } => {
                stream.send(&frontend::PasswordMessage { password: &password });
                stream.flush().await?;
                Action::Read
            },
            Action::SendSaslInitial { mechanism, data } => {
                stream.send(&frontend::SaslInitialResponse { mechanism, data: &data });
                stream.flush().await?;
                Action::Read
            },
            Action::SendSaslResponse { data } => {
                stream.send(&frontend::SaslResponse { data: &data });
                stream.flush().await?;
                Action::Read
            },
            Action::ForwardNotice { notice } => {
                tracing::warn!(target: "pglane", "{notice}");
                Action::Read
            },
            Action::ForwardNotification { notification } => {
                tracing::debug!(
                    target: "pglane",
                    channel = %notification.channel,
                    "notification during startup",
                );
                Action::Read
            },
            Action::FireReadyForQuery => return Ok(stream),
            Action::CloseConnection { clean_up } => {
                let error = clean_up
                    .map(|c| c.error)
                    .unwrap_or_else(Error::closed);
                return Err(error.context("startup"));
            },
            Action::Read | Action::Wait => {
                let message = stream.recv().await?;
                sm.message(message)
            },
            action => unreachable!("query action during startup: {action:?}"),
        };
    }
}

/// Wire an authenticated stream and its machine into a handle/driver pair.
fn assemble(sm: ConnectionSm, stream: PgStream) -> (Connection, Driver) {
    let (send, recv) = mpsc::unbounded_channel();
    let driver = Driver {
        sm,
        stream,
        recv,
        recv_closed: false,
        commands: send.downgrade(),
        cache: LruCache::new(NonZeroUsize::new(STATEMENT_CACHE_SIZE).unwrap()),
        active: None,
        next_stream: 0,
        // one read stays pending while idle, for async notifications and
        // peer-close detection
        pending_read: true,
        notifications: None,
        terminators: Vec::new(),
        done: false,
    };
    (Connection { send }, driver)
}

/// The active stream's producer half.
struct ActiveStream {
    id: u64,
    send: UnboundedSender<StreamEvent>,
}

/// Row-stream back-capability: demand and cancellation are commands like
/// any other, tagged so a stale stream cannot steer a later query.
struct SourceHandle {
    send: UnboundedSender<Command>,
    id: u64,
}

impl StreamSource for SourceHandle {
    fn request(&self) {
        let _ = self.send.send(Command::StreamDemand(self.id));
    }

    fn cancel(&self) {
        let _ = self.send.send(Command::StreamCancel(self.id));
    }
}

/// The connection's IO task.
///
/// Completes when the connection closes, gracefully or not; errors reach
/// the callers through their sinks, so the future itself yields nothing.
pub struct Driver {
    sm: ConnectionSm,
    stream: PgStream,
    recv: UnboundedReceiver<Command>,
    recv_closed: bool,
    /// Upgraded into every [`SourceHandle`] so live streams keep the
    /// driver reachable; weak here so the driver itself does not.
    commands: mpsc::WeakUnboundedSender<Command>,
    cache: LruCache<u64, (ByteStr, Option<Arc<RowSchema>>)>,
    active: Option<ActiveStream>,
    next_stream: u64,
    /// The machine wants socket reads.
    pending_read: bool,
    notifications: Option<Box<dyn NotificationSink>>,
    terminators: Vec<oneshot::Sender<()>>,
    done: bool,
}

impl Driver {
    /// Register a sink for `NOTIFY` traffic.
    pub fn set_notification_sink(&mut self, sink: impl NotificationSink + 'static) {
        self.notifications = Some(Box::new(sink));
    }

    fn command(&mut self, command: Command) {
        match command {
            Command::Query { sql, params, persistent, sink } => {
                let task = self.query_task(sql, params, persistent, sink);
                let action = self.sm.enqueue(task);
                self.run(action);
            },
            Command::QueryStatement { statement, schema, params, sink } => {
                let task = Task::Query(QueryContext {
                    target: QueryTarget::Reuse { statement, schema },
                    params,
                    cache_key: None,
                    sink,
                });
                let action = self.sm.enqueue(task);
                self.run(action);
            },
            Command::Prepare { sql, sink } => {
                let statement = next_statement_name();
                let task = Task::Prepare(PrepareContext { statement, sql, sink });
                let action = self.sm.enqueue(task);
                self.run(action);
            },
            Command::Close { target, sink } => {
                let task = Task::Close(CloseContext { target, sink });
                let action = self.sm.enqueue(task);
                self.run(action);
            },
            Command::StreamDemand(id) => {
                if self.active.as_ref().is_some_and(|a| a.id == id) {
                    let action = self.sm.stream_demand();
                    self.run(action);
                }
            },
            Command::StreamCancel(id) => {
                if self.active.as_ref().is_some_and(|a| a.id == id) {
                    let action = self.sm.stream_cancel();
                    self.run(action);
                }
            },
            Command::Terminate(ack) => {
                self.terminators.push(ack);
                let action = self.sm.terminate();
                self.run(action);
            },
        }
    }

    /// Resolve a textual query against the statement cache.
    fn query_task(
        &mut self,
        sql: ByteStr,
        params: Vec<Encoded>,
        persistent: bool,
        sink: ResultSink<RowStream>,
    ) -> Task {
        let sql = sql.trimmed();

        if !persistent {
            return Task::Query(QueryContext {
                target: QueryTarget::Parse { statement: ByteStr::from_static(""), sql },
                params,
                cache_key: None,
                sink,
            });
        }

        let key = {
            let mut hasher = DefaultHasher::new();
            sql.hash(&mut hasher);
            hasher.finish()
        };

        let target = match self.cache.get(&key) {
            Some((statement, schema)) => QueryTarget::Reuse {
                statement: statement.clone(),
                schema: schema.clone(),
            },
            None => QueryTarget::Parse { statement: next_statement_name(), sql },
        };

        Task::Query(QueryContext { target, params, cache_key: Some(key), sink })
    }

    /// Execute one machine action.
    fn run(&mut self, action: Action) {
        if action.sends() {
            self.pending_read = true;
        }

        match action {
            Action::SendParseDescribeBindExecuteSync { statement, sql, params } => {
                self.stream.send(&frontend::Parse {
                    name: &statement,
                    sql: &sql,
                    param_oids: &params.iter().map(Encoded::oid).collect::<Vec<_>>(),
                });
                self.stream.send(&frontend::Describe::statement(&statement));
                self.stream.send(&frontend::Bind {
                    portal: UNNAMED_PORTAL,
                    statement: &statement,
                    params: &params,
                });
                self.stream.send(&frontend::Execute { portal: UNNAMED_PORTAL, max_rows: 0 });
                self.stream.send(&frontend::Sync);
            },
            Action::SendParseDescribeSync { statement, sql } => {
                self.stream.send(&frontend::Parse { name: &statement, sql: &sql, param_oids: &[] });
                self.stream.send(&frontend::Describe::statement(&statement));
                self.stream.send(&frontend::Sync);
            },
            Action::SendBindExecuteSync { statement, params } => {
                self.stream.send(&frontend::Bind {
                    portal: UNNAMED_PORTAL,
                    statement: &statement,
                    params: &params,
                });
                self.stream.send(&frontend::Execute { portal: UNNAMED_PORTAL, max_rows: 0 });
                self.stream.send(&frontend::Sync);
            },
            Action::SendCloseSync { target } => {
                self.stream.send(&target);
                self.stream.send(&frontend::Sync);
            },

            Action::SucceedQuery { ctx, schema } => {
                self.remember(ctx.cache_key, &ctx.target, Some(schema.clone()));
                // the awaiting caller's borrow keeps a handle alive, so the
                // upgrade only fails when nobody is left to take the stream
                let Some(commands) = self.commands.upgrade() else {
                    return;
                };
                let (send, events) = mpsc::unbounded_channel();
                self.next_stream += 1;
                let id = self.next_stream;
                self.active = Some(ActiveStream { id, send });
                let source = SourceHandle { send: commands, id };
                ctx.sink.succeed(RowStream::new(schema, events, Box::new(source)));
            },
            Action::SucceedQueryNoRows { ctx, tag } => {
                self.remember(ctx.cache_key, &ctx.target, None);
                ctx.sink.succeed(RowStream::finished(tag));
            },
            Action::FailQuery { ctx, error, clean_up } => {
                ctx.sink.fail(error);
                if let Some(clean_up) = clean_up {
                    self.clean_up(clean_up);
                }
            },

            Action::ForwardRows { rows } => {
                self.pending_read = false;
                if let Some(active) = &self.active {
                    let _ = active.send.send(StreamEvent::Rows(rows));
                }
            },
            Action::ForwardStreamComplete { rows, tag } => {
                if let Some(active) = self.active.take() {
                    if !rows.is_empty() {
                        let _ = active.send.send(StreamEvent::Rows(rows));
                    }
                    let _ = active.send.send(StreamEvent::Complete(tag));
                }
            },
            Action::ForwardStreamError { error, clean_up } => {
                if let Some(active) = self.active.take() {
                    let _ = active.send.send(StreamEvent::Fail(error));
                }
                if let Some(clean_up) = clean_up {
                    self.clean_up(clean_up);
                }
            },

            Action::SucceedPrepare { ctx, description } => ctx.sink.succeed(description),
            Action::FailPrepare { ctx, error, clean_up } => {
                ctx.sink.fail(error);
                if let Some(clean_up) = clean_up {
                    self.clean_up(clean_up);
                }
            },
            Action::SucceedClose { ctx } => ctx.sink.succeed(()),
            Action::FailClose { ctx, error, clean_up } => {
                ctx.sink.fail(error);
                if let Some(clean_up) = clean_up {
                    self.clean_up(clean_up);
                }
            },
            Action::FailTask { task, error } => task.fail(error),

            Action::ForwardNotice { notice } => {
                tracing::warn!(target: "pglane", "{notice}");
            },
            Action::ForwardNotification { notification } => {
                match &mut self.notifications {
                    Some(sink) => sink.notification(notification),
                    None => tracing::debug!(
                        target: "pglane",
                        channel = %notification.channel,
                        "notification without a registered sink",
                    ),
                }
            },

            Action::FireReadyForQuery => {},
            Action::CloseConnection { clean_up } => {
                match clean_up {
                    Some(clean_up) => self.clean_up(clean_up),
                    None => {
                        // healthy close: say goodbye first
                        self.stream.send(&frontend::Terminate);
                        self.done = true;
                    },
                }
            },

            Action::Read => self.pending_read = true,
            Action::Wait => {},

            action @ (Action::SendStartup { .. }
            | Action::SendSslRequest
            | Action::EstablishSsl
            | Action::SendPassword { .. }
            | Action::SendSaslInitial { .. }
            | Action::SendSaslResponse { .. }) => {
                unreachable!("startup action after startup: {action:?}")
            },
        }
    }

    /// Populate the statement cache after a successful parse+describe.
    fn remember(
        &mut self,
        cache_key: Option<u64>,
        target: &QueryTarget,
        schema: Option<Arc<RowSchema>>,
    ) {
        let (Some(key), QueryTarget::Parse { statement, .. }) = (cache_key, target) else {
            return;
        };
        if !statement.is_empty() {
            self.cache.put(key, (statement.clone(), schema));
        }
    }

    /// Fail everything the machine handed back and close the socket.
    fn clean_up(&mut self, clean_up: CleanUp) {
        tracing::error!(target: "pglane", "connection failed: {}", clean_up.error);
        if let Some(active) = self.active.take() {
            let _ = active.send.send(StreamEvent::Fail(clean_up.error.clone()));
        }
        for task in clean_up.tasks {
            task.fail(clean_up.error.clone());
        }
        self.done = true;
    }

    /// The socket is dead; no goodbye possible.
    fn channel_dead(&mut self, error: Error) {
        let action = self.sm.channel_inactive(error);
        self.run(action);
    }
}

impl Future for Driver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();

        loop {
            let mut progress = false;

            // 1. user commands
            while !me.recv_closed && !me.done {
                match me.recv.poll_recv(cx) {
                    Poll::Ready(Some(command)) => {
                        progress = true;
                        me.command(command);
                    },
                    Poll::Ready(None) => {
                        // every handle and stream dropped
                        me.recv_closed = true;
                        progress = true;
                        let action = me.sm.terminate();
                        me.run(action);
                    },
                    Poll::Pending => break,
                }
            }

            // 2. shutdown path
            if me.done {
                if me.stream.wants_flush() {
                    let _ = ready!(me.stream.poll_flush(cx));
                }
                let _ = ready!(me.stream.poll_shutdown(cx));
                for ack in me.terminators.drain(..) {
                    let _ = ack.send(());
                }
                return Poll::Ready(());
            }

            // 3. pending writes
            if me.stream.wants_flush() {
                match me.stream.poll_flush(cx) {
                    Poll::Ready(Ok(())) => {},
                    Poll::Ready(Err(err)) => {
                        me.channel_dead(err.into());
                        continue;
                    },
                    Poll::Pending => {},
                }
            }

            // 4. socket reads, paced by the machine
            while me.pending_read && !me.done {
                match me.stream.poll_read(cx) {
                    Poll::Ready(Ok(0)) => {
                        progress = true;
                        me.channel_dead(Error::unclean_shutdown());
                        break;
                    },
                    Poll::Ready(Ok(_)) => {
                        progress = true;
                        // one readable burst is one row batch
                        loop {
                            if me.done {
                                break;
                            }
                            match me.stream.try_decode() {
                                Ok(Some(message)) => {
                                    let action = me.sm.message(message);
                                    me.run(action);
                                },
                                Ok(None) => break,
                                Err(err) => {
                                    me.channel_dead(err);
                                    break;
                                },
                            }
                        }
                        if !me.done {
                            let action = me.sm.read_complete();
                            // the burst's pacing verdict: `Wait` pauses the
                            // socket until the stream demands more
                            if matches!(action, Action::Wait) {
                                me.pending_read = false;
                            }
                            me.run(action);
                        }
                    },
                    Poll::Ready(Err(err)) => {
                        progress = true;
                        me.channel_dead(err.into());
                        break;
                    },
                    Poll::Pending => break,
                }
            }

            if !progress {
                return Poll::Pending;
            }
        }
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("stream", &self.stream)
            .field("pending_read", &self.pending_read)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Scripted round trips over a loopback socket pair; the "server" answers
/// each client burst with canned backend bytes.
#[cfg(test)]
mod test {
    use bytes::{BufMut, BytesMut};

    use super::*;

    fn msg(buf: &mut BytesMut, msgtype: u8, body: &[u8]) {
        buf.put_u8(msgtype);
        buf.put_i32(body.len() as i32 + 4);
        buf.put_slice(body);
    }

    fn startup_response() -> Vec<u8> {
        let mut buf = BytesMut::new();
        msg(&mut buf, b'R', &0i32.to_be_bytes()); // AuthenticationOk
        msg(&mut buf, b'S', b"server_version\x0016.2\x00");
        let mut key = BytesMut::new();
        key.put_i32(1234);
        key.put_i32(5678);
        msg(&mut buf, b'K', &key);
        msg(&mut buf, b'Z', b"I");
        buf.to_vec()
    }

    fn text_column(name: &str) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_i16(1);
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_u32(0);
        body.put_i16(0);
        body.put_u32(25);
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_i16(0);
        body
    }

    fn select_response(rows: &[&[u8]], tag: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        msg(&mut buf, b'1', b""); // ParseComplete
        msg(&mut buf, b't', &0i16.to_be_bytes());
        msg(&mut buf, b'T', &text_column("x"));
        msg(&mut buf, b'2', b""); // BindComplete
        for row in rows {
            let mut body = BytesMut::new();
            body.put_i16(1);
            body.put_i32(row.len() as i32);
            body.put_slice(row);
            msg(&mut buf, b'D', &body);
        }
        let mut complete = BytesMut::new();
        complete.put_slice(tag.as_bytes());
        complete.put_u8(0);
        msg(&mut buf, b'C', &complete);
        msg(&mut buf, b'Z', b"I");
        buf.to_vec()
    }

    fn delete_response(tag: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        msg(&mut buf, b'1', b"");
        let mut oids = BytesMut::new();
        oids.put_i16(1);
        oids.put_u32(20);
        msg(&mut buf, b't', &oids);
        msg(&mut buf, b'n', b""); // NoData
        msg(&mut buf, b'2', b"");
        let mut complete = BytesMut::new();
        complete.put_slice(tag.as_bytes());
        complete.put_u8(0);
        msg(&mut buf, b'C', &complete);
        msg(&mut buf, b'Z', b"I");
        buf.to_vec()
    }

    /// Answer each incoming burst with the next canned response.
    async fn script_server(mut server: PgStream, responses: Vec<Vec<u8>>) {
        for response in responses {
            let n = std::future::poll_fn(|cx| server.poll_read(cx)).await.unwrap();
            assert!(n > 0, "client closed before the script finished");
            server.take_read_buf();
            server.send_raw(&response);
            server.flush().await.unwrap();
        }
    }

    async fn connect_scripted(
        responses: Vec<Vec<u8>>,
    ) -> (Connection, tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let (client, server) = PgStream::test_pair();
        let config = Config::new("crab").dbname("marina");
        let mut sm = ConnectionSm::new(StartupContext::from(&config));

        let mut scripted = vec![startup_response()];
        scripted.extend(responses);
        let server_task = tokio::spawn(script_server(server, scripted));

        let stream = startup(client, &mut sm, &config).await.unwrap();
        let (conn, driver) = assemble(sm, stream);
        let driver_task = tokio::spawn(driver);
        (conn, driver_task, server_task)
    }

    #[tokio::test]
    async fn select_round_trip_streams_rows() {
        let (conn, driver_task, server_task) =
            connect_scripted(vec![select_response(&[b"a", b"b"], "SELECT 2")]).await;

        let mut stream = conn.query("SELECT x").fetch().await.unwrap();
        assert_eq!(stream.schema().index_of("x"), Some(0));

        let rows = stream.all().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].try_get::<_, String>("x").unwrap(), "a");
        assert_eq!(rows[1].try_get::<_, String>(0).unwrap(), "b");
        assert_eq!(stream.command_tag().as_str(), "SELECT 2");
        assert_eq!(stream.command_tag().rows_affected(), 2);

        conn.close().await.unwrap();
        driver_task.await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn delete_round_trip_resolves_without_rows() {
        let (conn, driver_task, _server) =
            connect_scripted(vec![delete_response("DELETE 1")]).await;

        let tag = conn
            .query("DELETE FROM t WHERE id=$1")
            .bind(7i64)
            .execute()
            .await
            .unwrap();
        assert_eq!(tag.as_str(), "DELETE 1");
        assert_eq!(tag.rows_affected(), 1);

        conn.close().await.unwrap();
        driver_task.await.unwrap();
    }

    #[tokio::test]
    async fn queries_share_one_connection_in_order() {
        let (conn, driver_task, _server) = connect_scripted(vec![
            select_response(&[b"first"], "SELECT 1"),
            select_response(&[b"second"], "SELECT 1"),
        ])
        .await;

        // distinct query texts so the second is not a cache hit
        let rows = conn.query("SELECT x FROM a").fetch_all().await.unwrap();
        assert_eq!(rows[0].try_get::<_, String>(0).unwrap(), "first");

        let rows = conn.query("SELECT x FROM b").fetch_all().await.unwrap();
        assert_eq!(rows[0].try_get::<_, String>(0).unwrap(), "second");

        conn.close().await.unwrap();
        driver_task.await.unwrap();
    }

    #[tokio::test]
    async fn too_many_parameters_fail_before_hitting_the_wire() {
        let (conn, driver_task, _server) = connect_scripted(vec![]).await;

        let mut query = conn.query("SELECT 1");
        for _ in 0..crate::machine::MAX_BIND_PARAMETERS + 1 {
            query = query.bind(1i32);
        }
        let err = query.fetch().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::TooManyParameters { given: 32768 }));

        drop(conn);
        driver_task.await.unwrap();
    }

    #[tokio::test]
    async fn server_disconnect_fails_the_caller() {
        let (client, server) = PgStream::test_pair();
        let config = Config::new("crab");
        let mut sm = ConnectionSm::new(StartupContext::from(&config));

        let server_task = tokio::spawn(async move {
            let mut server = server;
            let n = std::future::poll_fn(|cx| server.poll_read(cx)).await.unwrap();
            assert!(n > 0);
            server.take_read_buf();
            server.send_raw(&startup_response());
            server.flush().await.unwrap();
            // wait for the query, then hang up mid-protocol
            let n = std::future::poll_fn(|cx| server.poll_read(cx)).await.unwrap();
            assert!(n > 0);
        });

        let stream = startup(client, &mut sm, &config).await.unwrap();
        let (conn, driver) = assemble(sm, stream);
        let driver_task = tokio::spawn(driver);

        let err = conn.query("SELECT 1").fetch().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UncleanShutdown));

        server_task.await.unwrap();
        driver_task.await.unwrap();
    }
}
