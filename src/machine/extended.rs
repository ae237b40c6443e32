//! The extended-query sub-state machine.
//!
//! One instance drives a single Parse/Describe/Bind/Execute/Sync round trip
//! (or the prepare-only Parse/Describe/Sync variant), decoding data rows and
//! pacing socket reads against consumer demand. The enclosing connection
//! machine routes messages here while the sub-state is active and consumes
//! the final `ReadyForQuery` itself.
use std::{mem, sync::Arc};

use crate::{
    error::{Error, ErrorKind},
    machine::{Action, PrepareContext, QueryContext, QueryTarget, StatementDescription, Task},
    postgres::{backend::BackendMessage, Oid},
    row::{Row, RowSchema},
    stream::CommandTag,
};

/// The per-query machine, embedded in the connection state.
#[derive(Debug)]
pub struct ExtendedQuerySm {
    state: State,
}

#[derive(Debug)]
enum State {
    InitialQuery(QueryContext),
    InitialPrepare(PrepareContext),

    // execute path
    ParseDescribeBindExecuteSyncSent(QueryContext),
    ParseCompleteReceived(QueryContext),
    ParameterDescriptionReceived(QueryContext),
    RowDescriptionReceived(QueryContext, Arc<RowSchema>),
    NoDataReceived(QueryContext),
    /// Reuse path: Bind/Execute/Sync went out against a known statement.
    BindExecuteSyncSent(QueryContext, Option<Arc<RowSchema>>),

    // prepare path
    ParseDescribeSyncSent(PrepareContext),
    PrepareParseComplete(PrepareContext),
    PrepareDescribed(PrepareContext, Vec<Oid>),

    /// The statement returns no rows; the caller is settled at
    /// `CommandComplete`.
    NoRowsPending(QueryContext),
    /// Rows are flowing; the stream was handed to the caller.
    Streaming {
        schema: Arc<RowSchema>,
        /// Rows decoded since the last forward.
        buffer: Vec<Row>,
        /// The consumer asked for more and no batch went out since.
        demand: bool,
    },
    /// The caller canceled; discard rows until the round trip ends.
    Drain,

    /// Completed or failed; only the outer `ReadyForQuery` remains.
    Completed,
    Failed { fatal: bool },

    Busy,
}

impl ExtendedQuerySm {
    pub(crate) fn query(ctx: QueryContext) -> Self {
        Self { state: State::InitialQuery(ctx) }
    }

    pub(crate) fn prepare(ctx: PrepareContext) -> Self {
        Self { state: State::InitialPrepare(ctx) }
    }

    /// Reached a terminal sub-state; the next `ReadyForQuery` belongs to the
    /// connection machine.
    pub(crate) fn is_complete(&self) -> bool {
        matches!(self.state, State::Completed | State::Failed { .. })
    }

    /// Failed in a way that must tear the connection down.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self.state, State::Failed { fatal: true })
    }

    /// Emit the opening messages for the owned task.
    pub(crate) fn start(&mut self) -> Action {
        match mem::replace(&mut self.state, State::Busy) {
            State::InitialQuery(mut ctx) => match &mut ctx.target {
                QueryTarget::Parse { statement, sql } => {
                    let action = Action::SendParseDescribeBindExecuteSync {
                        statement: statement.clone(),
                        sql: sql.clone(),
                        params: mem::take(&mut ctx.params),
                    };
                    self.state = State::ParseDescribeBindExecuteSyncSent(ctx);
                    action
                },
                QueryTarget::Reuse { statement, schema } => {
                    let action = Action::SendBindExecuteSync {
                        statement: statement.clone(),
                        params: mem::take(&mut ctx.params),
                    };
                    let schema = schema.take();
                    self.state = State::BindExecuteSyncSent(ctx, schema);
                    action
                },
            },
            State::InitialPrepare(ctx) => {
                let action = Action::SendParseDescribeSync {
                    statement: ctx.statement.clone(),
                    sql: ctx.sql.clone(),
                };
                self.state = State::ParseDescribeSyncSent(ctx);
                action
            },
            state => {
                self.state = state;
                unreachable!("`start` on a started query machine")
            },
        }
    }

    /// Route one backend message.
    pub(crate) fn message(&mut self, message: BackendMessage) -> Action {
        use BackendMessage::*;

        match (mem::replace(&mut self.state, State::Busy), message) {
            (State::ParseDescribeBindExecuteSyncSent(ctx), ParseComplete(_)) => {
                self.state = State::ParseCompleteReceived(ctx);
                Action::Wait
            },
            (State::ParseCompleteReceived(ctx), ParameterDescription(_)) => {
                self.state = State::ParameterDescriptionReceived(ctx);
                Action::Wait
            },
            (State::ParameterDescriptionReceived(ctx), RowDescription(rd)) => {
                self.state = State::RowDescriptionReceived(ctx, RowSchema::new(rd.columns));
                Action::Wait
            },
            (State::ParameterDescriptionReceived(ctx), NoData(_)) => {
                self.state = State::NoDataReceived(ctx);
                Action::Wait
            },
            (State::RowDescriptionReceived(ctx, schema), BindComplete(_)) => {
                self.state = State::Streaming {
                    schema: schema.clone(),
                    buffer: Vec::new(),
                    demand: false,
                };
                Action::SucceedQuery { ctx, schema }
            },
            (State::NoDataReceived(ctx), BindComplete(_)) => {
                self.state = State::NoRowsPending(ctx);
                Action::Wait
            },
            (State::BindExecuteSyncSent(ctx, Some(schema)), BindComplete(_)) => {
                self.state = State::Streaming {
                    schema: schema.clone(),
                    buffer: Vec::new(),
                    demand: false,
                };
                Action::SucceedQuery { ctx, schema }
            },
            (State::BindExecuteSyncSent(ctx, None), BindComplete(_)) => {
                self.state = State::NoRowsPending(ctx);
                Action::Wait
            },
            (State::NoRowsPending(ctx), CommandComplete(cmd)) => {
                self.state = State::Completed;
                Action::SucceedQueryNoRows { ctx, tag: CommandTag::new(cmd.tag) }
            },
            (State::NoRowsPending(ctx), EmptyQueryResponse(_)) => {
                self.state = State::Failed { fatal: false };
                Action::FailQuery { ctx, error: ErrorKind::EmptyQuery.into(), clean_up: None }
            },

            (State::Streaming { schema, mut buffer, demand }, DataRow(row)) => {
                buffer.push(Row::new(schema.clone(), &row));
                self.state = State::Streaming { schema, buffer, demand };
                Action::Wait
            },
            (State::Streaming { buffer, .. }, CommandComplete(cmd)) => {
                self.state = State::Completed;
                Action::ForwardStreamComplete { rows: buffer, tag: CommandTag::new(cmd.tag) }
            },
            (State::Streaming { .. }, ErrorResponse(err)) => {
                self.state = State::Failed { fatal: false };
                Action::ForwardStreamError {
                    error: err.into_server_error().into(),
                    clean_up: None,
                }
            },
            (State::Streaming { .. }, EmptyQueryResponse(_)) => {
                self.state = State::Failed { fatal: false };
                Action::ForwardStreamError { error: ErrorKind::EmptyQuery.into(), clean_up: None }
            },
            (State::Streaming { .. }, message) => {
                // PortalSuspended lands here as well, the core never limits
                // the row count of an Execute
                self.state = State::Failed { fatal: true };
                Action::ForwardStreamError {
                    error: message.unexpected("extended query streaming").into(),
                    clean_up: None,
                }
            },

            (State::Drain, DataRow(_)) => {
                self.state = State::Drain;
                Action::Wait
            },
            (State::Drain, CommandComplete(cmd)) => {
                self.state = State::Completed;
                Action::ForwardStreamComplete { rows: Vec::new(), tag: CommandTag::new(cmd.tag) }
            },
            (State::Drain, ErrorResponse(err)) => {
                self.state = State::Failed { fatal: false };
                Action::ForwardStreamError {
                    error: err.into_server_error().into(),
                    clean_up: None,
                }
            },

            (State::ParseDescribeSyncSent(ctx), ParseComplete(_)) => {
                self.state = State::PrepareParseComplete(ctx);
                Action::Wait
            },
            (State::PrepareParseComplete(ctx), ParameterDescription(desc)) => {
                self.state = State::PrepareDescribed(ctx, desc.oids);
                Action::Wait
            },
            (State::PrepareDescribed(ctx, param_oids), RowDescription(rd)) => {
                self.state = State::Completed;
                let description = StatementDescription {
                    statement: ctx.statement.clone(),
                    param_oids,
                    columns: Some(rd.columns),
                };
                Action::SucceedPrepare { ctx, description }
            },
            (State::PrepareDescribed(ctx, param_oids), NoData(_)) => {
                self.state = State::Completed;
                let description = StatementDescription {
                    statement: ctx.statement.clone(),
                    param_oids,
                    columns: None,
                };
                Action::SucceedPrepare { ctx, description }
            },

            // a failure of the Sync stage after the command already
            // completed; the following ReadyForQuery recovers the
            // connection
            (State::Completed, ErrorResponse(_)) => {
                self.state = State::Failed { fatal: false };
                Action::Wait
            },
            (State::Failed { fatal }, ErrorResponse(_)) => {
                self.state = State::Failed { fatal };
                Action::Wait
            },

            // a server error before the stream exists fails the owned task;
            // the connection recovers at the following ReadyForQuery
            (state, ErrorResponse(err)) => {
                self.state = State::Failed { fatal: false };
                self.fail_task(state, err.into_server_error().into())
            },

            (state, message) => {
                let error: Error = message.unexpected("extended query").into();
                self.state = State::Failed { fatal: true };
                self.fail_task(state, error)
            },
        }
    }

    /// The read burst ended; flush buffered rows and decide whether the
    /// socket should be read again.
    pub(crate) fn read_complete(&mut self) -> Action {
        match mem::replace(&mut self.state, State::Busy) {
            State::Streaming { schema, buffer, demand } => {
                if buffer.is_empty() {
                    self.state = State::Streaming { schema, buffer, demand };
                    return match demand {
                        true => Action::Read,
                        false => Action::Wait,
                    };
                }
                // forwarding satisfies the outstanding request; reads stay
                // paused until the consumer asks again
                self.state = State::Streaming { schema, buffer: Vec::new(), demand: false };
                Action::ForwardRows { rows: buffer }
            },
            state => {
                // mid round-trip or draining, the reply is still incoming
                self.state = state;
                Action::Read
            },
        }
    }

    /// The stream consumer asked for more rows.
    pub(crate) fn stream_demand(&mut self) -> Action {
        match mem::replace(&mut self.state, State::Busy) {
            State::Streaming { schema, buffer, .. } => {
                if buffer.is_empty() {
                    self.state = State::Streaming { schema, buffer, demand: true };
                    return Action::Read;
                }
                self.state = State::Streaming { schema, buffer: Vec::new(), demand: false };
                Action::ForwardRows { rows: buffer }
            },
            state => {
                self.state = state;
                Action::Wait
            },
        }
    }

    /// The stream consumer is gone; drain the query to keep the protocol in
    /// lockstep.
    pub(crate) fn stream_cancel(&mut self) -> Action {
        match mem::replace(&mut self.state, State::Busy) {
            State::Streaming { .. } => {
                self.state = State::Drain;
                Action::Read
            },
            state => {
                self.state = state;
                Action::Wait
            },
        }
    }

    /// Fail the task still owned by `state`, or the connection when the
    /// task's sink is already settled.
    fn fail_task(&mut self, state: State, error: Error) -> Action {
        match state {
            State::InitialQuery(ctx)
            | State::ParseDescribeBindExecuteSyncSent(ctx)
            | State::ParseCompleteReceived(ctx)
            | State::ParameterDescriptionReceived(ctx)
            | State::RowDescriptionReceived(ctx, _)
            | State::NoDataReceived(ctx)
            | State::BindExecuteSyncSent(ctx, _)
            | State::NoRowsPending(ctx) => Action::FailQuery { ctx, error, clean_up: None },
            State::InitialPrepare(ctx)
            | State::ParseDescribeSyncSent(ctx)
            | State::PrepareParseComplete(ctx)
            | State::PrepareDescribed(ctx, _) => {
                Action::FailPrepare { ctx, error, clean_up: None }
            },
            State::Streaming { .. } | State::Drain => {
                Action::ForwardStreamError { error, clean_up: None }
            },
            State::Completed | State::Failed { .. } => {
                Action::CloseConnection {
                    clean_up: Some(super::CleanUp { error, tasks: Vec::new() }),
                }
            },
            State::Busy => unreachable!("transient sub-state observed"),
        }
    }

    /// Tear-down: hand the owned task back so the glue can fail it.
    pub(crate) fn into_task(self) -> Option<Task> {
        match self.state {
            State::InitialQuery(ctx)
            | State::ParseDescribeBindExecuteSyncSent(ctx)
            | State::ParseCompleteReceived(ctx)
            | State::ParameterDescriptionReceived(ctx)
            | State::RowDescriptionReceived(ctx, _)
            | State::NoDataReceived(ctx)
            | State::BindExecuteSyncSent(ctx, _)
            | State::NoRowsPending(ctx) => Some(Task::Query(ctx)),
            State::InitialPrepare(ctx)
            | State::ParseDescribeSyncSent(ctx)
            | State::PrepareParseComplete(ctx)
            | State::PrepareDescribed(ctx, _) => Some(Task::Prepare(ctx)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::{
        common::ByteStr,
        machine::ResultSink,
        postgres::{BackendProtocol, PgFormat},
    };

    fn backend_msg(msgtype: u8, body: &[u8]) -> BackendMessage {
        BackendMessage::decode(msgtype, bytes::Bytes::copy_from_slice(body)).unwrap()
    }

    fn unit(msgtype: u8) -> BackendMessage {
        backend_msg(msgtype, b"")
    }

    fn command_complete(tag: &str) -> BackendMessage {
        let mut body = BytesMut::new();
        body.put_slice(tag.as_bytes());
        body.put_u8(0);
        backend_msg(b'C', &body)
    }

    fn row_description_text_column(name: &str) -> BackendMessage {
        let mut body = BytesMut::new();
        body.put_i16(1);
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_u32(0);
        body.put_i16(0);
        body.put_u32(25);
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_i16(0); // declared text
        backend_msg(b'T', &body)
    }

    fn parameter_description(oids: &[Oid]) -> BackendMessage {
        let mut body = BytesMut::new();
        body.put_i16(oids.len() as i16);
        for oid in oids {
            body.put_u32(*oid);
        }
        backend_msg(b't', &body)
    }

    fn data_row(value: &[u8]) -> BackendMessage {
        let mut body = BytesMut::new();
        body.put_i16(1);
        body.put_i32(value.len() as i32);
        body.put_slice(value);
        backend_msg(b'D', &body)
    }

    fn query_ctx(
        sql: &str,
    ) -> (QueryContext, tokio::sync::oneshot::Receiver<Result<crate::RowStream, Error>>) {
        let (sink, rx) = ResultSink::new();
        let ctx = QueryContext {
            target: QueryTarget::Parse {
                statement: ByteStr::from_static(""),
                sql: ByteStr::from(sql),
            },
            params: vec![crate::encode::Encode::encode(1i32)],
            cache_key: None,
            sink,
        };
        (ctx, rx)
    }

    /// S1: a statement returning no rows settles at CommandComplete.
    #[test]
    fn delete_without_rows() {
        let (ctx, _rx) = query_ctx("DELETE FROM t WHERE id=$1");
        let mut sm = ExtendedQuerySm::query(ctx);

        assert!(matches!(sm.start(), Action::SendParseDescribeBindExecuteSync { .. }));
        assert!(matches!(sm.message(unit(b'1')), Action::Wait));
        assert!(matches!(sm.message(parameter_description(&[20])), Action::Wait));
        assert!(matches!(sm.message(unit(b'n')), Action::Wait));
        assert!(matches!(sm.message(unit(b'2')), Action::Wait));

        let action = sm.message(command_complete("DELETE 1"));
        let Action::SucceedQueryNoRows { tag, .. } = action else {
            panic!("expected SucceedQueryNoRows, got {action:?}");
        };
        assert_eq!(tag.as_str(), "DELETE 1");
        assert!(sm.is_complete());
        assert!(!sm.is_fatal());
    }

    /// S2: a declared text column reaches the decoder as binary.
    #[test]
    fn select_rewrites_text_format_to_binary() {
        let (ctx, _rx) = query_ctx("SELECT version()");
        let mut sm = ExtendedQuerySm::query(ctx);
        sm.start();

        sm.message(unit(b'1'));
        sm.message(parameter_description(&[]));
        assert!(matches!(sm.message(row_description_text_column("version")), Action::Wait));

        let Action::SucceedQuery { schema, .. } = sm.message(unit(b'2')) else {
            panic!("expected SucceedQuery at BindComplete");
        };
        assert_eq!(schema.columns().len(), 1);
        assert_eq!(schema.columns()[0].format, PgFormat::Binary);
        assert_eq!(schema.index_of("version"), Some(0));

        // one data row, then completion carries it to the stream
        assert!(matches!(sm.message(data_row(b"test")), Action::Wait));
        let Action::ForwardStreamComplete { rows, tag } = sm.message(command_complete("SELECT 1"))
        else {
            panic!("expected ForwardStreamComplete");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].try_get::<_, String>("version").unwrap(), "test");
        assert_eq!(tag.as_str(), "SELECT 1");
    }

    /// Read pacing: rows are flushed at the end of a read burst and reads
    /// stay paused until the consumer demands more.
    #[test]
    fn read_pacing_follows_demand() {
        let (ctx, _rx) = query_ctx("SELECT x FROM t");
        let mut sm = ExtendedQuerySm::query(ctx);
        sm.start();
        sm.message(unit(b'1'));
        sm.message(parameter_description(&[]));
        sm.message(row_description_text_column("x"));
        sm.message(unit(b'2'));

        sm.message(data_row(b"a"));
        sm.message(data_row(b"b"));
        let Action::ForwardRows { rows } = sm.read_complete() else {
            panic!("buffered rows must flush at read-complete");
        };
        assert_eq!(rows.len(), 2);

        // no demand: the burst ends without a new read
        assert!(matches!(sm.read_complete(), Action::Wait));

        // demand with an empty buffer re-enables the socket
        assert!(matches!(sm.stream_demand(), Action::Read));

        // rows buffered when demand arrives are flushed immediately
        sm.message(data_row(b"c"));
        let Action::ForwardRows { rows } = sm.stream_demand() else {
            panic!("demand must flush buffered rows");
        };
        assert_eq!(rows.len(), 1);
    }

    /// S6: a second execute of a prepared statement skips Parse/Describe.
    #[test]
    fn prepared_statement_reuse_skips_parse() {
        let schema = RowSchema::new(vec![]);
        let (sink, _rx) = ResultSink::new();
        let ctx = QueryContext {
            target: QueryTarget::Reuse {
                statement: ByteStr::from_static("s0001"),
                schema: Some(schema),
            },
            params: vec![],
            cache_key: None,
            sink,
        };
        let mut sm = ExtendedQuerySm::query(ctx);

        let Action::SendBindExecuteSync { statement, .. } = sm.start() else {
            panic!("reuse must bind without parsing");
        };
        assert_eq!(statement, "s0001");
        assert!(matches!(sm.message(unit(b'2')), Action::SucceedQuery { .. }));
    }

    #[test]
    fn server_error_fails_query_without_killing_connection() {
        let (ctx, rx) = query_ctx("SELECT nope");
        let mut sm = ExtendedQuerySm::query(ctx);
        sm.start();
        sm.message(unit(b'1'));

        let mut body = BytesMut::new();
        body.put_slice(b"SERROR\0C42703\0Mcolumn does not exist\0\0");
        let Action::FailQuery { ctx, error, clean_up } = sm.message(backend_msg(b'E', &body))
        else {
            panic!("expected FailQuery");
        };
        assert!(clean_up.is_none(), "server errors are recoverable");
        assert!(matches!(error.kind(), ErrorKind::Server(_)));
        assert!(sm.is_complete());
        assert!(!sm.is_fatal());

        ctx.sink.fail(error);
        assert!(rx.blocking_recv().unwrap().is_err());
    }

    /// S3-shaped: a protocol violation mid-query is fatal.
    #[test]
    fn unexpected_message_is_fatal() {
        let (ctx, _rx) = query_ctx("SELECT 1");
        let mut sm = ExtendedQuerySm::query(ctx);
        sm.start();

        let auth_ok = backend_msg(b'R', &0i32.to_be_bytes());
        let Action::FailQuery { error, .. } = sm.message(auth_ok) else {
            panic!("expected FailQuery");
        };
        assert!(matches!(error.kind(), ErrorKind::Protocol(_)));
        assert!(sm.is_fatal());
    }

    #[test]
    fn cancel_drains_remaining_rows() {
        let (ctx, _rx) = query_ctx("SELECT x FROM big");
        let mut sm = ExtendedQuerySm::query(ctx);
        sm.start();
        sm.message(unit(b'1'));
        sm.message(parameter_description(&[]));
        sm.message(row_description_text_column("x"));
        sm.message(unit(b'2'));

        assert!(matches!(sm.stream_cancel(), Action::Read));
        assert!(matches!(sm.message(data_row(b"dropped")), Action::Wait));
        assert!(matches!(
            sm.message(command_complete("SELECT 9000")),
            Action::ForwardStreamComplete { .. },
        ));
        assert!(sm.is_complete());
    }

    #[test]
    fn prepare_round_trip_describes_statement() {
        let (sink, rx) = ResultSink::new();
        let ctx = PrepareContext {
            statement: ByteStr::from_static("s0007"),
            sql: ByteStr::from_static("SELECT id FROM t WHERE id=$1"),
            sink,
        };
        let mut sm = ExtendedQuerySm::prepare(ctx);

        assert!(matches!(sm.start(), Action::SendParseDescribeSync { .. }));
        sm.message(unit(b'1'));
        sm.message(parameter_description(&[23]));
        let Action::SucceedPrepare { ctx, description } =
            sm.message(row_description_text_column("id"))
        else {
            panic!("expected SucceedPrepare");
        };
        assert_eq!(description.statement, "s0007");
        assert_eq!(description.param_oids, vec![23]);
        assert_eq!(description.columns.as_ref().unwrap().len(), 1);

        ctx.sink.succeed(description);
        assert!(rx.blocking_recv().unwrap().is_ok());
    }
}
