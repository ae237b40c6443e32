//! The protocol state machines.
//!
//! Every state-bearing piece of the connection is a sum type mutated by
//! events; each mutation returns an [`Action`] telling the channel glue what
//! to do: write a message, schedule a socket read, settle a caller's sink,
//! tear down. The machines never perform IO themselves.
mod close;
mod connection;
mod extended;

pub use close::CloseSm;
pub use connection::{ConnectionSm, StartupContext};
pub use extended::ExtendedQuerySm;

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::{
    common::ByteStr,
    encode::Encoded,
    error::{Error, ErrorKind},
    postgres::{
        backend::{ColumnDescription, NotificationResponse},
        frontend, Oid, ServerError,
    },
    row::{Row, RowSchema},
    stream::{CommandTag, RowStream},
};

/// A one-shot completable, settled exactly once.
///
/// Settling consumes the sink; a sink dropped unsettled fails the awaiting
/// caller with [`ErrorKind::ConnectionClosed`] through the closed channel.
#[derive(Debug)]
pub struct ResultSink<T>(oneshot::Sender<Result<T, Error>>);

impl<T> ResultSink<T> {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Result<T, Error>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Settle with a success; the caller may have given up waiting, which is
    /// not an error here.
    pub(crate) fn succeed(self, value: T) {
        let _ = self.0.send(Ok(value));
    }

    pub(crate) fn fail(self, error: Error) {
        let _ = self.0.send(Err(error));
    }
}

/// A pending work item, owned by the connection machine from enqueue until
/// its sink is settled.
#[derive(Debug)]
pub enum Task {
    Query(QueryContext),
    Prepare(PrepareContext),
    Close(CloseContext),
}

impl Task {
    /// Settle the task's sink with `error`.
    pub(crate) fn fail(self, error: Error) {
        match self {
            Task::Query(ctx) => ctx.sink.fail(error),
            Task::Prepare(ctx) => ctx.sink.fail(error),
            Task::Close(ctx) => ctx.sink.fail(error),
        }
    }
}

/// How the extended-query machine reaches the portal.
#[derive(Debug)]
pub enum QueryTarget {
    /// Parse and describe `sql` into `statement`, then bind.
    Parse { statement: ByteStr, sql: ByteStr },
    /// Bind an already prepared statement, skipping Parse and Describe.
    ///
    /// `schema` is the stored result layout; `None` means the statement
    /// returns no rows.
    Reuse {
        statement: ByteStr,
        schema: Option<Arc<RowSchema>>,
    },
}

/// One extended query round trip.
#[derive(Debug)]
pub struct QueryContext {
    pub target: QueryTarget,
    pub params: Vec<Encoded>,
    /// Statement-cache key to fill on success; `None` skips the cache.
    pub cache_key: Option<u64>,
    pub sink: ResultSink<RowStream>,
}

/// One Parse/Describe/Sync round trip preparing a named statement.
#[derive(Debug)]
pub struct PrepareContext {
    pub statement: ByteStr,
    pub sql: ByteStr,
    pub sink: ResultSink<StatementDescription>,
}

/// One Close/Sync round trip.
#[derive(Debug)]
pub struct CloseContext {
    pub target: frontend::Close,
    pub sink: ResultSink<()>,
}

/// The server's description of a prepared statement.
#[derive(Debug)]
pub struct StatementDescription {
    /// Wire name of the statement.
    pub statement: ByteStr,
    /// Parameter data types.
    pub param_oids: Vec<Oid>,
    /// Result columns, `None` when the statement returns no rows.
    pub columns: Option<Vec<ColumnDescription>>,
}

/// Unfinished work to fail when the connection dies.
///
/// Carries the head task (if its sink has not been handed back some other
/// way) and everything still queued; the glue settles each with the same
/// error and then closes or observes the already-dead socket.
#[derive(Debug)]
pub struct CleanUp {
    pub error: Error,
    pub tasks: Vec<Task>,
}

/// What the channel glue must do after an event.
///
/// Every `Send*` variant implies: flush the write buffer, then keep exactly
/// one socket read pending. `Wait` and `ForwardRows` imply no new read;
/// `Read` re-enables reading.
#[derive(Debug)]
pub enum Action {
    /// Write the startup message for the given parameters.
    SendStartup { user: ByteStr, database: Option<ByteStr> },
    /// Write the SSLRequest probe and read the single-byte reply.
    SendSslRequest,
    /// Run the TLS handshake over the raw socket, then call
    /// `tls_established`.
    EstablishSsl,
    /// Write a password response (cleartext or precomputed md5).
    SendPassword { password: String },
    /// Write the SASL initial response for the selected mechanism.
    SendSaslInitial { mechanism: &'static str, data: Vec<u8> },
    /// Write a SASL continuation response.
    SendSaslResponse { data: Vec<u8> },
    /// Write Parse, Describe(statement), Bind, Execute and Sync.
    SendParseDescribeBindExecuteSync {
        statement: ByteStr,
        sql: ByteStr,
        params: Vec<Encoded>,
    },
    /// Write Parse, Describe(statement) and Sync.
    SendParseDescribeSync { statement: ByteStr, sql: ByteStr },
    /// Write Bind, Execute and Sync against a prepared statement.
    SendBindExecuteSync { statement: ByteStr, params: Vec<Encoded> },
    /// Write Close and Sync.
    SendCloseSync { target: frontend::Close },
    /// Create a row stream over `schema` and settle the caller with it.
    SucceedQuery { ctx: QueryContext, schema: Arc<RowSchema> },
    /// Settle the caller with an already-finished stream carrying `tag`.
    SucceedQueryNoRows { ctx: QueryContext, tag: CommandTag },
    /// Fail the query; `clean_up` is set when the failure kills the
    /// connection.
    FailQuery {
        ctx: QueryContext,
        error: Error,
        clean_up: Option<CleanUp>,
    },
    /// Push a batch of decoded rows into the active stream.
    ForwardRows { rows: Vec<Row> },
    /// Push trailing rows and the command tag, completing the stream.
    ForwardStreamComplete { rows: Vec<Row>, tag: CommandTag },
    /// Fail the active stream.
    ForwardStreamError { error: Error, clean_up: Option<CleanUp> },
    SucceedPrepare {
        ctx: PrepareContext,
        description: StatementDescription,
    },
    FailPrepare {
        ctx: PrepareContext,
        error: Error,
        clean_up: Option<CleanUp>,
    },
    SucceedClose { ctx: CloseContext },
    FailClose {
        ctx: CloseContext,
        error: Error,
        clean_up: Option<CleanUp>,
    },
    /// Deliver a notice out of band.
    ForwardNotice { notice: ServerError },
    /// Deliver a notification to the registered sink.
    ForwardNotification { notification: NotificationResponse },
    /// The connection reached `ReadyForQuery` with an empty task queue.
    FireReadyForQuery,
    /// Reject a task that can no longer run.
    FailTask { task: Task, error: Error },
    /// Write Terminate (when the socket is still healthy) and close.
    CloseConnection { clean_up: Option<CleanUp> },
    /// Re-enable socket reads.
    Read,
    /// Nothing to do.
    Wait,
}

impl Action {
    /// `true` for actions that put frontend bytes on the wire.
    pub(crate) fn sends(&self) -> bool {
        matches!(
            self,
            Action::SendStartup { .. }
                | Action::SendSslRequest
                | Action::SendPassword { .. }
                | Action::SendSaslInitial { .. }
                | Action::SendSaslResponse { .. }
                | Action::SendParseDescribeBindExecuteSync { .. }
                | Action::SendParseDescribeSync { .. }
                | Action::SendBindExecuteSync { .. }
                | Action::SendCloseSync { .. }
        )
    }
}

/// Too many bind parameters for the wire format.
///
/// The Bind message carries an Int16 parameter count.
pub const MAX_BIND_PARAMETERS: usize = i16::MAX as usize;

/// Synchronous bound check, run before a query task is created.
pub(crate) fn check_bind_len(params: &[Encoded]) -> Result<(), Error> {
    if params.len() > MAX_BIND_PARAMETERS {
        return Err(ErrorKind::TooManyParameters { given: params.len() }.into());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    /// An Int16 worth of parameters binds; one more is rejected before
    /// anything reaches the wire.
    #[test]
    fn bind_parameter_boundary() {
        let mut params: Vec<Encoded> = (0..MAX_BIND_PARAMETERS).map(|_| Encoded::null(0)).collect();
        assert!(check_bind_len(&params).is_ok());

        params.push(Encoded::null(0));
        let err = check_bind_len(&params).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::TooManyParameters { given: 32768 }));
    }
}
