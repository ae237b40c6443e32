//! The close sub-state machine.
//!
//! Close(portal or statement) + Sync, answered by `CloseComplete` and the
//! `ReadyForQuery` the connection machine consumes.
use std::mem;

use crate::{
    error::Error,
    machine::{Action, CloseContext, Task},
    postgres::backend::BackendMessage,
};

#[derive(Debug)]
pub struct CloseSm {
    state: State,
}

#[derive(Debug)]
enum State {
    Initial(CloseContext),
    CloseSyncSent(CloseContext),
    Completed,
    Failed { fatal: bool },
    Busy,
}

impl CloseSm {
    pub(crate) fn new(ctx: CloseContext) -> Self {
        Self { state: State::Initial(ctx) }
    }

    pub(crate) fn is_complete(&self) -> bool {
        matches!(self.state, State::Completed | State::Failed { .. })
    }

    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self.state, State::Failed { fatal: true })
    }

    pub(crate) fn start(&mut self) -> Action {
        match mem::replace(&mut self.state, State::Busy) {
            State::Initial(ctx) => {
                let action = Action::SendCloseSync { target: ctx.target.clone() };
                self.state = State::CloseSyncSent(ctx);
                action
            },
            state => {
                self.state = state;
                unreachable!("`start` on a started close machine")
            },
        }
    }

    pub(crate) fn message(&mut self, message: BackendMessage) -> Action {
        use BackendMessage::*;

        match (mem::replace(&mut self.state, State::Busy), message) {
            (State::CloseSyncSent(ctx), CloseComplete(_)) => {
                self.state = State::Completed;
                Action::SucceedClose { ctx }
            },
            (State::CloseSyncSent(ctx), ErrorResponse(err)) => {
                self.state = State::Failed { fatal: false };
                Action::FailClose {
                    ctx,
                    error: err.into_server_error().into(),
                    clean_up: None,
                }
            },
            (State::CloseSyncSent(ctx), message) => {
                self.state = State::Failed { fatal: true };
                Action::FailClose {
                    ctx,
                    error: message.unexpected("close").into(),
                    clean_up: None,
                }
            },
            // a Sync-stage error after completion; absorbed until the
            // connection consumes ReadyForQuery
            (state @ (State::Completed | State::Failed { .. }), ErrorResponse(_)) => {
                self.state = state;
                Action::Wait
            },
            (state, message) => {
                self.state = state;
                self.fatal(message.unexpected("close").into())
            },
        }
    }

    pub(crate) fn read_complete(&mut self) -> Action {
        Action::Read
    }

    fn fatal(&mut self, error: Error) -> Action {
        self.state = State::Failed { fatal: true };
        Action::CloseConnection {
            clean_up: Some(super::CleanUp { error, tasks: Vec::new() }),
        }
    }

    pub(crate) fn into_task(self) -> Option<Task> {
        match self.state {
            State::Initial(ctx) | State::CloseSyncSent(ctx) => Some(Task::Close(ctx)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        machine::ResultSink,
        postgres::{frontend, BackendProtocol},
    };

    fn ctx() -> (CloseContext, tokio::sync::oneshot::Receiver<Result<(), Error>>) {
        let (sink, rx) = ResultSink::new();
        (CloseContext { target: frontend::Close::statement("s0003"), sink }, rx)
    }

    #[test]
    fn close_round_trip() {
        let (ctx, rx) = ctx();
        let mut sm = CloseSm::new(ctx);

        let Action::SendCloseSync { target } = sm.start() else {
            panic!("expected SendCloseSync");
        };
        assert_eq!(target.name(), "s0003");
        assert!(!target.is_portal());

        let msg = BackendMessage::decode(b'3', bytes::Bytes::new()).unwrap();
        let Action::SucceedClose { ctx } = sm.message(msg) else {
            panic!("expected SucceedClose");
        };
        assert!(sm.is_complete());

        ctx.sink.succeed(());
        assert!(rx.blocking_recv().unwrap().is_ok());
    }

    #[test]
    fn unexpected_message_fails_close() {
        let (ctx, _rx) = ctx();
        let mut sm = CloseSm::new(ctx);
        sm.start();

        // ParseComplete during a close round trip is a protocol violation
        let msg = BackendMessage::decode(b'1', bytes::Bytes::new()).unwrap();
        assert!(matches!(sm.message(msg), Action::FailClose { .. }));
        assert!(sm.is_fatal());
    }
}
