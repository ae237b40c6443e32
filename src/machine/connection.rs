//! The connection state machine.
//!
//! Owns the socket lifecycle: SSL negotiation, startup, authentication,
//! parameter bookkeeping, the task queue, and delegation to the per-query
//! sub-machines. It is the sole authority on what may be written to the
//! wire at any moment; the channel glue only executes the returned
//! [`Action`]s.
use std::{
    collections::{HashMap, VecDeque},
    mem,
};

use md5::{Digest, Md5};

use crate::{
    common::ByteStr,
    error::{Error, ErrorKind, TlsError},
    machine::{Action, CleanUp, CloseSm, ExtendedQuerySm, Task},
    postgres::{
        backend::{Authentication, BackendKeyData, BackendMessage},
        sasl, ProtocolError, ScramClient, TransactionStatus,
    },
};

/// Credentials and switches consumed during the startup phase.
#[derive(Debug, Clone)]
pub struct StartupContext {
    pub user: ByteStr,
    pub database: Option<ByteStr>,
    pub password: Option<ByteStr>,
    /// Negotiate TLS before startup; refusal is fatal.
    pub require_tls: bool,
}

#[derive(Debug)]
pub struct ConnectionSm {
    state: ConnState,
    queue: VecDeque<Task>,
    /// `ParameterStatus` bookkeeping, updated in every state.
    parameters: HashMap<ByteStr, ByteStr>,
    backend_key: Option<BackendKeyData>,
    tx_status: TransactionStatus,
    startup: StartupContext,
    /// Graceful close requested; honored once the queue drains.
    close_requested: bool,
}

#[derive(Debug)]
enum ConnState {
    Initial,
    SslRequestSent,
    SslHandshake,
    Authenticating(AuthPhase),
    /// Authenticated; collecting `BackendKeyData` until `ReadyForQuery`.
    AwaitingReady,
    Ready(TransactionStatus),
    ExtendedQuery(ExtendedQuerySm),
    Close(CloseSm),
    Closing,
    Closed,
    /// Terminal; every further event is `Wait`.
    Failed,
    Busy,
}

#[derive(Debug)]
enum AuthPhase {
    /// Waiting for the server to pick a method (or accept us).
    Waiting,
    SaslInFlight(ScramClient),
}

impl ConnectionSm {
    pub fn new(startup: StartupContext) -> Self {
        Self {
            state: ConnState::Initial,
            queue: VecDeque::new(),
            parameters: HashMap::new(),
            backend_key: None,
            tx_status: TransactionStatus::Idle,
            startup,
            close_requested: false,
        }
    }

    /// Server parameters reported so far (`server_version`, …).
    pub fn parameters(&self) -> &HashMap<ByteStr, ByteStr> {
        &self.parameters
    }

    /// Cancellation key data, available after startup.
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ConnState::Closed | ConnState::Failed)
    }

    /// The socket is up; begin SSL negotiation or startup.
    pub fn connected(&mut self) -> Action {
        match mem::replace(&mut self.state, ConnState::Busy) {
            ConnState::Initial if self.startup.require_tls => {
                self.state = ConnState::SslRequestSent;
                Action::SendSslRequest
            },
            ConnState::Initial => self.send_startup(),
            state => {
                self.state = state;
                unreachable!("`connected` on a started connection")
            },
        }
    }

    /// The server answered the SSLRequest with `S`.
    pub fn ssl_supported(&mut self) -> Action {
        match mem::replace(&mut self.state, ConnState::Busy) {
            ConnState::SslRequestSent => {
                self.state = ConnState::SslHandshake;
                Action::EstablishSsl
            },
            state => {
                self.state = state;
                unreachable!("ssl reply outside negotiation")
            },
        }
    }

    /// The server answered the SSLRequest with `N`.
    pub fn ssl_unsupported(&mut self) -> Action {
        match mem::replace(&mut self.state, ConnState::Busy) {
            ConnState::SslRequestSent => self.fatal(TlsError::ServerRefused.into(), None),
            state => {
                self.state = state;
                unreachable!("ssl reply outside negotiation")
            },
        }
    }

    /// The TLS handshake finished; proceed with startup.
    pub fn tls_established(&mut self) -> Action {
        match mem::replace(&mut self.state, ConnState::Busy) {
            ConnState::SslHandshake => self.send_startup(),
            state => {
                self.state = state;
                unreachable!("`tls_established` outside the handshake")
            },
        }
    }

    fn send_startup(&mut self) -> Action {
        self.state = ConnState::Authenticating(AuthPhase::Waiting);
        Action::SendStartup {
            user: self.startup.user.clone(),
            database: self.startup.database.clone(),
        }
    }

    /// Append a task; dispatched immediately when the connection is idle.
    pub fn enqueue(&mut self, task: Task) -> Action {
        let rejected = self.close_requested
            || matches!(
                self.state,
                ConnState::Closing | ConnState::Closed | ConnState::Failed,
            );
        if rejected {
            return Action::FailTask { task, error: Error::closed() };
        }

        if matches!(self.state, ConnState::Ready(_)) && self.queue.is_empty() {
            return self.dispatch(task);
        }

        self.queue.push_back(task);
        Action::Wait
    }

    /// Graceful close; runs after the queue drains.
    pub fn terminate(&mut self) -> Action {
        self.close_requested = true;
        match self.state {
            ConnState::Ready(_) if self.queue.is_empty() => {
                self.state = ConnState::Closing;
                Action::CloseConnection { clean_up: None }
            },
            // mid-startup there is nothing worth draining
            ConnState::Initial
            | ConnState::SslRequestSent
            | ConnState::SslHandshake
            | ConnState::Authenticating(_)
            | ConnState::AwaitingReady => {
                self.state = ConnState::Closing;
                Action::CloseConnection { clean_up: None }
            },
            _ => Action::Wait,
        }
    }

    /// The socket died (EOF or transport error).
    pub fn channel_inactive(&mut self, error: Error) -> Action {
        match mem::replace(&mut self.state, ConnState::Closed) {
            ConnState::Closing | ConnState::Closed => Action::Wait,
            state => {
                let mut tasks: Vec<Task> = Vec::new();
                match state {
                    ConnState::ExtendedQuery(sub) => tasks.extend(sub.into_task()),
                    ConnState::Close(sub) => tasks.extend(sub.into_task()),
                    _ => {},
                }
                tasks.extend(self.queue.drain(..));
                self.state = ConnState::Failed;
                Action::CloseConnection { clean_up: Some(CleanUp { error, tasks }) }
            },
        }
    }

    /// Route one backend message.
    pub fn message(&mut self, message: BackendMessage) -> Action {
        use BackendMessage::*;

        // bookkeeping and out-of-band traffic, valid between any two
        // messages
        let message = match message {
            ParameterStatus(status) => {
                self.parameters.insert(status.name, status.value);
                return Action::Wait;
            },
            NoticeResponse(notice) => {
                return Action::ForwardNotice { notice: notice.into_server_error() };
            },
            NotificationResponse(notification) => {
                return Action::ForwardNotification { notification };
            },
            message => message,
        };

        match (mem::replace(&mut self.state, ConnState::Busy), message) {
            (ConnState::Authenticating(phase), Authentication(auth)) => {
                self.authenticate(phase, auth)
            },
            (ConnState::Authenticating(_), ErrorResponse(err)) => {
                self.fatal(err.into_server_error().into(), None)
            },

            (ConnState::AwaitingReady, BackendKeyData(key)) => {
                self.backend_key = Some(key);
                self.state = ConnState::AwaitingReady;
                Action::Wait
            },
            (ConnState::AwaitingReady, ReadyForQuery(ready)) => self.ready(ready.status),
            (ConnState::AwaitingReady, ErrorResponse(err)) => {
                self.fatal(err.into_server_error().into(), None)
            },

            (ConnState::ExtendedQuery(mut sub), message) => {
                if let ReadyForQuery(ready) = &message {
                    if sub.is_complete() {
                        return self.ready(ready.status);
                    }
                }
                let action = sub.message(message);
                self.settle_sub(ConnState::ExtendedQuery(sub), action)
            },

            (ConnState::Close(mut sub), message) => {
                if let ReadyForQuery(ready) = &message {
                    if sub.is_complete() {
                        return self.ready(ready.status);
                    }
                }
                let action = sub.message(message);
                self.settle_sub(ConnState::Close(sub), action)
            },

            // after tear-down every event is absorbed
            (state @ (ConnState::Closing | ConnState::Closed | ConnState::Failed), _) => {
                self.state = state;
                Action::Wait
            },

            (_, ErrorResponse(err)) => self.fatal(err.into_server_error().into(), None),
            (_, message) => self.fatal(message.unexpected("connection").into(), None),
        }
    }

    /// The read burst ended; let the active sub-machine pace further reads.
    pub fn read_complete(&mut self) -> Action {
        match &mut self.state {
            ConnState::ExtendedQuery(sub) => sub.read_complete(),
            ConnState::Close(sub) => sub.read_complete(),
            ConnState::Closing | ConnState::Closed | ConnState::Failed => Action::Wait,
            _ => Action::Read,
        }
    }

    /// The active stream's consumer wants more rows.
    pub fn stream_demand(&mut self) -> Action {
        match &mut self.state {
            ConnState::ExtendedQuery(sub) => sub.stream_demand(),
            _ => Action::Wait,
        }
    }

    /// The active stream's consumer is gone.
    pub fn stream_cancel(&mut self) -> Action {
        match &mut self.state {
            ConnState::ExtendedQuery(sub) => sub.stream_cancel(),
            _ => Action::Wait,
        }
    }

    fn authenticate(&mut self, phase: AuthPhase, auth: Authentication) -> Action {
        use Authentication::*;

        match (phase, auth) {
            (_, Ok) => {
                self.state = ConnState::AwaitingReady;
                Action::Wait
            },
            (AuthPhase::Waiting, CleartextPassword) => match self.password() {
                Some(password) => {
                    self.state = ConnState::Authenticating(AuthPhase::Waiting);
                    Action::SendPassword { password: password.to_string() }
                },
                None => self.fatal(ErrorKind::AuthRequiresPassword.into(), None),
            },
            (AuthPhase::Waiting, MD5Password { salt }) => match self.password() {
                Some(password) => {
                    let password = md5_password(&self.startup.user, &password, salt);
                    self.state = ConnState::Authenticating(AuthPhase::Waiting);
                    Action::SendPassword { password }
                },
                None => self.fatal(ErrorKind::AuthRequiresPassword.into(), None),
            },
            (AuthPhase::Waiting, SASL { mechanisms }) => {
                if !mechanisms.iter().any(|m| m == sasl::SCRAM_SHA_256) {
                    return self.fatal(
                        ErrorKind::UnsupportedAuth { method: "SASL without SCRAM-SHA-256" }
                            .into(),
                        None,
                    );
                }
                let Some(password) = self.password() else {
                    return self.fatal(ErrorKind::AuthRequiresPassword.into(), None);
                };
                let client = ScramClient::new(&password);
                let data = client.client_first_message();
                self.state = ConnState::Authenticating(AuthPhase::SaslInFlight(client));
                Action::SendSaslInitial { mechanism: sasl::SCRAM_SHA_256, data }
            },
            (AuthPhase::SaslInFlight(mut client), SASLContinue { data }) => {
                match client.handle_server_first(&data) {
                    Result::Ok(response) => {
                        self.state = ConnState::Authenticating(AuthPhase::SaslInFlight(client));
                        Action::SendSaslResponse { data: response }
                    },
                    Err(err) => self.fatal(err.into(), None),
                }
            },
            (AuthPhase::SaslInFlight(client), SASLFinal { data }) => {
                match client.verify_server_final(&data) {
                    Result::Ok(()) => {
                        self.state = ConnState::Authenticating(AuthPhase::Waiting);
                        Action::Wait
                    },
                    Err(err) => self.fatal(err.into(), None),
                }
            },
            (_, KerberosV5) => {
                self.fatal(ErrorKind::UnsupportedAuth { method: "KerberosV5" }.into(), None)
            },
            (_, GSS) => self.fatal(ErrorKind::UnsupportedAuth { method: "GSS" }.into(), None),
            (_, SSPI) => self.fatal(ErrorKind::UnsupportedAuth { method: "SSPI" }.into(), None),
            (_, SCMCredential) => {
                self.fatal(ErrorKind::UnsupportedAuth { method: "SCMCredential" }.into(), None)
            },
            // a SASL step without a SASL exchange in flight
            (_, SASLContinue { .. } | SASLFinal { .. } | CleartextPassword | MD5Password { .. } | SASL { .. }) => {
                self.fatal(
                    ProtocolError::unexpected_phase(Authentication::MSGTYPE, "authentication")
                        .into(),
                    None,
                )
            },
        }
    }

    fn password(&self) -> Option<ByteStr> {
        self.startup.password.clone()
    }

    /// The server flushed the previous cycle; dispatch or go idle.
    fn ready(&mut self, status: TransactionStatus) -> Action {
        self.tx_status = status;

        if self.close_requested && self.queue.is_empty() {
            self.state = ConnState::Closing;
            return Action::CloseConnection { clean_up: None };
        }

        match self.queue.pop_front() {
            Some(task) => self.dispatch(task),
            None => {
                self.state = ConnState::Ready(status);
                Action::FireReadyForQuery
            },
        }
    }

    fn dispatch(&mut self, task: Task) -> Action {
        match task {
            Task::Query(ctx) => {
                self.state = ConnState::ExtendedQuery(ExtendedQuerySm::query(ctx));
                let ConnState::ExtendedQuery(sub) = &mut self.state else { unreachable!() };
                sub.start()
            },
            Task::Prepare(ctx) => {
                self.state = ConnState::ExtendedQuery(ExtendedQuerySm::prepare(ctx));
                let ConnState::ExtendedQuery(sub) = &mut self.state else { unreachable!() };
                sub.start()
            },
            Task::Close(ctx) => {
                self.state = ConnState::Close(CloseSm::new(ctx));
                let ConnState::Close(sub) = &mut self.state else { unreachable!() };
                sub.start()
            },
        }
    }

    /// Kill the connection: every unfinished task fails with `error`.
    fn fatal(&mut self, error: Error, active: Option<Task>) -> Action {
        let mut tasks: Vec<Task> = Vec::new();
        tasks.extend(active);
        tasks.extend(self.queue.drain(..));
        self.state = ConnState::Failed;
        Action::CloseConnection { clean_up: Some(CleanUp { error, tasks }) }
    }

    /// Restore the sub-machine, or escalate its fatal failure into a
    /// connection tear-down carrying every queued task.
    fn settle_sub(&mut self, state: ConnState, mut action: Action) -> Action {
        let fatal = match &state {
            ConnState::ExtendedQuery(sub) => sub.is_fatal(),
            ConnState::Close(sub) => sub.is_fatal(),
            _ => unreachable!("settling a non sub-machine state"),
        };

        if !fatal {
            self.state = state;
            return action;
        }

        self.state = ConnState::Failed;
        let tasks: Vec<Task> = self.queue.drain(..).collect();
        match &mut action {
            Action::FailQuery { error, clean_up, .. }
            | Action::FailPrepare { error, clean_up, .. }
            | Action::FailClose { error, clean_up, .. }
            | Action::ForwardStreamError { error, clean_up } => {
                *clean_up = Some(CleanUp { error: error.clone(), tasks });
            },
            Action::CloseConnection { clean_up: Some(clean_up) } => {
                clean_up.tasks.extend(tasks);
            },
            _ => {
                debug_assert!(false, "fatal sub-machine without a failure action");
                self.queue.extend(tasks);
            },
        }
        action
    }
}

/// `"md5" || hex(md5( hex(md5(password || user)) || salt ))`
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(password);
    md5.update(user);
    let inner = md5.finalize_reset();
    md5.update(format!("{inner:x}"));
    md5.update(salt);
    format!("md5{:x}", md5.finalize())
}
