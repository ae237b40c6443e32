//! Pull-based row streaming.
//!
//! A [`RowStream`] sits between the connection driver (producer) and the
//! caller (consumer). Decoded row batches arrive through a channel, but the
//! driver only reads the socket again after the consumer signals demand
//! through the [`StreamSource`] capability, so at most one batch is in
//! flight while the consumer is slow.
use std::{
    collections::VecDeque,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_core::Stream;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    common::ByteStr,
    error::{Error, Result},
    row::{Row, RowSchema},
};

/// The tag reported by `CommandComplete`, e.g. `"SELECT 1"` or `"DELETE 3"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTag(ByteStr);

impl CommandTag {
    pub(crate) fn new(tag: ByteStr) -> Self {
        Self(tag)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The affected row count carried by the tag, zero when the command does
    /// not report one.
    pub fn rows_affected(&self) -> u64 {
        let mut whs = self.0.split_whitespace();
        let Some(tag) = whs.next() else {
            return 0;
        };
        let Some(rows) = whs.next() else {
            return 0;
        };
        match tag {
            // INSERT tag is `INSERT oid rows`
            "INSERT" => whs.next().unwrap_or_default(),
            "SELECT" => rows,
            "UPDATE" => rows,
            "DELETE" => rows,
            "MERGE" => rows,
            "FETCH" => rows,
            "MOVE" => rows,
            "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the producer pushes into a stream.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// A batch of decoded rows, in server order.
    Rows(Vec<Row>),
    /// Clean end of the stream.
    Complete(CommandTag),
    /// The query failed mid-stream.
    Fail(Error),
}

/// Back-capability from the stream to its data source.
///
/// Implemented by the connection driver handle; `request` re-enables socket
/// reads, `cancel` asks the driver to drain the rest of the query. Neither
/// extends the driver's lifetime.
pub(crate) trait StreamSource: Send {
    fn request(&self);
    fn cancel(&self);
}

/// Producer-side state.
///
/// `Busy` is the transient marker for moving the buffer out by value during
/// a transition; no caller can ever observe it.
enum Upstream {
    /// The query is in flight, rows keep arriving.
    Streaming { buffer: VecDeque<Row> },
    /// The server completed the command; the buffer remainder is still
    /// undelivered.
    Finished { buffer: VecDeque<Row>, tag: CommandTag },
    /// The query failed; the error is delivered on the next pull.
    Failure { error: Error },
    /// Everything was delivered. Terminal.
    Consumed { tag: Option<CommandTag> },
    Busy,
}

/// A stream of [`Row`]s produced by one query.
///
/// The stream must be pulled to completion (or dropped, which cancels it)
/// before the connection starts the next queued task's results delivery.
pub struct RowStream {
    schema: Arc<RowSchema>,
    upstream: Upstream,
    events: Option<UnboundedReceiver<StreamEvent>>,
    source: Option<Box<dyn StreamSource>>,
    /// A `request()` is outstanding; cleared when a batch arrives.
    requested: bool,
}

impl RowStream {
    pub(crate) fn new(
        schema: Arc<RowSchema>,
        events: UnboundedReceiver<StreamEvent>,
        source: Box<dyn StreamSource>,
    ) -> Self {
        Self {
            schema,
            upstream: Upstream::Streaming { buffer: VecDeque::new() },
            events: Some(events),
            source: Some(source),
            requested: false,
        }
    }

    /// A stream for a statement which returns no rows; already finished
    /// with `tag`.
    pub(crate) fn finished(tag: CommandTag) -> Self {
        Self {
            schema: RowSchema::empty(),
            upstream: Upstream::Finished { buffer: VecDeque::new(), tag },
            events: None,
            source: None,
            requested: false,
        }
    }

    /// The normalized column layout of this result.
    pub fn schema(&self) -> &RowSchema {
        &self.schema
    }

    /// Pull the next row.
    ///
    /// Resolves to `None` on clean end of the stream.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx))
            .await
            .transpose()
    }

    /// Pull every remaining row.
    ///
    /// After success the stream is consumed and [`command_tag`][1] is
    /// available.
    ///
    /// [1]: RowStream::command_tag
    pub async fn all(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Pull rows one by one into `f`, completing on clean end.
    ///
    /// An error from `f` suspends the stream and is returned as is.
    pub async fn for_each<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(Row) -> Result<()>,
    {
        while let Some(row) = self.next().await? {
            f(row)?;
        }
        Ok(())
    }

    /// Ask the data source to stop producing.
    ///
    /// Rows already buffered stay readable and the stream still terminates
    /// through the source's drain; on an already terminal stream this is a
    /// no-op.
    pub fn cancel(&mut self) {
        if let Upstream::Streaming { .. } = &self.upstream {
            if let Some(source) = &self.source {
                source.cancel();
            }
        }
    }

    /// The command completion tag.
    ///
    /// # Panics
    ///
    /// Valid only after the stream completed successfully; anything else is
    /// a caller bug.
    pub fn command_tag(&self) -> &CommandTag {
        match &self.upstream {
            Upstream::Finished { tag, .. } => tag,
            Upstream::Consumed { tag: Some(tag) } => tag,
            _ => panic!("`command_tag` before the stream completed"),
        }
    }

    /// Fold one producer event into the streaming state, `buffer` being the
    /// moved-out row buffer.
    fn integrate(&mut self, mut buffer: VecDeque<Row>, event: StreamEvent) {
        match event {
            StreamEvent::Rows(rows) => {
                self.requested = false;
                buffer.extend(rows);
                self.upstream = Upstream::Streaming { buffer };
            },
            StreamEvent::Complete(tag) => {
                self.source = None;
                self.upstream = Upstream::Finished { buffer, tag };
            },
            StreamEvent::Fail(error) => {
                self.source = None;
                self.upstream = Upstream::Failure { error };
            },
        }
    }
}

impl Stream for RowStream {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        loop {
            match mem::replace(&mut me.upstream, Upstream::Busy) {
                Upstream::Streaming { mut buffer } => {
                    if let Some(row) = buffer.pop_front() {
                        me.upstream = Upstream::Streaming { buffer };
                        return Poll::Ready(Some(Ok(row)));
                    }

                    let events = me.events.as_mut().expect("streaming without a producer");
                    match events.poll_recv(cx) {
                        Poll::Ready(Some(event)) => {
                            me.integrate(buffer, event);
                        },
                        Poll::Ready(None) => {
                            // producer died without completion
                            me.source = None;
                            me.upstream = Upstream::Failure { error: Error::unclean_shutdown() };
                        },
                        Poll::Pending => {
                            me.upstream = Upstream::Streaming { buffer };
                            if !me.requested {
                                me.requested = true;
                                if let Some(source) = &me.source {
                                    source.request();
                                }
                            }
                            return Poll::Pending;
                        },
                    }
                },
                Upstream::Finished { mut buffer, tag } => {
                    match buffer.pop_front() {
                        Some(row) => {
                            me.upstream = Upstream::Finished { buffer, tag };
                            return Poll::Ready(Some(Ok(row)));
                        },
                        None => {
                            me.upstream = Upstream::Consumed { tag: Some(tag) };
                            return Poll::Ready(None);
                        },
                    }
                },
                Upstream::Failure { error } => {
                    me.upstream = Upstream::Consumed { tag: None };
                    return Poll::Ready(Some(Err(error)));
                },
                Upstream::Consumed { .. } => panic!("stream polled after it was consumed"),
                Upstream::Busy => unreachable!("transient upstream state observed"),
            }
        }
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.upstream {
            Upstream::Streaming { buffer } => format!("Streaming({})", buffer.len()),
            Upstream::Finished { buffer, tag } => format!("Finished({}, {tag})", buffer.len()),
            Upstream::Failure { error } => format!("Failure({error})"),
            Upstream::Consumed { .. } => "Consumed".into(),
            Upstream::Busy => "Busy".into(),
        };
        f.debug_struct("RowStream").field("upstream", &state).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use bytes::{BufMut, BytesMut};
    use tokio::sync::mpsc::{self, UnboundedSender};

    use super::*;
    use crate::postgres::{backend::DataRow, BackendProtocol};

    #[derive(Default)]
    struct Recording {
        requests: AtomicUsize,
        cancels: AtomicUsize,
    }

    struct RecordingSource(Arc<Recording>);

    impl StreamSource for RecordingSource {
        fn request(&self) {
            self.0.requests.fetch_add(1, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.0.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn streaming() -> (RowStream, UnboundedSender<StreamEvent>, Arc<Recording>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recording = Arc::new(Recording::default());
        let stream = RowStream::new(
            RowSchema::empty(),
            rx,
            Box::new(RecordingSource(recording.clone())),
        );
        (stream, tx, recording)
    }

    fn row() -> Row {
        let mut buf = BytesMut::new();
        buf.put_i16(0);
        Row::new(RowSchema::empty(), &DataRow::decode(b'D', buf.freeze()).unwrap())
    }

    fn tag(tag: &'static str) -> CommandTag {
        CommandTag::new(tag.into())
    }

    /// Drive `poll_next` once without a real executor.
    fn poll_once(stream: &mut RowStream) -> Poll<Option<Result<Row>>> {
        let mut cx = Context::from_waker(std::task::Waker::noop());
        Pin::new(stream).poll_next(&mut cx)
    }

    #[test]
    fn command_tag_rows_affected() {
        assert_eq!(tag("SELECT 2").rows_affected(), 2);
        assert_eq!(tag("INSERT 0 5").rows_affected(), 5);
        assert_eq!(tag("DELETE 1").rows_affected(), 1);
        assert_eq!(tag("BEGIN").rows_affected(), 0);
    }

    #[test]
    fn finished_stream_resolves_without_rows() {
        let mut stream = RowStream::finished(tag("DELETE 1"));
        assert!(matches!(poll_once(&mut stream), Poll::Ready(None)));
        assert_eq!(stream.command_tag().as_str(), "DELETE 1");
        assert_eq!(stream.command_tag().rows_affected(), 1);
    }

    #[test]
    fn empty_buffer_requests_a_read_exactly_once() {
        let (mut stream, tx, recording) = streaming();

        // no rows buffered: one request, repolling must not add another
        assert!(poll_once(&mut stream).is_pending());
        assert!(poll_once(&mut stream).is_pending());
        assert_eq!(recording.requests.load(Ordering::SeqCst), 1);

        // a batch arrives and satisfies the request
        tx.send(StreamEvent::Rows(vec![row(), row()])).unwrap();
        assert!(matches!(poll_once(&mut stream), Poll::Ready(Some(Ok(_)))));
        assert!(matches!(poll_once(&mut stream), Poll::Ready(Some(Ok(_)))));
        assert_eq!(recording.requests.load(Ordering::SeqCst), 1);

        // drained again: exactly one more request
        assert!(poll_once(&mut stream).is_pending());
        assert_eq!(recording.requests.load(Ordering::SeqCst), 2);

        tx.send(StreamEvent::Complete(tag("SELECT 2"))).unwrap();
        assert!(matches!(poll_once(&mut stream), Poll::Ready(None)));
        assert_eq!(stream.command_tag().as_str(), "SELECT 2");
    }

    #[test]
    fn batches_are_concatenated_in_arrival_order() {
        let (mut stream, tx, _) = streaming();

        tx.send(StreamEvent::Rows(vec![row()])).unwrap();
        tx.send(StreamEvent::Rows(vec![row()])).unwrap();
        tx.send(StreamEvent::Complete(tag("SELECT 2"))).unwrap();

        let mut cx = Context::from_waker(std::task::Waker::noop());
        let mut all = std::pin::pin!(stream.all());
        let Poll::Ready(Ok(rows)) = all.as_mut().poll(&mut cx) else {
            panic!("all() should complete synchronously");
        };
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn for_each_visits_rows_until_clean_end() {
        let (mut stream, tx, _) = streaming();
        tx.send(StreamEvent::Rows(vec![row(), row(), row()])).unwrap();
        tx.send(StreamEvent::Complete(tag("SELECT 3"))).unwrap();

        let mut cx = Context::from_waker(std::task::Waker::noop());
        let mut seen = 0;
        {
            let mut fut = std::pin::pin!(stream.for_each(|_| {
                seen += 1;
                Ok(())
            }));
            assert!(matches!(fut.as_mut().poll(&mut cx), Poll::Ready(Ok(()))));
        }
        assert_eq!(seen, 3);
        assert_eq!(stream.command_tag().as_str(), "SELECT 3");
    }

    #[test]
    fn failure_is_delivered_once_then_consumed() {
        let (mut stream, tx, _) = streaming();
        tx.send(StreamEvent::Fail(Error::unclean_shutdown())).unwrap();

        assert!(matches!(poll_once(&mut stream), Poll::Ready(Some(Err(_)))));
        // terminal now; next() is a caller bug per the streaming contract
    }

    #[test]
    fn cancel_is_noop_after_terminal() {
        let (mut stream, tx, recording) = streaming();
        tx.send(StreamEvent::Complete(tag("SELECT 0"))).unwrap();
        assert!(matches!(poll_once(&mut stream), Poll::Ready(None)));

        stream.cancel();
        stream.cancel();
        assert_eq!(recording.cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_while_streaming_forwards_once_per_call() {
        let (mut stream, _tx, recording) = streaming();
        stream.cancel();
        assert_eq!(recording.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_mid_stream_cancels() {
        let (stream, _tx, recording) = streaming();
        drop(stream);
        assert_eq!(recording.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "before the stream completed")]
    fn command_tag_before_completion_is_a_bug() {
        let (stream, _tx, _) = streaming();
        let _ = stream.command_tag();
    }
}
