//! Response body wrapper that counts what the client reads

use super::{HitCounters, MetricNames, MetricSample};
use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Wraps a response body and publishes usage samples on every data read.
///
/// Each data frame pulled from the inner body bumps the exchange's hit
/// counter and queues three samples sharing one timestamp: hits, cumulative
/// response bytes, and the declared request length. The frame is handed to
/// the caller only after all three were accepted by the queue, so a full
/// queue stalls the response. Frames and errors pass through untouched;
/// trailers and end of stream emit nothing.
pub struct CountingBody<B> {
    inner: B,
    names: MetricNames,
    request_bytes: i64,
    response_bytes: i64,
    hits: Arc<HitCounters>,
    sender: PollSender<MetricSample>,
    pending: VecDeque<MetricSample>,
    ready: Option<Frame<Bytes>>,
}

impl<B> CountingBody<B> {
    pub fn new(
        inner: B,
        names: MetricNames,
        request_bytes: i64,
        hits: Arc<HitCounters>,
        sender: mpsc::Sender<MetricSample>,
    ) -> Self {
        Self {
            inner,
            names,
            request_bytes,
            response_bytes: 0,
            hits,
            sender: PollSender::new(sender),
            pending: VecDeque::with_capacity(3),
            ready: None,
        }
    }

    fn record_read(&mut self, len: usize) {
        self.response_bytes += len as i64;
        let hits = self.hits.increment(&self.names.hits);
        let timestamp = chrono::Utc::now().timestamp();

        self.pending.extend([
            MetricSample::new(self.names.hits.clone(), hits as i64, timestamp),
            MetricSample::new(
                self.names.response_bytes.clone(),
                self.response_bytes,
                timestamp,
            ),
            MetricSample::new(
                self.names.request_bytes.clone(),
                self.request_bytes,
                timestamp,
            ),
        ]);
    }

    /// Pushes queued samples in order, parking until the channel has room
    fn poll_publish(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        while !self.pending.is_empty() {
            if ready!(self.sender.poll_reserve(cx)).is_err() {
                tracing::debug!(
                    dropped = self.pending.len(),
                    metric = %self.names.hits,
                    "Telemetry queue closed, dropping samples"
                );
                self.pending.clear();
                break;
            }
            if let Some(sample) = self.pending.pop_front() {
                if self.sender.send_item(sample).is_err() {
                    self.pending.clear();
                    break;
                }
            }
        }
        Poll::Ready(())
    }
}

impl<B> Body for CountingBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if this.ready.is_none() {
            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.data_ref() {
                    Some(data) => {
                        let len = data.len();
                        this.record_read(len);
                        this.ready = Some(frame);
                    }
                    None => return Poll::Ready(Some(Ok(frame))),
                },
                other => return Poll::Ready(other),
            }
        }

        ready!(this.poll_publish(cx));
        Poll::Ready(this.ready.take().map(Ok))
    }

    fn is_end_stream(&self) -> bool {
        self.ready.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let held = self
            .ready
            .as_ref()
            .and_then(|f| f.data_ref())
            .map_or(0, |d| d.len() as u64);
        let inner = self.inner.size_hint();

        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + held);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + held);
        }
        hint
    }
}
