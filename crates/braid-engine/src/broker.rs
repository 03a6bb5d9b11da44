//! Resumable multicast of one generation's wire chunks.
//!
//! Each session has at most one live [`StreamEntry`]. Chunks are buffered for
//! the entry's lifetime so a subscriber attaching late sees the full history
//! before live delivery. Entries are disposed when the last subscriber leaves
//! a finalized stream, or by [`StreamBroker::sweep_expired`] once the
//! retention grace period has passed.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use braid_core::ids::{SessionId, SubscriberId};
use braid_core::settings::BrokerSettings;
use braid_core::wire::WireChunk;

use crate::error::BrokerError;

struct EntryState {
    chunks: Vec<WireChunk>,
    /// `None` once the subscriber's channel is closed (finalized stream or
    /// slow-consumer disconnect); the id stays until it detaches.
    subscribers: HashMap<SubscriberId, Option<mpsc::Sender<WireChunk>>>,
    finalized_at: Option<Instant>,
    aborted: bool,
}

pub struct StreamEntry {
    session_id: SessionId,
    cancel: CancellationToken,
    state: Mutex<EntryState>,
}

impl StreamEntry {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            cancel: CancellationToken::new(),
            state: Mutex::new(EntryState {
                chunks: Vec::new(),
                subscribers: HashMap::new(),
                finalized_at: None,
                aborted: false,
            }),
        }
    }

    fn is_finalized(&self) -> bool {
        self.state.lock().finalized_at.is_some()
    }

    fn is_disposable(&self) -> bool {
        let st = self.state.lock();
        st.finalized_at.is_some() && st.subscribers.is_empty()
    }

    fn is_expired(&self, now: Instant, grace: Duration) -> bool {
        matches!(self.state.lock().finalized_at, Some(at) if now.duration_since(at) >= grace)
    }

    fn push(&self, chunk: WireChunk) -> Result<(), BrokerError> {
        let mut st = self.state.lock();
        if st.finalized_at.is_some() || st.aborted {
            return Err(BrokerError::Closed(self.session_id.clone()));
        }
        fan_out(&self.session_id, &mut st, chunk);
        Ok(())
    }

    /// Append a terminal error chunk and close, unless already closed.
    fn fail(&self, error_text: String) -> bool {
        let mut st = self.state.lock();
        if st.finalized_at.is_some() {
            return false;
        }
        fan_out(&self.session_id, &mut st, WireChunk::error(error_text));
        close(&mut st);
        true
    }

    fn finalize(&self) -> bool {
        let mut st = self.state.lock();
        if st.finalized_at.is_some() {
            return false;
        }
        close(&mut st);
        true
    }

    fn abort(&self) -> bool {
        let mut st = self.state.lock();
        if st.finalized_at.is_some() || st.aborted {
            return false;
        }
        st.aborted = true;
        drop(st);
        self.cancel.cancel();
        true
    }
}

fn fan_out(session_id: &SessionId, st: &mut EntryState, chunk: WireChunk) {
    let mut live = 0usize;
    for (subscriber_id, slot) in st.subscribers.iter_mut() {
        let Some(tx) = slot else { continue };
        match tx.try_send(chunk.clone()) {
            Ok(()) => live += 1,
            Err(TrySendError::Full(_)) => {
                warn!(
                    session_id = %session_id,
                    subscriber_id = %subscriber_id,
                    "slow subscriber disconnected"
                );
                *slot = None;
            }
            Err(TrySendError::Closed(_)) => {
                *slot = None;
            }
        }
    }
    if live == 0 {
        debug!(
            session_id = %session_id,
            chunk = chunk.kind(),
            "no live subscribers, chunk buffered only"
        );
    }
    st.chunks.push(chunk);
}

fn close(st: &mut EntryState) {
    st.finalized_at = Some(Instant::now());
    for slot in st.subscribers.values_mut() {
        *slot = None;
    }
}

struct BrokerInner {
    entries: DashMap<SessionId, Arc<StreamEntry>>,
    subscriber_queue: usize,
    retention_grace: Duration,
}

/// Registry of live and recently finished streams. Cheap to clone.
#[derive(Clone)]
pub struct StreamBroker {
    inner: Arc<BrokerInner>,
}

impl StreamBroker {
    pub fn new(settings: &BrokerSettings) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                entries: DashMap::new(),
                subscriber_queue: settings.subscriber_queue.max(1),
                retention_grace: settings.retention_grace(),
            }),
        }
    }

    /// Open a stream for `session_id`. A finalized entry still retained for
    /// resumption is replaced; a live one is a conflict.
    pub fn start(&self, session_id: &SessionId) -> Result<WriteHandle, BrokerError> {
        let entry = Arc::new(StreamEntry::new(session_id.clone()));
        match self.inner.entries.entry(session_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_finalized() {
                    return Err(BrokerError::Conflict(session_id.clone()));
                }
                occupied.insert(entry.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
            }
        }
        info!(session_id = %session_id, "stream started");
        Ok(WriteHandle { entry })
    }

    pub fn append(&self, session_id: &SessionId, chunk: WireChunk) -> Result<(), BrokerError> {
        self.entry(session_id)
            .ok_or_else(|| BrokerError::NotFound(session_id.clone()))?
            .push(chunk)
    }

    pub fn finalize(&self, session_id: &SessionId) -> bool {
        self.entry(session_id).is_some_and(|e| e.finalize())
    }

    /// Signal the producer to stop. Attached subscribers stay connected but
    /// the buffer stops growing.
    pub fn abort(&self, session_id: &SessionId) -> bool {
        let aborted = self.entry(session_id).is_some_and(|e| e.abort());
        if aborted {
            info!(session_id = %session_id, "stream aborted");
        }
        aborted
    }

    /// Replay everything buffered, then follow live. `None` when nothing is
    /// resumable or the subscriber is already attached.
    pub fn subscribe(
        &self,
        session_id: &SessionId,
        subscriber_id: &SubscriberId,
    ) -> Option<ReadHandle> {
        self.subscribe_from(session_id, subscriber_id, 0)
    }

    /// Like [`subscribe`](Self::subscribe), skipping the first `offset` chunks.
    pub fn subscribe_from(
        &self,
        session_id: &SessionId,
        subscriber_id: &SubscriberId,
        offset: usize,
    ) -> Option<ReadHandle> {
        let entry = self.entry(session_id)?;
        let rx = {
            let mut st = entry.state.lock();
            if st.subscribers.contains_key(subscriber_id) {
                debug!(
                    session_id = %session_id,
                    subscriber_id = %subscriber_id,
                    "duplicate subscribe ignored"
                );
                return None;
            }
            let replay = st.chunks.get(offset..).unwrap_or_default();
            let (tx, rx) = mpsc::channel(replay.len() + self.inner.subscriber_queue);
            for chunk in replay {
                // Capacity covers the whole replay.
                if tx.try_send(chunk.clone()).is_err() {
                    break;
                }
            }
            let slot = st.finalized_at.is_none().then_some(tx);
            st.subscribers.insert(subscriber_id.clone(), slot);
            rx
        };
        debug!(
            session_id = %session_id,
            subscriber_id = %subscriber_id,
            offset,
            "subscriber attached"
        );
        Some(ReadHandle {
            inner: ReceiverStream::new(rx),
            guard: Subscription {
                broker: self.clone(),
                entry,
                subscriber_id: subscriber_id.clone(),
            },
        })
    }

    /// Detach a subscriber from the current entry for `session_id`.
    pub fn unsubscribe(&self, session_id: &SessionId, subscriber_id: &SubscriberId) -> bool {
        match self.entry(session_id) {
            Some(entry) => self.detach(&entry, subscriber_id),
            None => false,
        }
    }

    fn detach(&self, entry: &Arc<StreamEntry>, subscriber_id: &SubscriberId) -> bool {
        let (removed, disposable) = {
            let mut st = entry.state.lock();
            let removed = st.subscribers.remove(subscriber_id).is_some();
            (removed, st.finalized_at.is_some() && st.subscribers.is_empty())
        };
        if removed && disposable {
            let disposed = self
                .inner
                .entries
                .remove_if(&entry.session_id, |_, current| {
                    Arc::ptr_eq(current, entry) && current.is_disposable()
                })
                .is_some();
            if disposed {
                debug!(
                    session_id = %entry.session_id,
                    "stream disposed after last subscriber left"
                );
            }
        }
        removed
    }

    /// Dispose finalized entries older than the retention grace period.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let grace = self.inner.retention_grace;
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, entry| !entry.is_expired(now, grace));
        let swept = before.saturating_sub(self.inner.entries.len());
        if swept > 0 {
            debug!(swept, "expired streams disposed");
        }
        swept
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.entry(session_id).is_some_and(|e| !e.is_finalized())
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.inner.entries.contains_key(session_id)
    }

    pub fn chunk_count(&self, session_id: &SessionId) -> Option<usize> {
        self.entry(session_id).map(|e| e.state.lock().chunks.len())
    }

    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.entry(session_id).map_or(0, |e| e.state.lock().subscribers.len())
    }

    fn entry(&self, session_id: &SessionId) -> Option<Arc<StreamEntry>> {
        self.inner.entries.get(session_id).map(|e| Arc::clone(e.value()))
    }
}

/// Producer side of one stream entry. Bound to the entry it was created
/// for, so a stale handle never writes into a later generation.
pub struct WriteHandle {
    entry: Arc<StreamEntry>,
}

impl WriteHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.entry.session_id
    }

    pub fn append(&self, chunk: WireChunk) -> Result<(), BrokerError> {
        self.entry.push(chunk)
    }

    pub fn finalize(&self) -> bool {
        self.entry.finalize()
    }

    /// Deliver a terminal error chunk to every subscriber exactly once and close.
    pub fn fail(&self, error_text: impl Into<String>) -> bool {
        self.entry.fail(error_text.into())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.entry.cancel.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.entry.state.lock().aborted
    }
}

struct Subscription {
    broker: StreamBroker,
    entry: Arc<StreamEntry>,
    subscriber_id: SubscriberId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.detach(&self.entry, &self.subscriber_id);
    }
}

pin_project! {
    /// Replay-then-live view of a stream. Dropping it unsubscribes.
    pub struct ReadHandle {
        #[pin]
        inner: ReceiverStream<WireChunk>,
        guard: Subscription,
    }
}

impl ReadHandle {
    pub fn subscriber_id(&self) -> &SubscriberId {
        &self.guard.subscriber_id
    }
}

impl Stream for ReadHandle {
    type Item = WireChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn broker() -> StreamBroker {
        StreamBroker::new(&BrokerSettings::default())
    }

    fn sid() -> SessionId {
        SessionId::from_raw("S1")
    }

    fn sub(name: &str) -> SubscriberId {
        SubscriberId::from_raw(name)
    }

    fn delta(s: &str) -> WireChunk {
        WireChunk::text_delta("t0", s)
    }

    async fn drain(handle: ReadHandle) -> Vec<WireChunk> {
        handle.collect().await
    }

    #[tokio::test]
    async fn mid_stream_follower_gets_replay_then_live() {
        let broker = broker();
        let writer = broker.start(&sid()).unwrap();
        writer.append(delta("H")).unwrap();

        let follower = broker.subscribe(&sid(), &sub("f")).unwrap();
        writer.append(delta("i")).unwrap();
        writer.finalize();

        assert_eq!(drain(follower).await, vec![delta("H"), delta("i")]);
    }

    #[tokio::test]
    async fn late_subscriber_after_finalize_sees_full_history_once() {
        let broker = broker();
        let writer = broker.start(&sid()).unwrap();
        for s in ["a", "b", "c"] {
            writer.append(delta(s)).unwrap();
        }
        writer.finalize();

        let late = broker.subscribe(&sid(), &sub("late")).unwrap();
        assert_eq!(drain(late).await, vec![delta("a"), delta("b"), delta("c")]);
    }

    #[tokio::test]
    async fn subscribe_from_offset_skips_prefix() {
        let broker = broker();
        let writer = broker.start(&sid()).unwrap();
        for s in ["a", "b", "c"] {
            writer.append(delta(s)).unwrap();
        }
        writer.finalize();
        let handle = broker.subscribe_from(&sid(), &sub("r"), 2).unwrap();
        assert_eq!(drain(handle).await, vec![delta("c")]);
        let past_end = broker.subscribe_from(&SessionId::from_raw("S1"), &sub("r2"), 10).unwrap();
        assert!(drain(past_end).await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_subscribe_returns_none() {
        let broker = broker();
        let _writer = broker.start(&sid()).unwrap();
        let first = broker.subscribe(&sid(), &sub("f"));
        assert!(first.is_some());
        assert!(broker.subscribe(&sid(), &sub("f")).is_none());
        assert_eq!(broker.subscriber_count(&sid()), 1);

        drop(first);
        assert!(broker.subscribe(&sid(), &sub("f")).is_some());
    }

    #[test]
    fn nothing_to_resume_is_none() {
        let broker = broker();
        assert!(broker.subscribe(&sid(), &sub("f")).is_none());
    }

    #[test]
    fn second_start_conflicts_until_finalized() {
        let broker = broker();
        let writer = broker.start(&sid()).unwrap();
        assert!(matches!(broker.start(&sid()), Err(BrokerError::Conflict(_))));
        writer.finalize();
        let next = broker.start(&sid()).unwrap();
        assert_eq!(broker.chunk_count(&sid()), Some(0));

        // The old handle cannot write into the new entry.
        assert!(matches!(writer.append(delta("x")), Err(BrokerError::Closed(_))));
        next.append(delta("y")).unwrap();
        assert_eq!(broker.chunk_count(&sid()), Some(1));
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_without_blocking() {
        let broker = StreamBroker::new(&BrokerSettings {
            subscriber_queue: 2,
            ..Default::default()
        });
        let writer = broker.start(&sid()).unwrap();
        let slow = broker.subscribe(&sid(), &sub("slow")).unwrap();
        let mut fast = broker.subscribe(&sid(), &sub("fast")).unwrap();

        for i in 0..5 {
            writer.append(delta(&i.to_string())).unwrap();
            assert_eq!(fast.next().await, Some(delta(&i.to_string())));
        }
        writer.finalize();

        // The slow reader got what fit in its queue, then its channel closed.
        assert_eq!(drain(slow).await, vec![delta("0"), delta("1")]);
        assert_eq!(broker.chunk_count(&sid()), Some(5));
    }

    #[tokio::test]
    async fn failure_is_one_terminal_chunk_for_everyone() {
        let broker = broker();
        let writer = broker.start(&sid()).unwrap();
        let a = broker.subscribe(&sid(), &sub("a")).unwrap();
        let b = broker.subscribe(&sid(), &sub("b")).unwrap();
        writer.append(delta("partial")).unwrap();
        assert!(writer.fail("producer crashed"));
        assert!(!writer.fail("again"));

        let expected = vec![delta("partial"), WireChunk::error("producer crashed")];
        assert_eq!(drain(a).await, expected);
        assert_eq!(drain(b).await, expected);
    }

    #[tokio::test]
    async fn abort_cancels_and_stops_growth() {
        let broker = broker();
        let writer = broker.start(&sid()).unwrap();
        let token = writer.cancel_token();
        let follower = broker.subscribe(&sid(), &sub("f")).unwrap();
        writer.append(delta("a")).unwrap();

        assert!(broker.abort(&sid()));
        assert!(token.is_cancelled());
        assert!(!broker.abort(&sid()));
        assert!(writer.append(delta("b")).is_err());
        assert!(broker.is_active(&sid()));

        writer.finalize();
        assert_eq!(drain(follower).await, vec![delta("a")]);
    }

    #[tokio::test]
    async fn last_unsubscribe_disposes_finalized_entry() {
        let broker = broker();
        let writer = broker.start(&sid()).unwrap();
        let a = broker.subscribe(&sid(), &sub("a")).unwrap();
        let b = broker.subscribe(&sid(), &sub("b")).unwrap();
        writer.finalize();

        drop(a);
        assert!(broker.contains(&sid()));
        assert!(broker.unsubscribe(&sid(), &sub("b")));
        assert!(!broker.contains(&sid()));
        // Dropping the handle after an explicit unsubscribe is harmless.
        drop(b);
        assert!(!broker.unsubscribe(&sid(), &sub("b")));
    }

    #[tokio::test]
    async fn unsubscribe_on_live_stream_keeps_entry() {
        let broker = broker();
        let _writer = broker.start(&sid()).unwrap();
        let handle = broker.subscribe(&sid(), &sub("a")).unwrap();
        drop(handle);
        assert!(broker.contains(&sid()));
        assert!(broker.is_active(&sid()));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_disposes_after_grace_period() {
        let broker = StreamBroker::new(&BrokerSettings {
            retention_grace_ms: 1_000,
            ..Default::default()
        });
        let writer = broker.start(&sid()).unwrap();
        let live = broker.start(&SessionId::from_raw("S2")).unwrap();
        writer.finalize();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(broker.sweep_expired(), 0);
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(broker.sweep_expired(), 1);
        assert!(!broker.contains(&sid()));
        assert!(broker.is_active(live.session_id()));
    }
}
