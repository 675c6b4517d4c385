//! Lock-fenced crash watching.
//!
//! The watcher does nothing until it holds the watcher lock. While it holds
//! it, crashes found on the event feed are queued to a single forwarding
//! task, which posts them one at a time in the order they were seen. When
//! the queue is full the watcher stops reading the feed until there is room.
//! Losing the lock ends the watcher with an error, also while it is still
//! subscribing; a forwarding failure is logged and the next crash is tried
//! anyway.

use crate::feed::{EventSource, EventStream};
use crate::forwarder::CrashSink;
use crate::prelude::*;
use async_trait::async_trait;
use coord::{LeadershipGate, LeaseHandle, Ready, Runner};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct EventWatcher {
    gate: Arc<LeadershipGate>,
    source: Arc<dyn EventSource>,
    sink: Arc<dyn CrashSink>,
    dispatch_buffer: usize,
}

impl EventWatcher {
    pub fn new(
        gate: Arc<LeadershipGate>,
        source: Arc<dyn EventSource>,
        sink: Arc<dyn CrashSink>,
        dispatch_buffer: usize,
    ) -> Self {
        Self {
            gate,
            source,
            sink,
            dispatch_buffer: dispatch_buffer.max(1),
        }
    }

    async fn watch(&self, lease: &LeaseHandle, shutdown: &CancellationToken, ready: &mut Ready) -> coord::Result<()> {
        let events = tokio::select! {
            biased;
            result = self.gate.hold(lease, shutdown) => return result,
            events = self.source.subscribe() => events.map_err(coord::Error::Other)?,
        };
        info!("watcher.started");
        ready.signal();

        let (tx, rx) = mpsc::channel(self.dispatch_buffer);
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&self.sink), rx));

        let result = tokio::select! {
            biased;
            result = self.gate.hold(lease, shutdown) => result,
            result = consume(events, tx) => result,
        };

        // Crashes still queued are dropped along with the dispatcher.
        dispatcher.abort();
        result
    }
}

async fn consume(mut events: EventStream, tx: mpsc::Sender<InstanceCrashEvent>) -> coord::Result<()> {
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| coord::Error::Transport(format!("event feed failed: {e:#}")))?;
        let Some(crash) = event.crash() else {
            continue;
        };

        info!(
            process_guid = %crash.process_guid,
            index = crash.index,
            crash_count = crash.crash_count,
            "watcher.crash-detected"
        );
        if tx.send(crash).await.is_err() {
            return Err(coord::Error::Transport("crash dispatcher stopped".to_string()));
        }
    }

    Err(coord::Error::Transport("event feed closed".to_string()))
}

async fn dispatch(sink: Arc<dyn CrashSink>, mut rx: mpsc::Receiver<InstanceCrashEvent>) {
    while let Some(crash) = rx.recv().await {
        match sink.app_crashed(&crash).await {
            Ok(()) => info!(
                process_guid = %crash.process_guid,
                instance_guid = %crash.instance_guid,
                index = crash.index,
                "watcher.crashed.forwarded"
            ),
            Err(e) => error!(
                process_guid = %crash.process_guid,
                index = crash.index,
                error = %e,
                "watcher.crashed.forward-failed"
            ),
        }
    }
}

#[async_trait]
impl Runner for EventWatcher {
    async fn run(&mut self, shutdown: CancellationToken, mut ready: Ready) -> coord::Result<()> {
        let Some(lease) = self.gate.acquire(&shutdown).await? else {
            return Ok(());
        };

        let result = self.watch(&lease, &shutdown, &mut ready).await;

        // A lost lease has nothing left to release. Release failures are
        // logged by the gate.
        if !matches!(result, Err(coord::Error::LeaseLost { .. })) {
            let _ = self.gate.release(lease).await;
        }
        info!("watcher.stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedEvent;
    use crate::forwarder::ForwardError;
    use crate::receptor::ActualLrp;
    use coord::{lease::lock_schema_path, test_utils::MemoryLockService, NodeId};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc::UnboundedSender, Semaphore};

    const KEY: &str = "tps_watcher_lock";

    /// Subscription that never answers.
    #[derive(Debug)]
    struct Unresponsive;

    #[async_trait]
    impl EventSource for Unresponsive {
        async fn subscribe(&self) -> Result<EventStream> {
            std::future::pending().await
        }
    }

    /// Feed driven by the test; counts events the watcher has pulled.
    #[derive(Debug)]
    struct Scripted {
        events: Mutex<Option<mpsc::UnboundedReceiver<FeedEvent>>>,
        pulled: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new() -> (Arc<Self>, UnboundedSender<FeedEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let source = Arc::new(Self {
                events: Mutex::new(Some(rx)),
                pulled: Arc::new(AtomicUsize::new(0)),
            });
            (source, tx)
        }
    }

    #[async_trait]
    impl EventSource for Scripted {
        async fn subscribe(&self) -> Result<EventStream> {
            let rx = self.events.lock().take().ok_or_else(|| anyhow!("already subscribed"))?;
            let pulled = Arc::clone(&self.pulled);
            Ok(futures_util::stream::unfold(rx, move |mut rx| {
                let pulled = Arc::clone(&pulled);
                async move {
                    let event = rx.recv().await?;
                    pulled.fetch_add(1, Ordering::SeqCst);
                    Some((Ok(event), rx))
                }
            })
            .boxed())
        }
    }

    /// Records delivered crashes. Calls listed in `failing` are rejected,
    /// and every call waits for a permit from `gate`.
    #[derive(Debug)]
    struct Recorder {
        delivered: Mutex<Vec<i32>>,
        calls: AtomicUsize,
        failing: Vec<usize>,
        gate: Semaphore,
    }

    impl Recorder {
        fn open(failing: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                failing,
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
            })
        }

        fn blocked() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                failing: Vec::new(),
                gate: Semaphore::new(0),
            })
        }

        fn delivered(&self) -> Vec<i32> {
            self.delivered.lock().clone()
        }
    }

    #[async_trait]
    impl CrashSink for Recorder {
        async fn app_crashed(&self, event: &InstanceCrashEvent) -> Result<(), ForwardError> {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&call) {
                return Err(ForwardError::Status(reqwest::StatusCode::BAD_GATEWAY));
            }
            self.delivered.lock().push(event.crash_count);
            Ok(())
        }
    }

    fn crash(crash_count: i32) -> FeedEvent {
        let before = ActualLrp {
            process_guid: "process".to_string(),
            instance_guid: "instance".to_string(),
            domain: "cf-apps".to_string(),
            crash_count: crash_count - 1,
            since: 1,
            ..Default::default()
        };
        let after = ActualLrp {
            crash_count,
            ..before.clone()
        };
        FeedEvent::ActualLrpChanged { before, after }
    }

    fn watcher(
        locks: &Arc<MemoryLockService>,
        source: Arc<dyn EventSource>,
        sink: Arc<dyn CrashSink>,
        dispatch_buffer: usize,
    ) -> EventWatcher {
        let gate = LeadershipGate::new(locks.clone(), lock_schema_path(KEY), NodeId::new(), Duration::from_millis(10));
        EventWatcher::new(Arc::new(gate), source, sink, dispatch_buffer)
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 5s");
    }

    #[tokio::test]
    async fn test_shutdown_while_subscribing() {
        let locks = Arc::new(MemoryLockService::new());
        let mut watcher = watcher(&locks, Arc::new(Unresponsive), Recorder::open(Vec::new()), 4);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { watcher.run(token, Ready::detached()).await });

        wait_for(|| locks.holder(&lock_schema_path(KEY)).is_some()).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(locks.holder(&lock_schema_path(KEY)).is_none());
    }

    #[tokio::test]
    async fn test_lock_loss_while_subscribing() {
        let locks = Arc::new(MemoryLockService::new());
        let mut watcher = watcher(&locks, Arc::new(Unresponsive), Recorder::open(Vec::new()), 4);

        let handle = tokio::spawn(async move { watcher.run(CancellationToken::new(), Ready::detached()).await });

        wait_for(|| locks.holder(&lock_schema_path(KEY)).is_some()).await;
        locks.force_release(&lock_schema_path(KEY));

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(coord::Error::LeaseLost { .. })));
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_stop_the_watcher() {
        let locks = Arc::new(MemoryLockService::new());
        let (source, feed) = Scripted::new();
        let sink = Recorder::open(vec![0]);
        let mut watcher = watcher(&locks, source, sink.clone(), 4);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { watcher.run(token, Ready::detached()).await });

        for crash_count in 1..=5 {
            feed.send(crash(crash_count)).unwrap();
        }

        wait_for(|| sink.delivered().len() == 4).await;
        assert_eq!(sink.delivered(), vec![2, 3, 4, 5]);
        assert!(!handle.is_finished());

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_stops_reading_the_feed() {
        let locks = Arc::new(MemoryLockService::new());
        let (source, feed) = Scripted::new();
        let pulled = Arc::clone(&source.pulled);
        let sink = Recorder::blocked();
        let mut watcher = watcher(&locks, source, sink.clone(), 1);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { watcher.run(token, Ready::detached()).await });

        for crash_count in 1..=10 {
            feed.send(crash(crash_count)).unwrap();
        }

        // One crash in the sink, one queued, one waiting to be queued.
        wait_for(|| pulled.load(Ordering::SeqCst) == 3).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
        assert!(sink.delivered().is_empty());

        sink.gate.add_permits(10);
        wait_for(|| sink.delivered().len() == 10).await;
        assert_eq!(sink.delivered(), (1..=10).collect::<Vec<_>>());
        assert_eq!(pulled.load(Ordering::SeqCst), 10);

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
