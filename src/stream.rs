//! Aggregation streams: one poll task per subscriber, pulling its sources on
//! a fixed interval and pushing new items, status changes and pings.
use crate::dedup::DedupRecord;
use crate::enrich::{enrich_item, Enricher};
use crate::events::{LogBus, LogLine};
use crate::model::{Item, SourceStatus, StreamEvent};
use crate::queue::BoundedQueue;
use crate::sources::SourceRegistry;
use chrono::Utc;
use futures::future::join_all;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::SendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const STREAM_BUFFER: usize = 64;

/// What a subscriber asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub sources: Vec<String>,
    /// When false, the first cycle only fills the dedup record.
    pub include_history: bool,
    /// Forward this instance's log lines on the stream.
    pub instance_id: Option<String>,
}

impl StreamRequest {
    pub fn new(sources: Vec<String>) -> Self {
        Self {
            sources,
            include_history: true,
            instance_id: None,
        }
    }
}

#[derive(Clone)]
pub struct StreamController {
    sources: Arc<SourceRegistry>,
    queue: BoundedQueue,
    enricher: Option<Arc<dyn Enricher>>,
    logs: LogBus,
    interval: Duration,
}

impl StreamController {
    pub fn new(sources: Arc<SourceRegistry>, queue: BoundedQueue, logs: LogBus, interval: Duration) -> Self {
        Self {
            sources,
            queue,
            enricher: None,
            logs,
            interval,
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Open a stream. Polling starts at once and stops when the returned
    /// subscription is dropped.
    pub fn subscribe(&self, request: StreamRequest) -> Subscription {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let logs = request.instance_id.as_ref().map(|_| self.logs.subscribe());
        info!(sources = ?request.sources, history = request.include_history, "stream opened");
        let poller = Poller {
            sources: Arc::clone(&self.sources),
            queue: self.queue.clone(),
            enricher: self.enricher.clone(),
            interval: self.interval,
            request,
            seen: DedupRecord::new(),
            statuses: HashMap::new(),
        };
        let handle = tokio::spawn(poller.run(tx, logs));
        Subscription { rx, handle }
    }
}

/// Event stream of one subscriber. Dropping it aborts the poll task, which
/// releases its timer, dedup record and log subscription.
pub struct Subscription {
    rx: mpsc::Receiver<StreamEvent>,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
        debug!("stream closed");
    }
}

type Sent = Result<(), SendError<StreamEvent>>;

struct Poller {
    sources: Arc<SourceRegistry>,
    queue: BoundedQueue,
    enricher: Option<Arc<dyn Enricher>>,
    interval: Duration,
    request: StreamRequest,
    seen: DedupRecord,
    statuses: HashMap<String, SourceStatus>,
}

impl Poller {
    async fn run(mut self, tx: mpsc::Sender<StreamEvent>, mut logs: Option<broadcast::Receiver<LogLine>>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut first_cycle = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let suppress = first_cycle && !self.request.include_history;
                    first_cycle = false;
                    if self.poll_cycle(&tx, suppress).await.is_err() {
                        break;
                    }
                }
                line = next_log(&mut logs) => {
                    if line.instance_id.as_deref() != self.request.instance_id.as_deref() {
                        continue;
                    }
                    if tx.send(StreamEvent::Log { message: line.message }).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn poll_cycle(&mut self, tx: &mpsc::Sender<StreamEvent>, suppress: bool) -> Sent {
        let ids = self.request.sources.clone();
        for id in &ids {
            match self.sources.get(id) {
                None => {
                    self.set_status(tx, id, SourceStatus::Error, Some("unknown source".into()))
                        .await?;
                }
                Some(adapter) => match adapter.fetch().await {
                    Ok(items) => {
                        self.set_status(tx, id, SourceStatus::Connected, None).await?;
                        let fresh: Vec<Item> = items
                            .into_iter()
                            .filter(|item| !item.url.is_empty() && self.seen.insert(&item.url))
                            .map(|mut item| {
                                if item.source.is_empty() {
                                    item.source = id.clone();
                                }
                                item
                            })
                            .collect();
                        if suppress {
                            debug!(source = %id, count = fresh.len(), "history suppressed");
                        } else {
                            for item in self.enrich_all(fresh).await {
                                tx.send(StreamEvent::Item(item)).await?;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(?err, source = %id, "source poll failed");
                        self.set_status(tx, id, SourceStatus::Error, Some(format!("{:#}", err)))
                            .await?;
                    }
                },
            }
            tx.send(StreamEvent::Ping {
                source: id.clone(),
                time: Utc::now().timestamp_millis(),
            })
            .await?;
        }
        Ok(())
    }

    /// Enrich concurrently through the shared queue, keeping input order.
    async fn enrich_all(&self, items: Vec<Item>) -> Vec<Item> {
        let Some(enricher) = self.enricher.as_deref() else {
            return items;
        };
        join_all(
            items
                .into_iter()
                .map(|item| enrich_item(&self.queue, enricher, item)),
        )
        .await
    }

    async fn set_status(
        &mut self,
        tx: &mpsc::Sender<StreamEvent>,
        source: &str,
        status: SourceStatus,
        message: Option<String>,
    ) -> Sent {
        if self.statuses.get(source) == Some(&status) {
            return Ok(());
        }
        self.statuses.insert(source.to_string(), status);
        tx.send(StreamEvent::Status {
            source: source.to_string(),
            status,
            message,
        })
        .await
    }
}

/// Next log line, or never when the stream is not scoped to an instance.
async fn next_log(rx: &mut Option<broadcast::Receiver<LogLine>>) -> LogLine {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(line) => return line,
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "log forwarding lagged"),
            Err(RecvError::Closed) => *rx = None,
        }
    }
}
