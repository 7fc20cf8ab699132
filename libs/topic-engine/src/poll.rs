use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use lens_api::PollSnapshot;

use crate::config::PollConfig;
use crate::metadata::MetadataAccessor;
use crate::EngineError;

/// Live metadata feed for one topic.
///
/// Ends when the subscription is replaced or stopped, or when a
/// metadata fetch fails.
pub struct PollSubscription {
    topic: String,
    id: u64,
    snapshots: mpsc::Receiver<PollSnapshot>,
}

impl PollSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Identifies this subscription in `PollSupervisor::unsubscribe`.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn next(&mut self) -> Option<PollSnapshot> {
        self.snapshots.recv().await
    }
}

/// Why a ticker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollExit {
    Cancelled,
    Expired,
    SubscriberGone,
    FetchFailed,
}

enum Command {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<PollSubscription>,
    },
    Unsubscribe {
        topic: String,
        id: u64,
        reply: oneshot::Sender<bool>,
    },
}

// ═══════════════════════════════════════════════════════════════
//  PollSupervisor
// ═══════════════════════════════════════════════════════════════

/// Owns the per-topic poll tickers.
///
/// At most one ticker runs per topic. A new subscription to a topic
/// stops the previous ticker and waits for it to exit before the new one
/// starts, so snapshots of two subscriptions never interleave.
///
/// All bookkeeping lives in a single actor task; handles are cheap to
/// clone and only send it commands.
#[derive(Clone)]
pub struct PollSupervisor {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    actor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PollSupervisor {
    pub fn spawn(metadata: MetadataAccessor, config: PollConfig) -> Self {
        let (commands, inbox) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let actor = Actor {
            metadata,
            config,
            inbox,
            shutdown: shutdown.clone(),
            active: HashMap::new(),
            next_id: 0,
        };
        let handle = tokio::spawn(actor.run());
        Self {
            commands,
            shutdown,
            actor: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Start polling `topic`, replacing any running subscription to it.
    pub async fn subscribe(&self, topic: &str) -> Result<PollSubscription, EngineError> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::Subscribe {
            topic: topic.to_string(),
            reply,
        })
        .await?;
        answer.await.map_err(|_| EngineError::SupervisorStopped)
    }

    /// Stop the subscription `id` on `topic`.
    ///
    /// Returns `false` when `id` is no longer the live subscription, in
    /// which case the current one is left running.
    pub async fn unsubscribe(&self, topic: &str, id: u64) -> Result<bool, EngineError> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::Unsubscribe {
            topic: topic.to_string(),
            id,
            reply,
        })
        .await?;
        answer.await.map_err(|_| EngineError::SupervisorStopped)
    }

    /// Stop every ticker and the actor. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.actor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "poll supervisor task failed");
            }
        }
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::SupervisorStopped);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::SupervisorStopped)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Actor
// ═══════════════════════════════════════════════════════════════

struct Active {
    id: u64,
    cancel: CancellationToken,
    ticker: JoinHandle<PollExit>,
}

impl Active {
    async fn stop(self, topic: &str) {
        self.cancel.cancel();
        match self.ticker.await {
            Ok(exit) => tracing::debug!(topic, id = self.id, ?exit, "ticker stopped"),
            Err(e) => tracing::error!(topic, id = self.id, error = %e, "ticker task failed"),
        }
    }
}

struct Actor {
    metadata: MetadataAccessor,
    config: PollConfig,
    inbox: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    active: HashMap<String, Active>,
    next_id: u64,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = self.inbox.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.reap();
            match command {
                Command::Subscribe { topic, reply } => {
                    let subscription = self.subscribe(topic).await;
                    // A caller that gave up leaves the ticker to notice on its first send.
                    let _ = reply.send(subscription);
                }
                Command::Unsubscribe { topic, id, reply } => {
                    let removed = self.unsubscribe(&topic, id).await;
                    let _ = reply.send(removed);
                }
            }
        }

        self.inbox.close();
        let count = self.active.len();
        for (topic, active) in self.active.drain() {
            active.stop(&topic).await;
        }
        tracing::info!(stopped = count, "poll supervisor stopped");
    }

    async fn subscribe(&mut self, topic: String) -> PollSubscription {
        if let Some(previous) = self.active.remove(&topic) {
            tracing::info!(topic = %topic, id = previous.id, "superseding poll subscription");
            previous.stop(&topic).await;
        }

        self.next_id += 1;
        let id = self.next_id;
        let (sink, snapshots) = mpsc::channel(self.config.buffer.max(1));
        let cancel = self.shutdown.child_token();
        let ticker = tokio::spawn(tick(
            self.metadata.clone(),
            topic.clone(),
            id,
            self.config.clone(),
            sink,
            cancel.clone(),
        ));
        self.active.insert(topic.clone(), Active { id, cancel, ticker });
        tracing::info!(topic = %topic, id, "poll subscription started");

        PollSubscription { topic, id, snapshots }
    }

    async fn unsubscribe(&mut self, topic: &str, id: u64) -> bool {
        match self.active.get(topic) {
            Some(active) if active.id == id => {}
            _ => {
                tracing::debug!(topic, id, "ignoring stale unsubscribe");
                return false;
            }
        }
        if let Some(active) = self.active.remove(topic) {
            active.stop(topic).await;
        }
        true
    }

    /// Forget tickers that already exited on their own.
    fn reap(&mut self) {
        self.active.retain(|_, active| !active.ticker.is_finished());
    }
}

// ═══════════════════════════════════════════════════════════════
//  Ticker
// ═══════════════════════════════════════════════════════════════

async fn tick(
    metadata: MetadataAccessor,
    topic: String,
    id: u64,
    config: PollConfig,
    sink: mpsc::Sender<PollSnapshot>,
    cancel: CancellationToken,
) -> PollExit {
    let mut interval = tokio::time::interval(config.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let max_session = config.max_session();
    let expiry = async move {
        match max_session {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);

    let mut sent = 0u64;
    let exit = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break PollExit::Cancelled,
            _ = &mut expiry => break PollExit::Expired,
            _ = interval.tick() => {}
        }

        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PollExit::Cancelled,
            snapshot = metadata.snapshot(&topic) => snapshot,
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(topic = %topic, id, error = %e, "poll metadata fetch failed");
                break PollExit::FetchFailed;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break PollExit::Cancelled,
            delivered = sink.send(snapshot) => {
                if delivered.is_err() {
                    break PollExit::SubscriberGone;
                }
            }
        }
        sent += 1;
    };

    tracing::debug!(topic = %topic, id, sent, ?exit, "poll ticker exited");
    exit
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cluster_memory::MemoryCluster;
    use lens_api::MetadataResponse;

    use super::*;

    fn supervisor(config: PollConfig) -> (Arc<MemoryCluster>, PollSupervisor) {
        let cluster = Arc::new(MemoryCluster::default());
        cluster.create_topic("orders", 1, 1);
        cluster.create_topic("audit", 1, 1);
        let supervisor = PollSupervisor::spawn(MetadataAccessor::new(cluster.clone()), config);
        (cluster, supervisor)
    }

    fn length_of(snapshot: &PollSnapshot) -> i64 {
        let doc: MetadataResponse = serde_json::from_str(&snapshot.payload).unwrap();
        doc.result[0].partition_info[0].length
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_every_interval_until_expiry() {
        let (_cluster, supervisor) = supervisor(PollConfig::default());
        let started = tokio::time::Instant::now();
        let mut sub = supervisor.subscribe("orders").await.unwrap();

        let mut arrivals = Vec::new();
        while let Some(snapshot) = sub.next().await {
            assert_eq!(snapshot.topic, "orders");
            arrivals.push(started.elapsed());
        }
        assert_eq!(arrivals.len(), 10);
        assert_eq!(arrivals[0], Duration::ZERO);
        assert_eq!(arrivals[9], Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_follow_new_writes() {
        let (cluster, supervisor) = supervisor(PollConfig::default());
        let mut sub = supervisor.subscribe("orders").await.unwrap();
        assert_eq!(length_of(&sub.next().await.unwrap()), 0);

        cluster.append("orders", 0, "a").unwrap();
        cluster.append("orders", 0, "b").unwrap();
        assert_eq!(length_of(&sub.next().await.unwrap()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_session_never_expires() {
        let config = PollConfig {
            max_session_ms: 0,
            ..PollConfig::default()
        };
        let (_cluster, supervisor) = supervisor(config);
        let mut sub = supervisor.subscribe("orders").await.unwrap();
        for _ in 0..30 {
            assert!(sub.next().await.is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_ends_previous_stream() {
        let (_cluster, supervisor) = supervisor(PollConfig::default());
        let mut first = supervisor.subscribe("orders").await.unwrap();
        assert!(first.next().await.is_some());

        let mut second = supervisor.subscribe("orders").await.unwrap();
        assert_ne!(first.id(), second.id());
        // Previous ticker was awaited before the new one spawned, so
        // nothing is left to trickle in after the buffer drains.
        while first.next().await.is_some() {}
        assert!(second.next().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_unsubscribe_keeps_current_stream() {
        let (_cluster, supervisor) = supervisor(PollConfig::default());
        let first = supervisor.subscribe("orders").await.unwrap();
        let mut second = supervisor.subscribe("orders").await.unwrap();

        assert!(!supervisor.unsubscribe("orders", first.id()).await.unwrap());
        assert!(second.next().await.is_some());
        assert!(second.next().await.is_some());

        assert!(supervisor.unsubscribe("orders", second.id()).await.unwrap());
        while second.next().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn topics_poll_independently() {
        let (_cluster, supervisor) = supervisor(PollConfig::default());
        let mut orders = supervisor.subscribe("orders").await.unwrap();
        let mut audit = supervisor.subscribe("audit").await.unwrap();
        assert_eq!(orders.next().await.unwrap().topic, "orders");
        assert_eq!(audit.next().await.unwrap().topic, "audit");
        assert!(orders.next().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_closes_stream() {
        let (cluster, supervisor) = supervisor(PollConfig::default());
        cluster.set_unreachable(true);
        let mut sub = supervisor.subscribe("orders").await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_subscriptions_and_rejects_new_ones() {
        let (_cluster, supervisor) = supervisor(PollConfig::default());
        let mut sub = supervisor.subscribe("orders").await.unwrap();
        supervisor.stop().await;
        while sub.next().await.is_some() {}

        let err = supervisor.subscribe("orders").await.err().unwrap();
        assert!(matches!(err, EngineError::SupervisorStopped));
        supervisor.stop().await;
    }
}
