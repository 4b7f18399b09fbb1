//! StagingWatcher: feeds staged message ids to a bounded worker pool.
//!
//! Sources of ids:
//! - a full sweep at startup (after restoring orphaned claims),
//! - live `notify` events on the staging directory,
//! - a periodic re-sweep that picks up deferred and retried messages.
//!
//! Files younger than the settle interval are parked and re-checked once they
//! have settled. If the event subscription errors or closes, or the staging
//! directory itself is removed or replaced, it is recreated and the directory
//! is swept again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::channels::staging::id_from_path;
use crate::config::ScanConfig;
use crate::error::StagingError;
use crate::pipeline::processor::MessageProcessor;
use crate::pipeline::types::Outcome;

/// Delay before recreating a failed event subscription.
const REWATCH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct WatcherOptions {
    pub sweep_interval: Duration,
    pub settle_interval: Duration,
    pub max_workers: usize,
}

impl WatcherOptions {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval,
            settle_interval: config.settle_interval,
            max_workers: config.max_workers,
        }
    }
}

/// Stops the watcher: no new ids are dispatched, in-flight work finishes.
#[derive(Debug, Clone)]
pub struct WatcherShutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl WatcherShutdown {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Spawn the watcher loop.
///
/// Returns a `JoinHandle` that resolves once shutdown has drained in-flight
/// work, and the handle that requests that shutdown.
pub fn spawn_staging_watcher(
    processor: Arc<MessageProcessor>,
    options: WatcherOptions,
) -> (JoinHandle<()>, WatcherShutdown) {
    let (tx, rx) = watch::channel(false);
    let shutdown = WatcherShutdown { tx: Arc::new(tx) };

    let handle = tokio::spawn(async move {
        let mut watch_loop = WatchLoop::new(processor, options);
        watch_loop.run(rx).await;
    });

    (handle, shutdown)
}

/// Live event subscription: the watcher must be kept alive alongside its
/// receiving end.
struct FsSubscription {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    /// Identity of the directory the watch was placed on.
    watched: Option<DirIdentity>,
}

fn subscribe(dir: &Path) -> Result<FsSubscription, StagingError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        // Receiver gone means the loop is shutting down or resubscribing.
        let _ = tx.send(event);
    })
    .map_err(|e| StagingError::Watcher(e.to_string()))?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| StagingError::Watcher(e.to_string()))?;

    Ok(FsSubscription {
        _watcher: watcher,
        events: rx,
        watched: dir_identity(dir),
    })
}

/// Inode plus change time: a directory recreated under the same name differs
/// even when the inode number is reused.
#[cfg(unix)]
type DirIdentity = (u64, u64, i64, i64);

#[cfg(unix)]
fn dir_identity(dir: &Path) -> Option<DirIdentity> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(dir).ok()?;
    Some((meta.dev(), meta.ino(), meta.ctime(), meta.ctime_nsec()))
}

#[cfg(not(unix))]
type DirIdentity = ();

#[cfg(not(unix))]
fn dir_identity(dir: &Path) -> Option<DirIdentity> {
    std::fs::metadata(dir).ok().map(|_| ())
}

enum Signal {
    Shutdown,
    Joined(Result<(tokio::task::Id, Outcome), tokio::task::JoinError>),
    Event(Option<notify::Result<notify::Event>>),
    Sweep,
    Settle,
    Rewatch,
}

struct WatchLoop {
    processor: Arc<MessageProcessor>,
    options: WatcherOptions,
    subscription: Option<FsSubscription>,
    rewatch_at: Option<Instant>,
    workers: JoinSet<Outcome>,
    task_ids: HashMap<tokio::task::Id, String>,
    in_flight: HashSet<String>,
    queued: VecDeque<String>,
    queued_set: HashSet<String>,
    settling: HashMap<String, Instant>,
    /// Ids handed back with a retry outcome; left for the next periodic sweep.
    deferred: HashSet<String>,
}

impl WatchLoop {
    fn new(processor: Arc<MessageProcessor>, options: WatcherOptions) -> Self {
        Self {
            processor,
            options: WatcherOptions {
                max_workers: options.max_workers.max(1),
                ..options
            },
            subscription: None,
            rewatch_at: None,
            workers: JoinSet::new(),
            task_ids: HashMap::new(),
            in_flight: HashSet::new(),
            queued: VecDeque::new(),
            queued_set: HashSet::new(),
            settling: HashMap::new(),
            deferred: HashSet::new(),
        }
    }

    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let staging = self.processor.staging().clone();
        info!(
            dir = %staging.dir().display(),
            workers = self.options.max_workers,
            sweep_secs = self.options.sweep_interval.as_secs(),
            "Staging watcher started"
        );

        if let Err(e) = staging.recover_orphans().await {
            warn!(error = %e, "Orphan recovery failed");
        }
        self.resubscribe();
        self.sweep().await;
        self.dispatch();

        let mut sweep_tick = tokio::time::interval_at(
            Instant::now() + self.options.sweep_interval,
            self.options.sweep_interval,
        );
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let settle_at = self.settling.values().min().copied();
            let rewatch_at = self.rewatch_at;

            let signal = tokio::select! {
                biased;
                changed = shutdown.changed() => match changed {
                    Ok(()) if !*shutdown.borrow() => continue,
                    _ => Signal::Shutdown,
                },
                Some(joined) = self.workers.join_next_with_id(), if !self.workers.is_empty() => {
                    Signal::Joined(joined)
                }
                event = recv_event(self.subscription.as_mut()) => Signal::Event(event),
                _ = sweep_tick.tick() => Signal::Sweep,
                _ = sleep_until_opt(settle_at) => Signal::Settle,
                _ = sleep_until_opt(rewatch_at) => Signal::Rewatch,
            };

            match signal {
                Signal::Shutdown => break,
                Signal::Joined(joined) => self.finish(joined),
                Signal::Event(Some(Ok(event))) => {
                    if self.watch_lost(&event) {
                        warn!("Staging directory removed or replaced, resubscribing");
                        self.drop_subscription();
                    } else if event.need_rescan() {
                        debug!("Staging events dropped by the backend, sweeping");
                        self.sweep().await;
                    } else {
                        self.on_event(event).await;
                    }
                }
                Signal::Event(Some(Err(e))) => {
                    warn!(error = %e, "Staging watch error, resubscribing");
                    self.drop_subscription();
                }
                Signal::Event(None) => {
                    warn!("Staging watch closed, resubscribing");
                    self.drop_subscription();
                }
                Signal::Sweep => {
                    self.deferred.clear();
                    self.check_watched_dir();
                    self.sweep().await;
                }
                Signal::Settle => self.recheck_settled().await,
                Signal::Rewatch => {
                    self.resubscribe();
                    if self.subscription.is_some() {
                        // Events may have been missed while unsubscribed.
                        self.sweep().await;
                    }
                }
            }

            self.dispatch();
        }

        info!(in_flight = self.workers.len(), "Staging watcher stopping, draining workers");
        self.subscription = None;
        while let Some(joined) = self.workers.join_next_with_id().await {
            self.finish(joined);
        }
        info!("Staging watcher stopped");
    }

    fn resubscribe(&mut self) {
        let dir = self.processor.staging().dir().to_path_buf();
        match subscribe(&dir) {
            Ok(sub) => {
                debug!(dir = %dir.display(), "Subscribed to staging events");
                self.subscription = Some(sub);
                self.rewatch_at = None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to subscribe to staging events, will retry");
                self.subscription = None;
                self.rewatch_at = Some(Instant::now() + REWATCH_DELAY);
            }
        }
    }

    fn drop_subscription(&mut self) {
        self.subscription = None;
        self.rewatch_at = Some(Instant::now() + REWATCH_DELAY);
    }

    /// The watch sits on the directory inode; once that inode is removed or
    /// renamed away no further events arrive for the staging path.
    fn watch_lost(&self, event: &notify::Event) -> bool {
        let dir = self.processor.staging().dir();
        matches!(
            event.kind,
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
        ) && event.paths.iter().any(|p| p == dir)
    }

    /// Catch a replaced staging directory whose removal event was missed.
    fn check_watched_dir(&mut self) {
        let Some(sub) = &self.subscription else {
            return;
        };
        let current = dir_identity(self.processor.staging().dir());
        if current.is_none() || current != sub.watched {
            warn!("Staging directory changed under the watch, resubscribing");
            self.drop_subscription();
        }
    }

    async fn on_event(&mut self, event: notify::Event) {
        if matches!(event.kind, EventKind::Remove(_) | EventKind::Access(_)) {
            return;
        }
        for path in event.paths {
            match id_from_path(&path) {
                Ok(Some(id)) => {
                    if self.deferred.contains(&id) {
                        continue;
                    }
                    self.consider(id, None).await;
                }
                Ok(None) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "Ignoring staging event"),
            }
        }
    }

    async fn sweep(&mut self) {
        let entries = match self.processor.staging().list_pending().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Staging sweep failed");
                return;
            }
        };
        if !entries.is_empty() {
            debug!(count = entries.len(), "Staging sweep found messages");
        }
        for entry in entries {
            self.consider(entry.id, Some(entry.age)).await;
        }
    }

    /// Queue an id if it is staged, settled, and not already being handled.
    async fn consider(&mut self, id: String, age: Option<Duration>) {
        if self.in_flight.contains(&id) || self.queued_set.contains(&id) {
            return;
        }
        let age = match age {
            Some(age) => age,
            None => match self.processor.staging().age_of(&id).await {
                Some(age) => age,
                // Gone already (claimed elsewhere or retired).
                None => return,
            },
        };

        if age < self.options.settle_interval {
            let due = Instant::now() + (self.options.settle_interval - age);
            self.settling.insert(id, due);
            return;
        }

        self.settling.remove(&id);
        self.queued_set.insert(id.clone());
        self.queued.push_back(id);
    }

    async fn recheck_settled(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .settling
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            self.settling.remove(&id);
            self.consider(id, None).await;
        }
    }

    fn dispatch(&mut self) {
        while self.workers.len() < self.options.max_workers {
            let Some(id) = self.queued.pop_front() else {
                break;
            };
            self.queued_set.remove(&id);
            if !self.in_flight.insert(id.clone()) {
                continue;
            }

            let processor = Arc::clone(&self.processor);
            let task_id = id.clone();
            let handle = self
                .workers
                .spawn(async move { processor.process(&task_id).await });
            self.task_ids.insert(handle.id(), id);
        }
    }

    fn finish(&mut self, joined: Result<(tokio::task::Id, Outcome), tokio::task::JoinError>) {
        let (task, outcome) = match joined {
            Ok((task, outcome)) => (task, Some(outcome)),
            Err(e) => {
                error!(error = %e, "Message worker failed");
                (e.id(), None)
            }
        };
        let Some(id) = self.task_ids.remove(&task) else {
            return;
        };
        self.in_flight.remove(&id);

        match outcome {
            Some(Outcome::Retry { cause }) => {
                debug!(id = %id, ?cause, "Message deferred to next sweep");
                self.deferred.insert(id);
            }
            Some(outcome) => debug!(id = %id, outcome = outcome.label(), "Message finished"),
            None => {
                self.deferred.insert(id);
            }
        }
    }
}

async fn recv_event(
    subscription: Option<&mut FsSubscription>,
) -> Option<notify::Result<notify::Event>> {
    match subscription {
        Some(sub) => sub.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
