//! Process-scoped tracker registry
//!
//! `Analytics` owns the queue database, the dispatch worker and every
//! tracker created through it. Settings here (opt-out, dispatch interval)
//! apply to all trackers at once.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::worker::{Command, DispatchWorker};
use crate::dispatch::{DispatchSchedule, WorkerSettings};
use crate::error::{ErrorReport, HitlineError, Result};
use crate::session::{Clock, SystemClock};
use crate::storage::{HitStore, SqliteHitStore, StorageResult};
use crate::tracker::{Tracker, TrackerMap};
use crate::transport::{HttpTransport, Transport};

const CLIENT_ID_PROPERTY: &str = "client_id";
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// State shared by the registry and every tracker it created
pub(crate) struct Runtime {
    pub(crate) client_id: String,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) commands: mpsc::Sender<Command>,
    opt_out: AtomicBool,
}

impl Runtime {
    pub(crate) fn is_opted_out(&self) -> bool {
        self.opt_out.load(Ordering::SeqCst)
    }

    /// Sends a control command that must not be lost to a momentarily full
    /// channel. Falls back to an awaited send on the current runtime.
    fn post(&self, command: Command) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(command)) => {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let commands = self.commands.clone();
                        handle.spawn(async move {
                            let _ = commands.send(command).await;
                        });
                        true
                    }
                    Err(_) => {
                        warn!("Command channel full and no runtime available");
                        false
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Dispatch worker stopped, command ignored");
                false
            }
        }
    }
}

/// Loads the installation's client id, creating it on first use
async fn load_or_create_client_id(store: &dyn HitStore) -> StorageResult<String> {
    if let Some(client_id) = store.property(CLIENT_ID_PROPERTY).await? {
        return Ok(client_id);
    }
    let client_id = uuid::Uuid::new_v4().to_string();
    store.set_property(CLIENT_ID_PROPERTY, &client_id).await?;
    info!("Generated new client id {}", client_id);
    Ok(client_id)
}

pub struct Analytics {
    runtime: Arc<Runtime>,
    trackers: Arc<TrackerMap>,
    default_tracker: Arc<Mutex<Option<Arc<Tracker>>>>,
    schedule: Mutex<DispatchSchedule>,
    session_timeout: Duration,
    errors: broadcast::Sender<ErrorReport>,
    worker: Mutex<Option<JoinHandle<()>>>,
    panic_hook_installed: AtomicBool,
}

impl Analytics {
    /// Opens the SQLite queue from `config` and delivers over HTTP
    pub async fn new(config: Config) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config.transport)?);
        Self::with_transport(config, transport).await
    }

    /// Opens the SQLite queue from `config` and delivers through `transport`
    pub async fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let store = SqliteHitStore::new(&config.storage.url, config.storage.max_connections).await?;
        Self::from_parts(&config, Arc::new(store), transport, Arc::new(SystemClock)).await
    }

    /// Assembles a registry from explicit collaborators. Must be called
    /// inside a tokio runtime; the dispatch worker is spawned here.
    pub async fn from_parts(
        config: &Config,
        store: Arc<dyn HitStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        store.init().await?;
        let client_id = load_or_create_client_id(store.as_ref()).await?;

        let settings = WorkerSettings::from(config);
        let schedule = settings.schedule;
        let (sender, receiver) = mpsc::channel(config.dispatch.channel_capacity.max(1));
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        let worker = DispatchWorker::new(store, transport, clock.clone(), errors.clone(), settings)
            .spawn(receiver);

        let session_timeout = Duration::try_from_secs_f64(config.session.timeout_secs)
            .unwrap_or(crate::session::DEFAULT_SESSION_TIMEOUT);

        Ok(Self {
            runtime: Arc::new(Runtime {
                client_id,
                clock,
                commands: sender,
                opt_out: AtomicBool::new(false),
            }),
            trackers: Arc::new(DashMap::new()),
            default_tracker: Arc::new(Mutex::new(None)),
            schedule: Mutex::new(schedule),
            session_timeout,
            errors,
            worker: Mutex::new(Some(worker)),
            panic_hook_installed: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.runtime.client_id
    }

    /// Returns the tracker for `tracking_id`, creating it if needed. The
    /// first tracker created becomes the default tracker.
    pub fn get_or_create(&self, tracking_id: &str) -> Result<Arc<Tracker>> {
        if tracking_id.trim().is_empty() {
            return Err(HitlineError::EmptyTrackingId);
        }

        let tracker = self
            .trackers
            .entry(tracking_id.to_string())
            .or_insert_with(|| {
                debug!("Creating tracker {}", tracking_id);
                Arc::new(Tracker::new(
                    tracking_id.to_string(),
                    self.runtime.clone(),
                    Arc::downgrade(&self.trackers),
                    self.session_timeout,
                ))
            })
            .clone();

        let mut default = self.default_tracker.lock();
        if default.as_ref().map_or(true, |t| t.is_closed()) {
            *default = Some(tracker.clone());
        }
        Ok(tracker)
    }

    /// Existing open tracker for `tracking_id`
    pub fn tracker(&self, tracking_id: &str) -> Option<Arc<Tracker>> {
        self.trackers.get(tracking_id).map(|t| t.value().clone())
    }

    pub fn trackers(&self) -> Vec<Arc<Tracker>> {
        self.trackers.iter().map(|t| t.value().clone()).collect()
    }

    pub fn default_tracker(&self) -> Option<Arc<Tracker>> {
        self.default_tracker
            .lock()
            .as_ref()
            .filter(|t| !t.is_closed())
            .cloned()
    }

    pub fn set_default_tracker(&self, tracker: Option<Arc<Tracker>>) {
        *self.default_tracker.lock() = tracker;
    }

    pub fn opt_out(&self) -> bool {
        self.runtime.is_opted_out()
    }

    /// While set, every send call returns `false` and queues nothing
    pub fn set_opt_out(&self, opt_out: bool) {
        info!("Opt-out {}", if opt_out { "enabled" } else { "disabled" });
        self.runtime.opt_out.store(opt_out, Ordering::SeqCst);
    }

    /// Negative: manual only. Zero: dispatch as soon as hits are queued.
    pub fn dispatch_interval(&self) -> f64 {
        self.schedule.lock().as_secs()
    }

    pub fn set_dispatch_interval(&self, interval_secs: f64) {
        let schedule = DispatchSchedule::from_secs(interval_secs);
        *self.schedule.lock() = schedule;
        self.runtime.post(Command::SetSchedule(schedule));
    }

    /// Requests a flush of every pending hit, ignoring retry backoff.
    /// Returns without waiting; pair with [`Analytics::sync`] to wait.
    pub fn dispatch(&self) {
        self.runtime.post(Command::Dispatch);
    }

    /// Resolves once every command submitted before this call was handled
    pub async fn sync(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.runtime
            .commands
            .send(Command::Barrier(reply))
            .await
            .map_err(|_| HitlineError::WorkerStopped)?;
        done.await.map_err(|_| HitlineError::WorkerStopped)
    }

    /// Hits still queued, for one tracker or all of them
    pub async fn pending_hits(&self, tracking_id: Option<&str>) -> Result<u64> {
        let (reply, count) = oneshot::channel();
        self.runtime
            .commands
            .send(Command::Count {
                tracking_id: tracking_id.map(str::to_string),
                reply,
            })
            .await
            .map_err(|_| HitlineError::WorkerStopped)?;
        Ok(count.await.map_err(|_| HitlineError::WorkerStopped)??)
    }

    /// Storage and network failures observed after send calls returned
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorReport> {
        self.errors.subscribe()
    }

    /// Queues a fatal exception hit on the default tracker whenever a thread
    /// panics. The previous hook still runs afterwards.
    pub fn track_uncaught_panics(&self) {
        if self.panic_hook_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let default_tracker = Arc::downgrade(&self.default_tracker);
        let previous = std::panic::take_hook();

        std::panic::set_hook(Box::new(move |info| {
            let tracker = default_tracker
                .upgrade()
                .and_then(|slot| slot.try_lock().and_then(|guard| guard.clone()))
                .filter(|t| !t.is_closed());
            if let Some(tracker) = tracker {
                let payload = info.payload();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                let description = match info.location() {
                    Some(location) => {
                        format!("{} at {}:{}", message, location.file(), location.line())
                    }
                    None => message,
                };
                tracker.send_exception(true, &description);
            }
            previous(info);
        }));
    }

    /// Stops the dispatch worker after it drains its channel. Hits still in
    /// the queue are kept for the next start.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        if self.runtime.commands.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = done.await;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Dispatch worker ended abnormally: {}", e);
            }
        }
        info!("Analytics shut down");
        Ok(())
    }
}
