//! Supervisor registry: the set of running tunnel instances.
//!
//! Every configuration identity gets its own async slot lock, so `start` and `stop`
//! for one identity are totally ordered while unrelated identities proceed in
//! parallel. The map from identity to slot is only locked long enough to fetch or
//! create a slot; it is never held across process work.
//!
//! The running set is published through a `watch` channel and always equals the
//! set of occupied slots: it is updated under the slot lock in the same critical
//! section that fills or vacates the slot.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{JoinError, JoinSet};

use crate::events::{self, SupervisorEvent};
use crate::identity::{ConfigIdentity, Role};
use crate::output::{LogAggregator, DEFAULT_MAX_LOG_BYTES};
use crate::process::{self, BinarySpec, ExitRecord, RunningInstance};

/// Default time a process gets to exit after the graceful signal.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(3000);

/// Static configuration of a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub client: BinarySpec,
    pub server: BinarySpec,
    pub grace_period: Duration,
    pub max_log_bytes: usize,
}

impl SupervisorOptions {
    pub fn binary(&self, role: Role) -> &BinarySpec {
        match role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            client: BinarySpec::new("frpc"),
            server: BinarySpec::new("frps"),
            grace_period: DEFAULT_GRACE_PERIOD,
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
        }
    }
}

/// Errors returned by `Supervisor::start`.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to spawn {identity}: {source}")]
    Spawn {
        identity: ConfigIdentity,
        #[source]
        source: std::io::Error,
    },

    #[error("supervisor is shut down")]
    Closed,
}

/// Errors returned by `Supervisor::stop`.
///
/// The slot is vacated even when this is returned.
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("monitor for {identity} failed: {source}")]
    Monitor {
        identity: ConfigIdentity,
        #[source]
        source: JoinError,
    },
}

/// Point-in-time view of one running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub identity: ConfigIdentity,
    pub pid: Option<u32>,
    pub uptime: Duration,
}

#[derive(Debug, Default)]
struct Slot {
    instance: Option<RunningInstance>,
}

struct Inner {
    options: SupervisorOptions,
    log: LogAggregator,
    slots: Mutex<HashMap<ConfigIdentity, Arc<Mutex<Slot>>>>,
    closed: AtomicBool,
    generation: AtomicU64,
    running: watch::Sender<BTreeSet<ConfigIdentity>>,
    events: broadcast::Sender<SupervisorEvent>,
}

/// Owns every running tunnel process. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        let (running, _) = watch::channel(BTreeSet::new());
        let log = LogAggregator::new(options.max_log_bytes);
        Self {
            inner: Arc::new(Inner {
                options,
                log,
                slots: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                running,
                events: events::channel(),
            }),
        }
    }

    /// Starts `identity` with the config file at `config_path`.
    ///
    /// Succeeds without spawning when the identity is already running.
    pub async fn start(&self, identity: &ConfigIdentity, config_path: &Path) -> Result<(), StartError> {
        self.inner.start(identity, config_path).await
    }

    /// Stops `identity` and returns once its slot is vacated.
    ///
    /// Runs on its own task, so dropping the returned future does not abandon a
    /// half-finished stop.
    pub async fn stop(&self, identity: &ConfigIdentity) -> Result<(), StopError> {
        let inner = self.inner.clone();
        let owned = identity.clone();
        match tokio::spawn(async move { inner.stop(&owned).await }).await {
            Ok(result) => result,
            Err(source) => Err(StopError::Monitor {
                identity: identity.clone(),
                source,
            }),
        }
    }

    /// Stops every running instance and refuses further starts.
    pub async fn shutdown_all(&self) {
        let identities: Vec<ConfigIdentity> = {
            let slots = self.inner.slots.lock().await;
            self.inner.closed.store(true, Ordering::SeqCst);
            slots.keys().cloned().collect()
        };

        let mut tasks = JoinSet::new();
        for identity in identities {
            let inner = self.inner.clone();
            tasks.spawn(async move {
                let result = inner.stop(&identity).await;
                (identity, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((identity, Err(err))) => {
                    tracing::warn!(identity = %identity, error = %err, "stop during shutdown failed");
                }
                Err(err) => tracing::warn!(error = %err, "shutdown task failed"),
            }
        }
        tracing::info!("supervisor shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Subscribes to the running set.
    ///
    /// The receiver is marked changed so the first `changed().await` yields the
    /// current set immediately.
    pub fn running_set(&self) -> watch::Receiver<BTreeSet<ConfigIdentity>> {
        let mut rx = self.inner.running.subscribe();
        rx.mark_changed();
        rx
    }

    pub fn running(&self) -> BTreeSet<ConfigIdentity> {
        self.inner.running.borrow().clone()
    }

    pub fn is_running(&self, identity: &ConfigIdentity) -> bool {
        self.inner.running.borrow().contains(identity)
    }

    /// Describes the registered process for `identity`, if any.
    ///
    /// Waits for any in-flight start or stop of that identity.
    pub async fn info(&self, identity: &ConfigIdentity) -> Option<InstanceInfo> {
        let slot = self.inner.existing_slot(identity).await?;
        let slot = slot.lock().await;
        slot.instance.as_ref().map(|instance| InstanceInfo {
            identity: instance.identity().clone(),
            pid: instance.pid(),
            uptime: instance.started_at().elapsed(),
        })
    }

    pub async fn pid(&self, identity: &ConfigIdentity) -> Option<u32> {
        self.info(identity).await.and_then(|info| info.pid)
    }

    pub fn log(&self) -> &LogAggregator {
        &self.inner.log
    }

    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    async fn slot_for_start(&self, identity: &ConfigIdentity) -> Option<Arc<Mutex<Slot>>> {
        let mut slots = self.slots.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(slots.entry(identity.clone()).or_default().clone())
    }

    async fn existing_slot(&self, identity: &ConfigIdentity) -> Option<Arc<Mutex<Slot>>> {
        self.slots.lock().await.get(identity).cloned()
    }

    async fn start(self: &Arc<Self>, identity: &ConfigIdentity, config_path: &Path) -> Result<(), StartError> {
        let slot = self.slot_for_start(identity).await.ok_or(StartError::Closed)?;
        let mut slot = slot.lock().await;
        if slot.instance.is_some() {
            tracing::debug!(identity = %identity, "already running");
            return Ok(());
        }
        // Shutdown may have swept this slot while we waited for it.
        if self.closed.load(Ordering::SeqCst) {
            return Err(StartError::Closed);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let binary = self.options.binary(identity.role());
        let weak = Arc::downgrade(self);
        let exited = identity.clone();
        let on_exit = move |record: ExitRecord| {
            if let Some(inner) = weak.upgrade() {
                inner.on_exit(exited, generation, record);
            }
        };

        match process::spawn(
            identity.clone(),
            generation,
            binary,
            config_path,
            self.log.clone(),
            on_exit,
        ) {
            Ok(instance) => {
                let pid = instance.pid();
                slot.instance = Some(instance);
                self.running.send_modify(|set| {
                    set.insert(identity.clone());
                });
                tracing::info!(
                    identity = %identity,
                    pid = pid.unwrap_or(0),
                    program = %binary.program,
                    config = %config_path.display(),
                    "started"
                );
                let _ = self.events.send(SupervisorEvent::Started {
                    identity: identity.clone(),
                    pid,
                });
                Ok(())
            }
            Err(source) => {
                tracing::warn!(identity = %identity, program = %binary.program, error = %source, "spawn failed");
                let _ = self.events.send(SupervisorEvent::StartFailed {
                    identity: identity.clone(),
                    error: source.to_string(),
                });
                Err(StartError::Spawn {
                    identity: identity.clone(),
                    source,
                })
            }
        }
    }

    async fn stop(&self, identity: &ConfigIdentity) -> Result<(), StopError> {
        let Some(slot) = self.existing_slot(identity).await else {
            return Ok(());
        };
        let mut slot = slot.lock().await;
        let Some(instance) = slot.instance.take() else {
            return Ok(());
        };

        tracing::info!(identity = %identity, pid = instance.pid().unwrap_or(0), "stopping");
        let result = instance.terminate(self.options.grace_period).await;
        self.running.send_modify(|set| {
            set.remove(identity);
        });
        drop(slot);

        match result {
            Ok(record) => {
                tracing::debug!(identity = %identity, code = ?record.code, "stopped");
                Ok(())
            }
            Err(source) => Err(StopError::Monitor {
                identity: identity.clone(),
                source,
            }),
        }
    }

    fn on_exit(self: Arc<Self>, identity: ConfigIdentity, generation: u64, record: ExitRecord) {
        if !record.requested {
            tracing::warn!(identity = %identity, code = ?record.code, "process exited on its own");
        }
        let _ = self.events.send(SupervisorEvent::Exited {
            identity: identity.clone(),
            code: record.code,
            requested: record.requested,
        });
        tokio::spawn(async move {
            self.reap(&identity, generation).await;
        });
    }

    // Vacate the slot after an exit nobody asked for. A no-op when `stop` (or a
    // later start) already owns the slot.
    async fn reap(&self, identity: &ConfigIdentity, generation: u64) {
        let Some(slot) = self.existing_slot(identity).await else {
            return;
        };
        let mut slot = slot.lock().await;
        let current = slot.instance.as_ref().map(RunningInstance::generation);
        if current != Some(generation) {
            return;
        }
        slot.instance = None;
        self.running.send_modify(|set| {
            set.remove(identity);
        });
        tracing::debug!(identity = %identity, "removed exited instance");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Instant;

    struct Fixture {
        dir: tempfile::TempDir,
        supervisor: Supervisor,
    }

    impl Fixture {
        fn new(grace: Duration) -> Self {
            let options = SupervisorOptions {
                client: BinarySpec::new("/bin/sh"),
                server: BinarySpec::new("/bin/sh"),
                grace_period: grace,
                max_log_bytes: 64 * 1024,
            };
            Self {
                dir: tempfile::tempdir().unwrap(),
                supervisor: Supervisor::new(options),
            }
        }

        fn config(&self, role: Role, name: &str, body: &str) -> (ConfigIdentity, PathBuf) {
            let path = self.dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            (ConfigIdentity::new(role, name), path)
        }
    }

    const LONG_RUNNING: &str = "echo up\nexec sleep 30\n";
    const STUBBORN: &str = "trap '' TERM\necho up\nsleep 30\n";

    async fn wait_until<F>(supervisor: &Supervisor, mut predicate: F)
    where
        F: FnMut(&BTreeSet<ConfigIdentity>) -> bool,
    {
        let mut rx = supervisor.running_set();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|set| predicate(set)))
            .await
            .expect("running set did not converge")
            .unwrap();
    }

    fn is_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let fx = Fixture::new(Duration::from_secs(2));
        let (id, path) = fx.config(Role::Client, "a.toml", LONG_RUNNING);

        fx.supervisor.start(&id, &path).await.unwrap();
        let first = fx.supervisor.pid(&id).await;
        fx.supervisor.start(&id, &path).await.unwrap();
        let second = fx.supervisor.pid(&id).await;

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(fx.supervisor.running(), BTreeSet::from([id.clone()]));
        fx.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn stop_then_start_spawns_fresh_process() {
        let fx = Fixture::new(Duration::from_millis(200));
        let (id, path) = fx.config(Role::Server, "slow.toml", STUBBORN);

        fx.supervisor.start(&id, &path).await.unwrap();
        let old = fx.supervisor.pid(&id).await.unwrap();
        fx.supervisor.stop(&id).await.unwrap();
        assert!(!fx.supervisor.is_running(&id));
        assert!(!is_alive(old));

        fx.supervisor.start(&id, &path).await.unwrap();
        let new = fx.supervisor.pid(&id).await.unwrap();
        assert_ne!(old, new);
        assert!(fx.supervisor.is_running(&id));
        fx.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn stop_of_unknown_identity_is_a_noop() {
        let fx = Fixture::new(Duration::from_secs(1));
        let id = ConfigIdentity::new(Role::Client, "never.toml");
        fx.supervisor.stop(&id).await.unwrap();
        assert!(fx.supervisor.running().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn distinct_identities_do_not_block_each_other() {
        let fx = Fixture::new(Duration::from_millis(1500));
        let (slow, slow_path) = fx.config(Role::Client, "slow.toml", STUBBORN);
        let (fast, fast_path) = fx.config(Role::Client, "fast.toml", LONG_RUNNING);
        fx.supervisor.start(&slow, &slow_path).await.unwrap();

        let supervisor = fx.supervisor.clone();
        let stopping = tokio::spawn(async move { supervisor.stop(&slow).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        fx.supervisor.start(&fast, &fast_path).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(fx.supervisor.is_running(&fast));

        stopping.await.unwrap().unwrap();
        fx.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn concurrent_starts_both_complete() {
        let fx = Fixture::new(Duration::from_secs(1));
        let (a, a_path) = fx.config(Role::Client, "a.toml", LONG_RUNNING);
        let (b, b_path) = fx.config(Role::Server, "b.toml", LONG_RUNNING);

        let (ra, rb) = tokio::join!(
            fx.supervisor.start(&a, &a_path),
            fx.supervisor.start(&b, &b_path)
        );
        ra.unwrap();
        rb.unwrap();
        assert_eq!(fx.supervisor.running(), BTreeSet::from([a, b]));
        fx.supervisor.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_start_and_stop_of_one_identity_never_overlap() {
        let fx = Fixture::new(Duration::from_secs(1));
        let (id, path) = fx.config(Role::Client, "race.toml", LONG_RUNNING);
        let mut events = fx.supervisor.events();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let supervisor = fx.supervisor.clone();
            let id = id.clone();
            let path = path.clone();
            tasks.push(tokio::spawn(async move {
                if i % 3 == 0 {
                    supervisor.stop(&id).await.map_err(|err| err.to_string())
                } else {
                    supervisor.start(&id, &path).await.map_err(|err| err.to_string())
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        fx.supervisor.shutdown_all().await;
        assert!(fx.supervisor.running().is_empty());

        // Each identity holds at most one process, so its events alternate.
        let mut live = 0;
        let mut started = 0;
        let mut exited = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                SupervisorEvent::Started { .. } => {
                    started += 1;
                    live += 1;
                }
                SupervisorEvent::Exited { .. } => {
                    exited += 1;
                    live -= 1;
                }
                SupervisorEvent::StartFailed { error, .. } => panic!("start failed: {}", error),
            }
            assert!((0..=1).contains(&live), "{} live instances of {}", live, id);
        }
        assert!(started > 0);
        assert_eq!(started, exited);
    }

    #[tokio::test]
    async fn self_exit_is_reaped_and_output_kept() {
        let fx = Fixture::new(Duration::from_secs(1));
        let (id, path) = fx.config(Role::Client, "bad.toml", "echo 'config error: bad token'\nexit 1\n");
        let mut events = fx.supervisor.events();

        fx.supervisor.start(&id, &path).await.unwrap();
        wait_until(&fx.supervisor, |set| !set.contains(&id)).await;

        assert!(fx.supervisor.log().text().contains("config error: bad token"));
        assert!(matches!(events.recv().await.unwrap(), SupervisorEvent::Started { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            SupervisorEvent::Exited {
                identity: id.clone(),
                code: Some(1),
                requested: false
            }
        );

        // The slot is free again.
        fx.supervisor.start(&id, &path).await.unwrap();
        fx.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn spawn_failure_leaves_running_set_unchanged() {
        let options = SupervisorOptions {
            client: BinarySpec::new("/nonexistent/frpc"),
            ..SupervisorOptions::default()
        };
        let supervisor = Supervisor::new(options);
        let id = ConfigIdentity::new(Role::Client, "x.toml");
        let err = supervisor.start(&id, Path::new("/tmp/x.toml")).await.unwrap_err();
        assert!(matches!(err, StartError::Spawn { .. }));
        assert!(supervisor.running().is_empty());
        assert_eq!(supervisor.pid(&id).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_all_kills_everything_including_in_flight_starts() {
        let fx = Fixture::new(Duration::from_millis(300));
        let mut configs = Vec::new();
        for i in 0..8 {
            let body = if i % 2 == 0 { LONG_RUNNING } else { STUBBORN };
            configs.push(fx.config(Role::Client, &format!("c{}.toml", i), body));
        }
        for (id, path) in &configs[..4] {
            fx.supervisor.start(id, path).await.unwrap();
        }
        let mut pids = Vec::new();
        for (id, _) in &configs[..4] {
            pids.push(fx.supervisor.pid(id).await.unwrap());
        }

        let mut starts = Vec::new();
        for (id, path) in configs[4..].iter().cloned() {
            let supervisor = fx.supervisor.clone();
            starts.push(tokio::spawn(async move {
                let result = supervisor.start(&id, &path).await;
                (id, result)
            }));
        }
        fx.supervisor.shutdown_all().await;

        for start in starts {
            let (id, result) = start.await.unwrap();
            match result {
                Ok(()) | Err(StartError::Closed) => {}
                Err(err) => panic!("unexpected start error for {}: {}", id, err),
            }
        }
        // A start that won the race registered before shutdown swept it, so it
        // was stopped too; one that lost was refused.
        assert!(fx.supervisor.running().is_empty());
        assert!(fx.supervisor.is_closed());
        for pid in pids {
            assert!(!is_alive(pid), "pid {} survived shutdown", pid);
        }
        let (late, late_path) = fx.config(Role::Server, "late.toml", LONG_RUNNING);
        assert!(matches!(
            fx.supervisor.start(&late, &late_path).await,
            Err(StartError::Closed)
        ));
    }
}
