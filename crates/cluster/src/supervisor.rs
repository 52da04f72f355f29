//! The supervision loop.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{error, info, warn};

use qp_config::RestartPolicy;

/// Set in every child before the entry runs.
pub const ENV_WORKER_ID: &str = "QP_WORKER_ID";

/// Cadence of the supervision loop between signal checks.
const TICK: Duration = Duration::from_millis(100);

pub type WorkerEntry = Arc<dyn Fn(u32) -> i32 + Send + Sync>;
pub type WorkerHook = Arc<dyn Fn(u32, i32) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker {worker_id}: {detail}")]
    WorkerSpawnFailed { worker_id: u32, detail: String },

    #[error("pid file: {0}")]
    PidFile(String),

    #[error("invalid supervisor options: {0}")]
    InvalidOptions(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPolicy {
    Other,
    Batch,
    Idle,
    Fifo(i32),
    RoundRobin(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitSpec {
    pub resource: nix::sys::resource::Resource,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Clone)]
pub struct SupervisorOptions {
    pub workers: u32,
    pub worker_entry: WorkerEntry,
    pub on_start: Option<WorkerHook>,
    pub on_exit: Option<WorkerHook>,
    pub pid_file: Option<PathBuf>,
    pub restart_policy: RestartPolicy,
    pub graceful_timeout: Duration,
    pub scheduler_policy: Option<SchedulerPolicy>,
    pub niceness: Option<i32>,
    pub cpu_affinity: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub cgroup_path: Option<PathBuf>,
    pub rlimits: Vec<RlimitSpec>,
}

impl SupervisorOptions {
    pub fn new(workers: u32, worker_entry: WorkerEntry) -> Self {
        Self {
            workers,
            worker_entry,
            on_start: None,
            on_exit: None,
            pid_file: None,
            restart_policy: RestartPolicy::default(),
            graceful_timeout: Duration::from_secs(30),
            scheduler_policy: None,
            niceness: None,
            cpu_affinity: false,
            uid: None,
            gid: None,
            cgroup_path: None,
            rlimits: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), SupervisorError> {
        if self.workers == 0 {
            return Err(SupervisorError::InvalidOptions(
                "worker count must be positive".into(),
            ));
        }
        if self.uid.is_some() != self.gid.is_some() && self.uid.is_some() {
            // Dropping uid without gid would keep the original group around.
            return Err(SupervisorError::InvalidOptions(
                "uid requires gid for the privilege drop".into(),
            ));
        }
        Ok(())
    }
}

/// Per-worker sliding restart window: at most `max_restarts` restarts within
/// any `interval`.
#[derive(Debug, Clone)]
pub struct RestartWindow {
    times: VecDeque<Instant>,
    max_restarts: u32,
    interval: Duration,
}

impl RestartWindow {
    pub fn new(policy: &RestartPolicy) -> Self {
        Self {
            times: VecDeque::new(),
            max_restarts: policy.max_restarts,
            interval: policy.interval,
        }
    }

    /// Record a restart attempt at `now`; returns whether it is allowed.
    pub fn allow_restart(&mut self, now: Instant) -> bool {
        while let Some(first) = self.times.front() {
            if now.duration_since(*first) > self.interval {
                self.times.pop_front();
            } else {
                break;
            }
        }
        if self.times.len() >= self.max_restarts as usize {
            return false;
        }
        self.times.push_back(now);
        true
    }

    pub fn restarts_in_window(&self) -> usize {
        self.times.len()
    }
}

/// Bookkeeping for one live child. Owned exclusively by the supervisor.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub pid: i32,
    pub worker_id: u32,
    pub started_at: Instant,
    pub restart_count: u32,
    pub last_restart_at: Option<Instant>,
    pub is_exiting: bool,
}

struct SignalFlags {
    term: Arc<AtomicBool>,
    hup: Arc<AtomicBool>,
    chld: Arc<AtomicBool>,
}

impl SignalFlags {
    fn install() -> std::io::Result<Self> {
        let term = Arc::new(AtomicBool::new(false));
        let hup = Arc::new(AtomicBool::new(false));
        let chld = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
        signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&hup))?;
        signal_hook::flag::register(signal_hook::consts::SIGCHLD, Arc::clone(&chld))?;
        Ok(Self { term, hup, chld })
    }
}

pub struct Supervisor {
    options: SupervisorOptions,
    /// Live children keyed by pid; a slot can briefly have two pids during
    /// a graceful reload (old exiting + fresh).
    workers: HashMap<i32, WorkerRecord>,
    windows: HashMap<u32, RestartWindow>,
    dead_slots: Vec<u32>,
    /// Set by the admin API: TERM workers without respawning.
    pub drain: Arc<AtomicBool>,
    /// Snapshot consumed by the admin API stats operation.
    pub roster: Arc<std::sync::RwLock<Vec<WorkerRecord>>>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Result<Self, SupervisorError> {
        options.validate()?;
        Ok(Self {
            options,
            workers: HashMap::new(),
            windows: HashMap::new(),
            dead_slots: Vec::new(),
            drain: Arc::new(AtomicBool::new(false)),
            roster: Arc::new(std::sync::RwLock::new(Vec::new())),
        })
    }

    /// Run the supervision loop until shutdown. Returns the process exit
    /// code.
    pub fn run(&mut self) -> Result<i32, SupervisorError> {
        if let Some(path) = self.options.pid_file.clone() {
            crate::pidfile::write_pid_file(&path)?;
        }
        let signals = SignalFlags::install().map_err(|err| {
            SupervisorError::InvalidOptions(format!("signal handler setup: {err}"))
        })?;

        for slot in 0..self.options.workers {
            self.spawn_worker(slot, 0)?;
        }
        info!(
            target: "qp::cluster::supervisor",
            workers = self.options.workers,
            "supervisor started"
        );

        loop {
            if signals.term.swap(false, Ordering::AcqRel) {
                self.shutdown();
                break;
            }
            if signals.hup.swap(false, Ordering::AcqRel) {
                self.reload();
            }
            if self.drain.swap(false, Ordering::AcqRel) {
                self.drain_workers();
            }
            if signals.chld.swap(false, Ordering::AcqRel) || !self.workers.is_empty() {
                self.reap();
            }
            self.publish_roster();
            std::thread::sleep(TICK);
        }

        if let Some(path) = &self.options.pid_file {
            crate::pidfile::remove_pid_file(path);
        }
        Ok(0)
    }

    fn spawn_worker(&mut self, slot: u32, restart_count: u32) -> Result<(), SupervisorError> {
        // Safety: the supervisor is single-threaded at fork time; children
        // exec nothing and only run the worker entry.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let record = WorkerRecord {
                    pid: child.as_raw(),
                    worker_id: slot,
                    started_at: Instant::now(),
                    restart_count,
                    last_restart_at: (restart_count > 0).then(Instant::now),
                    is_exiting: false,
                };
                if let Some(hook) = &self.options.on_start {
                    hook(slot, child.as_raw());
                }
                self.workers.insert(child.as_raw(), record);
                info!(
                    target: "qp::cluster::supervisor",
                    worker = slot,
                    pid = child.as_raw(),
                    restart_count,
                    "worker forked"
                );
                Ok(())
            }
            Ok(ForkResult::Child) => {
                let code = match apply_worker_environment(&self.options, slot) {
                    Ok(()) => (self.options.worker_entry)(slot),
                    Err(detail) => {
                        error!(
                            target: "qp::cluster::worker",
                            worker = slot,
                            detail,
                            "worker environment setup failed"
                        );
                        1
                    }
                };
                std::process::exit(code);
            }
            Err(err) => Err(SupervisorError::WorkerSpawnFailed {
                worker_id: slot,
                detail: err.to_string(),
            }),
        }
    }

    fn reap(&mut self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.handle_exit(pid, code);
                }
                Ok(WaitStatus::Signaled(pid, signal, _core)) => {
                    self.handle_exit(pid, 128 + signal as i32);
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(err) => {
                    warn!(target: "qp::cluster::supervisor", error = %err, "waitpid failed");
                    break;
                }
            }
        }
    }

    fn handle_exit(&mut self, pid: Pid, status: i32) {
        let Some(record) = self.workers.remove(&pid.as_raw()) else {
            return;
        };
        if let Some(hook) = &self.options.on_exit {
            hook(record.worker_id, status);
        }

        if record.is_exiting {
            // Intentional (reload, drain or shutdown): never counted as a
            // crash.
            info!(
                target: "qp::cluster::supervisor",
                worker = record.worker_id,
                pid = pid.as_raw(),
                "worker exited as requested"
            );
            return;
        }

        warn!(
            target: "qp::cluster::supervisor",
            worker = record.worker_id,
            pid = pid.as_raw(),
            status,
            "worker exited unexpectedly"
        );
        if !self.options.restart_policy.restart_crashed {
            self.dead_slots.push(record.worker_id);
            return;
        }

        let policy = self.options.restart_policy.clone();
        let window = self
            .windows
            .entry(record.worker_id)
            .or_insert_with(|| RestartWindow::new(&policy));
        if window.allow_restart(Instant::now()) {
            if let Err(err) = self.spawn_worker(record.worker_id, record.restart_count + 1) {
                error!(
                    target: "qp::cluster::supervisor",
                    worker = record.worker_id,
                    error = %err,
                    "respawn failed"
                );
                self.dead_slots.push(record.worker_id);
            }
        } else {
            error!(
                target: "qp::cluster::supervisor",
                worker = record.worker_id,
                max_restarts = policy.max_restarts,
                interval_s = policy.interval.as_secs(),
                "restart budget exhausted; leaving slot dead"
            );
            self.dead_slots.push(record.worker_id);
        }
    }

    /// Graceful reload: TERM the old generation (marked intentional) and
    /// fork a fresh one. Dead slots come back with the new generation.
    fn reload(&mut self) {
        info!(target: "qp::cluster::supervisor", "graceful reload");
        for record in self.workers.values_mut() {
            record.is_exiting = true;
            let _ = kill(Pid::from_raw(record.pid), Signal::SIGTERM);
        }
        self.windows.clear();
        self.dead_slots.clear();
        for slot in 0..self.options.workers {
            if let Err(err) = self.spawn_worker(slot, 0) {
                error!(
                    target: "qp::cluster::supervisor",
                    worker = slot,
                    error = %err,
                    "reload spawn failed"
                );
                self.dead_slots.push(slot);
            }
        }
    }

    /// Drain: TERM everything without respawning.
    fn drain_workers(&mut self) {
        info!(target: "qp::cluster::supervisor", "draining workers");
        for record in self.workers.values_mut() {
            record.is_exiting = true;
            let _ = kill(Pid::from_raw(record.pid), Signal::SIGTERM);
        }
    }

    /// Shutdown: TERM all, wait up to the graceful timeout, KILL stragglers.
    fn shutdown(&mut self) {
        info!(target: "qp::cluster::supervisor", "shutting down");
        for record in self.workers.values_mut() {
            record.is_exiting = true;
            let _ = kill(Pid::from_raw(record.pid), Signal::SIGTERM);
        }

        let deadline = Instant::now() + self.options.graceful_timeout;
        while !self.workers.is_empty() && Instant::now() < deadline {
            self.reap();
            if self.workers.is_empty() {
                break;
            }
            std::thread::sleep(TICK);
        }

        for pid in self.workers.keys().copied().collect::<Vec<_>>() {
            warn!(
                target: "qp::cluster::supervisor",
                pid,
                "worker survived the graceful timeout; killing"
            );
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        self.reap();
        self.publish_roster();
    }

    fn publish_roster(&self) {
        if let Ok(mut roster) = self.roster.write() {
            roster.clear();
            roster.extend(self.workers.values().cloned());
        }
    }
}

/// Applied inside the child, before the user entry runs.
fn apply_worker_environment(options: &SupervisorOptions, slot: u32) -> Result<(), String> {
    std::env::set_var(ENV_WORKER_ID, slot.to_string());

    if let Some(policy) = options.scheduler_policy {
        let (policy_id, priority) = match policy {
            SchedulerPolicy::Other => (libc::SCHED_OTHER, 0),
            SchedulerPolicy::Batch => (libc::SCHED_BATCH, 0),
            SchedulerPolicy::Idle => (libc::SCHED_IDLE, 0),
            SchedulerPolicy::Fifo(priority) => (libc::SCHED_FIFO, priority),
            SchedulerPolicy::RoundRobin(priority) => (libc::SCHED_RR, priority),
        };
        let param = libc::sched_param {
            sched_priority: priority,
        };
        // Safety: plain syscall on our own pid.
        let rc = unsafe { libc::sched_setscheduler(0, policy_id, &param) };
        if rc != 0 {
            return Err(format!(
                "sched_setscheduler: {}",
                std::io::Error::last_os_error()
            ));
        }
    }

    if let Some(niceness) = options.niceness {
        // Safety: setpriority on our own process group entry.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, niceness) };
        if rc != 0 {
            return Err(format!("setpriority: {}", std::io::Error::last_os_error()));
        }
    }

    if options.cpu_affinity {
        let online = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let cpu = slot as usize % online;
        let mut set = nix::sched::CpuSet::new();
        set.set(cpu).map_err(|err| format!("cpuset: {err}"))?;
        nix::sched::sched_setaffinity(Pid::from_raw(0), &set)
            .map_err(|err| format!("sched_setaffinity(cpu {cpu}): {err}"))?;
    }

    for limit in &options.rlimits {
        nix::sys::resource::setrlimit(limit.resource, limit.soft, limit.hard)
            .map_err(|err| format!("setrlimit({:?}): {err}", limit.resource))?;
    }

    if let Some(cgroup) = &options.cgroup_path {
        let procs = cgroup.join("cgroup.procs");
        std::fs::write(&procs, std::process::id().to_string())
            .map_err(|err| format!("join cgroup {}: {err}", procs.display()))?;
    }

    // Group before user: after setuid we may no longer be allowed to setgid.
    if let Some(gid) = options.gid {
        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))
            .map_err(|err| format!("setgid({gid}): {err}"))?;
    }
    if let Some(uid) = options.uid {
        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
            .map_err(|err| format!("setuid({uid}): {err}"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_restarts: u32, interval: Duration) -> RestartPolicy {
        RestartPolicy {
            restart_crashed: true,
            max_restarts,
            interval,
        }
    }

    #[test]
    fn restart_window_enforces_the_budget() {
        let mut window = RestartWindow::new(&policy(2, Duration::from_secs(60)));
        let base = Instant::now();
        assert!(window.allow_restart(base));
        assert!(window.allow_restart(base + Duration::from_secs(10)));
        // Third crash inside the same window: slot stays dead.
        assert!(!window.allow_restart(base + Duration::from_secs(20)));
        assert_eq!(window.restarts_in_window(), 2);
    }

    #[test]
    fn restart_window_slides() {
        let mut window = RestartWindow::new(&policy(2, Duration::from_secs(60)));
        let base = Instant::now();
        assert!(window.allow_restart(base));
        assert!(window.allow_restart(base + Duration::from_secs(1)));
        assert!(!window.allow_restart(base + Duration::from_secs(2)));
        // Both earlier restarts age out of the window.
        assert!(window.allow_restart(base + Duration::from_secs(120)));
    }

    #[test]
    fn each_worker_has_its_own_window() {
        let restart_policy = policy(1, Duration::from_secs(60));
        let mut windows: HashMap<u32, RestartWindow> = HashMap::new();
        let now = Instant::now();
        assert!(windows
            .entry(0)
            .or_insert_with(|| RestartWindow::new(&restart_policy))
            .allow_restart(now));
        assert!(!windows.get_mut(&0).unwrap().allow_restart(now));
        // Worker 3's budget is untouched by worker 0's crashes.
        assert!(windows
            .entry(3)
            .or_insert_with(|| RestartWindow::new(&restart_policy))
            .allow_restart(now));
    }

    #[test]
    fn zero_workers_is_invalid() {
        let entry: WorkerEntry = Arc::new(|_| 0);
        assert!(matches!(
            Supervisor::new(SupervisorOptions::new(0, entry)),
            Err(SupervisorError::InvalidOptions(_))
        ));
    }

    #[test]
    fn uid_without_gid_is_invalid() {
        let entry: WorkerEntry = Arc::new(|_| 0);
        let mut options = SupervisorOptions::new(2, entry);
        options.uid = Some(1000);
        assert!(matches!(
            Supervisor::new(options),
            Err(SupervisorError::InvalidOptions(_))
        ));
    }

    #[test]
    fn affinity_round_robins_over_online_cpus() {
        let online = 8usize;
        let cpus: Vec<usize> = (0..10u32).map(|slot| slot as usize % online).collect();
        assert_eq!(cpus[0], 0);
        assert_eq!(cpus[7], 7);
        assert_eq!(cpus[8], 0);
        assert_eq!(cpus[9], 1);
    }
}
