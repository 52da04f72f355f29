//! Pre-forking worker supervisor.
//!
//! The master process forks `workers` children, each of which applies its
//! scheduling policy, niceness, CPU affinity, resource limits, cgroup
//! membership and privilege drop before invoking the user entry with its
//! worker id. The master reaps exits (wait-no-hang), applies the restart
//! policy to crashes, reloads gracefully on HUP and shuts down on TERM/INT
//! (TERM all, wait, KILL stragglers, remove the PID file). External callers
//! signal the master found via the PID file; per-child signaling from
//! outside is not supported.
//!
//! OS processes, not tasks: fault isolation and privilege drop only mean
//! something across a process boundary.

pub mod admin;
pub mod pidfile;
pub mod supervisor;

pub use admin::{AdminContext, AdminError, AdminServer, WorkerStat};
pub use pidfile::{read_pid_file, remove_pid_file, signal_master, write_pid_file};
pub use supervisor::{
    RestartWindow, RlimitSpec, SchedulerPolicy, Supervisor, SupervisorError, SupervisorOptions,
    WorkerEntry, WorkerRecord, ENV_WORKER_ID,
};
