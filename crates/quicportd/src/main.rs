//! quicportd, the daemon entry point.
//!
//! Responsibilities are deliberately thin: initialize logging, load the
//! administrator configuration named by `QP_CONFIG_PATH`, then hand off to
//! the supervisor (and the admin API when enabled). Exit codes: 0 clean
//! shutdown, 1 fatal init error, 2 policy violation at startup.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{error, info, warn};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use qp_cluster::{AdminContext, AdminServer, Supervisor, SupervisorOptions, WorkerEntry};
use qp_config::{ActiveConfig, CallerOptions, ConfigObject, PolicyError, ENV_CONFIG_PATH};

const EXIT_CLEAN: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_POLICY: u8 = 2;

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let logs_dir = PathBuf::from("logs");
    let guard = match std::fs::create_dir_all(&logs_dir) {
        Ok(()) => {
            let stamp = Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
            let appender =
                tracing_appender::rolling::never(&logs_dir, format!("quicportd-{stamp}.log"));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter))
                .init();
            None
        }
    };
    guard
}

fn load_config() -> Result<ConfigObject, PolicyError> {
    let admin_path = std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from);
    match &admin_path {
        Some(path) => info!(
            target: "qp::daemon",
            path = %path.display(),
            "loading administrator configuration"
        ),
        None => info!(target: "qp::daemon", "no {ENV_CONFIG_PATH}; running on defaults"),
    }
    ConfigObject::build(admin_path.as_deref().map(Path::new), &CallerOptions::default())
}

/// Default worker body: park until the supervisor says otherwise. Embedders
/// build their own daemons on `qp-cluster` with a real entry.
fn idle_worker_entry() -> WorkerEntry {
    Arc::new(|worker_id: u32| -> i32 {
        let term = Arc::new(AtomicBool::new(false));
        if signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term)).is_err() {
            return 1;
        }
        info!(target: "qp::daemon::worker", worker = worker_id, "worker online");
        while !term.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(200));
        }
        info!(target: "qp::daemon::worker", worker = worker_id, "worker exiting");
        0
    })
}

fn run() -> u8 {
    let config = match load_config() {
        Ok(config) => config,
        Err(err @ PolicyError::PolicyViolation(_)) => {
            error!(target: "qp::daemon", error = %err, "startup policy violation");
            return EXIT_POLICY;
        }
        Err(err) => {
            error!(target: "qp::daemon", error = %err, "configuration load failed");
            return EXIT_FATAL;
        }
    };

    if config.cluster.workers == 0 {
        warn!(
            target: "qp::daemon",
            "cluster.workers is 0; nothing to supervise"
        );
        return EXIT_CLEAN;
    }

    let mut options = SupervisorOptions::new(config.cluster.workers, idle_worker_entry());
    options.pid_file = config.cluster.pid_file.clone();
    options.graceful_timeout = config.cluster.graceful_timeout;
    options.restart_policy = config.cluster.restart_policy.clone();

    let mut supervisor = match Supervisor::new(options) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!(target: "qp::daemon", error = %err, "supervisor setup failed");
            return EXIT_FATAL;
        }
    };

    let admin_api = config.admin_api.clone();
    let active = Arc::new(ActiveConfig::new(Arc::new(config)));
    let admin_server = if admin_api.enabled {
        let ctx = AdminContext {
            active: Arc::clone(&active),
            roster: Arc::clone(&supervisor.roster),
            drain: Arc::clone(&supervisor.drain),
        };
        match AdminServer::start(&admin_api, ctx) {
            Ok(server) => Some(server),
            Err(err) => {
                error!(target: "qp::daemon", error = %err, "admin api startup failed");
                return EXIT_FATAL;
            }
        }
    } else {
        None
    };

    let code = match supervisor.run() {
        Ok(code) => code as u8,
        Err(err) => {
            error!(target: "qp::daemon", error = %err, "supervisor failed");
            EXIT_FATAL
        }
    };

    if let Some(server) = admin_server {
        server.shutdown();
    }
    code
}

fn main() -> ExitCode {
    let _log_guard = init_logging();
    ExitCode::from(run())
}
