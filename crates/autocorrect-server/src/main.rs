//! autocorrect-server - HTTP front end for the suggestion process.
//!
//! Spawns the suggestion process, waits for it to warm up, then serves
//! `POST /api/autocorrect` until SIGINT or SIGTERM.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use autocorrect::transport::{ServerConfig, serve};
use autocorrect::{
    CommandSpawner, LookupService, Readiness, RestartPolicy, ServiceConfig, VersionInfo,
};

#[derive(Debug, Parser)]
#[command(name = "autocorrect-server")]
#[command(about = "Serve spelling suggestions from a long-lived suggestion process", long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Suggestion process executable
    #[arg(long, env = "AUTOCORRECT_PROGRAM", default_value = "python")]
    program: String,

    /// Arguments for the suggestion process (space separated)
    #[arg(
        long = "arg",
        env = "AUTOCORRECT_ARGS",
        value_delimiter = ' ',
        default_value = "processor.py"
    )]
    args: Vec<String>,

    /// Working directory for the suggestion process
    #[arg(long, env = "AUTOCORRECT_WORKDIR", default_value = "python")]
    workdir: String,

    /// Warm-up grace period, or probe timeout when --ready-probe is set
    #[arg(long, env = "AUTOCORRECT_WARMUP_SECS", default_value = "13")]
    warmup_secs: u64,

    /// Word to look up as a readiness probe instead of waiting out the grace period
    #[arg(long, env = "AUTOCORRECT_READY_PROBE")]
    ready_probe: Option<String>,

    /// Per-request response timeout; 0 disables it
    #[arg(long, env = "AUTOCORRECT_RESPONSE_TIMEOUT_SECS", default_value = "30")]
    response_timeout_secs: u64,

    /// Consecutive restarts allowed before the process is declared defunct
    #[arg(long, env = "AUTOCORRECT_MAX_RESTARTS", default_value = "5")]
    max_restarts: u32,
}

impl Args {
    fn readiness(&self) -> Readiness {
        let warmup = Duration::from_secs(self.warmup_secs);
        match self.ready_probe {
            Some(ref word) => Readiness::Probe {
                word: word.clone(),
                timeout: warmup,
            },
            None => Readiness::Grace(warmup),
        }
    }

    fn service_config(&self) -> ServiceConfig {
        let spawner = CommandSpawner::new(&self.program)
            .with_args(self.args.iter().filter(|a| !a.is_empty()).cloned())
            .with_current_dir(&self.workdir);

        let response_timeout =
            (self.response_timeout_secs > 0).then(|| Duration::from_secs(self.response_timeout_secs));

        ServiceConfig::new(Arc::new(spawner))
            .with_readiness(self.readiness())
            .with_response_timeout(response_timeout)
            .with_restart_policy(RestartPolicy {
                max_restarts: self.max_restarts,
                ..RestartPolicy::default()
            })
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Base level from `AUTOCORRECT_LOG`, defaulting to info.
fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("warn" | "warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

/// Directives used when `RUST_LOG` is unset. Process stderr lines are
/// logged at warn under `autocorrect::process` and stay visible at every
/// base level except error.
fn default_filter(level: &str) -> String {
    let process = if level == "error" { "error" } else { "warn" };
    [
        format!("autocorrect={level}"),
        format!("autocorrect::lookup={level}"),
        format!("autocorrect::process={process}"),
        format!("autocorrect_server={level}"),
    ]
    .join(",")
}

fn init_tracing() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => {
            let level = base_level(std::env::var("AUTOCORRECT_LOG").ok().as_deref());
            EnvFilter::new(default_filter(level))
        }
    };

    let output = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        _ => fmt::layer().with_writer(std::io::stderr).boxed(),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    info!("autocorrect {}", autocorrect::AUTOCORRECT_VERSION);
    info!(
        program = %args.program,
        args = ?args.args,
        workdir = %args.workdir,
        readiness = ?args.readiness(),
        "Starting suggestion process"
    );

    let service = Arc::new(
        LookupService::new(args.service_config())
            .with_version(VersionInfo::new().with_program(args.program.clone())),
    );

    // The server only accepts requests once the process has warmed up.
    if let Err(e) = service.start().await {
        error!(error = %e, "Suggestion process failed to start");
        service.shutdown().await;
        process::exit(1);
    }

    serve(args.server_config(), service).await
}
