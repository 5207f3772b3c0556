use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::guard::{rejection_envelope, EndpointPolicy, Verdict};
use turnstile::ratelimit::Rate;

#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about = "Per-caller request admission control")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fire concurrent requests for one caller and resource and report each verdict
    Simulate {
        /// Caller identity
        #[arg(long, default_value = "127.0.0.1")]
        caller: String,

        /// Resource name
        #[arg(long, default_value = "/api/v1")]
        resource: String,

        /// Permits per second; overrides the configured endpoint policy, 0 disables limiting
        #[arg(long)]
        qps: Option<f64>,

        /// Number of concurrent requests
        #[arg(long, default_value_t = 10)]
        requests: usize,

        /// Wait timeout in milliseconds; overrides the configured value
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Load and validate a configuration file, then print the effective values
    CheckConfig {
        /// Path to the YAML configuration file to check
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::CheckConfig { path } => {
            let config = TurnstileConfig::load(Some(&path))?;
            info!(path = %path, "Configuration is valid");
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Command::Simulate {
            caller,
            resource,
            qps,
            requests,
            timeout_ms,
        } => {
            let mut config = TurnstileConfig::load(cli.config.as_deref())?;
            if let Some(timeout_ms) = timeout_ms {
                config.admission.wait_timeout_ms = timeout_ms;
            }
            let mut policy = config.endpoint_policy(&resource)?;
            if let Some(qps) = qps {
                policy.qps = Rate::from_qps(qps)?;
            }
            simulate(&config, caller, resource, policy, requests).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn simulate(
    config: &TurnstileConfig,
    caller: String,
    resource: String,
    policy: EndpointPolicy,
    requests: usize,
) -> anyhow::Result<()> {
    let (registry, guard) = turnstile::build(config)?;
    let sweeper = registry.spawn_sweeper(config.sweep_interval());

    info!(
        caller = %caller,
        resource = %resource,
        rate = %policy.qps,
        requests = requests,
        "Starting simulation"
    );

    let caller = Arc::new(caller);
    let resource = Arc::new(resource);
    let started = Instant::now();

    let tasks = (0..requests).map(move |i| {
        let guard = guard.clone();
        let caller = Arc::clone(&caller);
        let resource = Arc::clone(&resource);
        tokio::spawn(async move {
            let verdict = guard.check_async(&caller, &resource, &policy).await;
            (i, verdict, started.elapsed())
        })
    });

    let mut admitted = 0usize;
    for joined in futures::future::join_all(tasks).await {
        let (i, verdict, elapsed) = joined?;
        match verdict {
            Ok(Verdict::Proceed) => {
                admitted += 1;
                println!("#{:<4} admitted   {:>6}ms", i, elapsed.as_millis());
            }
            Ok(Verdict::Notify(notice)) => {
                println!("#{:<4} notified   {:>6}ms {}", i, elapsed.as_millis(), notice.to_json()?);
            }
            Err(e) => match rejection_envelope(&e) {
                Some(envelope) => println!(
                    "#{:<4} rejected   {:>6}ms {}",
                    i,
                    elapsed.as_millis(),
                    serde_json::to_string(&envelope)?
                ),
                None => warn!(error = %e, "Guarded call failed"),
            },
        }
    }

    let stats = registry.stats();
    info!(
        admitted = admitted,
        rejected = requests - admitted,
        elapsed_ms = started.elapsed().as_millis() as u64,
        limiters_created = stats.limiters_created,
        "Simulation finished"
    );

    sweeper.abort();
    Ok(())
}
