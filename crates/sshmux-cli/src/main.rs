//! sshmux CLI
//!
//! Runs commands on remote hosts over pooled, session-limited SSH connections

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use eyre::WrapErr;
use sshmux_exec::{CommandOutput, ConnectionPool, CredentialIdentity, ExecError, KeySource};
use tracing_subscriber::EnvFilter;

mod config;
mod factory;
mod report;

use config::Config;
use factory::HostDialer;
use report::HostReport;

#[derive(Parser, Debug)]
#[command(name = "sshmux", version)]
#[command(about = "Run commands over pooled SSH connections", long_about = None)]
struct Cli {
    /// Configuration file (defaults to SSHMUX_CONFIG or sshmux.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Hosts and credentials
#[derive(Args, Debug)]
struct Target {
    /// Host to connect to (repeatable)
    #[arg(short = 'H', long = "host", required = true)]
    hosts: Vec<String>,

    /// SSH user
    #[arg(short, long)]
    user: Option<String>,

    /// SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// Private key file
    #[arg(short = 'i', long, conflicts_with = "key_env")]
    key_file: Option<PathBuf>,

    /// Environment variable holding a base64-encoded private key
    #[arg(long)]
    key_env: Option<String>,

    /// Seconds to wait for a host to become reachable
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Maximum concurrent sessions per connection
    #[arg(long)]
    session_limit: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command on every host
    Run {
        #[command(flatten)]
        target: Target,

        /// Feed this file to the command's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,

        /// Print a JSON report instead of raw output
        #[arg(long)]
        json: bool,

        /// Command to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Check that every host accepts a connection
    Check {
        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .wrap_err_with(|| format!("failed to load {}", path.display()))?,
        None => Config::load_default()?,
    };
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    init_tracing(&config);
    tracing::debug!(?config, "configuration loaded");

    let code = match cli.command {
        Commands::Run {
            target,
            stdin,
            json,
            command,
        } => run(&mut config, &target, stdin, json, &command.join(" ")).await?,
        Commands::Check { target } => check(&mut config, &target).await?,
    };

    Ok(ExitCode::from(code))
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Apply command-line overrides and build the pool plus one identity per host
fn prepare(
    config: &mut Config,
    target: &Target,
) -> Result<(Arc<ConnectionPool>, Vec<CredentialIdentity>)> {
    if let Some(limit) = target.session_limit {
        config.pool.session_limit = limit;
    }
    if let Some(secs) = target.deadline_secs {
        config.dial.deadline_secs = secs;
    }

    let key_source = if let Some(path) = &target.key_file {
        Some(KeySource::Path(path.clone()))
    } else if let Some(var) = &target.key_env {
        Some(KeySource::Env(var.clone()))
    } else {
        config.defaults.ssh_key.clone().map(KeySource::Path)
    };

    let key = match key_source {
        Some(source) => source.resolve().wrap_err("failed to load private key")?,
        None if target.hosts.iter().all(|h| h == "localhost" || h == "127.0.0.1") => {
            String::new()
        }
        None => {
            eyre::bail!("no private key given (use --key-file, --key-env or defaults.ssh_key)")
        }
    };

    let user = target.user.as_deref().unwrap_or(&config.defaults.user);
    let port = target.port.unwrap_or(config.defaults.port);
    let identities = target
        .hosts
        .iter()
        .map(|host| CredentialIdentity::new(key.clone(), user, host.as_str()).with_port(port))
        .collect();

    let pool_config = config.pool_config();
    tracing::debug!(hosts = target.hosts.len(), ?pool_config, "preparing connection pool");
    let pool = ConnectionPool::new(Arc::new(HostDialer::new()), pool_config)?;
    Ok((Arc::new(pool), identities))
}

async fn run(
    config: &mut Config,
    target: &Target,
    stdin: Option<PathBuf>,
    json: bool,
    command: &str,
) -> Result<u8> {
    let (pool, identities) = prepare(config, target)?;

    let input = match stdin {
        Some(path) => Some(Arc::new(
            tokio::fs::read(&path)
                .await
                .wrap_err_with(|| format!("failed to read {}", path.display()))?,
        )),
        None => None,
    };

    let tasks: Vec<_> = identities
        .iter()
        .cloned()
        .map(|identity| {
            let pool = Arc::clone(&pool);
            let input = input.clone();
            let command = command.to_string();
            tokio::spawn(async move {
                match input {
                    Some(data) => {
                        let reader = std::io::Cursor::new(data.to_vec());
                        pool.run_with_stdin(&identity, &command, reader).await
                    }
                    None => pool.run(&identity, &command).await,
                }
            })
        })
        .collect();

    let mut results: Vec<Result<CommandOutput, ExecError>> = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await?);
    }

    if json {
        let reports: Vec<_> = identities
            .iter()
            .zip(&results)
            .map(|(identity, result)| HostReport::new(identity.host(), result))
            .collect();
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_results(&identities, &results)?;
    }

    pool.shutdown().await;
    Ok(report::run_exit_code(&results))
}

fn print_results(
    identities: &[CredentialIdentity],
    results: &[Result<CommandOutput, ExecError>],
) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr().lock();
    let many = identities.len() > 1;

    for (identity, result) in identities.iter().zip(results) {
        if many {
            writeln!(stdout, "==> {} <==", identity.host())?;
        }
        let (out, err) = match result {
            Ok(output) => (output.stdout.as_slice(), output.stderr.as_slice()),
            Err(e) => e.partial_output().unwrap_or_default(),
        };
        stdout.write_all(out)?;
        stderr.write_all(err)?;
        if let Err(e) = result {
            writeln!(stderr, "sshmux: {}: {e}", identity.host())?;
        }
    }

    stdout.flush()?;
    Ok(())
}

async fn check(config: &mut Config, target: &Target) -> Result<u8> {
    let (pool, identities) = prepare(config, target)?;

    let tasks: Vec<_> = identities
        .iter()
        .cloned()
        .map(|identity| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.check(&identity).await })
        })
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for (identity, task) in identities.iter().zip(tasks) {
        let result = task.await?;
        match &result {
            Ok(()) => println!("{}: ok", identity.host()),
            Err(e) if e.is_connect_timeout() => println!("{}: unreachable ({e})", identity.host()),
            Err(e) => println!("{}: error ({e})", identity.host()),
        }
        results.push(result);
    }

    pool.shutdown().await;
    Ok(report::check_exit_code(&results))
}
