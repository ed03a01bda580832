//! Scope Runner
//!
//! Hosts the three roles of a scopes deployment from one binary: the
//! registry, a scope process (started on demand by the registry) and a
//! query client.
//!
//! Run with:
//!   cargo run --bin scope-runner -- --base-dir /tmp/scopes registry --scope news --scope weather
//!   cargo run --bin scope-runner -- --base-dir /tmp/scopes query news "rust"

mod demo_scope;
mod launcher;

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use scopes_mw::registry::DEFAULT_START_TIMEOUT_MS;
use scopes_mw::signals::Signal;
use scopes_mw::{
    AbstractObject, Disconnector, FinishReason, Hints, LocalRegistry, Middleware, MiddlewareConfig,
    ReplyObject, ScopeMetadata, ScopeState, SignalMask,
};

use demo_scope::DemoScope;
use launcher::ProcessLauncher;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "scope-runner")]
#[command(about = "Scopes registry, scope host and query client")]
struct Args {
    /// Directory holding the pub/ and priv/ endpoint directories
    #[arg(short, long)]
    base_dir: Option<PathBuf>,

    /// Identity of the registry
    #[arg(short, long, default_value = "Registry")]
    registry: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the registry; scopes are started when first located
    Registry {
        /// Scope ids to register
        #[arg(short, long = "scope")]
        scopes: Vec<String>,

        /// Milliseconds a launched scope has to report ready; keep it
        /// below the locate timeout of the clients
        #[arg(long, default_value_t = DEFAULT_START_TIMEOUT_MS)]
        start_timeout: u64,
    },
    /// Serve a single scope until terminated
    Scope {
        /// Scope id, also used as the server name
        id: String,
    },
    /// Print the scopes known to the registry
    List,
    /// Send a query to a scope and print the results
    Query {
        scope: String,
        query: String,
        /// Seconds to wait before cancelling
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
}

impl Args {
    fn config(&self) -> MiddlewareConfig {
        let config = match &self.base_dir {
            Some(dir) => MiddlewareConfig::with_base_dir(dir),
            None => MiddlewareConfig::default(),
        };
        config.with_registry(self.registry.as_str())
    }

    /// Global options a launched scope process needs to find us
    fn forwarded_options(&self) -> Vec<OsString> {
        let mut options = Vec::new();
        if let Some(dir) = &self.base_dir {
            options.push("--base-dir".into());
            options.push(dir.clone().into_os_string());
        }
        options.push("--registry".into());
        options.push(self.registry.clone().into());
        options.push("--log-level".into());
        options.push(self.log_level.clone().into());
        options
    }
}

fn main() -> CliResult<()> {
    // Before any middleware thread exists, so that all of them inherit it.
    let mask = SignalMask::block_termination()?;

    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &args.command {
        Command::Registry { scopes, start_timeout } => {
            run_registry(&args, scopes, Duration::from_millis(*start_timeout), &mask)
        }
        Command::Scope { id } => run_scope(&args, id, &mask),
        Command::List => run_list(&args),
        Command::Query { scope, query, timeout } => run_query(&args, scope, query, Duration::from_secs(*timeout)),
    }
}

fn wait_for_termination(mask: &SignalMask) -> CliResult<Signal> {
    loop {
        match mask.wait()? {
            Signal::SIGCHLD => debug!("Child process changed state"),
            signal => return Ok(signal),
        }
    }
}

fn run_registry(args: &Args, scopes: &[String], start_timeout: Duration, mask: &SignalMask) -> CliResult<()> {
    let mw = Middleware::new(args.registry.as_str(), args.config())?;
    mw.start()?;

    if let Ok(locate_timeout) = u64::try_from(mw.locate_timeout()) {
        if start_timeout >= Duration::from_millis(locate_timeout) {
            warn!(
                "Start timeout {:?} is not below the locate timeout {}ms; clients will time out first",
                start_timeout, locate_timeout
            );
        }
    }
    let launcher = Arc::new(ProcessLauncher::new(std::env::current_exe()?, args.forwarded_options()));
    let registry = Arc::new(LocalRegistry::new(launcher.clone(), start_timeout));
    launcher.set_registry(Arc::downgrade(&registry));

    registry.set_publisher(mw.create_publisher(&args.registry)?);
    for scope_id in scopes {
        let proxy = mw.create_scope_proxy(scope_id)?;
        let metadata = ScopeMetadata::new(scope_id.as_str(), proxy.address().clone())
            .with_display_name(scope_id.as_str())
            .with_description(format!("Echo scope {}", scope_id));
        registry.add_local_scope(metadata)?;
    }
    mw.add_registry_object(&args.registry, registry.clone())?;
    mw.add_state_receiver_object(&args.registry, registry.clone())?;
    info!("Registry {} serving {} scope(s)", args.registry, scopes.len());

    let signal = wait_for_termination(mask)?;
    info!("Received {:?}, shutting down", signal);

    registry.disconnect();
    launcher.kill_all();
    mw.stop();
    mw.wait_for_shutdown();
    Ok(())
}

fn run_scope(args: &Args, scope_id: &str, mask: &SignalMask) -> CliResult<()> {
    let mw = Middleware::new(scope_id, args.config())?;
    mw.start()?;
    mw.add_scope_object(scope_id, Arc::new(DemoScope::new(scope_id)), Duration::ZERO)?;

    let state = mw.create_state_receiver_proxy(&args.registry)?;
    state.push_state(scope_id, ScopeState::ScopeReady)?;
    info!("Scope {} ready", scope_id);

    let signal = wait_for_termination(mask)?;
    info!("Scope {} received {:?}", scope_id, signal);
    state.push_state(scope_id, ScopeState::ScopeStopping)?;

    mw.stop();
    mw.wait_for_shutdown();
    Ok(())
}

fn client(args: &Args) -> CliResult<Arc<Middleware>> {
    let mw = Middleware::new(format!("client-{}", std::process::id()), args.config())?;
    mw.start()?;
    Ok(mw)
}

fn run_list(args: &Args) -> CliResult<()> {
    let mw = client(args)?;
    let registry = mw.registry_proxy()?.ok_or("no registry configured")?;
    for (scope_id, metadata) in registry.list()? {
        println!("{:<20} {}", scope_id, metadata.display_name);
    }
    mw.stop();
    mw.wait_for_shutdown();
    Ok(())
}

enum ReplyEvent {
    Result(Bytes),
    Finished(FinishReason),
}

/// Forwards reply callbacks to the main thread
struct ChannelReply {
    events: Sender<ReplyEvent>,
}

impl AbstractObject for ChannelReply {
    fn set_disconnect_function(&self, _disconnector: Disconnector) {}
}

impl ReplyObject for ChannelReply {
    fn push(&self, payload: Bytes) -> scopes_mw::Result<()> {
        let _ = self.events.send(ReplyEvent::Result(payload));
        Ok(())
    }

    fn finished(&self, reason: FinishReason) -> scopes_mw::Result<()> {
        let _ = self.events.send(ReplyEvent::Finished(reason));
        Ok(())
    }
}

fn run_query(args: &Args, scope_id: &str, query: &str, timeout: Duration) -> CliResult<()> {
    let mw = client(args)?;
    let registry = mw.registry_proxy()?.ok_or("no registry configured")?;
    let scope = registry.locate(scope_id)?;

    let (tx, rx) = mpsc::channel();
    let reply = mw.add_reply_object(Arc::new(ChannelReply { events: tx }))?;
    let ctrl = scope.create_query(query, &Hints::new(), &reply)?;

    let deadline = Instant::now() + timeout;
    loop {
        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(ReplyEvent::Result(payload)) => println!("{}", String::from_utf8_lossy(&payload)),
            Ok(ReplyEvent::Finished(reason)) => {
                info!("Query finished: {:?}", reason);
                break;
            }
            Err(_) => {
                warn!("No reply within {:?}, cancelling", timeout);
                ctrl.cancel()?;
                break;
            }
        }
    }
    ctrl.destroy()?;

    mw.stop();
    mw.wait_for_shutdown();
    Ok(())
}
