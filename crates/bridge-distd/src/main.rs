//! A daemon that hands out Tor bridges over HTTP and email.
//!
//! `bridge-distd` loads a catalogue of bridges, partitions it across
//! its request fronts with a keyed hash (so that no front can leak
//! another front's bridges), and answers each requester with a small,
//! slowly rotating slice decided by the engines in `bridge-hashring`
//! and `bridge-dist`.
//!
//! # Command-line interface
//!
//! Run `bridge-distd help` for the full listing.  The two subcommands
//! are `run`, which starts the configured fronts, and
//! `dump-assignments`, which loads the catalogue once and writes which
//! bridge ended up in which ring.
//!
//! # Configuration
//!
//! Configuration is TOML, `./bridge-distd.toml` by default; every
//! option has a default, so the daemon starts without one.  See the
//! example in [`cfg`].

// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_arti_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_arti_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)] // arti/-/merge_requests/588/#note_2812945
#![allow(clippy::result_large_err)] // temporary workaround for arti#587
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
#![allow(clippy::needless_lifetimes)] // See arti#1765
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod catalogue;
mod cfg;
mod mail;
mod web;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

use bridge_dist::{
    uniform_mapper, Database, EmailDistributor, IntervalSchedule, IpDistributor, ProxyCategory,
    StoreTracker,
};
use bridge_hashring::{
    AnswerParameters, BridgeSplitter, HmacKey, SharedBridgeHolder, UnallocatedHolder,
};

use cfg::DistdConfig;

/// Length of the master key, in bytes.
const MASTER_KEY_LEN: usize = 32;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "bridge-distd", version, about = "Hand out Tor bridges over HTTP and email")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "bridge-distd.toml")]
    config: PathBuf,

    /// What to do.
    #[command(subcommand)]
    command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the configured fronts.
    Run,
    /// Load the catalogue once and write the ring assignment of every
    /// bridge.
    DumpAssignments {
        /// Write the dump here instead of standard output.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DistdConfig::load(&cli.config)?;
    setup_logging(&config.log_filter);

    match cli.command {
        Command::Run => run(config),
        Command::DumpAssignments { output } => dump_assignments(&config, output.as_deref()),
    }
}

/// Initialize tracing; `RUST_LOG` overrides the configured filter.
fn setup_logging(filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load the master key, creating it on first start.
fn master_key(path: &Path) -> anyhow::Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(key) if key.len() == MASTER_KEY_LEN => Ok(key),
        Ok(_) => anyhow::bail!(
            "master key file {:?} is not {} bytes; refusing to guess",
            path,
            MASTER_KEY_LEN
        ),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let key: [u8; MASTER_KEY_LEN] = rand::random();
            write_secret(path, &key)
                .with_context(|| format!("creating master key {:?}", path))?;
            info!("created new master key at {:?}", path);
            Ok(key.to_vec())
        }
        Err(e) => Err(e).with_context(|| format!("reading master key {:?}", path)),
    }
}

/// Write `data` to a fresh file that only the daemon's user can read.
fn write_secret(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut f = options.open(path)?;
    f.write_all(data)
}

/// Turn configured `[port, count]` pairs into answer parameters.
fn answer_params(need_ports: &[(u16, usize)]) -> AnswerParameters {
    need_ports
        .iter()
        .fold(AnswerParameters::new(), |params, (port, count)| {
            params.require_port(*port, *count)
        })
}

/// The assembled distribution engine.
struct App {
    /// The top-level splitter over every enabled channel.
    splitter: Arc<BridgeSplitter>,
    /// The IP-based distributor, if the HTTP front is enabled.
    ip_dist: Option<Arc<RwLock<IpDistributor>>>,
    /// The email-based distributor, if the email front is enabled.
    email_dist: Option<Arc<RwLock<EmailDistributor>>>,
}

/// Build the distributors and the splitter from the configuration.
fn build_app(config: &DistdConfig) -> anyhow::Result<App> {
    let key = master_key(&config.master_key_file)?;
    let db = Arc::new(Mutex::new(
        Database::open(&config.db_file)
            .with_context(|| format!("opening state database {:?}", config.db_file))?,
    ));

    let mut splitter = BridgeSplitter::new(HmacKey::from_master(&key, "Splitter-Key"));
    splitter.set_tracker(Box::new(StoreTracker::new(Arc::clone(&db))));

    let mut ip_dist = None;
    if config.https.enabled && config.https.share > 0 {
        let mut categories = Vec::new();
        for path in &config.proxy_list_files {
            match ProxyCategory::from_file(path) {
                Ok(cat) => categories.push(cat),
                Err(e) => warn!("skipping proxy list {:?}: {}", path, e),
            }
        }
        let mut dist = IpDistributor::new(
            &HmacKey::from_master(&key, "HTTPS-IP-Dist-Key"),
            uniform_mapper(),
            config.n_ip_clusters,
            categories,
            answer_params(&config.https.need_ports),
        );
        dist.prepopulate();
        let dist = Arc::new(RwLock::new(dist));
        let holder: SharedBridgeHolder = dist.clone();
        splitter.add_ring(holder, "https", config.https.share);
        ip_dist = Some(dist);
    }

    let mut email_dist = None;
    if config.email.enabled && config.email.share > 0 {
        let mut dist = EmailDistributor::new(
            &HmacKey::from_master(&key, "Email-Dist-Key"),
            config.email.complete_domain_map(),
            config.email.parsed_domain_rules()?,
            config.email.parsed_whitelist(),
            answer_params(&config.email.need_ports),
            Arc::clone(&db),
        );
        dist.prepopulate();
        let dist = Arc::new(RwLock::new(dist));
        let holder: SharedBridgeHolder = dist.clone();
        splitter.add_ring(holder, "email", config.email.share);
        email_dist = Some(dist);
    }

    if config.reserved_share > 0 {
        let holder: SharedBridgeHolder = Arc::new(RwLock::new(UnallocatedHolder::new()));
        splitter.add_ring(holder, "unallocated", config.reserved_share);
    }

    Ok(App {
        splitter: Arc::new(splitter),
        ip_dist,
        email_dist,
    })
}

/// Run the daemon until a front fails.
fn run(config: DistdConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_run(config))
}

/// The daemon proper.
async fn async_run(config: DistdConfig) -> anyhow::Result<()> {
    let app = build_app(&config)?;

    if let Err(e) = catalogue::reload_once(&app.splitter, &config.catalogue_file) {
        warn!("initial catalogue load failed; starting empty: {:#}", e);
    }

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    {
        let splitter = Arc::clone(&app.splitter);
        let path = config.catalogue_file.clone();
        let interval = config.reload_interval;
        tasks.spawn(async move {
            catalogue::reload_task(splitter, path, interval).await;
            Ok(())
        });
    }

    if let Some(dist) = app.ip_dist.clone() {
        let listener = TcpListener::bind(config.https.listen)
            .await
            .with_context(|| format!("binding web front to {}", config.https.listen))?;
        info!("web front listening on {}", config.https.listen);
        let ctx = Arc::new(web::WebContext {
            dist,
            schedule: IntervalSchedule::new(config.https.rotation),
            n_bridges: config.https.n_bridges_per_answer,
            use_forwarded_header: config.https.use_forwarded_header,
        });
        tasks.spawn(web::serve(listener, ctx));
    }

    if let Some(dist) = app.email_dist.clone() {
        let listener = TcpListener::bind(config.email.listen)
            .await
            .with_context(|| format!("binding email front to {}", config.email.listen))?;
        info!("email front listening on {}", config.email.listen);
        let ctx = Arc::new(mail::MailContext {
            dist: Arc::clone(&dist),
            schedule: IntervalSchedule::new(config.email.rotation),
            n_bridges: config.email.n_bridges_per_answer,
            local_part: config.email.local_part.clone(),
            from_addr: config.email.from_addr.clone(),
            smtp_from_addr: config.email.smtp_from_addr.clone(),
            smarthost: config.email.smarthost,
        });
        tasks.spawn(mail::serve(listener, ctx));

        // Rate-limit records older than a full window are dead weight;
        // sweep them hourly.
        tasks.spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(3600));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let result = dist
                    .read()
                    .expect("poisoned lock")
                    .clean_database(SystemTime::now());
                if let Err(e) = result {
                    warn!("rate-limit state sweep failed: {}", e);
                }
            }
        });
    }

    // The tasks above run forever; the first one to finish took the
    // daemon down with it.
    match tasks.join_next().await {
        Some(finished) => finished.context("daemon task panicked")?,
        None => anyhow::bail!("no fronts enabled; nothing to do"),
    }
}

/// Load the catalogue once and write the assignment dump.
fn dump_assignments(config: &DistdConfig, output: Option<&Path>) -> anyhow::Result<()> {
    let app = build_app(config)?;
    catalogue::reload_once(&app.splitter, &config.catalogue_file)?;

    match output {
        Some(path) => {
            let mut f = std::fs::File::create(path)
                .with_context(|| format!("creating dump file {:?}", path))?;
            app.splitter.dump_assignments(&mut f)?;
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            app.splitter.dump_assignments(&mut out)?;
        }
    }
    Ok(())
}
