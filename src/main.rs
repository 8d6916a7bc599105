use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::unistd::{daemon, Uid, User};
use tracing::{info, Level};

use warden::config::{self, CONF_FILE, OPT_LOGUPDATE, OPT_NOACTION, OPT_VERBOSE};
use warden::parent::{block_signals, Parent};
use warden::privsep::{socket_rlimit, spawn_children};

#[derive(Parser)]
#[command(name = "wardend", about = "privilege-separated relay daemon")]
struct Args {
    /// Stay in the foreground and log to stderr.
    #[arg(short = 'd')]
    debug: bool,

    /// Parse the configuration, report, and exit.
    #[arg(short = 'n')]
    noaction: bool,

    /// Increase verbosity; repeat for trace output.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file.
    #[arg(short = 'f', value_name = "file", default_value = CONF_FILE)]
    conffile: PathBuf,

    /// Define a configuration macro, name=value.
    #[arg(short = 'D', value_name = "name=value")]
    define: Vec<String>,
}

fn parse_macro(arg: &str) -> Result<(String, String)> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => bail!("could not parse macro definition {arg}"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match (args.debug, args.verbose) {
        (_, v) if v > 1 => Level::TRACE,
        (_, 1) => Level::DEBUG,
        (true, _) => Level::DEBUG,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let macros = args
        .define
        .iter()
        .map(|d| parse_macro(d))
        .collect::<Result<Vec<_>>>()?;

    let mut opts = 0;
    if args.verbose > 0 {
        opts |= OPT_VERBOSE;
    }
    if args.noaction {
        opts |= OPT_NOACTION;
    }
    if args.debug {
        opts |= OPT_LOGUPDATE;
    }

    let mut cfg = config::load(&args.conffile, &macros, opts)?;
    if args.noaction {
        // also verify the key files are present and readable
        cfg.load_keys()?;
        cfg.purge_keys();
        eprintln!("configuration OK");
        return Ok(());
    }

    if !Uid::effective().is_root() {
        bail!("need root privileges");
    }
    let user = User::from_name(&cfg.user)
        .context("getpwnam")?
        .with_context(|| format!("unknown user {}", cfg.user))?;

    socket_rlimit()?;

    if !args.debug {
        daemon(true, false).context("failed to daemonize")?;
    }
    info!("startup");

    if let Some(pidfile) = &cfg.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("pidfile {}", pidfile.display()))?;
    }

    // mask before forking so children never see a default disposition
    let mask = block_signals()?;
    let peers = spawn_children(&cfg, &user)?;

    let parent = Parent::new(cfg, args.conffile, macros, peers, &mask)?;
    parent.run()
}
