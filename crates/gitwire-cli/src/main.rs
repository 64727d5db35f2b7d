//! gitwire CLI - talk to git remotes without a local git.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod settings;

/// gitwire - git smart protocol client
#[derive(Parser, Debug)]
#[command(name = "gitwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (default: ./gitwire.yaml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Protocol version to request (1 or 2)
    #[arg(short, long, global = true)]
    protocol: Option<u8>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the refs of a remote
    LsRemote {
        /// Remote URL or path
        url: String,
        /// Only list refs starting with these prefixes
        prefixes: Vec<String>,
    },

    /// Fetch refs into a pack and index
    Fetch {
        /// Remote URL or path
        url: String,
        /// Refs to fetch (default: HEAD)
        refs: Vec<String>,
        /// Objects the local side already has
        #[arg(long = "have")]
        haves: Vec<String>,
        /// Limit history to this many commits
        #[arg(long)]
        depth: Option<u32>,
        /// Partial clone filter, e.g. blob:none
        #[arg(long)]
        filter: Option<String>,
        /// Directory for the pack and index
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Do not print remote progress
        #[arg(short, long)]
        quiet: bool,
    },

    /// Update refs on a remote
    Push {
        /// Remote URL or path
        url: String,
        /// Commands as <old>:<new>:<ref>; an empty id means zero
        #[arg(required = true)]
        commands: Vec<String>,
        /// Pack with the objects the remote needs
        #[arg(long)]
        pack: Option<PathBuf>,
    },

    /// Build an index for a pack file
    IndexPack {
        /// Pack file
        pack: PathBuf,
        /// Index file (default: the pack path with .idx)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Index format version (1 or 2)
        #[arg(long, default_value_t = 2)]
        index_version: u8,
    },

    /// Check a pack against its index
    VerifyPack {
        /// Index file; the pack is expected next to it
        index: PathBuf,
        /// List every object
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show version information
    Version,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gitwire={log_level},gitwire_protocol={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = settings::load(cli.config.as_deref(), cli.protocol).and_then(|config| match cli.command {
        Commands::LsRemote { url, prefixes } => commands::ls_remote(config, &url, &prefixes),
        Commands::Fetch {
            url,
            refs,
            haves,
            depth,
            filter,
            output,
            quiet,
        } => commands::fetch(
            config,
            &commands::FetchArgs {
                url,
                refs,
                haves,
                depth,
                filter,
                output,
                quiet,
            },
        ),
        Commands::Push { url, commands, pack } => commands::push(config, &url, &commands, pack.as_deref()),
        Commands::IndexPack {
            pack,
            output,
            index_version,
        } => commands::index_pack(&pack, output.as_deref(), index_version),
        Commands::VerifyPack { index, verbose } => commands::verify_pack(&index, verbose),
        Commands::Version => {
            println!("gitwire {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    });

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
