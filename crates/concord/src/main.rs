use clap::{Parser, Subcommand};
use std::io::BufReader;
use std::path::PathBuf;
use tracing::{error, info};

use concord::{Concord, RootConfig, RootError};

/// Concord: multi-admin device policy resolution
///
/// Reconciles policies set by several administrators into one enforced
/// value per policy, and tells every admin whether theirs won.
#[derive(Parser, Debug)]
#[command(name = "concord", version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the configuration and build the policy registry
    Validate,

    /// List every registered policy type and its resolution mechanism
    Catalog {
        /// Print as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Apply a JSON-lines script of set/clear/remove_admin operations
    Replay {
        /// Script file, one operation per line
        script: PathBuf,

        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("concord=debug,concord_policy=debug,concord_notify=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("concord=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<RootConfig, RootError> {
    match path {
        Some(p) => RootConfig::load(p),
        None => {
            let default_path = RootConfig::default_config_path();
            RootConfig::load(&default_path)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), RootError> {
    match cli.command {
        Commands::Validate => cmd_validate(cli.config.as_ref()),
        Commands::Catalog { json } => cmd_catalog(cli.config.as_ref(), json),
        Commands::Replay { script, pretty } => cmd_replay(cli.config.as_ref(), &script, pretty),
    }
}

fn cmd_validate(config_path: Option<&PathBuf>) -> Result<(), RootError> {
    let config = load_config(config_path)?;
    let concord = Concord::from_config(config)?;
    println!("Configuration OK.");
    println!(
        "  Policy types: {}",
        concord.engine().registry().len()
    );
    println!(
        "  Custom:       {}",
        concord.config().policies.len()
    );
    println!(
        "  Unsupported:  {}",
        concord.config().capabilities.unsupported.len()
    );
    concord.shutdown();
    Ok(())
}

fn cmd_catalog(config_path: Option<&PathBuf>, json: bool) -> Result<(), RootError> {
    let config = load_config(config_path)?;
    let concord = Concord::from_config(config)?;
    let definitions = concord.engine().registry().definitions();

    if json {
        println!("{}", serde_json::to_string_pretty(&definitions)?);
    } else {
        println!("{:<48} {:<8} MECHANISM", "POLICY", "SCOPE");
        for def in definitions {
            let scope = match def.scope {
                concord_core::PolicyScopeKind::Global => "global",
                concord_core::PolicyScopeKind::Local => "local",
            };
            println!("{:<48} {:<8} {}", def.identifier, scope, def.mechanism);
        }
    }
    concord.shutdown();
    Ok(())
}

fn cmd_replay(
    config_path: Option<&PathBuf>,
    script: &PathBuf,
    pretty: bool,
) -> Result<(), RootError> {
    let config = load_config(config_path)?;
    let concord = Concord::from_config(config)?;

    info!(script = %script.display(), "replaying operations");
    let file = std::fs::File::open(script)?;
    let report = concord.replay(BufReader::new(file))?;
    concord.shutdown();

    let output = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", output);
    Ok(())
}
