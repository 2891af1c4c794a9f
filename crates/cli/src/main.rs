use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "roust")]
#[command(about = "Roust agent wake router", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the router: watch the board and wake agents over their gateways.
    Run {
        /// Config file path (default: ROUST_CONFIG_PATH or ~/.roust/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Authenticate against every configured agent gateway once, so pairing
    /// approvals can be granted before the router runs.
    Pair {
        /// Config file path (default: ROUST_CONFIG_PATH or ~/.roust/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("roust {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Run { config }) => {
            if let Err(e) = run_router(config).await {
                log::error!("router failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Pair { config }) => {
            if let Err(e) = run_pair(config).await {
                log::error!("pairing failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_router(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    log::info!("starting router with config {}", path.display());
    lib::router::run_router(config, &path).await
}

async fn run_pair(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    let state_dir = lib::config::identity_dir(&path);
    let identity = lib::device::DeviceIdentity::load_or_generate(&state_dir.join("device.json"))?;
    let tokens = lib::tokens::DeviceTokenStore::load(state_dir.join("device-tokens.json")).await;

    let roster = lib::config::load_roster(&config, &path)?;
    if roster.is_empty() {
        println!("no agents configured");
        return Ok(());
    }

    let mut failures = 0usize;
    for agent in &roster {
        match lib::gateway::pair(agent, &identity, &tokens).await {
            Ok(()) => println!("{}: paired", agent.id),
            Err(e) => {
                failures += 1;
                println!("{}: {}", agent.id, e);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} of {} agents failed to pair", failures, roster.len());
    }
    Ok(())
}
