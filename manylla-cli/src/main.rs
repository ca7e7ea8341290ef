use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use manylla_core::invite::split_url;
use manylla_core::platform::{get_data_dir, get_default_config_path};
use manylla_core::share::ShareOptions;
use manylla_core::storage::FileStorage;
use manylla_core::transport::HttpTransport;
use manylla_core::{
    generate_recovery_phrase, OsSecureRandom, Profile, SyncConfig, SyncEngine, SyncPhase,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Manylla CLI - zero-knowledge profile sync from the terminal
#[derive(Parser)]
#[command(name = "manylla")]
#[command(about = "Sync and share Manylla profiles through a relay", long_about = None)]
struct Cli {
    /// Directory holding the local key-value store
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Sync configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Relay base URL, overriding the configuration
    #[arg(long, global = true)]
    relay: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh recovery phrase
    Phrase,

    /// Enable sync on this device
    Enable {
        /// Existing recovery phrase to join; a new one is generated if omitted
        #[arg(long)]
        phrase: Option<String>,
    },

    /// Disable sync and forget the recovery phrase
    Disable,

    /// Show sync status
    Status,

    /// Push a profile JSON file
    Push {
        /// Profile file
        file: PathBuf,
    },

    /// Pull and merge the relay copy into the local profile
    Pull {
        /// Also write the merged profile to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Create an invite link for another device
    Invite {
        /// Base URL the link points to
        #[arg(long, default_value = "https://manylla.com/qual")]
        base_url: String,
    },

    /// Join a sync group from an invite link
    Join {
        /// Invite link (`https://.../sync/XXXX-XXXX#phrase`)
        url: String,
    },

    /// Temporary share links
    Share {
        #[command(subcommand)]
        command: ShareCommands,
    },
}

#[derive(Subcommand)]
enum ShareCommands {
    /// Upload a filtered profile and print its link
    Create {
        /// Profile file
        file: PathBuf,

        /// Category ids to include (repeatable); all categories if omitted
        #[arg(long = "category")]
        categories: Vec<String>,

        /// Include the profile photo
        #[arg(long)]
        include_photo: bool,

        /// Days until the link expires
        #[arg(long, default_value_t = 7)]
        days: u32,

        /// Audience preset, e.g. education or medical
        #[arg(long, default_value = "custom")]
        recipient: String,

        /// Origin the link points to
        #[arg(long, default_value = "https://manylla.com/qual")]
        origin: String,
    },

    /// Fetch and decrypt a share link
    Open {
        /// Share link (`https://.../share/XXXX-XXXX#key`)
        url: String,
    },
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let path = cli.config.clone().unwrap_or_else(get_default_config_path);
    let mut config = if path.exists() {
        SyncConfig::load(&path).with_context(|| format!("loading {}", path.display()))?
    } else {
        SyncConfig::default()
    };
    if let Some(relay) = &cli.relay {
        config.relay_url = relay.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_engine(cli: &Cli) -> Result<SyncEngine> {
    let config = load_config(cli)?;
    let data_dir = cli.data_dir.clone().unwrap_or_else(get_data_dir);
    let storage = FileStorage::new(data_dir.join("store.json"));
    let transport = HttpTransport::new(&config.relay_url)?;

    Ok(SyncEngine::new(
        config,
        Arc::new(storage),
        Arc::new(transport),
        Arc::new(OsSecureRandom),
    )?)
}

/// Build the engine and restore a previous session, failing if sync is off.
async fn enabled_engine(cli: &Cli) -> Result<SyncEngine> {
    let engine = build_engine(cli)?;
    if !engine.resume().await? {
        bail!("sync is not enabled; run `manylla enable` first");
    }
    engine.stop_polling();
    Ok(engine)
}

fn read_profile(path: &Path) -> Result<Profile> {
    let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing profile {}", path.display()))
}

fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("writing {}", path.display()))
}

fn describe(phase: SyncPhase) -> &'static str {
    match phase {
        SyncPhase::Disabled => "disabled",
        SyncPhase::Enabling => "enabling",
        SyncPhase::Enabled(_) => "enabled",
    }
}

async fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Phrase => {
            println!("{}", generate_recovery_phrase(&OsSecureRandom).as_str());
        }
        Commands::Enable { phrase } => {
            let engine = build_engine(cli)?;
            let (phrase, is_new) = match phrase {
                Some(phrase) => (phrase.clone(), false),
                None => (generate_recovery_phrase(&OsSecureRandom).as_str().to_string(), true),
            };
            engine.enable(&phrase, is_new).await?;
            engine.stop_polling();
            if is_new {
                println!("Recovery phrase (keep it safe): {}", phrase);
            }
            println!("Sync enabled: {}", engine.sync_id().await.unwrap_or_default());
        }
        Commands::Disable => {
            build_engine(cli)?.disable().await?;
            println!("Sync disabled");
        }
        Commands::Status => {
            let engine = build_engine(cli)?;
            if engine.resume().await? {
                engine.stop_polling();
            }
            let status = engine.status().await;
            println!("State:       {}", describe(status.phase));
            println!("Sync id:     {}", status.sync_id.as_deref().unwrap_or("-"));
            println!("Relay:       {}", engine.config().relay_url);
            println!("Online:      {}", status.online);
            println!("Last pull:   {}", status.last_pull.map_or("-".to_string(), |t| t.to_string()));
            println!("Queued ops:  {}", status.queued_operations);
            println!("Device:      {}", engine.device().await.device_id);
        }
        Commands::Push { file } => {
            let profile = read_profile(file)?;
            let engine = enabled_engine(cli).await?;
            engine.save_local_profile(&profile).await?;
            let timestamp = engine.push_now(profile).await?;
            println!("Pushed at {}", timestamp);
        }
        Commands::Pull { out } => {
            let engine = enabled_engine(cli).await?;
            match engine.pull().await? {
                Some(profile) => {
                    info!("Merged {} entries", profile.live_entries().count());
                    if let Some(out) = out {
                        write_json(out, &profile)?;
                    }
                    println!("Pulled profile {}", profile.id());
                }
                None => println!("No new data on the relay"),
            }
        }
        Commands::Invite { base_url } => {
            let engine = enabled_engine(cli).await?;
            println!("{}", engine.create_invite(base_url).await?);
        }
        Commands::Join { url } => {
            let engine = build_engine(cli)?;
            let (path, fragment) = split_url(url);
            engine.join_from_invite(path, fragment).await?;
            engine.stop_polling();
            println!("Joined sync group {}", engine.sync_id().await.unwrap_or_default());
        }
        Commands::Share { command } => match command {
            ShareCommands::Create {
                file,
                categories,
                include_photo,
                days,
                recipient,
                origin,
            } => {
                let profile = read_profile(file)?;
                let options = ShareOptions {
                    selected_categories: categories.clone(),
                    include_photo: *include_photo,
                    expiration_days: *days,
                    recipient_type: recipient.clone(),
                };
                let engine = build_engine(cli)?;
                println!("{}", engine.create_share(&profile, &options, origin).await?);
            }
            ShareCommands::Open { url } => {
                let engine = build_engine(cli)?;
                let (path, fragment) = split_url(url);
                let payload = engine.open_share(path, fragment).await?;
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    run(&cli).await
}
