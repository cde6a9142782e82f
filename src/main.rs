use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpbinding::{
    BindingCapabilities, BindingManager, BindingStore, Config, FreeAddressSet, IaType, Result,
};

#[derive(Parser)]
#[command(name = "dhcpbinding")]
#[command(author, version, about = "DHCP address-binding lifecycle manager", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// IA type managed by this instance (v4, na, ta, pd).
    #[arg(short, long, default_value = "v4")]
    ia_type: IaType,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ListBindings,
    Reap,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Arc::new(Config::load_or_create(&cli.config).await?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting binding manager with config: {:?}", cli.config);
            let store = Arc::new(BindingStore::open(&config.bindings_file).await?);
            let pool = Arc::new(free_addresses(&config, &store, cli.ia_type).await);
            info!("{} free addresses in configured pools", pool.len());

            let manager = Arc::new(BindingManager::new(
                BindingCapabilities::new(cli.ia_type),
                Arc::clone(&config) as _,
                Arc::clone(&store) as _,
                pool,
            ));
            manager.start().await?;

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping binding manager...");
            manager.stop().await;
            if let Err(error) = store.save().await {
                tracing::error!("Failed to save bindings on shutdown: {}", error);
            }
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(config.as_ref())?);
            Ok(())
        }
        Commands::ListBindings => {
            let store = BindingStore::open(&config.bindings_file).await?;
            let identities = store.list_identity_assocs().await;

            if identities.is_empty() {
                println!("No bindings.");
            } else {
                println!(
                    "{:<40} {:<10} {:<40} {:<24} {:<10}",
                    "Address", "State", "Identity", "Valid Until", "Remaining"
                );
                println!("{}", "-".repeat(128));

                for ia in identities {
                    for binding in &ia.addresses {
                        let valid_until = binding
                            .valid_end_time
                            .map(|valid_end| valid_end.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                            .unwrap_or_else(|| "-".to_string());
                        let remaining = binding.remaining_seconds();
                        let remaining_str = match binding.valid_end_time {
                            None => "-".to_string(),
                            Some(_) if remaining > 0 => format!("{}s", remaining),
                            Some(_) => "expired".to_string(),
                        };

                        println!(
                            "{:<40} {:<10} {:<40} {:<24} {:<10}",
                            binding.ip_address.to_string(),
                            binding.state.to_string(),
                            ia.key(),
                            valid_until,
                            remaining_str
                        );
                    }
                }
            }

            Ok(())
        }
        Commands::Reap => {
            let store = Arc::new(BindingStore::open(&config.bindings_file).await?);
            let pool = Arc::new(free_addresses(&config, &store, cli.ia_type).await);
            let manager = BindingManager::new(
                BindingCapabilities::new(cli.ia_type),
                Arc::clone(&config) as _,
                Arc::clone(&store) as _,
                pool,
            );

            let summary = manager.expire_bindings().await;
            store.save().await?;
            println!(
                "Expired {} of {} binding(s) ({} skipped, {} failed).",
                summary.expired, summary.found, summary.skipped, summary.failed
            );
            Ok(())
        }
    }
}

/// Seeds the free set with every address of the IA type's family in the
/// configured pools that the store does not already hold.
async fn free_addresses(config: &Config, store: &BindingStore, ia_type: IaType) -> FreeAddressSet {
    let held: HashSet<_> = store.addresses().await.into_iter().collect();
    let v4 = ia_type == IaType::V4;

    FreeAddressSet::new(
        config
            .pools
            .iter()
            .filter(|pool| pool.range_start.is_ipv4() == v4)
            .flat_map(|pool| pool.addresses())
            .filter(|address| !held.contains(address)),
    )
}
