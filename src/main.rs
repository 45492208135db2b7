use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use rime::prelude::*;

#[derive(Parser)]
#[command(name = "rime", about = "Forensic analysis of mobile device backups")]
struct Cli {
    /// Directory containing device backups.
    #[arg(long, default_value = ".")]
    base_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List recognised devices.
    Devices,
    /// List events on the given devices, oldest first.
    Events {
        device_ids: Vec<String>,
        /// Inclusive RFC 3339 lower bound, e.g. 2023-01-01T00:00:00Z.
        #[arg(long)]
        start: Option<chrono::DateTime<chrono::Utc>>,
        /// Inclusive RFC 3339 upper bound.
        #[arg(long)]
        end: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// List contacts on the given devices, merged across providers.
    Contacts {
        device_ids: Vec<String>,
    },
    /// Produce a subset of a device and wait for it to complete.
    Subset {
        old_device_id: String,
        new_device_id: String,
        #[arg(long)]
        start: Option<chrono::DateTime<chrono::Utc>>,
        #[arg(long)]
        end: Option<chrono::DateTime<chrono::Utc>>,
        /// Replace PII in the subset's databases.
        #[arg(long)]
        anonymise: bool,
    },
    /// Decrypt an encrypted device.
    Decrypt {
        device_id: String,
        passphrase: String,
    },
    /// Watch the devices directory and report changes.
    Watch,
}

#[tokio::main]
async fn main() -> EmptyRes {
    env_logger::Builder::new()
        .filter(None, LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let rime = rime::create(Config::new(&cli.base_path))?;
    let mut cache = DeviceCache::new();

    match cli.command {
        Command::Devices => {
            for device_id in rime.device_ids() {
                println!("{device_id}");
            }
        }
        Command::Events { device_ids, start, end } => {
            let filter = EventsFilter {
                timestamp_start: start,
                timestamp_end: end,
                ..Default::default()
            };
            let result = rime.events(&mut cache, &device_ids, &filter)?;
            for event in &result.events {
                let device_id = event.device_id().unwrap_or("?");
                println!("{} {} {} {:?}", event.timestamp(), device_id,
                         event.provider_name(), event.local_id());
            }
            log::info!("{} events from {} devices", result.events.len(), result.device_ids.len());
        }
        Command::Contacts { device_ids } => {
            let result = rime.contacts(&mut cache, &device_ids, &ContactsFilter::empty())?;
            for merged in &result.merged_contacts {
                let members = merged.contacts.iter()
                    .map(GlobalContactId::make_global_id_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("{} {} [{members}]",
                         merged.name.as_ref().map(|n| n.full_name()).unwrap_or_default(),
                         merged.phone.as_deref().unwrap_or("-"));
            }
        }
        Command::Subset { old_device_id, new_device_id, start, end, anonymise } => {
            let filter = EventsFilter {
                timestamp_start: start,
                timestamp_end: end,
                ..Default::default()
            };
            let mut completions = rime.broker().subscribe_subset_complete();
            rime.create_subset(
                vec![SubsetTarget { old_device_id, new_device_id }],
                filter, ContactsFilter::empty(), anonymise)?;

            let outcome = completions.recv().await?;
            if outcome.success {
                log::info!("Subset complete: {:?}", outcome.device_ids);
            } else {
                bail!("Subset failed ({:?}): {}", outcome.error_code,
                      outcome.error_message.unwrap_or_default());
            }
        }
        Command::Decrypt { device_id, passphrase } => {
            rime.decrypt_device(&mut cache, &device_id, &passphrase)?;
            log::info!("Decrypted {device_id}");
        }
        Command::Watch => {
            let mut updates = rime.broker().subscribe_device_list_updated();
            tokio::spawn(rime.clone().watch_devices(Duration::from_secs(2)));
            loop {
                updates.recv().await?;
                println!("devices: {}", rime.device_ids().join(", "));
            }
        }
    }

    Ok(())
}
