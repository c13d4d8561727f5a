//! Operator CLI for the device registry.
//!
//! ```bash
//! plantctl add --name basil --location kitchen --topic-name basil
//! plantctl set-status --device-id 2 --inactive
//! plantctl set-range --device-id 2 --min 30 --max 70
//! plantctl list --active-only
//! plantctl seed
//! ```

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};

use moisture_ingest::{
    admin::{self, NewDevice, RangeRequest, StatusChange},
    bootstrap,
    config::{self, DatabaseConfig},
    db::{self, models::Device, Store},
    logging,
    topic::DeviceTopic,
};

/// Manage the devices the moisture consumer ingests from.
#[derive(Parser, Debug)]
#[command(name = "plantctl")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a new device
    Add {
        /// Display name of the plant
        #[arg(long)]
        name: String,

        /// `<location>` in plant-monitoring/<location>/<topic-name>/telemetry
        #[arg(long)]
        location: String,

        /// `<topic-name>` in plant-monitoring/<location>/<topic-name>/telemetry
        #[arg(long)]
        topic_name: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Activate or deactivate a device
    #[command(group(ArgGroup::new("status").required(true).args(["active", "inactive"])))]
    SetStatus {
        #[arg(long)]
        device_id: i32,

        #[arg(long)]
        active: bool,

        #[arg(long)]
        inactive: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Set the recommended moisture range of a device, in percent
    SetRange {
        #[arg(long)]
        device_id: i32,

        #[arg(long)]
        min: i32,

        #[arg(long)]
        max: i32,
    },

    /// List registered devices
    List {
        #[arg(long)]
        active_only: bool,
    },

    /// Reconcile DEVICE_SEEDS into the store
    Seed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(config::log_format_from_env()?);

    match cli.command {
        Command::Add {
            name,
            location,
            topic_name,
            yes,
        } => {
            // Validate before opening a connection.
            let device = NewDevice::new(&name, &location, &topic_name)?;
            println!("Adding device with the following details:");
            println!("  Name:  {}", device.name);
            println!("  Topic: {}", device.topic);
            if !yes && !confirm("Do you want to continue?")? {
                println!("Aborted.");
                return Ok(());
            }

            let store = open_store().await?;
            let row = admin::add_device(&store, &device).await?;
            println!("Added device {} ({}).", row.id, row.name);
            remind_reload();
        }

        Command::SetStatus {
            device_id,
            active,
            inactive: _,
            yes,
        } => {
            let store = open_store().await?;
            let current = admin::get_device(&store, device_id).await?;
            if current.is_active == active {
                println!(
                    "Warning: device {device_id} ({}) is already {}.",
                    current.name,
                    status_label(active)
                );
                return Ok(());
            }

            println!(
                "Setting device {device_id} ({}) to {}.",
                current.name,
                status_label(active)
            );
            if !yes && !confirm("Do you want to continue?")? {
                println!("Aborted.");
                return Ok(());
            }

            match admin::set_status(&store, device_id, active).await? {
                StatusChange::Changed(row) => {
                    println!("Device {} is now {}.", row.id, status_label(row.is_active));
                    remind_reload();
                }
                StatusChange::Unchanged(row) => {
                    println!(
                        "Warning: device {} is already {}.",
                        row.id,
                        status_label(row.is_active)
                    );
                }
            }
        }

        Command::SetRange { device_id, min, max } => {
            let range = RangeRequest::new(min, max)?;
            let store = open_store().await?;
            let row = admin::set_range(&store, device_id, range).await?;
            println!(
                "Recommended range for device {} set to {}%..{}%.",
                row.device_id, row.min_perc, row.max_perc
            );
        }

        Command::List { active_only } => {
            let store = open_store().await?;
            let devices = store.query_devices(active_only).await?;
            if devices.is_empty() {
                println!("No devices registered.");
            } else {
                println!(
                    "{:>4}  {:<24} {:<20} {:<24} {}",
                    "ID", "NAME", "LOCATION", "TOPIC NAME", "STATUS"
                );
            }
            for device in &devices {
                println!("{}", format_device(device));
            }
        }

        Command::Seed => {
            let seeds = config::device_seeds_from_env()?;
            if seeds.is_empty() {
                println!("DEVICE_SEEDS is empty; nothing to do.");
                return Ok(());
            }
            let store = open_store().await?;
            let inserted = bootstrap::reconcile_seeds(&store, &seeds).await?;
            println!("{inserted} of {} seed devices inserted.", seeds.len());
            if inserted > 0 {
                remind_reload();
            }
        }
    }

    Ok(())
}

async fn open_store() -> Result<Store> {
    let config = DatabaseConfig::from_env()?;
    let store = Store::new(db::create_pool(&config).await?);
    store
        .ensure_schema()
        .await
        .context("schema creation failed")?;
    Ok(store)
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N]: ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn remind_reload() {
    println!("Send SIGHUP to the moisture consumer to apply the change.");
}

fn status_label(active: bool) -> &'static str {
    if active {
        "active"
    } else {
        "inactive"
    }
}

fn format_device(device: &Device) -> String {
    let status = match device.deactivated_at {
        Some(at) => format!("inactive since {}", at.to_rfc3339()),
        None => status_label(device.is_active).to_owned(),
    };
    // Topics are validated on insert; fall back to the raw string regardless.
    let (location, topic_name) = match DeviceTopic::parse(&device.topic) {
        Ok(topic) => (topic.location().to_owned(), topic.name().to_owned()),
        Err(_) => ("?".to_owned(), device.topic.clone()),
    };
    format!(
        "{:>4}  {:<24} {:<20} {:<24} {}",
        device.id, device.name, location, topic_name, status
    )
}
