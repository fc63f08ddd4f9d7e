use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shared::domain::{DeviceId, GroupId};
use storage::{NewGroup, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/portrait.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateGroup {
        name: String,
        album_url: String,
        album_id: String,
        #[arg(long, default_value_t = 5)]
        delay_minutes: i64,
        #[arg(long)]
        seed: Option<i64>,
    },
    RegisterDevice {
        device_id: String,
        #[arg(long)]
        group_id: Option<i64>,
        #[arg(long)]
        owner: Option<String>,
    },
    AssignDevice {
        device_id: String,
        group_id: i64,
    },
    ListGroups,
    ListDevices,
    Logins {
        device_id: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateGroup {
            name,
            album_url,
            album_id,
            delay_minutes,
            seed,
        } => {
            if delay_minutes <= 0 {
                return Err(anyhow!("delay must be at least one minute"));
            }
            let group_id = storage
                .create_group(
                    &NewGroup {
                        name,
                        album_url,
                        album_id,
                        rollover_delay_minutes: delay_minutes,
                        random_seed: seed.unwrap_or_else(rand::random),
                    },
                    Utc::now(),
                )
                .await?;
            println!("created group_id={group_id}");
        }
        Command::RegisterDevice {
            device_id,
            group_id,
            owner,
        } => {
            let device_id = DeviceId::parse(&device_id)?;
            let group_id = group_id.map(GroupId);
            if let Some(group_id) = group_id {
                require_group(&storage, group_id).await?;
            }
            storage
                .register_device(&device_id, group_id, owner.as_deref())
                .await?;
            println!("registered device_id={device_id}");
        }
        Command::AssignDevice {
            device_id,
            group_id,
        } => {
            let device_id = DeviceId::parse(&device_id)?;
            let group_id = GroupId(group_id);
            require_group(&storage, group_id).await?;
            let mut device = storage
                .get_device(&device_id)
                .await?
                .ok_or_else(|| anyhow!("device {device_id} is not registered"))?;
            device.group_id = Some(group_id);
            storage.save_device(&device).await?;
            println!("assigned device_id={device_id} group_id={group_id}");
        }
        Command::ListGroups => {
            for group in storage.list_groups().await? {
                println!(
                    "{}\t{}\talbum={}\tposition={}\tdelay={}m\tlast_rollover={}",
                    group.id,
                    group.name,
                    group.album_id,
                    group.current_asset,
                    group.rollover_delay_minutes,
                    group.last_rollover.to_rfc3339()
                );
            }
        }
        Command::ListDevices => {
            for device in storage.list_devices().await? {
                let group = device
                    .group_id
                    .map_or_else(|| "-".to_string(), |id| id.to_string());
                let last_seen = device
                    .last_seen
                    .map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
                println!(
                    "{}\tgroup={group}\towner={}\tlast_seen={last_seen}",
                    device.id,
                    device.owner.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Logins { device_id, limit } => {
            let device_id = DeviceId::parse(&device_id)?;
            for record in storage.list_login_records(&device_id, limit).await? {
                println!("{}\t{}", record.device_id, record.requested_at.to_rfc3339());
            }
        }
    }

    Ok(())
}

async fn require_group(storage: &Storage, group_id: GroupId) -> Result<()> {
    storage
        .get_group(group_id)
        .await?
        .map(|_| ())
        .ok_or_else(|| anyhow!("group {group_id} does not exist"))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
