use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{Device, DeviceId, Group, GroupId};

const MEMORY_URL: &str = "sqlite::memory:";

/// Persistence seam used by the coordinator loop. Every method is one
/// durable unit: batch writes either land completely or not at all.
#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<Device>>;
    async fn list_groups(&self) -> Result<Vec<Group>>;
    async fn get_group(&self, group_id: GroupId) -> Result<Option<Group>>;
    async fn save_groups(&self, groups: &[Group]) -> Result<()>;
    /// Serves a batch of login beacons: appends an audit record and refreshes
    /// `last_seen` for every known device that already belongs to a group.
    /// Unknown and ungrouped devices are skipped.
    async fn record_logins(&self, device_ids: &[DeviceId], at: DateTime<Utc>)
        -> Result<Vec<LoginGrant>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginGrant {
    pub device_id: DeviceId,
    pub group_id: GroupId,
}

#[derive(Debug, Clone)]
pub struct NewGroup {
    pub name: String,
    pub album_url: String,
    pub album_id: String,
    pub rollover_delay_minutes: i64,
    pub random_seed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRecord {
    pub device_id: DeviceId,
    pub requested_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every in-memory connection is its own database.
        let max_connections = if database_url.starts_with(MEMORY_URL) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_group(&self, new: &NewGroup, created_at: DateTime<Utc>) -> Result<GroupId> {
        let rec = sqlx::query(
            "INSERT INTO groups (name, album_url, album_id, current_asset, last_rollover, last_skip_request, random_seed, rollover_delay_minutes)
             VALUES (?, ?, ?, 0, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&new.name)
        .bind(&new.album_url)
        .bind(&new.album_id)
        .bind(created_at)
        .bind(created_at)
        .bind(new.random_seed)
        .bind(new.rollover_delay_minutes)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert group")?;
        Ok(GroupId(rec.get::<i64, _>(0)))
    }

    pub async fn get_group(&self, group_id: GroupId) -> Result<Option<Group>> {
        let row = sqlx::query(
            "SELECT id, name, album_url, album_id, current_asset, last_rollover, last_skip_request, random_seed, rollover_delay_minutes
             FROM groups WHERE id = ?",
        )
        .bind(group_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(group_from_row).transpose()
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let rows = sqlx::query(
            "SELECT id, name, album_url, album_id, current_asset, last_rollover, last_skip_request, random_seed, rollover_delay_minutes
             FROM groups ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(group_from_row).collect()
    }

    pub async fn save_groups(&self, groups: &[Group]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for group in groups {
            let result = sqlx::query(
                "UPDATE groups
                 SET name = ?, album_url = ?, album_id = ?, current_asset = ?, last_rollover = ?,
                     last_skip_request = ?, random_seed = ?, rollover_delay_minutes = ?
                 WHERE id = ?",
            )
            .bind(&group.name)
            .bind(&group.album_url)
            .bind(&group.album_id)
            .bind(group.current_asset)
            .bind(group.last_rollover)
            .bind(group.last_skip_request)
            .bind(group.random_seed)
            .bind(group.rollover_delay_minutes)
            .bind(group.id.0)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to update group {}", group.id))?;
            if result.rows_affected() == 0 {
                // Dropping `tx` rolls back the rows already written.
                bail!("group {} does not exist", group.id);
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn register_device(
        &self,
        device_id: &DeviceId,
        group_id: Option<GroupId>,
        owner: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices (id, group_id, owner) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET group_id = excluded.group_id, owner = excluded.owner",
        )
        .bind(device_id.as_str())
        .bind(group_id.map(|g| g.0))
        .bind(owner)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to register device {device_id}"))?;
        Ok(())
    }

    pub async fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT id, group_id, owner, last_seen FROM devices WHERE id = ?")
            .bind(device_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(device_from_row).transpose()
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query("SELECT id, group_id, owner, last_seen FROM devices ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(device_from_row).collect()
    }

    pub async fn save_device(&self, device: &Device) -> Result<()> {
        let result =
            sqlx::query("UPDATE devices SET group_id = ?, owner = ?, last_seen = ? WHERE id = ?")
                .bind(device.group_id.map(|g| g.0))
                .bind(device.owner.as_deref())
                .bind(device.last_seen)
                .bind(device.id.as_str())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            bail!("device {} does not exist", device.id);
        }
        Ok(())
    }

    pub async fn record_logins(
        &self,
        device_ids: &[DeviceId],
        at: DateTime<Utc>,
    ) -> Result<Vec<LoginGrant>> {
        let mut grants = Vec::with_capacity(device_ids.len());
        let mut tx = self.pool.begin().await?;
        for device_id in device_ids {
            let row = sqlx::query("SELECT group_id FROM devices WHERE id = ?")
                .bind(device_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                debug!(%device_id, "login beacon from unknown device");
                continue;
            };
            let Some(group_id) = row.try_get::<Option<i64>, _>(0)? else {
                debug!(%device_id, "device has no group yet");
                continue;
            };

            sqlx::query("INSERT INTO login_requests (device_id, requested_at) VALUES (?, ?)")
                .bind(device_id.as_str())
                .bind(at)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE devices SET last_seen = ? WHERE id = ?")
                .bind(at)
                .bind(device_id.as_str())
                .execute(&mut *tx)
                .await?;
            grants.push(LoginGrant {
                device_id: device_id.clone(),
                group_id: GroupId(group_id),
            });
        }
        tx.commit().await.context("failed to commit login batch")?;
        Ok(grants)
    }

    pub async fn list_login_records(
        &self,
        device_id: &DeviceId,
        limit: u32,
    ) -> Result<Vec<LoginRecord>> {
        let rows = sqlx::query(
            "SELECT device_id, requested_at FROM login_requests
             WHERE device_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(device_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(LoginRecord {
                    device_id: parse_device_id(row.try_get::<String, _>(0)?)?,
                    requested_at: row.try_get(1)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CoordinatorStore for Storage {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        Storage::list_devices(self).await
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        Storage::list_groups(self).await
    }

    async fn get_group(&self, group_id: GroupId) -> Result<Option<Group>> {
        Storage::get_group(self, group_id).await
    }

    async fn save_groups(&self, groups: &[Group]) -> Result<()> {
        Storage::save_groups(self, groups).await
    }

    async fn record_logins(
        &self,
        device_ids: &[DeviceId],
        at: DateTime<Utc>,
    ) -> Result<Vec<LoginGrant>> {
        Storage::record_logins(self, device_ids, at).await
    }
}

fn group_from_row(row: &SqliteRow) -> Result<Group> {
    Ok(Group {
        id: GroupId(row.try_get("id")?),
        name: row.try_get("name")?,
        album_url: row.try_get("album_url")?,
        album_id: row.try_get("album_id")?,
        current_asset: row.try_get("current_asset")?,
        last_rollover: row.try_get("last_rollover")?,
        last_skip_request: row.try_get("last_skip_request")?,
        random_seed: row.try_get("random_seed")?,
        rollover_delay_minutes: row.try_get("rollover_delay_minutes")?,
    })
}

fn device_from_row(row: &SqliteRow) -> Result<Device> {
    Ok(Device {
        id: parse_device_id(row.try_get("id")?)?,
        group_id: row.try_get::<Option<i64>, _>("group_id")?.map(GroupId),
        owner: row.try_get("owner")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn parse_device_id(raw: String) -> Result<DeviceId> {
    DeviceId::parse(&raw).map_err(|error| anyhow!("stored device id is unusable: {error}"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with(MEMORY_URL) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
