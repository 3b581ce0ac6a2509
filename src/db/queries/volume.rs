use crate::db::error::DbError;
use crate::db::tables::{join_snapshot_name, StorageVolume};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{MySql, Pool};
use std::collections::HashMap;

pub async fn get_storage_pool_volume(
    pool: &Pool<MySql>,
    pool_id: i64,
    project: &str,
    vol_type: &str,
    name: &str,
) -> Result<StorageVolume, DbError> {
    sqlx::query_as::<_, StorageVolume>(
        "SELECT * FROM storage_volumes WHERE pool_id = ? AND project = ? AND type = ? AND name = ?",
    )
    .bind(pool_id)
    .bind(project)
    .bind(vol_type)
    .bind(name)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

pub async fn get_storage_pool_volumes_with_type(
    pool: &Pool<MySql>,
    vol_type: &str,
) -> Result<Vec<StorageVolume>, DbError> {
    let volumes = sqlx::query_as::<_, StorageVolume>(
        "SELECT * FROM storage_volumes WHERE type = ? ORDER BY project, name",
    )
    .bind(vol_type)
    .fetch_all(pool)
    .await?;

    Ok(volumes)
}

/// Snapshots of one parent volume in creation order. Creation order and row
/// insertion order coincide, which the migration engine relies on.
pub async fn get_local_storage_pool_volume_snapshots_with_type(
    pool: &Pool<MySql>,
    project: &str,
    parent: &str,
    vol_type: &str,
    pool_id: i64,
) -> Result<Vec<StorageVolume>, DbError> {
    let snapshots = sqlx::query_as::<_, StorageVolume>(
        r#"SELECT * FROM storage_volumes
        WHERE pool_id = ? AND project = ? AND type = ? AND name LIKE CONCAT(?, '/%')
        ORDER BY id"#,
    )
    .bind(pool_id)
    .bind(project)
    .bind(vol_type)
    .bind(parent)
    .fetch_all(pool)
    .await?;

    Ok(snapshots)
}

pub async fn get_storage_volume_snapshot_expiry(
    pool: &Pool<MySql>,
    vol_id: i64,
) -> Result<Option<DateTime<Utc>>, DbError> {
    let expiry = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        "SELECT expiry FROM storage_volumes WHERE id = ?",
    )
    .bind(vol_id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(expiry)
}

/// Next free index for a `%d`-style snapshot naming pattern.
pub async fn get_next_storage_volume_snapshot_index(
    pool: &Pool<MySql>,
    pool_id: i64,
    name: &str,
    vol_type: &str,
    pattern: &str,
) -> Result<u64, DbError> {
    let names = sqlx::query_scalar::<_, String>(
        r#"SELECT name FROM storage_volumes
        WHERE pool_id = ? AND type = ? AND name LIKE CONCAT(?, '/%')"#,
    )
    .bind(pool_id)
    .bind(vol_type)
    .bind(name)
    .fetch_all(pool)
    .await?;

    let snap_names: Vec<&str> = names
        .iter()
        .filter_map(|n| n.split_once('/').map(|(_, s)| s))
        .collect();

    Ok(next_snapshot_index(&snap_names, pattern))
}

/// Pure form of the index scan: the next index is one past the highest index
/// already present among names matching the pattern.
pub fn next_snapshot_index(existing: &[&str], pattern: &str) -> u64 {
    let (prefix, suffix) = match pattern.split_once("%d") {
        Some(parts) => parts,
        None => (pattern, ""),
    };

    let mut next = 0u64;
    for name in existing {
        let Some(rest) = name.strip_prefix(prefix) else {
            continue;
        };
        let Some(digits) = rest.strip_suffix(suffix) else {
            continue;
        };
        if let Ok(index) = digits.parse::<u64>() {
            if index + 1 > next {
                next = index + 1;
            }
        }
    }
    next
}

/// Expired snapshot rows across the cluster. Remote-shared rows are included
/// only on request, so each member can scope the scan to what it may prune.
pub async fn get_expired_storage_volume_snapshots(
    pool: &Pool<MySql>,
    include_remote: bool,
) -> Result<Vec<StorageVolume>, DbError> {
    let snapshots = sqlx::query_as::<_, StorageVolume>(
        r#"SELECT * FROM storage_volumes
        WHERE name LIKE '%/%' AND expiry IS NOT NULL AND expiry <= CURRENT_TIMESTAMP
          AND (? OR (node_id IS NOT NULL AND node_id > 0))
        ORDER BY id"#,
    )
    .bind(include_remote)
    .fetch_all(pool)
    .await?;

    Ok(snapshots)
}

/// Custom volumes carrying a `snapshots.schedule` configuration key.
pub async fn get_scheduled_volumes(pool: &Pool<MySql>) -> Result<Vec<StorageVolume>, DbError> {
    let volumes = sqlx::query_as::<_, StorageVolume>(
        r#"SELECT * FROM storage_volumes
        WHERE type = 'custom' AND name NOT LIKE '%/%'
          AND JSON_EXTRACT(config, '$."snapshots.schedule"') IS NOT NULL
        ORDER BY id"#,
    )
    .fetch_all(pool)
    .await?;

    Ok(volumes)
}

/// Parameters for a fresh volume row.
pub struct NewVolume<'a> {
    pub project:      &'a str,
    pub name:         &'a str,
    pub vol_type:     &'a str,
    pub pool_id:      i64,
    pub node_id:      Option<i64>,
    pub content_type: &'a str,
    pub description:  &'a str,
    pub config:       &'a HashMap<String, String>,
    pub expiry:       Option<DateTime<Utc>>,
}

pub async fn create_volume(pool: &Pool<MySql>, new: &NewVolume<'_>) -> Result<i64, DbError> {
    let result = sqlx::query(
        r#"INSERT INTO storage_volumes (
            project, name, type, pool_id, node_id, content_type, description, config, expiry
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(new.project)
    .bind(new.name)
    .bind(new.vol_type)
    .bind(new.pool_id)
    .bind(new.node_id)
    .bind(new.content_type)
    .bind(new.description)
    .bind(Json(new.config))
    .bind(new.expiry)
    .execute(pool)
    .await?;

    Ok(result.last_insert_id() as i64)
}

/// Inserts a snapshot row inheriting the parent volume's config, content type
/// and node linkage. The snapshot is immutable afterwards except for
/// `description` and `expiry`.
pub async fn create_volume_snapshot(
    pool: &Pool<MySql>,
    parent: &StorageVolume,
    snap_name: &str,
    description: &str,
    expiry: Option<DateTime<Utc>>,
) -> Result<i64, DbError> {
    let full_name = join_snapshot_name(&parent.name, snap_name);
    create_volume(
        pool,
        &NewVolume {
            project: &parent.project,
            name: &full_name,
            vol_type: &parent.kind,
            pool_id: parent.pool_id,
            node_id: parent.node_id,
            content_type: &parent.content_type,
            description,
            config: &parent.config,
            expiry,
        },
    )
    .await
}

pub async fn rename_volume_snapshot(
    pool: &Pool<MySql>,
    id: i64,
    new_full_name: &str,
) -> Result<(), DbError> {
    let updated = sqlx::query("UPDATE storage_volumes SET name = ? WHERE id = ?")
        .bind(new_full_name)
        .bind(id)
        .execute(pool)
        .await?;

    if updated.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn update_volume_snapshot(
    pool: &Pool<MySql>,
    id: i64,
    description: &str,
    expiry: Option<DateTime<Utc>>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE storage_volumes SET description = ?, expiry = ? WHERE id = ?")
        .bind(description)
        .bind(expiry)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn delete_volume(pool: &Pool<MySql>, id: i64) -> Result<(), DbError> {
    let deleted = sqlx::query("DELETE FROM storage_volumes WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    if deleted.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_index_starts_at_zero() {
        assert_eq!(next_snapshot_index(&[], "snap%d"), 0);
    }

    #[test]
    fn next_index_skips_past_highest() {
        assert_eq!(next_snapshot_index(&["snap0", "snap3", "snap1"], "snap%d"), 4);
    }

    #[test]
    fn next_index_ignores_foreign_names() {
        assert_eq!(
            next_snapshot_index(&["weekly-2", "snap0", "snapx"], "snap%d"),
            1
        );
    }

    #[test]
    fn next_index_honours_suffix() {
        assert_eq!(
            next_snapshot_index(&["auto-7-manual", "auto-9-manual"], "auto-%d-manual"),
            10
        );
    }
}
