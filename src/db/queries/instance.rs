use crate::db::error::DbError;
use crate::db::tables::{Instance, InstanceBackup};
use sqlx::types::Json;
use sqlx::{MySql, Pool};
use std::collections::HashMap;

/// Join used everywhere an instance is read, so rows carry the owning
/// member's name as `location`.
const INSTANCE_SELECT: &str = r#"SELECT i.id, i.project, i.name, i.type, i.architecture,
        i.node_id, m.name AS location, i.pool_id, i.ephemeral, i.stateful, i.status,
        i.local_config, i.devices, i.expanded_devices, i.profiles, i.created_at
    FROM instances i JOIN cluster_members m ON m.id = i.node_id"#;

pub async fn get_instance(
    pool: &Pool<MySql>,
    project: &str,
    name: &str,
) -> Result<Instance, DbError> {
    sqlx::query_as::<_, Instance>(&format!(
        "{} WHERE i.project = ? AND i.name = ?",
        INSTANCE_SELECT
    ))
    .bind(project)
    .bind(name)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

pub async fn get_instance_id(
    pool: &Pool<MySql>,
    project: &str,
    name: &str,
) -> Result<i64, DbError> {
    sqlx::query_scalar::<_, i64>("SELECT id FROM instances WHERE project = ? AND name = ?")
        .bind(project)
        .bind(name)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn list_instances(
    pool: &Pool<MySql>,
    project: Option<&str>,
) -> Result<Vec<Instance>, DbError> {
    let instances = match project {
        Some(project) => {
            sqlx::query_as::<_, Instance>(&format!(
                "{} WHERE i.project = ? ORDER BY i.name",
                INSTANCE_SELECT
            ))
            .bind(project)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Instance>(&format!("{} ORDER BY i.name", INSTANCE_SELECT))
                .fetch_all(pool)
                .await?
        }
    };

    Ok(instances)
}

pub async fn list_instances_on_member(
    pool: &Pool<MySql>,
    member: &str,
) -> Result<Vec<Instance>, DbError> {
    let instances = sqlx::query_as::<_, Instance>(&format!(
        "{} WHERE m.name = ? ORDER BY i.name",
        INSTANCE_SELECT
    ))
    .bind(member)
    .fetch_all(pool)
    .await?;

    Ok(instances)
}

/// Address of the member owning the instance, or `""` when that member is the
/// local one.
pub async fn get_node_address_of_instance(
    pool: &Pool<MySql>,
    project: &str,
    name: &str,
    local_member: &str,
) -> Result<String, DbError> {
    let row = sqlx::query_as::<_, (String, String)>(
        r#"SELECT m.name, m.address FROM instances i
        JOIN cluster_members m ON m.id = i.node_id
        WHERE i.project = ? AND i.name = ?"#,
    )
    .bind(project)
    .bind(name)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    let (member, address) = row;
    if member == local_member {
        return Ok(String::new());
    }
    Ok(address)
}

pub async fn get_instance_backups(
    pool: &Pool<MySql>,
    project: &str,
    name: &str,
) -> Result<Vec<InstanceBackup>, DbError> {
    let backups = sqlx::query_as::<_, InstanceBackup>(
        r#"SELECT b.id, b.instance_id, b.name, b.created_at FROM instance_backups b
        JOIN instances i ON i.id = b.instance_id
        WHERE i.project = ? AND i.name = ?
        ORDER BY b.created_at"#,
    )
    .bind(project)
    .bind(name)
    .fetch_all(pool)
    .await?;

    Ok(backups)
}

/// The single linearization point for "the instance moved".
///
/// In one transaction: the instance row is renamed and re-pointed at the new
/// member and pool, its storage volume row is renamed, and every snapshot row
/// under the old composite prefix is re-pointed with it. Remote-shared volume
/// rows keep their node linkage untouched.
pub async fn update_instance_node(
    pool: &Pool<MySql>,
    project: &str,
    old_name: &str,
    new_name: &str,
    new_member: &str,
    pool_id: i64,
    vol_type: &str,
) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    let new_node_id =
        sqlx::query_scalar::<_, i64>("SELECT id FROM cluster_members WHERE name = ?")
            .bind(new_member)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(DbError::NotFound)?;

    let updated = sqlx::query(
        "UPDATE instances SET name = ?, node_id = ?, pool_id = ? WHERE project = ? AND name = ?",
    )
    .bind(new_name)
    .bind(new_node_id)
    .bind(pool_id)
    .bind(project)
    .bind(old_name)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    let vol_node_id: Option<i64> = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT node_id FROM storage_volumes WHERE project = ? AND type = ? AND name = ?",
    )
    .bind(project)
    .bind(vol_type)
    .bind(old_name)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(DbError::NotFound)?;

    // Remote-shared rows stay unowned; local rows follow the instance.
    let new_vol_node_id = match vol_node_id {
        Some(id) if id > 0 => Some(new_node_id),
        other => other,
    };

    sqlx::query(
        r#"UPDATE storage_volumes
        SET name = CONCAT(?, SUBSTRING(name, CHAR_LENGTH(?) + 1)), node_id = ?, pool_id = ?
        WHERE project = ? AND type = ? AND (name = ? OR name LIKE CONCAT(?, '/%'))"#,
    )
    .bind(new_name)
    .bind(old_name)
    .bind(new_vol_node_id)
    .bind(pool_id)
    .bind(project)
    .bind(vol_type)
    .bind(old_name)
    .bind(old_name)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Renames an instance and its volume rows in place; member linkage and pool
/// are untouched. The unique `(project, name)` key turns collisions into
/// `DbError::Conflict`.
pub async fn rename_instance(
    pool: &Pool<MySql>,
    project: &str,
    old_name: &str,
    new_name: &str,
    vol_type: &str,
) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query("UPDATE instances SET name = ? WHERE project = ? AND name = ?")
        .bind(new_name)
        .bind(project)
        .bind(old_name)
        .execute(&mut *tx)
        .await?;

    if updated.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    sqlx::query(
        r#"UPDATE storage_volumes
        SET name = CONCAT(?, SUBSTRING(name, CHAR_LENGTH(?) + 1))
        WHERE project = ? AND type = ? AND (name = ? OR name LIKE CONCAT(?, '/%'))"#,
    )
    .bind(new_name)
    .bind(old_name)
    .bind(project)
    .bind(vol_type)
    .bind(old_name)
    .bind(old_name)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn update_instance_status(
    pool: &Pool<MySql>,
    id: i64,
    status: &str,
) -> Result<(), DbError> {
    sqlx::query("UPDATE instances SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn delete_instance_config_key(
    pool: &Pool<MySql>,
    id: i64,
    key: &str,
) -> Result<(), DbError> {
    sqlx::query(
        r#"UPDATE instances
        SET local_config = JSON_REMOVE(local_config, CONCAT('$."', ?, '"'))
        WHERE id = ?"#,
    )
    .bind(key)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_instance_config(
    pool: &Pool<MySql>,
    id: i64,
    config: &HashMap<String, String>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE instances SET local_config = JSON_MERGE_PATCH(local_config, CAST(? AS JSON)) WHERE id = ?",
    )
    .bind(Json(config))
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Parameters for a fresh instance row, used by the copy-then-delete flows.
pub struct NewInstance<'a> {
    pub project:          &'a str,
    pub name:             &'a str,
    pub kind:             &'a str,
    pub architecture:     &'a str,
    pub node_id:          i64,
    pub pool_id:          i64,
    pub ephemeral:        bool,
    pub stateful:         bool,
    pub status:           &'a str,
    pub local_config:     &'a HashMap<String, String>,
    pub devices:          &'a HashMap<String, HashMap<String, String>>,
    pub expanded_devices: &'a HashMap<String, HashMap<String, String>>,
    pub profiles:         &'a [String],
}

pub async fn create_instance(
    pool: &Pool<MySql>,
    new: &NewInstance<'_>,
) -> Result<i64, DbError> {
    let result = sqlx::query(
        r#"INSERT INTO instances (
            project, name, type, architecture, node_id, pool_id,
            ephemeral, stateful, status, local_config, devices, expanded_devices, profiles
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(new.project)
    .bind(new.name)
    .bind(new.kind)
    .bind(new.architecture)
    .bind(new.node_id)
    .bind(new.pool_id)
    .bind(new.ephemeral)
    .bind(new.stateful)
    .bind(new.status)
    .bind(Json(new.local_config))
    .bind(Json(new.devices))
    .bind(Json(new.expanded_devices))
    .bind(Json(new.profiles))
    .execute(pool)
    .await?;

    Ok(result.last_insert_id() as i64)
}

/// Removes an instance row. Volume and snapshot rows belong to the storage
/// pool layer and are removed through it.
pub async fn delete_instance(
    pool: &Pool<MySql>,
    project: &str,
    name: &str,
) -> Result<(), DbError> {
    let deleted = sqlx::query("DELETE FROM instances WHERE project = ? AND name = ?")
        .bind(project)
        .bind(name)
        .execute(pool)
        .await?;

    if deleted.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}
