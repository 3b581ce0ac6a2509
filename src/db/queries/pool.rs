use crate::db::error::DbError;
use crate::db::tables::StoragePoolRow;
use sqlx::{MySql, Pool};

pub async fn get_pools(pool: &Pool<MySql>) -> Result<Vec<StoragePoolRow>, DbError> {
    let pools = sqlx::query_as::<_, StoragePoolRow>("SELECT * FROM storage_pools ORDER BY id")
        .fetch_all(pool)
        .await?;

    Ok(pools)
}

pub async fn get_pool_by_name(
    pool: &Pool<MySql>,
    name: &str,
) -> Result<StoragePoolRow, DbError> {
    sqlx::query_as::<_, StoragePoolRow>("SELECT * FROM storage_pools WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Registers a configured pool if the row does not exist yet and returns its id.
pub async fn ensure_pool(
    pool: &Pool<MySql>,
    name: &str,
    driver: &str,
) -> Result<i64, DbError> {
    sqlx::query(
        r#"INSERT INTO storage_pools (name, driver) VALUES (?, ?)
        ON DUPLICATE KEY UPDATE driver = VALUES(driver)"#,
    )
    .bind(name)
    .bind(driver)
    .execute(pool)
    .await?;

    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM storage_pools WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await?;

    Ok(id)
}
