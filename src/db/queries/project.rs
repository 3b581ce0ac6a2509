use crate::db::error::DbError;
use crate::db::tables::Project;
use sqlx::{MySql, Pool};

pub async fn get_projects(pool: &Pool<MySql>) -> Result<Vec<Project>, DbError> {
    let projects = sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY name")
        .fetch_all(pool)
        .await?;

    Ok(projects)
}

pub async fn get_project(pool: &Pool<MySql>, name: &str) -> Result<Project, DbError> {
    sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}
