use crate::db::error::DbError;
use crate::db::tables::ClusterMember;
use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};

pub async fn get_nodes(pool: &Pool<MySql>) -> Result<Vec<ClusterMember>, DbError> {
    let members = sqlx::query_as::<_, ClusterMember>(
        "SELECT * FROM cluster_members ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    Ok(members)
}

pub async fn get_node_by_name(
    pool: &Pool<MySql>,
    name: &str,
) -> Result<ClusterMember, DbError> {
    sqlx::query_as::<_, ClusterMember>("SELECT * FROM cluster_members WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn get_node_by_address(
    pool: &Pool<MySql>,
    address: &str,
) -> Result<ClusterMember, DbError> {
    sqlx::query_as::<_, ClusterMember>("SELECT * FROM cluster_members WHERE address = ?")
        .bind(address)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn get_node_id(pool: &Pool<MySql>, name: &str) -> Result<i64, DbError> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM cluster_members WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)?;

    Ok(id)
}

/// Refreshes this member's registration row. Inserting on first start and
/// bumping the heartbeat timestamp afterwards.
pub async fn upsert_heartbeat(
    pool: &Pool<MySql>,
    name: &str,
    address: &str,
    architecture: &str,
    member_group: &str,
) -> Result<(), DbError> {
    sqlx::query(
        r#"INSERT INTO cluster_members (name, address, architecture, member_group, status, heartbeat)
        VALUES (?, ?, ?, ?, 'online', CURRENT_TIMESTAMP)
        ON DUPLICATE KEY UPDATE
            address = VALUES(address),
            architecture = VALUES(architecture),
            member_group = VALUES(member_group),
            heartbeat = CURRENT_TIMESTAMP"#,
    )
    .bind(name)
    .bind(address)
    .bind(architecture)
    .bind(member_group)
    .execute(pool)
    .await?;

    Ok(())
}

/// Members eligible to receive an instance: online, matching one of the
/// requested architectures, and inside the allowed failover groups.
pub async fn get_candidate_members(
    pool: &Pool<MySql>,
    archs: &[String],
    group: Option<&str>,
    groups_allowed: Option<&[String]>,
    offline_threshold: chrono::Duration,
) -> Result<Vec<ClusterMember>, DbError> {
    let members = get_nodes(pool).await?;
    Ok(filter_candidates(
        members,
        archs,
        group,
        groups_allowed,
        offline_threshold,
        Utc::now(),
    ))
}

/// Pure candidate filter, split out so placement stays deterministic under test.
pub fn filter_candidates(
    members: Vec<ClusterMember>,
    archs: &[String],
    group: Option<&str>,
    groups_allowed: Option<&[String]>,
    offline_threshold: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<ClusterMember> {
    members
        .into_iter()
        .filter(|m| !m.is_offline(offline_threshold, now))
        .filter(|m| archs.is_empty() || archs.iter().any(|a| *a == m.architecture))
        .filter(|m| group.map_or(true, |g| m.member_group == g))
        .filter(|m| {
            groups_allowed.map_or(true, |allowed| {
                allowed.iter().any(|g| *g == m.member_group)
            })
        })
        .collect()
}

/// Picks the candidate currently hosting the fewest instances.
pub async fn get_node_with_least_instances(
    pool: &Pool<MySql>,
    candidates: &[ClusterMember],
) -> Result<Option<ClusterMember>, DbError> {
    if candidates.is_empty() {
        return Ok(None);
    }

    let counts: Vec<(i64, i64)> = sqlx::query_as::<_, (i64, i64)>(
        "SELECT node_id, COUNT(*) FROM instances GROUP BY node_id",
    )
    .fetch_all(pool)
    .await?;

    let count_for = |id: i64| -> i64 {
        counts
            .iter()
            .find(|(node_id, _)| *node_id == id)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };

    let best = candidates
        .iter()
        .min_by_key(|m| (count_for(m.id), m.name.clone()))
        .cloned();

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, arch: &str, group: &str, stale_secs: i64) -> ClusterMember {
        ClusterMember {
            id: 1,
            name: name.to_string(),
            address: format!("{}:8443", name),
            architecture: arch.to_string(),
            member_group: group.to_string(),
            status: "online".to_string(),
            heartbeat: Utc::now() - chrono::Duration::seconds(stale_secs),
        }
    }

    #[test]
    fn filters_offline_members() {
        let members = vec![member("a", "x86_64", "default", 0), member("b", "x86_64", "default", 120)];
        let got = filter_candidates(
            members,
            &[],
            None,
            None,
            chrono::Duration::seconds(20),
            Utc::now(),
        );
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "a");
    }

    #[test]
    fn filters_architecture_and_groups() {
        let members = vec![
            member("a", "x86_64", "fast", 0),
            member("b", "aarch64", "fast", 0),
            member("c", "x86_64", "slow", 0),
        ];
        let allowed = vec!["fast".to_string()];
        let got = filter_candidates(
            members,
            &["x86_64".to_string()],
            None,
            Some(&allowed),
            chrono::Duration::seconds(20),
            Utc::now(),
        );
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "a");
    }

    #[test]
    fn explicit_group_narrows_candidates() {
        let members = vec![member("a", "x86_64", "fast", 0), member("b", "x86_64", "slow", 0)];
        let got = filter_candidates(
            members,
            &[],
            Some("slow"),
            None,
            chrono::Duration::seconds(20),
            Utc::now(),
        );
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "b");
    }
}
