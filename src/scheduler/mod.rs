//! Periodic auto-creation and expiry pruning of custom-volume snapshots.
//!
//! Fires every minute (the first tick is skipped so a restarting member does
//! not double-fire). Remote-shared volumes are visible to every member, so a
//! deterministic election picks exactly one executor per item.

use crate::config::MemberConfig;
use crate::db::queries as db;
use crate::db::tables::StorageVolume;
use crate::db::ClusterDb;
use crate::storage::PoolRegistry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use log::{debug, info, warn};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const TICK_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_PATTERN: &str = "snap%d";

pub struct SnapshotScheduler {
    db:        Arc<ClusterDb>,
    pools:     Arc<PoolRegistry>,
    config:    Arc<MemberConfig>,
    /// Snapshot ids currently being deleted; overlapping ticks skip them.
    in_flight: Mutex<HashSet<i64>>,
}

impl SnapshotScheduler {
    pub fn new(
        db: Arc<ClusterDb>,
        pools: Arc<PoolRegistry>,
        config: Arc<MemberConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            pools,
            config,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Runs forever; spawn on its own task.
    pub async fn start(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        // An interval fires immediately; consuming that tick skips the first
        // scheduled run.
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(err) = self.tick(Utc::now()).await {
                warn!("Snapshot scheduler tick failed: {}", err);
            }
        }
    }

    /// One scheduler pass: expiry first, then creation, so disk usage stays
    /// bounded.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), anyhow::Error> {
        let local_node_id = self.db.get_node_id().await?;

        // Single collection pass against the store.
        let scheduled = db::volume::get_scheduled_volumes(self.db.pool()).await?;
        let expired =
            db::volume::get_expired_storage_volume_snapshots(self.db.pool(), true).await?;

        let members = db::member::get_nodes(self.db.pool()).await?;
        let online: Vec<String> = members
            .iter()
            .filter(|m| !m.is_offline(self.config.offline_threshold(), now))
            .map(|m| m.name.clone())
            .collect();
        let multi_member = members.len() > 1;

        // Projects can opt their volumes out of automatic snapshots.
        let restricted: HashSet<String> = db::project::get_projects(self.db.pool())
            .await?
            .into_iter()
            .filter(|p| p.restricted_snapshots())
            .map(|p| p.name)
            .collect();

        for snap in expired {
            if !self.responsible_for(&snap, local_node_id, &online, multi_member) {
                continue;
            }
            if !self.in_flight.lock().insert(snap.id) {
                debug!("Snapshot {} already being deleted, skipping", snap.name);
                continue;
            }
            let result = self.prune(&snap).await;
            self.in_flight.lock().remove(&snap.id);
            if let Err(err) = result {
                warn!("Failed to prune expired snapshot {}: {}", snap.name, err);
            }
        }

        for vol in scheduled {
            if restricted.contains(&vol.project) {
                continue;
            }
            if !self.responsible_for(&vol, local_node_id, &online, multi_member) {
                continue;
            }
            let Some(schedule) = vol.config.get("snapshots.schedule") else {
                continue;
            };
            if !schedule_fires(schedule, now) {
                continue;
            }
            if let Err(err) = self.create_scheduled(&vol, now).await {
                warn!("Failed to create scheduled snapshot of {}: {}", vol.name, err);
            }
        }

        Ok(())
    }

    /// Local volumes belong to their owner; remote-shared ones get exactly
    /// one executor elected over the online member set.
    fn responsible_for(
        &self,
        vol: &StorageVolume,
        local_node_id: i64,
        online: &[String],
        multi_member: bool,
    ) -> bool {
        if !vol.is_remote() {
            return vol.node_id == Some(local_node_id);
        }
        if online.is_empty() {
            // A lone member may act; a partitioned cluster must not.
            return !multi_member;
        }
        elected_member(vol.id, online) == Some(self.config.name.as_str())
    }

    async fn prune(&self, snap: &StorageVolume) -> Result<(), anyhow::Error> {
        let pool = self
            .pools
            .get_by_id(snap.pool_id)
            .ok_or_else(|| anyhow::anyhow!("pool {} not configured here", snap.pool_id))?;

        // The expiry may have been pushed out since the collection pass.
        let expiry =
            db::volume::get_storage_volume_snapshot_expiry(self.db.pool(), snap.id).await?;
        match expiry {
            Some(at) if at <= Utc::now() => {}
            _ => return Ok(()),
        }

        info!("Pruning expired snapshot {}/{}", snap.project, snap.name);
        pool.delete_custom_volume_snapshot(&snap.project, &snap.name)
            .await?;
        Ok(())
    }

    async fn create_scheduled(
        &self,
        vol: &StorageVolume,
        now: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        let pool = self
            .pools
            .get_by_id(vol.pool_id)
            .ok_or_else(|| anyhow::anyhow!("pool {} not configured here", vol.pool_id))?;

        let pattern = vol
            .config
            .get("snapshots.pattern")
            .map(String::as_str)
            .unwrap_or(DEFAULT_PATTERN);

        let name = if pattern.contains("%d") {
            let index = db::volume::get_next_storage_volume_snapshot_index(
                self.db.pool(),
                vol.pool_id,
                &vol.name,
                &vol.kind,
                pattern,
            )
            .await?;
            pattern.replace("%d", &index.to_string())
        } else {
            let rendered = render_pattern(pattern, now);
            let existing = db::volume::get_local_storage_pool_volume_snapshots_with_type(
                self.db.pool(),
                &vol.project,
                &vol.name,
                &vol.kind,
                vol.pool_id,
            )
            .await?;
            dedupe_name(&rendered, &existing)
        };

        let expiry = vol
            .config
            .get("snapshots.expiry")
            .map(String::as_str)
            .unwrap_or("");
        let expires_at = parse_expiry(expiry, now)
            .map_err(|e| anyhow::anyhow!("bad snapshots.expiry \"{}\": {}", expiry, e))?;

        info!(
            "Creating scheduled snapshot {}/{}/{}",
            vol.project, vol.name, name
        );
        pool.create_custom_volume_snapshot(&vol.project, &vol.name, &name, "", expires_at)
            .await?;
        Ok(())
    }
}

/// Deterministic executor election for one remote-shared item: a stable hash
/// of the volume id modulo the online member count.
pub fn elected_member<'a, S: AsRef<str>>(id: i64, online_sorted: &'a [S]) -> Option<&'a str> {
    if online_sorted.is_empty() {
        return None;
    }
    let digest = Sha256::digest(id.to_le_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let index = (u64::from_le_bytes(prefix) % online_sorted.len() as u64) as usize;
    Some(online_sorted[index].as_ref())
}

/// Whether a cron-style schedule (or comma-separated list of them) would have
/// fired in the one-minute window ending at `now`.
pub fn schedule_fires(schedule: &str, now: DateTime<Utc>) -> bool {
    schedule
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .any(|expr| expression_fires(expr, now))
}

fn expression_fires(expr: &str, now: DateTime<Utc>) -> bool {
    // User schedules are standard 5-field cron; the parser wants seconds.
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    let Ok(schedule) = Schedule::from_str(&normalized) else {
        warn!("Ignoring invalid snapshot schedule \"{}\"", expr);
        return false;
    };
    let window_start = now - ChronoDuration::seconds(60);
    schedule
        .after(&window_start)
        .next()
        .map_or(false, |fire| fire <= now)
}

/// Renders a non-`%d` naming pattern; `{{ creation_date }}` is the one
/// variable offered.
pub fn render_pattern(pattern: &str, now: DateTime<Utc>) -> String {
    let mut context = tera::Context::new();
    context.insert("creation_date", &now.format("%Y-%m-%dT%H-%M-%S").to_string());
    match tera::Tera::one_off(pattern, &context, false) {
        Ok(rendered) => rendered,
        Err(err) => {
            warn!("Ignoring invalid snapshot pattern \"{}\": {}", pattern, err);
            "snap".to_string()
        }
    }
}

/// Appends an index when the rendered name collides with an existing one.
pub fn dedupe_name(rendered: &str, existing: &[StorageVolume]) -> String {
    let taken: Vec<&str> = existing
        .iter()
        .filter_map(|v| v.split_snapshot_name().map(|(_, snap)| snap))
        .collect();
    if !taken.contains(&rendered) {
        return rendered.to_string();
    }
    let mut index = 1u64;
    loop {
        let candidate = format!("{}-{}", rendered, index);
        if !taken.contains(&candidate.as_str()) {
            return candidate;
        }
        index += 1;
    }
}

/// Parses a `snapshots.expiry` duration expression such as `2d4h`; empty
/// means the snapshot never expires.
pub fn parse_expiry(
    expr: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, humantime::DurationError> {
    if expr.is_empty() {
        return Ok(None);
    }
    let duration = humantime::parse_duration(expr)?;
    Ok(Some(
        now + ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(0)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_schedules_fire_in_window() {
        // Hourly at minute 0; "now" is exactly on the minute.
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 14, 0, 0).unwrap();
        assert!(schedule_fires("0 * * * *", now));
        assert!(!schedule_fires("30 * * * *", now));

        // A minute later, the window has moved on.
        let later = Utc.with_ymd_and_hms(2026, 8, 1, 14, 1, 30).unwrap();
        assert!(!schedule_fires("0 * * * *", later));
    }

    #[test]
    fn schedule_lists_fire_when_any_entry_fires() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).unwrap();
        assert!(schedule_fires("0 * * * *, 30 * * * *", now));
        assert!(!schedule_fires("0 * * * *, 15 * * * *", now));
    }

    #[test]
    fn invalid_schedules_never_fire() {
        let now = Utc::now();
        assert!(!schedule_fires("not a schedule", now));
        assert!(!schedule_fires("", now));
    }

    #[test]
    fn election_is_deterministic_and_in_range() {
        let members = vec!["node-a".to_string(), "node-b".to_string(), "node-c".to_string()];
        let first = elected_member(42, &members).unwrap();
        for _ in 0..10 {
            assert_eq!(elected_member(42, &members).unwrap(), first);
        }
        assert!(members.iter().any(|m| m == first));
        assert!(elected_member(42, &Vec::<String>::new()).is_none());
    }

    #[test]
    fn different_ids_spread_over_members() {
        let members: Vec<String> = (0..8).map(|i| format!("node-{}", i)).collect();
        let hits: HashSet<&str> = (0..256)
            .filter_map(|id| elected_member(id, &members))
            .collect();
        // With 256 ids over 8 members, every member should be hit.
        assert_eq!(hits.len(), members.len());
    }

    #[test]
    fn creation_date_pattern_renders() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 15, 0).unwrap();
        let name = render_pattern("backup-{{ creation_date }}", now);
        assert_eq!(name, "backup-2026-08-01T09-15-00");
    }

    #[test]
    fn expiry_expressions_parse() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_expiry("", now).unwrap(), None);
        let expiry = parse_expiry("2d4h", now).unwrap().unwrap();
        assert_eq!(expiry, now + ChronoDuration::hours(52));
        assert!(parse_expiry("nonsense", now).is_err());
    }

    fn vol_named(name: &str) -> StorageVolume {
        StorageVolume {
            id: 1,
            project: "default".into(),
            name: name.to_string(),
            kind: "custom".into(),
            pool_id: 1,
            node_id: Some(1),
            content_type: "filesystem".into(),
            description: String::new(),
            config: sqlx::types::Json(Default::default()),
            expiry: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn colliding_rendered_names_get_an_index() {
        let existing = vec![vol_named("vol1/daily"), vol_named("vol1/daily-1")];
        assert_eq!(dedupe_name("daily", &existing), "daily-2");
        assert_eq!(dedupe_name("weekly", &existing), "weekly");
    }
}
