use crate::api::error::ApiError;
use crate::db::queries as db;
use crate::db::tables::{ClusterMember, Instance, Project};
use crate::db::ClusterDb;
use std::collections::HashMap;

/// Input handed to a configured placement scriptlet.
pub struct PlacementRequest<'a> {
    pub name:    &'a str,
    pub kind:    &'a str,
    pub config:  &'a HashMap<String, String>,
    pub devices: &'a HashMap<String, HashMap<String, String>>,
    pub project: &'a str,
    pub reason:  &'static str,
}

/// Optional policy hook choosing among the filtered candidates. Injected so
/// placement stays deterministic under test.
pub trait PlacementScriptlet: Send + Sync {
    fn place(&self, req: &PlacementRequest<'_>, candidates: &[ClusterMember]) -> Option<String>;
}

/// Picks the member to relocate `inst` onto when the caller named none.
///
/// Candidates are filtered by architecture, the project's allowed failover
/// groups and online status; the scriptlet decides if configured, otherwise
/// the least-loaded member wins.
pub async fn choose_member(
    db: &ClusterDb,
    project: &Project,
    inst: &Instance,
    scriptlet: Option<&dyn PlacementScriptlet>,
    offline_threshold: chrono::Duration,
) -> Result<ClusterMember, ApiError> {
    let groups_allowed = project.restricted_cluster_groups();
    let archs = vec![inst.architecture.clone()];

    let candidates = db::member::get_candidate_members(
        db.pool(),
        &archs,
        None,
        groups_allowed.as_deref(),
        offline_threshold,
    )
    .await
    .map_err(ApiError::from)?;

    if candidates.is_empty() {
        return Err(ApiError::Unavailable(
            "No online cluster member is eligible for this instance".to_string(),
        ));
    }

    if let Some(scriptlet) = scriptlet {
        let request = PlacementRequest {
            name: &inst.name,
            kind: &inst.kind,
            config: &inst.local_config,
            devices: &inst.expanded_devices,
            project: &inst.project,
            reason: "relocation",
        };
        if let Some(choice) = scriptlet.place(&request, &candidates) {
            let member = candidates
                .into_iter()
                .find(|m| m.name == choice)
                .ok_or_else(|| {
                    ApiError::Internal(format!(
                        "Placement scriptlet chose \"{}\", which is not a candidate",
                        choice
                    ))
                })?;
            return Ok(member);
        }
    }

    db::member::get_node_with_least_instances(db.pool(), &candidates)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::Unavailable("No candidate member available".to_string()))
}
