use crate::api;
use crate::api::error::ApiError;
use crate::config::MemberConfig;
use crate::db::queries as db;
use crate::db::ClusterDb;
use crate::ops::OperationRegistry;
use crate::relocate::Relocator;
use crate::storage::PoolRegistry;
use colored::Colorize;
use rocket::serde::json::{json, Json, Value};
use rocket::{get, routes, Build, Rocket, State};
use std::sync::Arc;

pub trait RocketExt {
    fn mount_routes(self, routes: Vec<(&'static str, Vec<rocket::Route>)>) -> Self;
}

impl RocketExt for Rocket<Build> {
    fn mount_routes(self, routes: Vec<(&'static str, Vec<rocket::Route>)>) -> Self {
        let mut rocket = self;
        for (path, routes) in routes {
            log::info!("{}", format!("Mounting routes at {}", path).green());
            rocket = rocket.mount(path, routes);
        }
        rocket
    }
}

#[get("/health")]
async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[get("/1.0/cluster/members")]
async fn cluster_members(
    cluster_db: &State<Arc<ClusterDb>>,
    config: &State<Arc<MemberConfig>>,
) -> Result<Json<Value>, ApiError> {
    let members = db::member::get_nodes(cluster_db.pool()).await?;
    let now = chrono::Utc::now();
    let rendered: Vec<Value> = members
        .iter()
        .map(|m| {
            json!({
                "name": m.name,
                "address": m.address,
                "architecture": m.architecture,
                "group": m.member_group,
                "online": !m.is_offline(config.offline_threshold(), now),
                "heartbeat": m.heartbeat,
            })
        })
        .collect();
    Ok(Json(json!({ "members": rendered })))
}

pub fn build_rocket(
    config: Arc<MemberConfig>,
    cluster_db: Arc<ClusterDb>,
    pools: Arc<PoolRegistry>,
    ops: Arc<OperationRegistry>,
    relocator: Arc<Relocator>,
) -> Rocket<Build> {
    crate::logging::print_banner("CORRALD MEMBER STARTUP", |s| s.bright_cyan());

    log::info!("{}", "Building Rocket instance".cyan());
    let rocket_instance = rocket::build()
        .configure(rocket::Config {
            port: config.port,
            address: config
                .address
                .parse()
                .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0))),
            ..Default::default()
        })
        .manage(config)
        .manage(cluster_db)
        .manage(pools)
        .manage(ops)
        .manage(relocator);

    let routes = vec![
        ("/", routes![health_check, cluster_members]),
        ("/", api::routes()),
        ("/", api::internal_routes()),
    ];

    rocket_instance.mount_routes(routes)
}
