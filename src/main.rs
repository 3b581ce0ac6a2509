use std::env;
use std::sync::Arc;
use std::time::Duration;

mod api;
mod config;
mod db;
mod forkfile;
mod logging;
mod migration;
mod ops;
mod peer;
mod relocate;
mod scheduler;
mod server;
mod storage;

use config::MEMBER_CONFIG;
use db::queries;
use db::ClusterDb;
use ops::OperationRegistry;
use peer::client::HttpPeerConnector;
use relocate::Relocator;
use scheduler::SnapshotScheduler;
use storage::PoolRegistry;

/// Keeps this member's row fresh so peers can tell it apart from a dead one.
async fn heartbeat_loop(cluster_db: Arc<ClusterDb>, config: Arc<config::MemberConfig>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs));
    loop {
        interval.tick().await;
        if let Err(err) = queries::member::upsert_heartbeat(
            cluster_db.pool(),
            &config.name,
            &config.cluster_address,
            &config.architecture,
            &config.member_group,
        )
        .await
        {
            log::warn!("Heartbeat update failed: {}", err);
        }
    }
}

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    logging::init();

    // Hidden helper subcommand: corrald forkfile <listen_fd> <rootfs_fd> <pidfd> <pid>
    let args: Vec<String> = env::args().collect();
    if args.get(1).map(String::as_str) == Some("forkfile") {
        if args.len() != 6 {
            eprintln!("usage: corrald forkfile <listen_fd> <rootfs_fd> <pidfd> <pid>");
            std::process::exit(1);
        }
        let parse = |s: &String| s.parse::<i32>();
        match (parse(&args[2]), parse(&args[3]), parse(&args[4]), parse(&args[5])) {
            (Ok(listen_fd), Ok(rootfs_fd), Ok(pidfd), Ok(pid)) => {
                let code = forkfile::run(listen_fd, rootfs_fd, pidfd, pid).await;
                std::process::exit(code);
            }
            _ => {
                eprintln!("forkfile arguments must be numeric file descriptors");
                std::process::exit(1);
            }
        }
    }

    let config = MEMBER_CONFIG.clone();
    let database_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "mysql://corral@127.0.0.1/corral".to_string());

    let cluster_db = ClusterDb::connect(&database_url, &config.name, &config.cluster_address)
        .await
        .map_err(|e| format!("Failed to connect to the cluster database: {}", e))?;

    // Register before anything else reads the member table.
    queries::member::upsert_heartbeat(
        cluster_db.pool(),
        &config.name,
        &config.cluster_address,
        &config.architecture,
        &config.member_group,
    )
    .await
    .map_err(|e| format!("Failed to register this member: {}", e))?;

    let pools = PoolRegistry::load(&config, cluster_db.clone())
        .await
        .map_err(|e| format!("Failed to load storage pools: {}", e))?;
    let ops = OperationRegistry::new();
    let peers = HttpPeerConnector::new();
    let relocator = Relocator::new(
        cluster_db.clone(),
        pools.clone(),
        ops.clone(),
        peers,
        config.clone(),
        None,
    );

    tokio::spawn(heartbeat_loop(cluster_db.clone(), config.clone()));

    let snapshot_scheduler =
        SnapshotScheduler::new(cluster_db.clone(), pools.clone(), config.clone());
    tokio::spawn(snapshot_scheduler.start());

    log::info!(
        "Starting corrald member {} on {}:{}",
        config.name,
        config.address,
        config.port
    );
    let _rocket = server::build_rocket(config, cluster_db, pools, ops, relocator)
        .launch()
        .await?;

    Ok(())
}
