use clap::Parser;
use coord::CoordinationConfig;
use leasehold::{
    cluster::{ClusterHashRing, ConsistentHashRing, Member},
    test_utils::{create_test_fleet_with, TestFleet},
    Cli, Commands, LeaseManagerConfig,
};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const TTL: Duration = Duration::from_secs(30);
const SETTLE_PASSES: usize = 10;
const SETTLE_INTERVAL: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Demo {
            members,
            resources,
            rounds,
        } => run_demo(members, resources, rounds).await,
        Commands::Ring { members, resources } => print_ring(&members, resources),
    }
}

fn print_ring(names: &[String], resources: usize) -> anyhow::Result<()> {
    let ring = ConsistentHashRing::new(
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Member::new(name.clone(), format!("10.0.0.{}", i + 1))),
    );

    for i in 0..resources {
        let resource = format!("lease-{i}");
        println!("{resource:<12} {}", ring.map_resource_to_member(&resource)?);
    }
    Ok(())
}

enum Disturbance {
    Reconnect(usize),
    Rejoin(usize),
}

async fn run_demo(members: usize, resources: usize, rounds: usize) -> anyhow::Result<()> {
    anyhow::ensure!(members > 0, "the demo needs at least one member");

    let config = LeaseManagerConfig::from_env()?;
    let coordination = CoordinationConfig::from_env()?;
    let names: Vec<String> = (0..members)
        .map(|_| format!("proc-{}", &Uuid::new_v4().simple().to_string()[..8]))
        .collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();

    info!(app = %config.app_name, members, resources, "starting demo fleet");
    let fleet = create_test_fleet_with(&names, config, coordination)?;
    let leases: Vec<String> = (0..resources).map(|i| format!("lease-{i}")).collect();

    // Drawn up front so the rng is not held across awaits
    let plan: Vec<Disturbance> = {
        let mut rng = rand::rng();
        (0..rounds)
            .map(|_| {
                let target = rng.random_range(0..members);
                if members == 1 || rng.random_bool(0.5) {
                    Disturbance::Reconnect(target)
                } else {
                    Disturbance::Rejoin(target)
                }
            })
            .collect()
    };

    settle(&fleet, &leases).await;
    print_table(&fleet, &leases, "initial").await;

    for (round, disturbance) in plan.into_iter().enumerate() {
        match disturbance {
            Disturbance::Reconnect(target) => {
                let process = &fleet.processes[target];
                println!("\nround {}: {} drops its connection", round + 1, process.name());
                process.client.suspend();
                settle(&fleet, &leases).await;
                print_table(&fleet, &leases, "disconnected").await;
                process.client.reconnect();
            }
            Disturbance::Rejoin(target) => {
                let process = &fleet.processes[target];
                println!("\nround {}: {} leaves the cluster", round + 1, process.name());
                fleet.cluster.remove_members([process.member.clone()]);
                settle(&fleet, &leases).await;
                print_table(&fleet, &leases, "departed").await;
                fleet.cluster.add_members([process.member.clone()]);
            }
        }

        settle(&fleet, &leases).await;
        print_table(&fleet, &leases, "recovered").await;
    }

    fleet.stop_all().await;
    println!(
        "\nstopped {} processes, {} lease nodes left behind",
        fleet.processes.len(),
        fleet.coordinator.paths().len()
    );
    Ok(())
}

/// Re-checks every lease everywhere until each has exactly one holder
async fn settle(fleet: &TestFleet, leases: &[String]) {
    for pass in 0..SETTLE_PASSES {
        tokio::time::sleep(SETTLE_INTERVAL).await;

        let mut settled = true;
        for lease in leases {
            settled &= fleet.holders(lease, TTL).await.len() == 1;
        }
        if settled {
            debug!(pass, "fleet settled");
            return;
        }
    }
    debug!("fleet did not settle, some leases have no holder");
}

async fn print_table(fleet: &TestFleet, leases: &[String], label: &str) {
    println!("{label}:");
    for lease in leases {
        let holders = fleet.holders(lease, TTL).await;
        let designated = fleet
            .designated_owner(lease)
            .unwrap_or_else(|e| e.to_string());
        let held_by = if holders.is_empty() {
            "-".to_string()
        } else {
            holders.join(",")
        };
        println!("  {lease:<10} designated={designated:<14} held_by={held_by}");
    }
}
