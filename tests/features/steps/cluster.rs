//! Topology changes driven from scenarios.

use cucumber::when;
use kurrentdb::Endpoint;

use super::ClientWorld;

#[when(expr = "the leader goes down and {string} is elected")]
async fn when_leader_fails_over(world: &mut ClientWorld, successor: String) {
    let old = world.cluster.leader().expect("cluster has a leader");
    let successor: Endpoint = successor.parse().expect("endpoint");
    world.cluster.set_reachable(&old, false);
    world.cluster.set_alive(&old, false);
    world.cluster.elect(&successor);
}
