//! Exercises the Dependency Engine (C2) end to end against deptree-cache-
//! shaped text, covering scenarios S3 (cycle breakable), S4 (cycle
//! unsolvable), and S5 (provider choice) from the testable-properties list.

use std::collections::HashSet;

use rcinit::depgraph::{Graph, Operation, ProviderStatus};

#[test]
fn backlink_adds_symmetric_reverse_edges() {
    let mut graph = Graph::parse(["a ineed b"]);
    graph.backlink();

    let a = graph.find("a").unwrap();
    let b = graph.find("b").unwrap();
    assert_eq!(graph.node(a).edge_targets(rcinit::constants::DepType::INeed), &[b]);
    assert_eq!(graph.node(b).edge_targets(rcinit::constants::DepType::NeedsMe), &[a]);
}

#[test]
fn s3_cycle_breakable_resolves_after_tryfix() {
    // A after B, B after C, C after A: one edge must be dropped so the
    // remaining graph is acyclic.
    let mut graph = Graph::parse(["a iafter b", "b iafter c", "c iafter a"]);
    graph.backlink();
    graph.tryfix().expect("breakable cycle should resolve");

    let a = graph.find("a").unwrap();
    let b = graph.find("b").unwrap();
    let c = graph.find("c").unwrap();
    let entry_points = [a, b, c];
    let runlevel_members: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let boot_members = HashSet::new();
    let hotplugged = HashSet::new();

    let order = graph.order(
        &entry_points,
        Operation::Start,
        &runlevel_members,
        &hotplugged,
        &boot_members,
        &|_| ProviderStatus::Stopped,
        None,
        &HashSet::new(),
    );
    assert_eq!(order.len(), 3, "all three services should appear in the plan");
}

#[test]
fn s4_cycle_unsolvable_reports_dependency_error() {
    // A need B, B need A: a `need` cycle cannot be broken by dropping a
    // single soft edge, so tryfix must surface it.
    let mut graph = Graph::parse(["a ineed b", "b ineed a"]);
    graph.backlink();
    let result = graph.tryfix();
    assert!(result.is_err(), "an unsolvable need cycle must fail tryfix");
}

#[test]
fn s5_provider_choice_prefers_runlevel_member() {
    // net providedby {eth0, wlan0}; eth0 is in the default runlevel, wlan0
    // is not. sshd need net should resolve to eth0.
    let mut graph = Graph::parse([
        "net iprovide eth0",
        "net iprovide wlan0",
        "sshd ineed net",
    ]);
    graph.backlink();
    graph.tryfix().expect("no cycle expected in this fixture");

    let eth0 = graph.find("eth0").unwrap();
    let wlan0 = graph.find("wlan0").unwrap();
    let candidates = [eth0, wlan0];
    let runlevel_members: HashSet<String> = ["sshd", "eth0"].iter().map(|s| s.to_string()).collect();
    let boot_members = HashSet::new();
    let hotplugged = HashSet::new();

    let chosen = graph.select_provider(
        &candidates,
        Operation::Start,
        &runlevel_members,
        &hotplugged,
        &boot_members,
        &|_| ProviderStatus::Stopped,
    );
    assert_eq!(chosen, vec![eth0]);
}

#[test]
fn prune_platform_removes_opted_out_services() {
    let mut graph = Graph::parse(["a ineed b", "a keyword -linux"]);
    graph.prune_platform("linux");
    assert!(graph.find("a").is_none(), "platform-excluded service should be pruned");
}

#[test]
fn no_self_edges_survive_parsing() {
    let graph = Graph::parse(["a ineed a"]);
    let a = graph.find("a").unwrap();
    assert!(graph.node(a).edge_targets(rcinit::constants::DepType::INeed).is_empty());
}
