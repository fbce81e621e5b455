//! End-to-end convergence of a document covering every resource kind.

use cloud_converge::{
    ConvergeConfig, ConvergeOrchestrator, DesiredDocument, EntryState, EntryStore,
    JsonFileEntryStore, OutcomeKind, ResourceKind, SandboxCloud,
};

fn document(zone_id: &str) -> DesiredDocument {
    let json = format!(
        r#"{{"resources": [
            {{"kind": "network", "name": "main", "cidr_block": "10.0.0.0/16",
              "internet_gateway": true, "enable_dns_hostnames": true, "tags": {{"env": "test"}}}},
            {{"kind": "volume", "name": "data", "availability_zone": "us-east-1a", "size": 20,
              "tags": {{"team": "storage"}}}},
            {{"kind": "record_set", "zone_id": "{zone_id}", "name": "www.example.com",
              "record_type": "A", "ttl": 300, "values": ["10.0.0.2", "10.0.0.1"]}},
            {{"kind": "db_instance", "name": "orders", "engine": "postgres",
              "instance_class": "db.t3.micro", "allocated_storage": 20,
              "master_username": "admin", "master_password": "correct-horse",
              "tags": {{"env": "test"}}}},
            {{"kind": "bucket", "name": "logs", "versioning": true, "tags": {{}}}},
            {{"kind": "search_domain", "name": "catalog", "engine_version": "7.10",
              "instance_type": "t3.small.search", "instance_count": 1, "tags": {{"env": "test"}}}},
            {{"kind": "load_balancer", "name": "web", "subnets": ["subnet-1", "subnet-2"],
              "security_groups": ["sg-1"], "tags": {{"env": "test"}}}},
            {{"kind": "auto_scaling_group", "name": "workers", "launch_configuration": "lc-1",
              "min_size": 1, "max_size": 3, "desired_capacity": 2,
              "availability_zones": ["us-east-1a", "us-east-1b"], "tags": {{"env": "test"}}}}
        ]}}"#
    );
    DesiredDocument::from_json(&json).ok().unwrap_or_default()
}

#[tokio::test]
async fn every_kind_converges_and_the_second_pass_is_a_no_op() {
    let cloud = SandboxCloud::new("us-east-1", "123456789012");
    let zone = cloud.create_hosted_zone("example.com.");
    let cfg = ConvergeConfig::default();
    let doc = document(&zone);
    assert_eq!(doc.resources.len(), ResourceKind::ALL.len());

    let mut entries = EntryState::new();
    let orchestrator = ConvergeOrchestrator::new(&cloud, &cfg);
    let (first, second) = orchestrator.verify(&doc, &mut entries).await;

    assert_eq!(first.failures().count(), 0, "{:?}", first.outcomes());
    assert_eq!(first.count(OutcomeKind::Created), 8);
    assert!(second.is_idempotent(), "{:?}", second.outcomes());
    assert_eq!(second.count(OutcomeKind::Unchanged), 8);
    assert_eq!(entries.entries.len(), 8);
}

#[tokio::test]
async fn converged_state_issues_no_mutating_calls() {
    let cloud = SandboxCloud::new("us-east-1", "123456789012");
    let zone = cloud.create_hosted_zone("example.com.");
    let cfg = ConvergeConfig::default();
    let doc = document(&zone);
    let mut entries = EntryState::new();
    let orchestrator = ConvergeOrchestrator::new(&cloud, &cfg);
    orchestrator.apply(&doc, &mut entries).await;
    cloud.reset_calls();

    orchestrator.apply(&doc, &mut entries).await;

    assert!(cloud.mutating_calls().is_empty(), "{:?}", cloud.mutating_calls());
}

#[tokio::test]
async fn destroy_tears_everything_down_once() {
    let cloud = SandboxCloud::new("us-east-1", "123456789012");
    let zone = cloud.create_hosted_zone("example.com.");
    let cfg = ConvergeConfig::default();
    let doc = document(&zone);
    let mut entries = EntryState::new();
    let orchestrator = ConvergeOrchestrator::new(&cloud, &cfg);
    orchestrator.apply(&doc, &mut entries).await;

    let first = orchestrator.destroy(&doc, &mut entries).await;
    let second = orchestrator.destroy(&doc, &mut entries).await;

    assert_eq!(first.count(OutcomeKind::Destroyed), 8, "{:?}", first.outcomes());
    assert_eq!(first.outcomes()[0].kind, ResourceKind::AutoScalingGroup);
    assert!(second.is_idempotent());
    assert!(entries.entries.is_empty());
    assert_eq!(cloud.gateway_count(), 0);
    assert!(cloud.final_snapshots().is_empty());
}

#[tokio::test]
async fn state_survives_a_round_trip_through_files() {
    let dir = tempfile::tempdir().ok();
    let base = dir.as_ref().map(|d| d.path().to_path_buf()).unwrap_or_default();
    let sandbox_path = base.join("sandbox.json");
    let store = JsonFileEntryStore::new(base.join("state.json"));
    let cfg = ConvergeConfig::default();

    let cloud = SandboxCloud::new("us-east-1", "123456789012");
    let zone = cloud.create_hosted_zone("example.com.");
    let doc = document(&zone);
    let mut entries = EntryState::new();
    ConvergeOrchestrator::new(&cloud, &cfg).apply(&doc, &mut entries).await;
    assert!(cloud.save(&sandbox_path).is_ok());
    assert!(store.save(&entries).is_ok());

    let reopened = SandboxCloud::open(&sandbox_path, "us-east-1", "123456789012").ok();
    let reopened = reopened.unwrap_or_else(|| SandboxCloud::new("us-east-1", "000000000000"));
    let mut loaded = store.load().ok().flatten().unwrap_or_default();
    assert_eq!(loaded, entries);
    assert_eq!(reopened.hosted_zone_for("example.com."), Some(zone));

    let report = ConvergeOrchestrator::new(&reopened, &cfg).apply(&doc, &mut loaded).await;
    assert!(report.is_idempotent(), "{:?}", report.outcomes());
}
