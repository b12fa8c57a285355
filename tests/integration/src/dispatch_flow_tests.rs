//! End-to-end tests over the real gRPC services
//!
//! Each test starts a node on an ephemeral port with a 5ms time unit and
//! drives it with the generated clients.

use crate::test_utils::*;
use firewatch_core::{Coordinate, EmergencyRequest, ResourceStatus, STATUS_TOPIC};
use firewatch_dispatch::grpc::{Assignment, Emergency};
use firewatch_dispatch::{EmergencyOutcome, Orchestrator};

fn emergency(name: &str, latitude: i32, longitude: i32, magnitude: i64) -> Emergency {
    Emergency {
        name: name.to_string(),
        latitude,
        longitude,
        magnitude,
    }
}

#[tokio::test]
async fn test_fire1_scenario_end_to_end() {
    let node = start_node(test_config(&[("A", 0, 0), ("B", 10, 10)])).await;
    let mut monitoring = node.monitoring_client().await;
    let mut dispatch = node.dispatch_client().await;

    let fire1 = emergency("fire1", 1, 1, 2);
    let stream = monitoring
        .subscribe(fire1.clone())
        .await
        .unwrap()
        .into_inner();

    let reply = dispatch.assign(fire1).await.unwrap().into_inner();
    assert!(reply.assigned);
    assert_eq!(reply.resource_id, "A");
    assert_eq!(reply.message, "Resource A assigned to emergency fire1");

    let updates = collect_updates(stream).await;
    assert_eq!(statuses(&updates), vec!["Apagando", "Apagando", "Extinguido"]);
    assert!(updates
        .iter()
        .all(|u| u.emergency_name == "fire1" && u.resource_id == "A"));

    let a = node
        .wait_for_resource("A", |r| r.status == ResourceStatus::Available)
        .await;
    assert_eq!(a.location, Coordinate::new(1, 1));

    let b = node.resource("B");
    assert_eq!(b.status, ResourceStatus::Available);
    assert_eq!(b.location, Coordinate::new(10, 10));

    node.wait_until_resolved("fire1").await;
    node.stop().await;
}

#[tokio::test]
async fn test_travel_ticks_follow_distance() {
    let node = start_node(test_config(&[("A", 0, 0)])).await;
    let mut monitoring = node.monitoring_client().await;
    let mut dispatch = node.dispatch_client().await;

    // Distance 50 -> 25 travel units -> 5 travel ticks
    let far = emergency("far", 30, 40, 1);
    let stream = monitoring.subscribe(far.clone()).await.unwrap().into_inner();
    assert!(dispatch.assign(far).await.unwrap().into_inner().assigned);

    let updates = collect_updates(stream).await;
    assert_eq!(
        statuses(&updates),
        vec![
            "En camino",
            "En camino",
            "En camino",
            "En camino",
            "En camino",
            "Apagando",
            "Extinguido"
        ]
    );

    let a = node
        .wait_for_resource("A", |r| r.status == ResourceStatus::Available)
        .await;
    assert_eq!(a.location, Coordinate::new(30, 40));
    node.stop().await;
}

#[tokio::test]
async fn test_no_resource_available_leaves_registry_unchanged() {
    let node = start_node(test_config(&[("A", 0, 0)])).await;
    assert!(node.registry.try_reserve("A").unwrap());
    let before = node.registry.find_all().unwrap();

    let mut dispatch = node.dispatch_client().await;
    let reply = dispatch
        .assign(emergency("fire2", 5, 5, 1))
        .await
        .unwrap()
        .into_inner();

    assert!(!reply.assigned);
    assert!(reply.resource_id.is_empty());
    assert_eq!(reply.message, "No resources available");
    assert_eq!(node.registry.find_all().unwrap(), before);
    assert!(!node.dispatcher.is_in_flight("fire2"));
    node.stop().await;
}

#[tokio::test]
async fn test_concurrent_assign_single_resource() {
    let node = start_node(test_config(&[("only", 0, 0)])).await;

    let mut first = node.dispatch_client().await;
    let mut second = node.dispatch_client().await;
    let (a, b) = tokio::join!(
        first.assign(emergency("north", 1, 1, 20)),
        second.assign(emergency("south", -1, -1, 20)),
    );
    let (a, b) = (a.unwrap().into_inner(), b.unwrap().into_inner());

    assert!(a.assigned ^ b.assigned, "exactly one assignment must succeed");
    let winner = if a.assigned { "north" } else { "south" };
    assert_eq!(node.resource("only").status, ResourceStatus::Busy);

    node.wait_until_resolved(winner).await;
    node.wait_for_resource("only", |r| r.status == ResourceStatus::Available)
        .await;
    node.stop().await;
}

#[tokio::test]
async fn test_duplicate_in_flight_emergency_rejected() {
    let node = start_node(test_config(&[("A", 0, 0), ("B", 3, 3)])).await;
    let mut dispatch = node.dispatch_client().await;

    assert!(dispatch
        .assign(emergency("fire1", 1, 1, 20))
        .await
        .unwrap()
        .into_inner()
        .assigned);

    let status = dispatch
        .assign(emergency("fire1", 1, 1, 20))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::AlreadyExists);
    assert_eq!(node.resource("B").status, ResourceStatus::Available);

    node.wait_until_resolved("fire1").await;
    node.stop().await;
}

#[tokio::test]
async fn test_monitoring_filters_other_emergencies() {
    let node = start_node(test_config(&[("A", 0, 0), ("B", 20, 20)])).await;
    let mut monitoring = node.monitoring_client().await;
    let mut dispatch = node.dispatch_client().await;

    let x = emergency("X", 1, 1, 3);
    let y = emergency("Y", 21, 21, 1);
    let stream = monitoring.subscribe(x.clone()).await.unwrap().into_inner();

    assert!(dispatch.assign(y).await.unwrap().into_inner().assigned);
    assert!(dispatch.assign(x).await.unwrap().into_inner().assigned);

    let updates = collect_updates(stream).await;
    assert!(updates.iter().all(|u| u.emergency_name == "X"));
    assert_eq!(
        statuses(&updates),
        vec!["Apagando", "Apagando", "Apagando", "Extinguido"]
    );

    node.wait_until_resolved("Y").await;
    node.stop().await;
}

#[tokio::test]
async fn test_dropped_subscription_releases_receiver() {
    let node = start_node(test_config(&[("A", 0, 0)])).await;
    let mut monitoring = node.monitoring_client().await;
    let base = node.broadcast.subscriber_count(STATUS_TOPIC);

    let abandoned = monitoring
        .subscribe(emergency("abandoned", 1, 1, 1))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(node.broadcast.subscriber_count(STATUS_TOPIC), base + 1);

    drop(abandoned);
    node.wait_for_subscribers(STATUS_TOPIC, base).await;

    // The shared topic keeps serving later subscribers
    let mut dispatch = node.dispatch_client().await;
    let fire = emergency("fire1", 1, 1, 1);
    let stream = monitoring.subscribe(fire.clone()).await.unwrap().into_inner();
    assert!(dispatch.assign(fire).await.unwrap().into_inner().assigned);
    assert_eq!(
        statuses(&collect_updates(stream).await),
        vec!["Apagando", "Extinguido"]
    );

    node.wait_until_resolved("fire1").await;
    node.stop().await;
}

#[tokio::test]
async fn test_subscribe_rejects_empty_name() {
    let node = start_node(test_config(&[("A", 0, 0)])).await;
    let mut monitoring = node.monitoring_client().await;

    let status = monitoring
        .subscribe(emergency("", 0, 0, 1))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    node.stop().await;
}

#[tokio::test]
async fn test_assign_rejects_negative_magnitude() {
    let node = start_node(test_config(&[("A", 0, 0)])).await;
    let mut dispatch = node.dispatch_client().await;

    let status = dispatch
        .assign(emergency("fire1", 0, 0, -3))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert_eq!(node.resource("A").status, ResourceStatus::Available);
    node.stop().await;
}

#[tokio::test]
async fn test_resolve_is_idempotent() {
    let node = start_node(test_config(&[("A", 0, 0)])).await;
    let mut dispatch = node.dispatch_client().await;

    let first = dispatch
        .resolve(emergency("ghost", 0, 0, 0))
        .await
        .unwrap()
        .into_inner();
    let second = dispatch
        .resolve(emergency("ghost", 0, 0, 0))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(first, second);
    assert!(!first.assigned);
    assert_eq!(node.resource("A").status, ResourceStatus::Available);
    node.stop().await;
}

#[tokio::test]
async fn test_execute_requires_reserved_resource() {
    let node = start_node(test_config(&[("A", 0, 0)])).await;
    let mut execution = node.execution_client().await;
    let mut monitoring = node.monitoring_client().await;

    let assignment = Assignment {
        emergency: Some(emergency("manual", 2, 2, 1)),
        resource_id: "A".to_string(),
    };

    let status = execution.execute(assignment.clone()).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);

    let missing = Assignment {
        resource_id: "nobody".to_string(),
        ..assignment.clone()
    };
    let status = execution.execute(missing).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);

    assert!(node.registry.try_reserve("A").unwrap());
    let stream = monitoring
        .subscribe(emergency("manual", 2, 2, 1))
        .await
        .unwrap()
        .into_inner();

    let reply = execution.execute(assignment).await.unwrap().into_inner();
    assert!(reply.started);

    let updates = collect_updates(stream).await;
    assert_eq!(statuses(&updates), vec!["Apagando", "Extinguido"]);

    let a = node
        .wait_for_resource("A", |r| r.status == ResourceStatus::Available)
        .await;
    assert_eq!(a.location, Coordinate::new(2, 2));
    node.stop().await;
}

#[tokio::test]
async fn test_ledger_tracks_assignment_and_completion() {
    let node = start_node(test_config(&[("A", 0, 0)])).await;
    let ledger = node.ledger.clone().expect("Ledger enabled by default");
    let mut monitoring = node.monitoring_client().await;
    let mut dispatch = node.dispatch_client().await;

    let fire = emergency("fire1", 1, 1, 2);
    let stream = monitoring.subscribe(fire.clone()).await.unwrap().into_inner();
    assert!(dispatch.assign(fire).await.unwrap().into_inner().assigned);
    collect_updates(stream).await;

    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    let entry = loop {
        let entries = ledger.find_by_name("fire1").unwrap();
        if let Some(entry) = entries.first().filter(|e| !e.is_active()) {
            break entry.clone();
        }
        assert!(tokio::time::Instant::now() < deadline, "Ledger never recorded completion");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };

    assert_eq!(entry.status, "Extinguido");
    assert_eq!(entry.resource_id, "A");
    assert_eq!((entry.latitude, entry.longitude, entry.magnitude), (1, 1, 2));
    node.stop().await;
}

#[tokio::test]
async fn test_orchestrator_batch_continues_past_failure() {
    let node = start_node(test_config(&[("A", 0, 0), ("B", 4, 4)])).await;

    let batch = vec![
        EmergencyRequest::new("fire1", Coordinate::new(1, 1), 2),
        EmergencyRequest::new("", Coordinate::new(2, 2), 1),
        EmergencyRequest::new("fire3", Coordinate::new(3, 3), 1),
    ];

    let mut orchestrator = Orchestrator::connect(node.url.clone(), WAIT_LIMIT)
        .await
        .unwrap();
    let mut seen = Vec::new();
    let summary = orchestrator
        .run_batch(&batch, |update| seen.push(update.clone()))
        .await;

    assert_eq!(summary.outcomes.len(), 3);
    assert_eq!(summary.extinguished(), 2);
    assert_eq!(summary.failed(), 1);
    assert!(matches!(summary.outcomes[1].1, EmergencyOutcome::Failed(_)));

    // Updates arrive in batch order: all of fire1 before any of fire3
    let first_fire3 = seen.iter().position(|u| u.emergency_name == "fire3").unwrap();
    assert!(seen[..first_fire3].iter().all(|u| u.emergency_name == "fire1"));
    assert_eq!(
        seen.iter().filter(|u| u.status == "Extinguido").count(),
        2
    );
    node.stop().await;
}

#[tokio::test]
async fn test_orchestrator_reports_unassigned() {
    let node = start_node(test_config(&[("A", 0, 0)])).await;
    assert!(node.registry.try_reserve("A").unwrap());

    let batch = serde_json::to_string(&vec![EmergencyRequest::new(
        "fire1",
        Coordinate::new(1, 1),
        1,
    )])
    .unwrap();
    let batch = firewatch_dispatch::parse_batch(&batch).unwrap();

    let mut orchestrator = Orchestrator::connect(node.url.clone(), WAIT_LIMIT)
        .await
        .unwrap();
    let summary = orchestrator.run_batch(&batch, |_| {}).await;

    assert_eq!(
        summary.outcomes,
        vec![("fire1".to_string(), EmergencyOutcome::NoResourceAvailable)]
    );
    node.stop().await;
}
