//! Mastership handover between two controller instances

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect_as_master, features, init_tracing, wait_for_condition, Cluster, RecordingSwitch, TEST_TIMEOUT};
use flowgrid_core::events::ControllerEvent;
use flowgrid_core::registry::{ClusterRegistry, ControlChangeCallback, ControllerRegistry, InProcessCoordinator};
use flowgrid_core::topology::TopologyEvent;
use flowgrid_core::types::Role;
use flowgrid_core::{Dpid, OnosInstanceId};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_standby_takes_over_when_master_disconnects() {
    let cluster = Cluster::new();
    let a = cluster.started("ctrl-a").await;
    let b = cluster.controller("ctrl-b");
    let events = b.subscribe("mastership-test").unwrap();
    b.start().await.unwrap();

    connect_as_master(&a, RecordingSwitch::new(1), 3).await;
    b.switch_connected(RecordingSwitch::new(1), features(1, 3)).await.unwrap();

    let b_ref = &b;
    wait_for_condition(
        || async move {
            b_ref
                .registry()
                .get_all_switches()
                .await
                .map(|all| all.get(&Dpid(1)).map_or(0, |entries| entries.len()))
                .unwrap_or(0)
                == 2
        },
        TEST_TIMEOUT,
    )
    .await
    .unwrap();

    let all = a.registry().get_all_switches().await.unwrap();
    let entries: Vec<(String, bool)> = all[&Dpid(1)]
        .iter()
        .map(|e| (e.controller_id.clone(), e.is_master))
        .collect();
    assert_eq!(
        entries,
        vec![("ctrl-a".to_string(), true), ("ctrl-b".to_string(), false)]
    );
    assert!(!b.registry().has_control(Dpid(1)));
    assert!(b.topology().read().get_switch(Dpid(1)).is_none());

    a.switch_disconnected(Dpid(1)).await;

    wait_for_condition(
        || async move {
            b_ref.registry().has_control(Dpid(1))
                && b_ref.topology().read().get_master(Dpid(1)).map(|id| id.as_str() == "ctrl-b") == Some(true)
        },
        TEST_TIMEOUT,
    )
    .await
    .unwrap();

    assert_eq!(
        b.registry().get_controller_for_switch(Dpid(1)).await.unwrap(),
        Some("ctrl-b".to_string())
    );
    assert_eq!(b.topology().read().get_ports(Dpid(1)).count(), 3);
    assert!(a.topology().read().get_master(Dpid(1)).is_none());

    let mut saw_mastership = false;
    while let Some(event) = events.try_recv() {
        if let ControllerEvent::Topology(TopologyEvent::MastershipChanged(m)) = event {
            if m.dpid == Dpid(1) && m.instance_id.as_str() == "ctrl-b" {
                assert_eq!(m.role, Role::Master);
                saw_mastership = true;
            }
        }
    }
    assert!(saw_mastership);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_second_request_for_same_switch_is_rejected() {
    let cluster = Cluster::new();
    let a = cluster.started("ctrl-a").await;
    connect_as_master(&a, RecordingSwitch::new(2), 1).await;

    let err = a
        .switch_connected(RecordingSwitch::new(2), features(2, 1))
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 409);
    a.shutdown().await;
}

/// Callback that keeps every transition it is told about
#[derive(Default)]
struct Transitions(Mutex<Vec<(Dpid, bool)>>);

impl Transitions {
    fn seen(&self) -> Vec<bool> {
        self.0.lock().iter().map(|(_, has_control)| *has_control).collect()
    }
}

impl ControlChangeCallback for Transitions {
    fn control_changed(&self, dpid: Dpid, has_control: bool) {
        self.0.lock().push((dpid, has_control));
    }
}

async fn registered(coordinator: &Arc<InProcessCoordinator>, id: &str) -> ClusterRegistry {
    let registry = ClusterRegistry::new(coordinator.clone(), 1 << 32);
    registry.register_controller(OnosInstanceId::new(id).unwrap()).await.unwrap();
    registry
}

#[tokio::test]
async fn test_one_callback_per_mastership_transition() {
    init_tracing();
    let coordinator = Arc::new(InProcessCoordinator::new());
    let a = registered(&coordinator, "ctrl-a").await;
    let b = registered(&coordinator, "ctrl-b").await;
    let on_a = Arc::new(Transitions::default());
    let on_b = Arc::new(Transitions::default());

    a.request_control(Dpid(10), on_a.clone()).await.unwrap();
    let on_a_ref = &on_a;
    wait_for_condition(|| async move { on_a_ref.seen() == vec![true] }, TEST_TIMEOUT)
        .await
        .unwrap();
    b.request_control(Dpid(10), on_b.clone()).await.unwrap();

    coordinator.expire_session("ctrl-a");
    let on_b_ref = &on_b;
    wait_for_condition(
        || async move { on_a_ref.seen() == vec![true, false] && on_b_ref.seen() == vec![true] },
        TEST_TIMEOUT,
    )
    .await
    .unwrap();

    // Nothing further trickles in
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(on_a.seen(), vec![true, false]);
    assert_eq!(on_b.seen(), vec![true]);
    assert!(on_a.0.lock().iter().all(|(dpid, _)| *dpid == Dpid(10)));

    // Back in line behind ctrl-b, without a transition of its own
    coordinator.restore_session("ctrl-a");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(on_a.seen(), vec![true, false]);
    assert!(b.has_control(Dpid(10)));

    b.release_control(Dpid(10)).await.unwrap();
    wait_for_condition(|| async move { on_a_ref.seen() == vec![true, false, true] }, TEST_TIMEOUT)
        .await
        .unwrap();
    assert!(a.has_control(Dpid(10)));
    assert_eq!(on_b.seen(), vec![true]);
}
