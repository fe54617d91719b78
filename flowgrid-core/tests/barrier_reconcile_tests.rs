//! Acknowledgement of pushed entries through barrier replies

mod common;

use std::sync::Arc;

use common::{connect_as_master, wait_for_condition, Cluster, RecordingSwitch, TEST_TIMEOUT};
use flowgrid_core::flows::{FlowEntry, FlowPath, FlowPathState, SwitchState};
use flowgrid_core::openflow::{Action, FlowModCommand, Match};
use flowgrid_core::pusher::PendingEntry;
use flowgrid_core::{Controller, Dpid, MacAddress, PortNumber, SwitchPort};
use pretty_assertions::assert_eq;

fn path() -> FlowPath {
    let flow_match = Match {
        in_port: Some(PortNumber(1)),
        dl_dst: Some(MacAddress::from_u64(0xbb)),
        ..Match::default()
    };
    FlowPath::new("reconcile", SwitchPort::new(1u64, 1u32), SwitchPort::new(1u64, 2u32))
        .with_entry(FlowEntry::new(1u64, flow_match, vec![Action::output(PortNumber(2))]))
}

fn answer_barriers(controller: &Controller, switch: &RecordingSwitch) {
    for xid in switch.barrier_xids() {
        controller.barrier_reply(Dpid(1), xid);
    }
}

#[tokio::test]
async fn test_add_add_delete_leaves_nothing_behind() {
    let cluster = Cluster::new();
    let controller = cluster.started("ctrl-a").await;
    let switch = RecordingSwitch::new(1);
    connect_as_master(&controller, switch.clone(), 2).await;

    let flow_id = controller.flows().add_flow(path()).await.unwrap();
    controller.synchronizer().synchronize(Dpid(1)).await.unwrap();

    // A second ADD of the same rule
    let entry = controller.flows().get_flow(flow_id).await.unwrap().unwrap().entries[0].clone();
    let pending = PendingEntry {
        flow_entry_id: entry.flow_entry_id.unwrap(),
        user_state: entry.user_state,
    };
    controller
        .pusher()
        .push_flow_entry(Dpid(1), entry.to_flow_mod(), pending)
        .unwrap();

    controller.flows().delete_flow(flow_id).await.unwrap();
    let deleting = controller.flows().get_flow(flow_id).await.unwrap().unwrap();
    assert_eq!(deleting.state, FlowPathState::Deleting);
    controller.synchronizer().synchronize(Dpid(1)).await.unwrap();

    let switch_ref = &switch;
    wait_for_condition(
        || async move {
            switch_ref
                .flow_mods()
                .iter()
                .any(|fm| fm.command == FlowModCommand::DeleteStrict)
        },
        TEST_TIMEOUT,
    )
    .await
    .unwrap();
    assert_eq!(switch.flow_mods()[0].command, FlowModCommand::Add);

    let controller_ref: &Arc<Controller> = &controller;
    wait_for_condition(
        || async move {
            answer_barriers(controller_ref, switch_ref);
            matches!(controller_ref.flows().get_flow(flow_id).await, Ok(None))
        },
        TEST_TIMEOUT,
    )
    .await
    .unwrap();

    assert!(controller.flows().get_flow(flow_id).await.unwrap().is_none());
    assert!(controller.flows().entries_for_switch(Dpid(1)).await.unwrap().is_empty());
    assert!(controller.flows().get_all_flows().await.unwrap().is_empty());
    controller.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_barrier_keeps_entries_pending() {
    let cluster = Cluster::new();
    let controller = cluster.started("ctrl-a").await;
    let switch = RecordingSwitch::new(1);
    connect_as_master(&controller, switch.clone(), 2).await;

    let flow_id = controller.flows().add_flow(path()).await.unwrap();
    controller.synchronizer().synchronize(Dpid(1)).await.unwrap();

    let switch_ref = &switch;
    wait_for_condition(|| async move { !switch_ref.barrier_xids().is_empty() }, TEST_TIMEOUT)
        .await
        .unwrap();
    let flow = controller.flows().get_flow(flow_id).await.unwrap().unwrap();
    assert_eq!(flow.state, FlowPathState::Installing);
    assert_eq!(flow.entries[0].switch_state, SwitchState::NotUpdated);

    answer_barriers(&controller, &switch);
    let controller_ref = &controller;
    wait_for_condition(
        || async move {
            controller_ref
                .flows()
                .get_flow(flow_id)
                .await
                .ok()
                .flatten()
                .map(|f| f.state == FlowPathState::Installed)
                .unwrap_or(false)
        },
        TEST_TIMEOUT,
    )
    .await
    .unwrap();
    controller.shutdown().await;
}
