//! Id blocks handed out across instances never overlap

use std::collections::HashSet;
use std::sync::Arc;

use flowgrid_core::registry::{ClusterRegistry, ControllerRegistry, IdBlock, IdGenerator, InProcessCoordinator};
use flowgrid_core::FlowId;
use proptest::prelude::*;

fn two_instances(block_size: u64) -> (Arc<ClusterRegistry>, Arc<ClusterRegistry>) {
    let coordinator = Arc::new(InProcessCoordinator::new());
    (
        Arc::new(ClusterRegistry::new(coordinator.clone(), block_size)),
        Arc::new(ClusterRegistry::new(coordinator, block_size)),
    )
}

fn assert_disjoint(mut blocks: Vec<IdBlock>) {
    blocks.sort_by_key(|b| b.start);
    for pair in blocks.windows(2) {
        assert!(
            pair[0].end() <= pair[1].start,
            "{:?} overlaps {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test]
async fn test_hundred_blocks_from_two_instances_are_disjoint() {
    let (a, b) = two_instances(1000);
    let mut blocks = Vec::new();
    for i in 0..100 {
        let registry = if i % 2 == 0 { &a } else { &b };
        blocks.push(registry.allocate_unique_id_block().await.unwrap());
    }
    assert!(blocks.iter().all(|b| b.size == 1000));
    assert_disjoint(blocks);
}

#[tokio::test]
async fn test_concurrent_allocations_are_disjoint() {
    let (a, b) = two_instances(64);
    let mut tasks = Vec::new();
    for i in 0..50 {
        let registry = if i % 2 == 0 { a.clone() } else { b.clone() };
        tasks.push(tokio::spawn(async move { registry.allocate_unique_id_block().await }));
    }
    let mut blocks = Vec::new();
    for task in tasks {
        blocks.push(task.await.unwrap().unwrap());
    }
    assert_disjoint(blocks);
}

#[tokio::test]
async fn test_generators_on_two_instances_never_repeat() {
    let (a, b) = two_instances(16);
    let gen_a: IdGenerator<FlowId> = IdGenerator::new(a);
    let gen_b: IdGenerator<FlowId> = IdGenerator::new(b);

    let mut seen = HashSet::new();
    for _ in 0..200 {
        assert!(seen.insert(gen_a.next_id().await.unwrap()));
        assert!(seen.insert(gen_b.next_id().await.unwrap()));
    }
    assert_eq!(seen.len(), 400);
}

proptest! {
    #[test]
    fn prop_interleaved_allocations_are_disjoint(
        block_size in 1u64..10_000,
        picks in prop::collection::vec(any::<bool>(), 1..60),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let blocks = runtime.block_on(async {
            let (a, b) = two_instances(block_size);
            let mut blocks = Vec::new();
            for pick_a in &picks {
                let registry = if *pick_a { &a } else { &b };
                blocks.push(registry.allocate_unique_id_block().await.unwrap());
            }
            blocks
        });
        prop_assert_eq!(blocks.len(), picks.len());
        prop_assert!(blocks.iter().all(|b| b.size == block_size));
        assert_disjoint(blocks);
    }
}
