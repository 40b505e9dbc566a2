use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

use rex_transport::config::NodeConfig;
use rex_transport::scheduler::{build_command, JobQueue, JobSpec, NodePool, NodeStatus};
use rex_transport::TransportError;

fn pool(n: usize) -> NodePool {
    NodePool::new(
        (0..n)
            .map(|i| NodeConfig::new(format!("node{}", i), 8))
            .collect(),
    )
    .unwrap()
}

#[test]
fn test_queue_is_fifo_and_deduplicated() {
    let mut queue = JobQueue::new();

    assert!(queue.push(0));
    assert!(queue.push(1));
    assert!(queue.push(2));
    assert!(!queue.push(1));
    assert_eq!(queue.len(), 3);

    assert_eq!(queue.pop(), Some(0));
    assert!(queue.push_front(0));
    assert_eq!(queue.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
}

#[test]
fn test_pool_assignment_cycle() {
    let mut pool = pool(2);
    let mut queue = JobQueue::new();
    for r in 0..3 {
        queue.push(r);
    }

    // Fill every idle node from the head of the queue.
    while let Some(node) = pool.available_node() {
        let replica = queue.pop().unwrap();
        assert!(pool.mark_busy(node, replica));
    }

    assert_eq!(queue.len(), 1);
    assert_eq!(queue.peek(), Some(2));
    assert!(pool.idle_nodes().is_empty());

    let mut assigned: Vec<_> = pool.busy_nodes().into_iter().map(|(_, r)| r).collect();
    assigned.sort();
    assert_eq!(assigned, vec![0, 1]);

    let node = pool
        .busy_nodes()
        .into_iter()
        .find(|(_, r)| *r == 1)
        .map(|(n, _)| n)
        .unwrap();
    assert_eq!(pool.free(node), Some(1));
    assert_eq!(pool.available_node(), Some(node));
}

#[test]
fn test_no_double_booking() {
    let mut pool = pool(1);

    assert!(pool.mark_busy(0, 4));
    assert!(!pool.mark_busy(0, 5));
    assert_eq!(pool.status(0), Some(NodeStatus::Busy(4)));

    assert_eq!(pool.free(0), Some(4));
    assert_eq!(pool.free(0), None);
    assert!(!pool.mark_busy(3, 1));
}

#[test]
fn test_pool_rejects_out_of_range_slot() {
    let nodes = vec![
        NodeConfig::new("knl0", 2).with_arch("knl"),
        NodeConfig::new("knl1", 2)
            .with_slot(u32::MAX / 2 + 1)
            .with_arch("knl"),
    ];
    assert!(matches!(
        NodePool::new(nodes),
        Err(TransportError::InvalidConfig(_))
    ));
}

#[test]
fn test_idle_node_choice_is_spread() {
    let pool = pool(4);
    let mut rng = StdRng::seed_from_u64(7);
    let mut counts: HashMap<usize, usize> = HashMap::new();

    for _ in 0..4000 {
        let node = pool.available_node_with(&mut rng).unwrap();
        *counts.entry(node).or_default() += 1;
    }

    assert_eq!(counts.len(), 4);
    for count in counts.values() {
        assert!(*count > 700, "skewed choice: {:?}", counts);
    }
}

#[test]
fn test_only_idle_nodes_are_chosen() {
    let mut pool = pool(3);
    pool.mark_busy(0, 0);
    pool.mark_busy(2, 1);

    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..100 {
        assert_eq!(pool.available_node_with(&mut rng), Some(1));
    }
}

#[test]
fn test_command_placement_per_architecture() {
    let spec = JobSpec::new("impact", "/work").with_io("r0.inp", "r0.log", "r0.err");
    let command = spec.command();
    assert_eq!(command, "impact r0.inp > r0.log 2> r0.err");

    let plain = NodeConfig::new("n1", 4);
    assert_eq!(
        build_command(&plain, &command, None),
        "export OMP_NUM_THREADS=4;impact r0.inp > r0.log 2> r0.err"
    );

    let knl = NodeConfig::new("n2", 8).with_arch("-knl").with_slot(2);
    assert_eq!(
        build_command(&knl, &command, Some("/tmp/r0")),
        "cd /tmp/r0 ; numactl -C 16-23 impact r0.inp > r0.log 2> r0.err"
    );

    let knc = NodeConfig::new("mic0", 8).with_arch("-knc").with_slot(1);
    assert_eq!(
        build_command(&knc, &command, Some("/tmp/r0")),
        "export KMP_PLACE_THREADS=2C,4T,2O ; cd /tmp/r0 ; impact r0.inp > r0.log 2> r0.err"
    );
}
