//! Scenario 3 (spec.md §8): three-node causal reliable broadcast under
//! lossy links. The simulated bus applies one loss rate across every link
//! rather than singling out one pair, which only makes convergence harder,
//! not easier, than the scenario as stated.

mod common;

use std::time::Duration;

use distcore::{
    bus::{Bus, BusConfig},
    crb,
    event::{SendEvent, Session},
    node::NodeId,
    transport::BusNet,
};

#[tokio::test(start_paused = true)]
async fn three_node_broadcast_converges_despite_loss() {
    let bus = Bus::new(
        BusConfig {
            max_delay_time_units: 2.0,
            loss_rate: 0.3,
            ..Default::default()
        },
        distcore::time::Clock::with_unit(Duration::from_millis(5)),
        42,
    );

    let ids = [NodeId::from("1"), NodeId::from("2"), NodeId::from("3")];
    let mut submits = Vec::new();
    let mut upcall_rxs = Vec::new();
    let mut tasks = Vec::new();

    for (i, id) in ids.iter().enumerate() {
        let (upcall, upcalls) = tokio::sync::mpsc::unbounded_channel::<String>();
        let node = crb::Node::new(
            id.clone(),
            ids.to_vec(),
            100 + i as u64,
            BusNet::new(bus.clone(), id.clone()),
            upcall,
        );
        let mut session = Session::<crb::Event>::new();
        let sender = session.sender();
        common::pump(bus.clone(), id.clone(), session.sender(), crb::Event::Recv);
        let mut node = node;
        let task = tokio::spawn(async move {
            let _ = session.run(&mut node).await;
        });
        submits.push(sender);
        upcall_rxs.push(upcalls);
        tasks.push(task);
    }

    submits[0].send(crb::Event::Submit("x".to_string())).unwrap();

    tokio::time::advance(Duration::from_secs(5)).await;

    for upcalls in upcall_rxs.iter_mut() {
        let delivered = upcalls.recv().await.expect("every node eventually delivers");
        assert_eq!(delivered, "x");
        // delivered exactly once: a second recv must not also yield "x" immediately.
        assert!(upcalls.try_recv().is_err());
    }

    for task in tasks {
        task.abort();
    }
}
