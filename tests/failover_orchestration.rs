use colo::sim::{SimEvent, SimNode};
use colo::{
    CheckpointConfig, FailoverOrchestrator, FailoverSignal, Role, SessionState, SessionStatus,
    Takeover, VmControl,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn orchestrator_for(role: Role, node: &SimNode) -> (Arc<SessionState>, FailoverOrchestrator) {
    let state = Arc::new(SessionState::new(
        role,
        &CheckpointConfig::default(),
        Arc::new(FailoverSignal::new()),
    ));
    state.set_status(SessionStatus::Active);
    let orchestrator = FailoverOrchestrator::new(state.clone(), node.collaborators());
    (state, orchestrator)
}

#[test]
fn secondary_promotion_waits_for_device_state_apply() {
    let node = SimNode::new(4);
    let (state, orchestrator) = orchestrator_for(Role::Secondary, &node);
    let start = Instant::now();
    state.loading().set();

    let loader = {
        let state = state.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let cleared_at = start.elapsed();
            state.loading().clear();
            cleared_at
        })
    };

    thread::sleep(Duration::from_millis(5));
    assert!(state.failover().request());
    let takeover = orchestrator.execute();
    let promoted_at = start.elapsed();
    let cleared_at = loader.join().unwrap();

    assert!(promoted_at >= Duration::from_millis(20));
    assert!(promoted_at >= cleared_at);
    assert_eq!(takeover.role, Role::Secondary);
    assert!(state.failover().is_completed());
    assert!(!state.loading().is_set());
}

#[test]
fn execute_runs_promotion_once() {
    let node = SimNode::new(4);
    let (state, orchestrator) = orchestrator_for(Role::Secondary, &node);
    state.failover().request();

    let first = orchestrator.execute();
    let second = orchestrator.execute();

    assert_eq!(first, second);
    assert_eq!(orchestrator.completed(), Some(first));
    assert_eq!(node.events.count(&SimEvent::StorageStop { failover: true }), 1);
    assert_eq!(node.events.count(&SimEvent::OracleFailover), 1);
    assert_eq!(node.events.count(&SimEvent::VmStart), 1);
}

#[test]
fn primary_promotion_resumes_standalone() {
    let node = SimNode::new(4);
    node.machine.start();
    let (state, orchestrator) = orchestrator_for(Role::Primary, &node);
    state.failover().request();

    let takeover = orchestrator.execute();

    assert_eq!(
        takeover,
        Takeover {
            role: Role::Primary,
            applied_checkpoints: 0,
            resumed_locally: true,
        }
    );
    assert_eq!(state.status(), SessionStatus::Completed);
    assert!(node.machine.is_running());
    assert_eq!(
        node.events.events(),
        vec![
            SimEvent::VmStart,
            SimEvent::VmStop,
            SimEvent::NetworkRevert(Role::Primary),
            SimEvent::StorageStop { failover: true },
            SimEvent::VmStart,
        ]
    );
}

#[test]
fn failed_setup_status_survives_promotion() {
    let node = SimNode::new(4);
    let (state, orchestrator) = orchestrator_for(Role::Primary, &node);
    state.set_status(SessionStatus::Failed);
    state.failover().request();

    orchestrator.execute();

    assert_eq!(state.status(), SessionStatus::Failed);
    assert!(state.failover().is_completed());
}

#[test]
fn secondary_handoff_leaves_the_vm_stopped() {
    let node = SimNode::new(4);
    node.machine.start();
    let (tx, rx) = mpsc::channel();
    let (state, orchestrator) = orchestrator_for(Role::Secondary, &node);
    let orchestrator = orchestrator.with_handoff(tx);
    state.failover().request();

    let takeover = orchestrator.execute();

    assert_eq!(rx.try_recv().unwrap(), takeover);
    assert!(!takeover.resumed_locally);
    assert!(!node.machine.is_running());
    assert_eq!(node.events.count(&SimEvent::VmStart), 1);
    assert!(node
        .events
        .events()
        .contains(&SimEvent::NetworkRevert(Role::Secondary)));
}

#[test]
fn dropped_handoff_falls_back_to_local_resume() {
    let node = SimNode::new(4);
    let (tx, rx) = mpsc::channel();
    drop(rx);
    let (state, orchestrator) = orchestrator_for(Role::Secondary, &node);
    let orchestrator = orchestrator.with_handoff(tx);
    state.failover().request();

    let takeover = orchestrator.execute();

    assert!(takeover.resumed_locally);
    assert!(node.machine.is_running());
}
