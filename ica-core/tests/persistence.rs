mod common;

use std::collections::BTreeSet;
use std::path::Path;

use ica_core::persist::PersistedOperation;
use ica_core::{
    IcaNode, LauncherHandle, NodeState, SubprocessorId, ThreadLauncher, TrainingOutcome,
    TrainingRequest,
};

use common::*;

fn id() -> SubprocessorId {
    SubprocessorId::new(1, 0)
}

fn node(root: &Path, channels: usize) -> IcaNode {
    let node = IcaNode::new(
        config(root),
        LauncherHandle::new(ThreadLauncher::new(kurtosis_solver)),
    );
    node.update_topology(&layout(1, channels));
    node
}

/// A node with a trained operation rejecting component 1 only.
fn trained(root: &Path) -> IcaNode {
    let node = node(root, NUM_CHANNELS);
    let mut applier = node.realtime_applier();
    node.start_training(TrainingRequest::new(id(), ENABLED))
        .unwrap();
    feed(&mut applier, 0, 2_000, 256);
    let outcome = node.wait_for_training().unwrap();
    assert!(matches!(outcome, TrainingOutcome::Installed { .. }), "{outcome:?}");
    node.set_component_rejected(id(), 0, false).unwrap();
    node.set_component_rejected(id(), 1, true).unwrap();
    node
}

#[test]
fn saved_state_restores_operation_and_selection() {
    let root = tempfile::tempdir().unwrap();
    let original = trained(root.path());
    let saved = original.save_state();
    assert_eq!(saved.training_duration_secs, Some(4.0));
    assert_eq!(saved.subprocessors.len(), 1);
    assert_eq!(saved.subprocessors[0].rejected_components, vec![1]);

    let json = saved.to_json().unwrap();
    let state = NodeState::from_json(&json).unwrap();
    assert_eq!(state, saved);

    let restored = node(root.path(), NUM_CHANNELS);
    restored.set_training_duration(1.0);
    let report = restored.restore_state(&state);
    assert_eq!(report.restored, vec![id()]);
    assert!(report.failed.is_empty());
    assert_eq!(restored.config().training_duration_secs, 4.0);

    let a = original.operation(id()).unwrap();
    let b = restored.operation(id()).unwrap();
    assert_eq!(b.config_path, a.config_path);
    assert_eq!(b.operation.enabled_channels(), a.operation.enabled_channels());
    assert_eq!(b.operation.mixing(), a.operation.mixing());
    assert_eq!(b.operation.unmixing(), a.operation.unmixing());
    assert_eq!(b.operation.rejected_components(), &BTreeSet::from([1]));
}

#[test]
fn out_of_range_selection_falls_back_to_first_component() {
    let root = tempfile::tempdir().unwrap();
    let mut state = trained(root.path()).save_state();
    state.subprocessors[0].rejected_components = vec![1, 5];

    let restored = node(root.path(), NUM_CHANNELS);
    let report = restored.restore_state(&state);
    assert_eq!(report.restored, vec![id()]);
    let op = restored.operation(id()).unwrap().operation;
    assert_eq!(op.rejected_components(), &BTreeSet::from([0]));
}

#[test]
fn unreadable_run_leaves_subprocessor_as_noop() {
    let root = tempfile::tempdir().unwrap();
    let state = NodeState {
        training_duration_secs: None,
        subprocessors: vec![PersistedOperation {
            subprocessor: id(),
            config_path: root.path().join("missing").join("binica.sc"),
            rejected_components: vec![0],
        }],
    };
    let node = node(root.path(), NUM_CHANNELS);
    let report = node.restore_state(&state);
    assert!(report.restored.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, id());
    assert!(report.failed[0].1.contains("binica.sc"));
    assert!(node.operation(id()).unwrap().operation.is_noop());
}

#[test]
fn run_needing_more_channels_is_refused() {
    let root = tempfile::tempdir().unwrap();
    let state = trained(root.path()).save_state();

    // enabled channels 1 and 3 cannot exist on a 2-channel subprocessor
    let narrow = node(root.path(), 2);
    let report = narrow.restore_state(&state);
    assert_eq!(report.failed.len(), 1);
    assert!(narrow.operation(id()).unwrap().operation.is_noop());
}

#[test]
fn load_operation_recomputes_missing_derived_matrices() {
    let root = tempfile::tempdir().unwrap();
    let original = trained(root.path());
    let config_path = original.current_operation_path(id()).unwrap();
    let dir = config_path.parent().unwrap();
    std::fs::remove_file(dir.join("mixing.bin")).unwrap();
    std::fs::remove_file(dir.join("unmixing.bin")).unwrap();

    let fresh = node(root.path(), NUM_CHANNELS);
    fresh.load_operation(id(), &config_path, &[1]).unwrap();
    assert!(dir.join("mixing.bin").is_file());

    let a = original.operation(id()).unwrap().operation;
    let b = fresh.operation(id()).unwrap().operation;
    for (x, y) in a.mixing().iter().zip(b.mixing().iter()) {
        assert!((x - y).abs() < 1e-5);
    }
    assert_eq!(b.rejected_components(), &BTreeSet::from([1]));
    assert_eq!(fresh.current_operation_path(id()), Some(config_path));
}
