// Cross-module scenario tests for the execution tree, variables, suspension and projection

use std::sync::Arc;

use chrono::Utc;
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::models::{
    ActivityId, AsyncMarker, CommandContext, DependentEntityRef, ExecutionId, FixedClock,
    ProcessDefinitionRef, TypedValue,
};
use crate::ProcessEngineError;

fn new_tree() -> (ExecutionTree, CommandContext) {
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let tree = ExecutionTree::start(ProcessDefinitionRef::new("scenario", 1), None, clock.clone());
    (tree, CommandContext::new(clock).with_actor("tester"))
}

/// Builds a tree of `depth` levels, alternating scope and non-scope
/// executions, `width` children per node
fn build(tree: &mut ExecutionTree, width: usize, depth: usize) -> Vec<ExecutionId> {
    let mut all = vec![tree.root_id()];
    let mut frontier = vec![tree.root_id()];
    for level in 0..depth {
        let mut next = Vec::new();
        for parent in &frontier {
            for i in 0..width {
                let child = tree.create_child(parent, level % 2 == 0, width > 1).unwrap();
                tree.move_activity_marker(&child, Some(ActivityId::new(format!("a{}_{}", level, i))), None)
                    .unwrap();
                next.push(child);
            }
        }
        all.extend(next.iter().copied());
        frontier = next;
    }
    all
}

#[test]
fn scenario_scoped_set_updates_root_slot() {
    let (mut tree, _) = new_tree();
    let r = tree.root_id();
    tree.set_variable_local(&r, "x", TypedValue::from(1)).unwrap();
    let c = tree.create_child(&r, false, false).unwrap();

    assert_eq!(tree.get_variable(&c, "x").unwrap().unwrap().value, TypedValue::from(1));

    tree.set_variable(&c, "x", TypedValue::from(2)).unwrap();
    assert_eq!(tree.get_variable(&r, "x").unwrap().unwrap().value, TypedValue::from(2));
    assert_eq!(tree.get_variables_local(&r).unwrap().len(), 1);
}

#[tokio::test]
async fn scenario_suspended_branch_refuses_end_but_accepts_variables() {
    let (mut tree, ctx) = new_tree();
    let controller = SuspensionController::new(Arc::new(InMemoryDependentEntities::new()));
    let r = tree.root_id();
    let c = tree.create_child(&r, false, false).unwrap();

    assert_ok!(controller.suspend(&mut tree, &r, &ctx).await);
    let err = assert_err!(tree.end(&c));
    assert!(matches!(err, ProcessEngineError::SuspendedEntityInteraction { .. }));
    assert_ok!(tree.set_variable(&c, "comment", TypedValue::from("looked at it")));

    assert_ok!(controller.activate(&mut tree, &r, &ctx).await);
    assert_ok!(tree.end(&c));
}

#[test]
fn scenario_concurrent_siblings_project_separately() {
    let (mut tree, _) = new_tree();
    let r = tree.root_id();
    let p = tree.create_child(&r, false, false).unwrap();
    let c1 = tree.create_child(&p, false, true).unwrap();
    let c2 = tree.create_child(&p, false, true).unwrap();
    for c in [c1, c2] {
        tree.move_activity_marker(&c, Some(ActivityId::from("task")), None).unwrap();
    }

    let projected = InstanceTreeProjector::new().project(&tree).unwrap();
    let tasks = projected.find_by_activity("task");
    assert_eq!(tasks.len(), 2);
    assert_ne!(tasks[0].id(), tasks[1].id());

    // creation order is kept
    let first = projected.activity_instance(tasks[0].id()).unwrap();
    assert_eq!(first.execution_ids, vec![c1]);
}

#[test]
fn scenario_async_before_projects_as_transition() {
    let (mut tree, _) = new_tree();
    let r = tree.root_id();
    let n = tree.create_child(&r, true, false).unwrap();
    tree.move_activity_marker(&n, Some(ActivityId::from("service")), Some(AsyncMarker::Before))
        .unwrap();

    let projected = InstanceTreeProjector::new().project(&tree).unwrap();
    let found = projected.find_by_activity("service");
    assert_eq!(found.len(), 1);
    assert!(found[0].is_transition());
    assert_eq!(projected.activity_instances().len(), 1);
}

#[test]
fn incidents_attach_to_every_instance_at_an_activity() {
    let (mut tree, _) = new_tree();
    let r = tree.root_id();
    for marker in [None, Some(AsyncMarker::After)] {
        let c = tree.create_child(&r, false, true).unwrap();
        tree.move_activity_marker(&c, Some(ActivityId::from("charge")), marker).unwrap();
    }

    let mut projected = InstanceTreeProjector::new().project(&tree).unwrap();
    assert_eq!(projected.attach_incident("charge", "incident-7"), 2);
    assert_eq!(projected.attach_incident("elsewhere", "incident-8"), 0);
    assert!(projected
        .transition_instances()
        .iter()
        .all(|t| t.incident_ids == vec!["incident-7".to_string()]));
}

#[test]
fn property_nearest_scope_wins_at_every_depth() {
    for (width, depth) in [(1, 1), (1, 4), (2, 3), (3, 2)] {
        let (mut tree, _) = new_tree();
        let nodes = build(&mut tree, width, depth);
        let r = tree.root_id();
        tree.set_variable_local(&r, "v", TypedValue::from("root")).unwrap();

        for node in &nodes {
            let scope = tree.owning_scope(node).unwrap();
            if scope != r {
                tree.set_variable_local(&scope, "v", TypedValue::from(scope.to_string())).unwrap();
            }
        }

        for node in &nodes {
            let expected = tree.scope_chain(node).unwrap()[0];
            let (found_in, _) = tree.find_variable(node, "v").unwrap().unwrap();
            assert_eq!(found_in, expected);
        }
        // shadowing never touched the root slot
        assert_eq!(tree.get_variable_local(&r, "v").unwrap().unwrap().value, TypedValue::from("root"));
        assert_eq!(tree.get_variable_local(&r, "v").unwrap().unwrap().revision, 1);
    }
}

#[tokio::test]
async fn property_cascade_is_total_and_idempotent() {
    for (width, depth) in [(1, 3), (2, 3), (3, 2)] {
        let (mut tree, ctx) = new_tree();
        let registry = Arc::new(InMemoryDependentEntities::new());
        let controller = SuspensionController::new(registry.clone());
        let nodes = build(&mut tree, width, depth);
        for (i, node) in nodes.iter().enumerate().skip(1) {
            registry.attach(&mut tree, node, DependentEntityRef::job(format!("job-{}", i))).unwrap();
        }
        let r = tree.root_id();

        controller.suspend(&mut tree, &r, &ctx).await.unwrap();
        let once: Vec<_> = nodes.iter().map(|n| tree.get(n).unwrap().suspension).collect();
        assert!(nodes.iter().all(|n| tree.get(n).unwrap().is_suspended()));
        assert!(nodes.iter().skip(1).all(|n| tree.get(n).unwrap().dependents_synced));

        controller.suspend(&mut tree, &r, &ctx).await.unwrap();
        let twice: Vec<_> = nodes.iter().map(|n| tree.get(n).unwrap().suspension).collect();
        assert_eq!(once, twice);

        controller.activate(&mut tree, &r, &ctx).await.unwrap();
        assert!(nodes.iter().all(|n| !tree.get(n).unwrap().is_suspended()));
        for i in 1..nodes.len() {
            assert_eq!(registry.is_suspended(&format!("job-{}", i)), Some(false));
        }
    }
}

#[test]
fn property_end_requires_all_children_ended() {
    let (mut tree, _) = new_tree();
    let nodes = build(&mut tree, 2, 3);

    // ancestors refuse to end while any descendant is active
    for node in &nodes {
        if !tree.get(node).unwrap().children.is_empty() {
            assert!(matches!(
                tree.end(node),
                Err(ProcessEngineError::InvalidTreeOperation { .. })
            ));
        }
    }
    // deepest first always succeeds
    for node in nodes.iter().rev() {
        tree.end(node).unwrap();
    }
    assert!(tree.is_ended());
}

#[test]
fn property_projection_never_lists_non_scope_levels_or_settled_async_nodes() {
    let (mut tree, _) = new_tree();
    let nodes = build(&mut tree, 2, 3);
    // put every third node into an async continuation
    for node in nodes.iter().skip(1).step_by(3) {
        let activity = tree.get(node).unwrap().activity.clone();
        tree.move_activity_marker(node, activity, Some(AsyncMarker::Before)).unwrap();
    }

    let projected = InstanceTreeProjector::new().project(&tree).unwrap();
    for node in nodes.iter().skip(1) {
        let n = tree.get(node).unwrap();
        let as_activity = projected
            .activity_instances()
            .iter()
            .find(|a| a.execution_ids.first() == Some(node) && a.parent_activity_instance_id.is_some());
        if n.is_transitioning() {
            assert!(as_activity.is_none());
            assert!(projected.transition_instance(&node.to_string()).is_some());
        } else {
            let instance = as_activity.unwrap();
            if !n.is_scope {
                assert!(instance.child_activity_instance_ids.is_empty());
                assert!(instance.child_transition_instance_ids.is_empty());
            }
        }
    }
}
