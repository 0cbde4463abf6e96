//! End-to-end reconciliation scenarios against in-memory and local state.

mod common;

use std::sync::Arc;

use common::{addr, idle, Harness};
use converge::error::{ConvergeError, PlanError};
use converge::planner::{Action, StepStatus};
use converge::state::{Backend, LocalBackend};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

const ENVIRONMENTS: &str = r#"
resources:
  - type: null_env
    name: stage
    for_each: [dev, qa, prod]
    attributes:
      label: "${each.key}"
"#;

const ENVIRONMENTS_WITHOUT_QA: &str = r#"
resources:
  - type: null_env
    name: stage
    for_each: [dev, prod]
    attributes:
      label: "${each.key}"
"#;

#[tokio::test]
async fn test_for_each_removal_destroys_only_the_removed_key() {
    let harness = Harness::new().await;
    let report = assert_ok!(harness.reconciler(ENVIRONMENTS).reconcile(idle()).await);
    assert!(report.is_success());
    assert_eq!(harness.store.list().await.len(), 3);

    let plan = assert_ok!(harness.reconciler(ENVIRONMENTS_WITHOUT_QA).plan().await);
    let action = |a: &str| plan.change(&addr(a)).map(|c| c.action);
    assert_eq!(action(r#"null_env.stage["qa"]"#), Some(Action::Destroy));
    assert_eq!(action(r#"null_env.stage["dev"]"#), Some(Action::NoOp));
    assert_eq!(action(r#"null_env.stage["prod"]"#), Some(Action::NoOp));
    assert_eq!(plan.summary().destroy, 1);

    let report = assert_ok!(
        harness
            .reconciler(ENVIRONMENTS_WITHOUT_QA)
            .apply(&plan, idle())
            .await
    );
    assert!(report.is_success());
    assert!(!harness.store.list().await.contains(&addr(r#"null_env.stage["qa"]"#)));
    assert_eq!(harness.store.list().await.len(), 2);
}

#[tokio::test]
async fn test_protected_orphan_aborts_planning_without_touching_state() {
    let harness = Harness::new().await;
    let protected = r#"
resources:
  - type: null_db
    name: primary
    attributes: {size: 10}
    lifecycle:
      prevent_destroy: true
"#;
    assert_ok!(harness.reconciler(protected).reconcile(idle()).await);
    let before = harness.store.version().await;

    let err = assert_err!(harness.reconciler("resources: []").plan().await);
    assert!(matches!(
        err,
        ConvergeError::Plan(PlanError::PreventDestroyViolation { ref address, .. })
            if address == "null_db.primary"
    ));

    assert_eq!(harness.store.version().await, before);
    assert!(harness.store.get(&addr("null_db.primary")).await.is_some());
}

#[tokio::test]
async fn test_create_before_destroy_replaces_in_order() {
    let harness = Harness::new().await;
    let revision = |image: &str| {
        format!(
            r#"
resources:
  - type: null_vm
    name: web
    attributes:
      image: {image}
    lifecycle:
      force_new: [image]
      create_before_destroy: true
"#
        )
    };

    assert_ok!(harness.reconciler(&revision("v1")).reconcile(idle()).await);

    let reconciler = harness.reconciler(&revision("v2"));
    let plan = assert_ok!(reconciler.plan().await);
    let change = plan.change(&addr("null_vm.web")).unwrap();
    assert_eq!(change.action, Action::Replace);
    assert!(change.create_before_destroy);

    let position = |id: &str| plan.steps.iter().position(|s| s.id.as_str() == id).unwrap();
    assert!(position("null_vm.web#create-shadow") < position("null_vm.web#delete-deposed"));

    let report = assert_ok!(reconciler.apply(&plan, idle()).await);
    assert!(report.is_success(), "{report}");

    let created = harness.recorder.position(r#"create null_vm "v2""#).unwrap();
    let deleted = harness.recorder.position("delete null_vm.web").unwrap();
    assert!(created < deleted, "{:?}", harness.recorder.events());

    assert_eq!(harness.store.list().await.len(), 1);
    let entry = harness.store.get(&addr("null_vm.web")).await.unwrap();
    assert_eq!(entry.attributes["image"], json!("v2"));
    assert!(harness.store.deposed(&addr("null_vm.web")).await.is_empty());
}

#[tokio::test]
async fn test_failed_dependency_blocks_transitive_dependents() {
    let harness = Harness::new().await;
    let document = r#"
resources:
  - type: broken_network
    name: main
    attributes: {cidr: "10.0.0.0/16"}
  - type: null_server
    name: web
    attributes:
      network: "${broken_network.main.id}"
  - type: null_lb
    name: front
    attributes:
      backend: "${null_server.web.id}"
  - type: null_dns
    name: zone
    attributes: {domain: example.com}
"#;

    let report = assert_ok!(harness.reconciler(document).reconcile(idle()).await);
    assert!(!report.is_success());

    let status = |id: &str| report.step(id).map(|s| s.status);
    assert_eq!(status("broken_network.main#create"), Some(StepStatus::Failed));
    assert_eq!(status("null_server.web#create"), Some(StepStatus::Blocked));
    assert_eq!(status("null_lb.front#create"), Some(StepStatus::Blocked));
    assert_eq!(status("null_dns.zone#create"), Some(StepStatus::Succeeded));

    let recorded = harness.store.list().await;
    assert_eq!(recorded.len(), 1);
    assert!(recorded.contains(&addr("null_dns.zone")));
    assert!(!harness.store.holds_lock().await);

    let history = harness.store.snapshot().await.history;
    assert!(!history.last().unwrap().success);
}

#[tokio::test]
async fn test_second_plan_is_all_no_op() {
    let harness = Harness::new().await;
    let document = r#"
resources:
  - type: null_network
    name: main
    attributes: {cidr: "10.0.0.0/16"}
  - type: null_server
    name: web
    count: 3
    attributes:
      network: "${null_network.main.id}"
      index: "${count.index}"
  - type: null_lb
    name: front
    attributes:
      backends: "${null_server.web.id}"
  - type: null_marker
    name: rollout
    kind: trigger
    attributes:
      lb: "${null_lb.front.id}"
"#;

    let reconciler = harness.reconciler(document);
    let report = assert_ok!(reconciler.reconcile(idle()).await);
    assert!(report.is_success(), "{report}");
    assert_eq!(harness.store.list().await.len(), 6);

    let plan = assert_ok!(reconciler.plan().await);
    assert!(plan.is_empty(), "{plan}");
    assert!(plan.changes.iter().all(|c| c.action == Action::NoOp));
    assert_eq!(plan.changes.len(), 6);
}

#[tokio::test]
async fn test_local_state_survives_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let document = r#"
resources:
  - type: null_bucket
    name: assets
    for_each:
      eu: {region: eu-west-1}
      us: {region: us-east-1}
    attributes:
      region: "${each.value.region}"
"#;

    {
        let backend = Arc::new(LocalBackend::with_base_dir(dir.path()));
        let harness = Harness::with_backend(backend).await;
        let report = assert_ok!(harness.reconciler(document).reconcile(idle()).await);
        assert!(report.is_success());
    }

    let harness = Harness::with_backend(Arc::new(LocalBackend::with_base_dir(dir.path()))).await;
    let entry = harness.store.get(&addr(r#"null_bucket.assets["eu"]"#)).await.unwrap();
    assert_eq!(entry.attributes["region"], json!("eu-west-1"));

    let plan = assert_ok!(harness.reconciler(document).plan().await);
    assert!(plan.is_empty());
}

#[tokio::test]
async fn test_quoted_for_each_key_survives_reloading_state() {
    let dir = tempfile::tempdir().unwrap();
    let document = r#"
resources:
  - type: null_env
    name: stage
    for_each: ['a"b', 'c\d']
"#;

    let backend = Arc::new(LocalBackend::with_base_dir(dir.path()));
    let harness = Harness::with_backend(backend.clone()).await;
    let report = assert_ok!(harness.reconciler(document).reconcile(idle()).await);
    assert!(report.is_success());

    let snapshot = assert_ok!(backend.load().await).unwrap();
    assert!(snapshot.entries.contains_key(&addr(r#"null_env.stage["a\"b"]"#)));
    assert!(snapshot.entries.contains_key(&addr(r#"null_env.stage["c\\d"]"#)));

    let reopened = Harness::with_backend(Arc::new(LocalBackend::with_base_dir(dir.path()))).await;
    let plan = assert_ok!(reopened.reconciler(document).plan().await);
    assert!(plan.is_empty());
}

#[tokio::test]
async fn test_in_place_update_leaves_dependents_alone() {
    let harness = Harness::new().await;
    let revision = |cidr: &str| {
        format!(
            r#"
resources:
  - type: null_network
    name: main
    attributes:
      cidr: "{cidr}"
  - type: null_server
    name: web
    attributes:
      network: "${{null_network.main.id}}"
    lifecycle:
      force_new: [network]
      prevent_destroy: true
"#
        )
    };

    assert_ok!(harness.reconciler(&revision("10.0.0.0/16")).reconcile(idle()).await);

    let reconciler = harness.reconciler(&revision("10.1.0.0/16"));
    let plan = assert_ok!(reconciler.plan().await);
    let action = |a: &str| plan.change(&addr(a)).map(|c| c.action);
    assert_eq!(action("null_network.main"), Some(Action::Update));
    assert_eq!(action("null_server.web"), Some(Action::NoOp));

    let report = assert_ok!(reconciler.apply(&plan, idle()).await);
    assert!(report.is_success(), "{report}");
    assert_eq!(harness.recorder.position("delete"), None);
    assert!(harness.recorder.position("update null_network.main").is_some());
    assert!(assert_ok!(reconciler.plan().await).is_empty());
}
