use podpatcher::podpatcher::k8s::pod::PodRef;
use podpatcher::podpatcher::k8s::store::{ApplyOptions, InMemoryPodStore, PodStore, StoreError};
use podpatcher::podpatcher::test_support::{container, named_pod, TEST_NAMESPACE};
use serde_json::json;

fn seeded() -> (InMemoryPodStore, PodRef) {
    let store = InMemoryPodStore::new();
    let key = store
        .insert(named_pod(
            "agent",
            vec![container("c1", "v1"), container("c2", "v1")],
            vec![container("init", "i1")],
        ))
        .expect("seed");
    (store, key)
}

#[test]
fn insert_assigns_namespace_and_version() {
    let (store, key) = seeded();
    assert_eq!(key, PodRef::new(Some(TEST_NAMESPACE), "agent"));
    let pod = store.get(&key).expect("pod");
    assert_eq!(pod.metadata.resource_version.as_deref(), Some("1"));
}

#[test]
fn get_missing_pod_is_not_found() {
    let (store, _) = seeded();
    let err = store
        .get(&PodRef::new(Some(TEST_NAMESPACE), "ghost"))
        .expect_err("missing");
    assert!(err.is_not_found());
    assert!(!err.is_conflict());
}

#[test]
fn patch_for_another_pod_is_invalid() {
    let (store, key) = seeded();
    let patch = json!({
        "kind": "Pod",
        "metadata": {"name": "other", "namespace": TEST_NAMESPACE},
        "spec": {"containers": [{"name": "c1", "image": "v2"}]}
    });
    let err = store
        .apply(&key, &patch, &ApplyOptions::default())
        .expect_err("wrong target");
    assert!(matches!(err, StoreError::Invalid(_)), "{err}");
}

#[test]
fn blank_field_manager_is_invalid() {
    let (store, key) = seeded();
    let patch = json!({"spec": {"containers": [{"name": "c1", "image": "v2"}]}});
    let err = store
        .apply(&key, &patch, &ApplyOptions::new("  ", true))
        .expect_err("no manager");
    assert!(matches!(err, StoreError::Invalid(_)));
}

#[test]
fn current_resource_version_precondition_passes() {
    let (store, key) = seeded();
    let patch = json!({
        "metadata": {"resourceVersion": "1"},
        "spec": {"initContainers": [{"name": "init", "image": "i2"}]}
    });
    let pod = store
        .apply(&key, &patch, &ApplyOptions::default())
        .expect("apply");
    assert_eq!(pod.spec.init_containers[0].image.as_deref(), Some("i2"));
    assert_eq!(pod.metadata.resource_version.as_deref(), Some("2"));

    // The same precondition is now stale.
    let err = store
        .apply(&key, &patch, &ApplyOptions::default())
        .expect_err("stale");
    assert!(err.is_conflict());
}

#[test]
fn labels_merge_without_dropping_existing() {
    let (store, key) = seeded();
    store
        .apply(
            &key,
            &json!({"metadata": {"labels": {"tier": "storage"}}}),
            &ApplyOptions::new("labeler", false),
        )
        .expect("labels");
    let pod = store
        .apply(
            &key,
            &json!({"spec": {"containers": [{"name": "c2", "image": "v9"}]}}),
            &ApplyOptions::new("operator", false),
        )
        .expect("image");
    assert_eq!(pod.metadata.labels.get("tier").map(String::as_str), Some("storage"));
    assert_eq!(pod.spec.containers[1].image.as_deref(), Some("v9"));
    assert_eq!(
        store.field_manager(&key, "/metadata/labels/tier").as_deref(),
        Some("labeler")
    );
}
