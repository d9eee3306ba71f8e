use std::sync::Arc;
use std::thread;

use podpatcher::podpatcher::controller::images::equal_images;
use podpatcher::podpatcher::controller::patch::{apply_image_patch, ImagePatch};
use podpatcher::podpatcher::controller::reconcile::{ImageSync, Reconciler, SyncError};
use podpatcher::podpatcher::controller::restart::{needs_restart, pod_needs_restart};
use podpatcher::podpatcher::k8s::pod::{
    ContainerEnvVar, Pod, PodPhase, PodRef, RestartPolicy, VolumeSpec,
};
use podpatcher::podpatcher::k8s::store::{ApplyOptions, InMemoryPodStore, PodStore, StoreError};
use podpatcher::podpatcher::test_support::{container, named_pod, with_phase};
use podpatcher::podpatcher::util::error::BoxError;

fn failed_agent() -> Pod {
    with_phase(
        named_pod(
            "agent",
            vec![container("c1", "v1"), container("c2", "v1")],
            Vec::new(),
        ),
        "Failed",
        "OnFailure",
    )
}

#[test]
fn failed_pod_is_patched_and_needs_restart() {
    let store = InMemoryPodStore::new();
    let target = store.insert(failed_agent()).expect("seed");
    let observed = store.get(&target).expect("observed");
    let desired = named_pod(
        "agent",
        vec![container("c1", "v2"), container("c2", "v1")],
        Vec::new(),
    );

    assert!(!equal_images(&desired, &observed));

    let patch = ImagePatch::diff(&desired, &observed);
    assert_eq!(patch, ImagePatch::new().with_container("c1", "v2"));

    let patched = apply_image_patch(&store, &target, &patch, &ApplyOptions::default())
        .expect("patch applies");
    assert_eq!(store.apply_count(), 1);
    assert!(equal_images(&desired, &patched));

    let policy = observed.restart_policy().expect("policy");
    assert_eq!(policy, RestartPolicy::OnFailure);
    assert_eq!(patched.phase(), PodPhase::Failed);
    assert!(needs_restart(PodPhase::Failed, RestartPolicy::OnFailure));
    assert!(pod_needs_restart(&patched, policy));
}

#[test]
fn reconciler_reports_restart_for_failed_pod() {
    let store = Arc::new(InMemoryPodStore::new());
    let target = store.insert(failed_agent()).expect("seed");
    let desired = named_pod(
        "agent",
        vec![container("c1", "v2"), container("c2", "v1")],
        Vec::new(),
    );
    let source = move |_: &PodRef| -> Result<Option<Pod>, BoxError> { Ok(Some(desired.clone())) };
    let sync = ImageSync::new(
        Arc::clone(&store) as Arc<dyn PodStore>,
        Arc::new(source),
        ApplyOptions::new("storage-operator", true),
    );

    let outcome = sync
        .reconcile_and_apply(&target)
        .expect("reconcile")
        .expect("outcome");
    assert!(outcome.patched);
    assert!(outcome.converged);
    assert!(outcome.restart_required);
    assert_eq!(
        store
            .field_manager(&target, "/spec/containers/name=c1/image")
            .as_deref(),
        Some("storage-operator")
    );

    // Second pass finds nothing to do.
    let again = sync
        .reconcile_and_apply(&target)
        .expect("reconcile")
        .expect("outcome");
    assert!(!again.patched);
    assert_eq!(store.apply_count(), 1);
}

#[test]
fn repeated_patch_converges_to_same_state() {
    let store = InMemoryPodStore::new();
    let target = store.insert(failed_agent()).expect("seed");
    let patch = ImagePatch::new().with_container("c1", "v2");

    let once = apply_image_patch(&store, &target, &patch, &ApplyOptions::default())
        .expect("first apply");
    let twice = apply_image_patch(&store, &target, &patch, &ApplyOptions::default())
        .expect("second apply");

    assert_eq!(once, twice);
    assert_eq!(store.get(&target).expect("pod"), once);
    assert_eq!(store.apply_count(), 2);
}

#[test]
fn patch_leaves_other_fields_untouched() {
    let store = InMemoryPodStore::new();
    let mut pod = named_pod(
        "agent",
        vec![container("c1", "v1"), container("c2", "v1")],
        vec![container("setup", "s1")],
    );
    pod.metadata
        .labels
        .insert("app".to_string(), "storage".to_string());
    pod.spec.containers[0].args = vec!["--port=3366".to_string()];
    pod.spec.containers[0].env = vec![ContainerEnvVar {
        name: "LOG_LEVEL".to_string(),
        value: Some("debug".to_string()),
    }];
    pod.spec.volumes = vec![VolumeSpec {
        name: "data".to_string(),
        host_path: None,
    }];
    pod.spec.node_name = Some("node-a".to_string());
    let pod = with_phase(pod, "Running", "Always");
    let target = store.insert(pod).expect("seed");
    let before = store.get(&target).expect("snapshot");

    let patched = apply_image_patch(
        &store,
        &target,
        &ImagePatch::new().with_container("c1", "v2"),
        &ApplyOptions::default(),
    )
    .expect("patch");

    let mut expected = before.clone();
    expected.spec.containers[0].image = Some("v2".to_string());
    expected.metadata.resource_version = patched.metadata.resource_version.clone();
    assert_eq!(patched, expected);
    assert_ne!(patched.metadata.resource_version, before.metadata.resource_version);
    assert!(!pod_needs_restart(&patched, RestartPolicy::Always));
}

#[test]
fn init_container_images_are_patched_in_their_own_list() {
    let store = InMemoryPodStore::new();
    let pod = named_pod(
        "agent",
        vec![container("setup", "app:v1")],
        vec![container("setup", "init:v1")],
    );
    let target = store.insert(pod).expect("seed");

    let patched = apply_image_patch(
        &store,
        &target,
        &ImagePatch::new().with_init_container("setup", "init:v2"),
        &ApplyOptions::default(),
    )
    .expect("patch");

    assert_eq!(patched.spec.containers[0].image.as_deref(), Some("app:v1"));
    assert_eq!(patched.spec.init_containers[0].image.as_deref(), Some("init:v2"));
}

#[test]
fn store_failures_surface_without_retry() {
    let store = InMemoryPodStore::new();
    let target = store.insert(failed_agent()).expect("seed");
    let before = store.get(&target).expect("snapshot");
    store.fail_next_apply(StoreError::Unavailable("connection reset by peer".into()));

    let err = apply_image_patch(
        &store,
        &target,
        &ImagePatch::new().with_container("c1", "v2"),
        &ApplyOptions::default(),
    )
    .expect_err("unavailable");

    assert_eq!(store.apply_count(), 1);
    assert_eq!(err.target(), &target);
    assert!(matches!(err.store_error(), StoreError::Unavailable(_)));
    assert!(err.to_string().contains("connection reset by peer"));
    assert_eq!(store.get(&target).expect("pod"), before);
}

#[test]
fn unknown_container_is_rejected_by_store() {
    let store = Arc::new(InMemoryPodStore::new());
    let target = store.insert(failed_agent()).expect("seed");
    let desired = named_pod(
        "agent",
        vec![container("c1", "v1"), container("c3", "v1")],
        Vec::new(),
    );
    let source = move |_: &PodRef| -> Result<Option<Pod>, BoxError> { Ok(Some(desired.clone())) };
    let sync = ImageSync::new(
        Arc::clone(&store) as Arc<dyn PodStore>,
        Arc::new(source),
        ApplyOptions::default(),
    );

    let err = sync.reconcile_and_apply(&target).expect_err("rejected");
    match err {
        SyncError::Patch(patch_err) => {
            assert!(matches!(patch_err.store_error(), StoreError::Invalid(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn different_pods_patch_concurrently() {
    let store = Arc::new(InMemoryPodStore::new());
    let targets: Vec<PodRef> = (0..8)
        .map(|idx| {
            store
                .insert(named_pod(
                    &format!("agent-{idx}"),
                    vec![container("c1", "v1")],
                    Vec::new(),
                ))
                .expect("seed")
        })
        .collect();

    let handles: Vec<_> = targets
        .iter()
        .cloned()
        .map(|target| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                apply_image_patch(
                    store.as_ref(),
                    &target,
                    &ImagePatch::new().with_container("c1", "v2"),
                    &ApplyOptions::default(),
                )
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread").expect("patch");
    }

    for target in &targets {
        let pod = store.get(target).expect("pod");
        assert_eq!(pod.spec.containers[0].image.as_deref(), Some("v2"));
    }
    assert_eq!(store.apply_count(), targets.len());
}
