#![allow(dead_code)]

//! Pod fixtures shared by unit tests and the integration suites under `tests/`.

use crate::podpatcher::k8s::pod::{ContainerSpec, ObjectMeta, Pod, PodSpec, PodStatus};

pub const TEST_NAMESPACE: &str = "storage";

pub fn container(name: &str, image: &str) -> ContainerSpec {
    ContainerSpec::new(name, image)
}

/// Unnamed-namespace pod called `example`, for comparisons that never touch a store.
pub fn pod_with(containers: Vec<ContainerSpec>, init_containers: Vec<ContainerSpec>) -> Pod {
    Pod::new(
        ObjectMeta {
            name: Some("example".to_string()),
            ..ObjectMeta::default()
        },
        PodSpec {
            containers,
            init_containers,
            ..PodSpec::default()
        },
    )
}

/// Pod in [`TEST_NAMESPACE`], ready to be seeded into a store.
pub fn named_pod(
    name: &str,
    containers: Vec<ContainerSpec>,
    init_containers: Vec<ContainerSpec>,
) -> Pod {
    let mut pod = pod_with(containers, init_containers);
    pod.metadata.name = Some(name.to_string());
    pod.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    pod
}

pub fn with_phase(mut pod: Pod, phase: &str, restart_policy: &str) -> Pod {
    pod.spec.restart_policy = Some(restart_policy.to_string());
    let status = pod.status.get_or_insert_with(PodStatus::default);
    status.phase = Some(phase.to_string());
    pod
}
