/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Image drift detection between a desired and an observed pod.

use crate::podpatcher::k8s::pod::{ContainerSpec, Pod};

/// Returns true when both pods run the same images in the same slots.
///
/// Containers and init containers are compared positionally; a length
/// mismatch in either list is inequality on its own, with no attempt to
/// match entries by name.
pub fn equal_images(a: &Pod, b: &Pod) -> bool {
    equal_container_images(&a.spec.containers, &b.spec.containers)
        && equal_container_images(&a.spec.init_containers, &b.spec.init_containers)
}

fn equal_container_images(a: &[ContainerSpec], b: &[ContainerSpec]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(left, right)| left.name == right.name && left.image == right.image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::podpatcher::test_support::{container, pod_with};

    fn example_pod() -> Pod {
        pod_with(
            vec![container("container-1", "image-1"), container("container-2", "image-2")],
            vec![container("init-1", "image-init-1"), container("init-2", "image-init-2")],
        )
    }

    #[test]
    fn same_object_is_equal() {
        let pod = example_pod();
        assert!(equal_images(&pod, &pod));
        assert!(equal_images(&pod, &pod.clone()));
    }

    #[test]
    fn renamed_container_differs() {
        let a = example_pod();
        let mut b = example_pod();
        b.spec.containers[1] = container("container-3", "image-2");
        assert!(!equal_images(&a, &b));
    }

    #[test]
    fn changed_init_image_differs() {
        let a = example_pod();
        let mut b = example_pod();
        b.spec.init_containers[1].image = Some("image-init-3".to_string());
        assert!(!equal_images(&a, &b));
        assert!(!equal_images(&b, &a));
    }

    #[test]
    fn length_mismatch_differs_even_when_prefix_matches() {
        let a = example_pod();
        let mut b = example_pod();
        b.spec.containers.push(container("container-3", "image-3"));
        assert!(!equal_images(&a, &b));

        let mut c = example_pod();
        c.spec.init_containers.pop();
        assert!(!equal_images(&a, &c));
    }

    #[test]
    fn reordered_containers_differ() {
        let a = example_pod();
        let mut b = example_pod();
        b.spec.containers.swap(0, 1);
        assert!(!equal_images(&a, &b));
    }

    #[test]
    fn non_image_fields_are_ignored() {
        let a = example_pod();
        let mut b = example_pod();
        b.spec.containers[0].args = vec!["--verbose".to_string()];
        b.spec.node_name = Some("node-b".to_string());
        assert!(equal_images(&a, &b));
    }

    #[test]
    fn missing_image_only_matches_missing_image() {
        let a = example_pod();
        let mut b = example_pod();
        b.spec.containers[0].image = None;
        assert!(!equal_images(&a, &b));

        let mut c = example_pod();
        c.spec.containers[0].image = None;
        assert!(equal_images(&b, &c));
    }
}
