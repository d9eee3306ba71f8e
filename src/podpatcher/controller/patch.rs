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

//! In-place image updates.
//!
//! An [`ImagePatch`] names containers and the image each should run. It is
//! rendered into an apply payload that carries nothing but `name` and
//! `image` for those containers, so fields owned by other managers (and every
//! container the patch does not name) stay as they are on the live pod.

use crate::podpatcher::controller::images::equal_images;
use crate::podpatcher::k8s::pod::{ContainerSpec, Pod, PodRef};
use crate::podpatcher::k8s::store::{ApplyOptions, PodStore, StoreError};
use crate::podpatcher::logger::{log_debug, log_info, log_warn};
use crate::podpatcher::util::error::describe_chain;

use serde_json::{json, Map, Value};
use std::error::Error;
use std::fmt;

const COMPONENT: &str = "image-patcher";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerList {
    Containers,
    InitContainers,
}

impl ContainerList {
    fn field(self) -> &'static str {
        match self {
            ContainerList::Containers => "containers",
            ContainerList::InitContainers => "initContainers",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageOverride {
    pub list: ContainerList,
    pub name: String,
    pub image: String,
}

/// Ordered set of image overrides; at most one entry per (list, name).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImagePatch {
    overrides: Vec<ImageOverride>,
}

impl ImagePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container(mut self, name: impl Into<String>, image: impl Into<String>) -> Self {
        self.set(ContainerList::Containers, name, image);
        self
    }

    pub fn with_init_container(
        mut self,
        name: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        self.set(ContainerList::InitContainers, name, image);
        self
    }

    /// Adds an override, replacing an earlier one for the same container.
    pub fn set(&mut self, list: ContainerList, name: impl Into<String>, image: impl Into<String>) {
        let name = name.into();
        let image = image.into();
        match self
            .overrides
            .iter_mut()
            .find(|entry| entry.list == list && entry.name == name)
        {
            Some(entry) => entry.image = image,
            None => self.overrides.push(ImageOverride { list, name, image }),
        }
    }

    /// Every image of `desired`. Containers without an image are skipped.
    pub fn from_pod(desired: &Pod) -> Self {
        let mut patch = Self::new();
        for (list, containers) in lists_of(desired) {
            for container in containers {
                if let Some(image) = container.image.as_deref() {
                    patch.set(list, container.name.as_str(), image);
                }
            }
        }
        patch
    }

    /// Only the images of `desired` that `observed` does not already run under
    /// the same container name. Names missing from `observed` are kept so the
    /// store can reject them.
    pub fn diff(desired: &Pod, observed: &Pod) -> Self {
        if equal_images(desired, observed) {
            return Self::new();
        }
        let mut patch = Self::new();
        for ((list, wanted), (_, live)) in lists_of(desired).into_iter().zip(lists_of(observed)) {
            for container in wanted {
                let Some(image) = container.image.as_deref() else {
                    continue;
                };
                let current = live
                    .iter()
                    .find(|candidate| candidate.name == container.name)
                    .and_then(|candidate| candidate.image.as_deref());
                if current != Some(image) {
                    patch.set(list, container.name.as_str(), image);
                }
            }
        }
        patch
    }

    pub fn overrides(&self) -> &[ImageOverride] {
        &self.overrides
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    /// Minimal apply payload addressing `target`; empty lists are omitted.
    pub fn to_apply_payload(&self, target: &PodRef) -> Value {
        let mut spec = Map::new();
        for list in [ContainerList::Containers, ContainerList::InitContainers] {
            let entries: Vec<Value> = self
                .overrides
                .iter()
                .filter(|entry| entry.list == list)
                .map(|entry| json!({"name": entry.name, "image": entry.image}))
                .collect();
            if !entries.is_empty() {
                spec.insert(list.field().to_string(), Value::Array(entries));
            }
        }
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": target.name, "namespace": target.namespace},
            "spec": Value::Object(spec),
        })
    }
}

fn lists_of(pod: &Pod) -> [(ContainerList, &[ContainerSpec]); 2] {
    [
        (ContainerList::Containers, pod.spec.containers.as_slice()),
        (ContainerList::InitContainers, pod.spec.init_containers.as_slice()),
    ]
}

/// Failure to patch a pod's images. The store cause is kept as `source()`.
#[derive(Debug)]
pub struct PatchError {
    target: PodRef,
    source: StoreError,
}

impl PatchError {
    pub fn target(&self) -> &PodRef {
        &self.target
    }

    pub fn store_error(&self) -> &StoreError {
        &self.source
    }

    pub fn into_store_error(self) -> StoreError {
        self.source
    }
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to patch images of pod {}: {}", self.target, self.source)
    }
}

impl Error for PatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Applies `patch` to the live pod at `target` with a single store write.
///
/// Failures are returned as-is; retrying is left to the caller, which is safe
/// because applying the same patch again converges on the same state.
pub fn apply_image_patch<S>(
    store: &S,
    target: &PodRef,
    patch: &ImagePatch,
    options: &ApplyOptions,
) -> Result<Pod, PatchError>
where
    S: PodStore + ?Sized,
{
    if patch.is_empty() {
        return Err(PatchError {
            target: target.clone(),
            source: StoreError::Invalid("image patch names no containers".to_string()),
        });
    }

    let count = patch.len().to_string();
    log_debug(
        COMPONENT,
        "Applying image patch",
        &[
            ("namespace", target.namespace.as_str()),
            ("pod", target.name.as_str()),
            ("field_manager", options.field_manager.as_str()),
            ("containers", count.as_str()),
        ],
    );

    let payload = patch.to_apply_payload(target);
    match store.apply(target, &payload, options) {
        Ok(pod) => {
            let version = pod.metadata.resource_version.as_deref().unwrap_or("");
            log_info(
                COMPONENT,
                "Patched pod images",
                &[
                    ("namespace", target.namespace.as_str()),
                    ("pod", target.name.as_str()),
                    ("resource_version", version),
                ],
            );
            Ok(pod)
        }
        Err(source) => {
            let error = PatchError {
                target: target.clone(),
                source,
            };
            let detail = describe_chain(&error);
            log_warn(
                COMPONENT,
                "Image patch failed",
                &[
                    ("namespace", target.namespace.as_str()),
                    ("pod", target.name.as_str()),
                    ("error", detail.as_str()),
                ],
            );
            Err(error)
        }
    }
}
