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

//! Pod store boundary.
//!
//! [`PodStore`] is the seam to the cluster object store. Production callers
//! back it with their API client; [`InMemoryPodStore`] is an in-process
//! implementation with apply-patch semantics: lists of containers are merged
//! by `name`, every written leaf is owned by a field manager, and a
//! `metadata.resourceVersion` in the patch acts as an optimistic-concurrency
//! precondition.

use crate::podpatcher::config::Config;
use crate::podpatcher::k8s::pod::{Pod, PodRef};
use crate::podpatcher::util::error::{with_context, BoxError};

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::{Mutex, RwLock};

/// Lists inside a pod spec that merge by the `name` key instead of being replaced.
const NAME_KEYED_LISTS: [&str; 2] = ["containers", "initContainers"];

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Conflict(String),
    Invalid(String),
    Unavailable(BoxError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(msg) => write!(f, "not found: {msg}"),
            StoreError::Conflict(msg) => write!(f, "conflict: {msg}"),
            StoreError::Invalid(msg) => write!(f, "invalid: {msg}"),
            StoreError::Unavailable(err) => write!(f, "store unavailable: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Unavailable(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Parameters of an apply-style partial update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    pub field_manager: String,
    /// Take over fields currently owned by another manager instead of failing.
    pub force: bool,
}

impl ApplyOptions {
    pub fn new(field_manager: impl Into<String>, force: bool) -> Self {
        Self {
            field_manager: field_manager.into(),
            force,
        }
    }

    /// Reads the field manager and force flag from the environment.
    pub fn from_env() -> Result<Self, BoxError> {
        let force = Config::ForceOwnership.get_bool()?;
        Ok(Self::new(Config::FieldManager.get(), force))
    }
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self::new(Config::FieldManager.default_value(), true)
    }
}

/// Object store operations consumed by the patcher.
pub trait PodStore: Send + Sync {
    fn get(&self, pod: &PodRef) -> Result<Pod, StoreError>;

    /// Applies `patch` as a structural merge, touching only the fields it names.
    fn apply(&self, pod: &PodRef, patch: &Value, options: &ApplyOptions)
        -> Result<Pod, StoreError>;
}

/// Tracks which field manager last wrote each leaf, keyed by a path such as
/// `/spec/containers/name=agent/image`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldOwnership {
    entries: HashMap<String, String>,
}

impl FieldOwnership {
    pub fn set_owner(&mut self, path: &str, manager: &str) {
        self.entries
            .insert(path.trim().to_string(), manager.trim().to_string());
    }

    pub fn manager_for(&self, path: &str) -> Option<&str> {
        self.entries.get(path.trim()).map(|value| value.as_str())
    }
}

#[derive(Debug, Clone)]
struct StoredPod {
    pod: Pod,
    generation: u64,
    owners: FieldOwnership,
}

#[derive(Default)]
pub struct InMemoryPodStore {
    pods: RwLock<HashMap<PodRef, StoredPod>>,
    apply_calls: Mutex<usize>,
    injected_failure: Mutex<Option<StoreError>>,
}

impl InMemoryPodStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds or replaces a pod, assigning it a fresh resource version.
    pub fn insert(&self, pod: Pod) -> Result<PodRef, StoreError> {
        let key = PodRef::from_pod(&pod)
            .ok_or_else(|| StoreError::Invalid("pod metadata.name is required".to_string()))?;
        let mut pods = self.pods.write().unwrap_or_else(|p| p.into_inner());
        let generation = pods.get(&key).map(|stored| stored.generation + 1).unwrap_or(1);
        let mut pod = pod;
        pod.metadata.namespace = Some(key.namespace.clone());
        pod.metadata.resource_version = Some(generation.to_string());
        pods.insert(
            key.clone(),
            StoredPod {
                pod,
                generation,
                owners: FieldOwnership::default(),
            },
        );
        Ok(key)
    }

    /// Number of `apply` calls received, successful or not.
    pub fn apply_count(&self) -> usize {
        *self.apply_calls.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Makes the next `apply` fail with `error` without touching state.
    pub fn fail_next_apply(&self, error: StoreError) {
        *self.injected_failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(error);
    }

    pub fn field_manager(&self, pod: &PodRef, path: &str) -> Option<String> {
        let pods = self.pods.read().unwrap_or_else(|p| p.into_inner());
        pods.get(pod)
            .and_then(|stored| stored.owners.manager_for(path))
            .map(str::to_string)
    }
}

impl PodStore for InMemoryPodStore {
    fn get(&self, pod: &PodRef) -> Result<Pod, StoreError> {
        let pods = self.pods.read().unwrap_or_else(|p| p.into_inner());
        pods.get(pod)
            .map(|stored| stored.pod.clone())
            .ok_or_else(|| StoreError::NotFound(format!("pod {pod}")))
    }

    fn apply(
        &self,
        pod: &PodRef,
        patch: &Value,
        options: &ApplyOptions,
    ) -> Result<Pod, StoreError> {
        *self.apply_calls.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        if let Some(error) = self
            .injected_failure
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            return Err(error);
        }

        let manager = options.field_manager.trim();
        if manager.is_empty() {
            return Err(StoreError::Invalid(
                "field manager is required for apply operations".to_string(),
            ));
        }

        let mut pods = self.pods.write().unwrap_or_else(|p| p.into_inner());
        let stored = pods
            .get_mut(pod)
            .ok_or_else(|| StoreError::NotFound(format!("pod {pod}")))?;

        let patch = patch
            .as_object()
            .ok_or_else(|| StoreError::Invalid("apply patch must be a JSON object".to_string()))?;
        check_identity(pod, patch)?;
        check_precondition(stored, patch)?;

        let mut current = serde_json::to_value(&stored.pod)
            .map_err(|err| StoreError::Unavailable(with_context(err, "encoding stored pod")))?;

        let mut written = Vec::new();
        if let Some(spec) = patch.get("spec") {
            let target = current
                .as_object_mut()
                .and_then(|obj| obj.get_mut("spec"))
                .ok_or_else(|| StoreError::Invalid("stored pod has no spec".to_string()))?;
            merge_value(target, spec, "/spec", &mut written)?;
        }
        if let Some(labels) = patch
            .get("metadata")
            .and_then(|meta| meta.get("labels"))
        {
            let meta = current
                .as_object_mut()
                .and_then(|obj| obj.get_mut("metadata"))
                .and_then(Value::as_object_mut)
                .ok_or_else(|| StoreError::Invalid("stored pod has no metadata".to_string()))?;
            let target = meta
                .entry("labels")
                .or_insert_with(|| Value::Object(Map::new()));
            merge_value(target, labels, "/metadata/labels", &mut written)?;
        }

        let conflicts: Vec<String> = written
            .iter()
            .filter(|leaf| leaf.changed)
            .filter_map(|leaf| {
                stored
                    .owners
                    .manager_for(&leaf.path)
                    .filter(|owner| *owner != manager)
                    .map(|owner| format!("{} (owned by {owner})", leaf.path))
            })
            .collect();
        if !conflicts.is_empty() && !options.force {
            return Err(StoreError::Conflict(format!(
                "apply by {manager} conflicts on {}",
                conflicts.join(", ")
            )));
        }

        let merged: Pod = serde_json::from_value(current)
            .map_err(|err| StoreError::Invalid(format!("patched pod is invalid: {err}")))?;

        for leaf in &written {
            stored.owners.set_owner(&leaf.path, manager);
        }

        // A no-op apply keeps the resource version so repeated applies converge.
        if merged != stored.pod {
            stored.generation += 1;
            stored.pod = merged;
            stored.pod.metadata.resource_version = Some(stored.generation.to_string());
        }
        Ok(stored.pod.clone())
    }
}

struct WrittenLeaf {
    path: String,
    changed: bool,
}

fn check_identity(pod: &PodRef, patch: &Map<String, Value>) -> Result<(), StoreError> {
    if let Some(kind) = patch.get("kind").and_then(Value::as_str) {
        if kind != "Pod" {
            return Err(StoreError::Invalid(format!("cannot apply kind {kind} to pod {pod}")));
        }
    }
    let meta = patch.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(Value::as_str);
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(Value::as_str);
    if name.is_some_and(|name| name != pod.name)
        || namespace.is_some_and(|ns| ns != pod.namespace)
    {
        return Err(StoreError::Invalid(format!(
            "patch metadata does not address pod {pod}"
        )));
    }
    Ok(())
}

fn check_precondition(stored: &StoredPod, patch: &Map<String, Value>) -> Result<(), StoreError> {
    let expected = patch
        .get("metadata")
        .and_then(|m| m.get("resourceVersion"))
        .and_then(Value::as_str);
    match expected {
        Some(version) if version != stored.generation.to_string() => {
            Err(StoreError::Conflict(format!(
                "resourceVersion {version} is stale, current is {}",
                stored.generation
            )))
        }
        _ => Ok(()),
    }
}

fn merge_value(
    target: &mut Value,
    patch: &Value,
    path: &str,
    written: &mut Vec<WrittenLeaf>,
) -> Result<(), StoreError> {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                let child_path = format!("{path}/{key}");
                if NAME_KEYED_LISTS.contains(&key.as_str()) {
                    let list = target
                        .entry(key.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    merge_named_list(list, value, &child_path, written)?;
                    continue;
                }
                let nested = value.is_object() && target.get(key).is_some_and(Value::is_object);
                if nested {
                    if let Some(existing) = target.get_mut(key) {
                        merge_value(existing, value, &child_path, written)?;
                    }
                } else {
                    let previous = target.insert(key.clone(), value.clone());
                    written.push(WrittenLeaf {
                        path: child_path,
                        changed: previous.as_ref() != Some(value),
                    });
                }
            }
            Ok(())
        }
        (_, _) => Err(StoreError::Invalid(format!("{path} must be an object"))),
    }
}

fn merge_named_list(
    target: &mut Value,
    patch: &Value,
    path: &str,
    written: &mut Vec<WrittenLeaf>,
) -> Result<(), StoreError> {
    let entries = patch
        .as_array()
        .ok_or_else(|| StoreError::Invalid(format!("{path} must be a list")))?;
    let existing = target
        .as_array_mut()
        .ok_or_else(|| StoreError::Invalid(format!("{path} must be a list")))?;

    for entry in entries {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Invalid(format!("{path} entries require a name")))?;
        // Pods cannot gain containers after creation.
        let slot = existing
            .iter_mut()
            .find(|item| item.get("name").and_then(Value::as_str) == Some(name))
            .ok_or_else(|| {
                StoreError::Invalid(format!("{path}: container {name} does not exist"))
            })?;
        let mut fields = entry.clone();
        if let Some(obj) = fields.as_object_mut() {
            obj.remove("name");
        }
        merge_value(slot, &fields, &format!("{path}/name={name}"), written)?;
    }
    Ok(())
}
