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

use crate::podpatcher::k8s::pod::{Pod, PodPhase, RestartPolicy};

/// Reports whether a pod in `phase` still needs an explicit restart after its
/// images were patched, given the restart policy the runtime applies on its own.
pub fn needs_restart(phase: PodPhase, policy: RestartPolicy) -> bool {
    match (phase, policy) {
        (PodPhase::Running, _) => false,
        (PodPhase::Failed, RestartPolicy::Always | RestartPolicy::OnFailure) => true,
        (PodPhase::Failed, RestartPolicy::Never) => false,
        (PodPhase::Succeeded, RestartPolicy::Always) => true,
        (PodPhase::Succeeded, RestartPolicy::OnFailure | RestartPolicy::Never) => false,
        (PodPhase::Pending | PodPhase::Unknown, _) => false,
    }
}

/// Evaluates [`needs_restart`] against the observed phase of `pod`.
pub fn pod_needs_restart(pod: &Pod, policy: RestartPolicy) -> bool {
    needs_restart(pod.phase(), policy)
}
