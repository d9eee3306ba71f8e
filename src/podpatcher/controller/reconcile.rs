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

use crate::podpatcher::controller::images::equal_images;
use crate::podpatcher::controller::patch::{apply_image_patch, ImagePatch, PatchError};
use crate::podpatcher::controller::restart::needs_restart;
use crate::podpatcher::k8s::pod::{ParseRestartPolicyError, Pod, PodRef, RestartPolicy};
use crate::podpatcher::k8s::store::{ApplyOptions, PodStore, StoreError};
use crate::podpatcher::logger::{log_debug, log_info};
use crate::podpatcher::util::error::BoxError;

use std::error::Error;
use std::fmt;
use std::sync::Arc;

const COMPONENT: &str = "image-sync";

/// Desired input and observed state gathered during the fetch phase.
pub struct ReconcileData<Desired, Observed> {
    pub desired: Desired,
    pub observed: Observed,
}

type FetchResult<D, O, E> = Result<Option<ReconcileData<D, O>>, E>;

/// Fetch, diff and apply phases shared by reconcilers.
pub trait Reconciler {
    type Desired;
    type Observed;
    type Plan;
    type Outcome;
    type Error: Error + Send + Sync + 'static;

    /// Returns the logical kind handled by this reconciler (used for diagnostics).
    fn kind(&self) -> &'static str;

    /// Returning `Ok(None)` means there is nothing to reconcile for `target`.
    fn fetch(&self, target: &PodRef) -> FetchResult<Self::Desired, Self::Observed, Self::Error>;

    fn diff(
        &self,
        target: &PodRef,
        desired: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Plan, Self::Error>;

    fn apply(&self, target: &PodRef, plan: Self::Plan) -> Result<Self::Outcome, Self::Error>;

    /// Runs fetch, diff and apply in order.
    fn reconcile_and_apply(&self, target: &PodRef) -> Result<Option<Self::Outcome>, Self::Error> {
        match self.fetch(target)? {
            Some(data) => {
                let plan = self.diff(target, &data.desired, &data.observed)?;
                self.apply(target, plan).map(Some)
            }
            None => Ok(None),
        }
    }
}

/// Supplies the desired pod for a reference; `Ok(None)` when nothing is desired.
pub trait DesiredPodSource: Send + Sync {
    fn desired(&self, target: &PodRef) -> Result<Option<Pod>, BoxError>;
}

impl<F> DesiredPodSource for F
where
    F: Fn(&PodRef) -> Result<Option<Pod>, BoxError> + Send + Sync,
{
    fn desired(&self, target: &PodRef) -> Result<Option<Pod>, BoxError> {
        self(target)
    }
}

#[derive(Debug)]
pub enum SyncError {
    Desired(BoxError),
    Observe(StoreError),
    Policy(ParseRestartPolicyError),
    Patch(PatchError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Desired(err) => write!(f, "failed to load desired pod: {err}"),
            SyncError::Observe(err) => write!(f, "failed to read live pod: {err}"),
            SyncError::Policy(err) => write!(f, "{err}"),
            SyncError::Patch(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncError::Desired(err) => Some(err.as_ref()),
            SyncError::Observe(err) => Some(err),
            SyncError::Policy(err) => Some(err),
            SyncError::Patch(err) => Some(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSyncPlan {
    pub desired: Pod,
    pub patch: ImagePatch,
    pub policy: RestartPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSyncOutcome {
    pub patched: bool,
    /// Images match the desired pod afterwards. False when the drift cannot be
    /// fixed in place, e.g. the container lists differ in shape.
    pub converged: bool,
    /// The caller must restart the pod itself (e.g. delete it for recreation).
    pub restart_required: bool,
    pub pod: Pod,
}

/// Brings a live pod's images in line with its desired spec without recreating it.
pub struct ImageSync {
    store: Arc<dyn PodStore>,
    desired: Arc<dyn DesiredPodSource>,
    options: ApplyOptions,
}

impl ImageSync {
    pub fn new(
        store: Arc<dyn PodStore>,
        desired: Arc<dyn DesiredPodSource>,
        options: ApplyOptions,
    ) -> Self {
        Self {
            store,
            desired,
            options,
        }
    }

    pub fn options(&self) -> &ApplyOptions {
        &self.options
    }
}

impl Reconciler for ImageSync {
    type Desired = Pod;
    type Observed = Pod;
    type Plan = ImageSyncPlan;
    type Outcome = ImageSyncOutcome;
    type Error = SyncError;

    fn kind(&self) -> &'static str {
        "Pod"
    }

    fn fetch(&self, target: &PodRef) -> FetchResult<Pod, Pod, SyncError> {
        let Some(desired) = self.desired.desired(target).map_err(SyncError::Desired)? else {
            return Ok(None);
        };
        let observed = self.store.get(target).map_err(SyncError::Observe)?;
        Ok(Some(ReconcileData { desired, observed }))
    }

    fn diff(
        &self,
        target: &PodRef,
        desired: &Pod,
        observed: &Pod,
    ) -> Result<ImageSyncPlan, SyncError> {
        // Restart policy is fixed for the pod's lifetime, so the live value is authoritative.
        let policy = observed.restart_policy().map_err(SyncError::Policy)?;
        let patch = if equal_images(desired, observed) {
            ImagePatch::new()
        } else {
            ImagePatch::diff(desired, observed)
        };
        let changes = patch.len().to_string();
        log_debug(
            COMPONENT,
            "Computed image diff",
            &[
                ("kind", self.kind()),
                ("namespace", target.namespace.as_str()),
                ("pod", target.name.as_str()),
                ("changes", changes.as_str()),
            ],
        );
        Ok(ImageSyncPlan {
            desired: desired.clone(),
            patch,
            policy,
        })
    }

    fn apply(&self, target: &PodRef, plan: ImageSyncPlan) -> Result<ImageSyncOutcome, SyncError> {
        if plan.patch.is_empty() {
            let pod = self.store.get(target).map_err(SyncError::Observe)?;
            return Ok(ImageSyncOutcome {
                patched: false,
                converged: equal_images(&plan.desired, &pod),
                restart_required: false,
                pod,
            });
        }

        let pod = apply_image_patch(self.store.as_ref(), target, &plan.patch, &self.options)
            .map_err(SyncError::Patch)?;
        let restart_required = needs_restart(pod.phase(), plan.policy);
        let phase = pod.phase();
        log_info(
            COMPONENT,
            "Pod images updated in place",
            &[
                ("namespace", target.namespace.as_str()),
                ("pod", target.name.as_str()),
                ("phase", phase.as_str()),
                ("restart_policy", plan.policy.as_str()),
                ("restart_required", if restart_required { "true" } else { "false" }),
            ],
        );
        Ok(ImageSyncOutcome {
            patched: true,
            converged: equal_images(&plan.desired, &pod),
            restart_required,
            pod,
        })
    }
}
