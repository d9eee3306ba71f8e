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

//! Trace identifiers for reconcile passes. A caller wraps one pass over a pod
//! in [`with_span`]; every log line emitted by the patcher inside that pass
//! then carries the same `trace_id`, so the compare/patch/restart decisions
//! for one pod can be correlated.

use rand::{rngs::OsRng, RngCore};
use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::task_local;
use tracing_subscriber::registry::Registry;

#[derive(Clone, Debug)]
pub struct TraceContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
}

impl TraceContext {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    fn child(parent: Option<&TraceContext>) -> Self {
        let trace_id = parent
            .map(|ctx| Arc::clone(&ctx.trace_id))
            .unwrap_or_else(|| Arc::<str>::from(random_hex(16)));
        Self {
            trace_id,
            span_id: Arc::<str>::from(random_hex(8)),
        }
    }
}

task_local! {
    static ACTIVE_TRACE: TraceContext;
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once. A subscriber installed elsewhere wins.
pub fn init() {
    TRACING_INIT.get_or_init(|| {
        let _ = tracing::subscriber::set_global_default(Registry::default());
    });
}

pub fn current_context() -> Option<TraceContext> {
    ACTIVE_TRACE.try_with(|ctx| ctx.clone()).ok()
}

/// Runs `fut` inside a span; nested calls keep the parent's trace id.
pub async fn with_span<T>(
    component: &'static str,
    span_name: impl Into<String>,
    fut: impl Future<Output = T>,
) -> T {
    let context = TraceContext::child(current_context().as_ref());
    let name = span_name.into();
    let span = tracing::info_span!(
        "podpatcher",
        component = component,
        span = name.as_str(),
        trace_id = context.trace_id(),
        span_id = context.span_id(),
    );

    ACTIVE_TRACE
        .scope(context, async move {
            let _guard = span.enter();
            fut.await
        })
        .await
}

/// Synchronous counterpart of [`with_span`] for callers outside an async task.
pub fn with_span_sync<T>(
    component: &'static str,
    span_name: impl Into<String>,
    f: impl FnOnce() -> T,
) -> T {
    let context = TraceContext::child(current_context().as_ref());
    let name = span_name.into();
    let span = tracing::info_span!(
        "podpatcher",
        component = component,
        span = name.as_str(),
        trace_id = context.trace_id(),
        span_id = context.span_id(),
    );
    ACTIVE_TRACE.sync_scope(context, || span.in_scope(f))
}

fn random_hex(bytes: usize) -> String {
    let mut data = vec![0u8; bytes];
    OsRng.fill_bytes(&mut data);
    let mut output = String::with_capacity(bytes * 2);
    for byte in data {
        let _ = write!(&mut output, "{:02x}", byte);
    }
    output
}
