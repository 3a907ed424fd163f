// Copyright (c) The testgraph Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Expands one test method into an invocation stream and runs it.
//!
//! Each non-skip parameter row becomes one invocation. Sequential mode
//! preserves row order, applies the retry hook after failures and can
//! cascade-skip the rest of the method's invocation budget; parallel mode
//! fans rows out over a pool and flattens results in submission order, with
//! every row independent.
//!
//! Nothing in this module propagates errors upward: user-code failures are
//! already results by the time the invoker returns, and invoker breakage is
//! logged and swallowed.

use crate::{
    invoker::{FailureContext, TestMethodArguments},
    list::{ParameterRow, TestMethod},
    listeners::notify_each,
    pool::CancelToken,
    results::{InvokedMethod, TestResult, TestStatus},
    runner::TestContext,
};
use chrono::Local;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use tracing::{debug, warn};

/// Runs the invocation stream of a single method.
pub struct MethodRunner;

impl MethodRunner {
    /// Expands `method` into parameter rows and runs them, choosing
    /// sequential or parallel fan-out from the method's metadata.
    pub fn run(
        method: &Arc<TestMethod>,
        ctx: &Arc<TestContext>,
        skip_failed_invocation_counts: bool,
        cancel: &CancelToken,
    ) -> Vec<TestResult> {
        let arguments = TestMethodArguments::builder(Arc::clone(method))
            .with_parameters(ctx.effective_parameters().clone())
            .build();

        notify_each(ctx.data_provider_listeners(), |listener| {
            listener.before_data_provider_execution(method, ctx);
        });
        let rows = match method.data_provider() {
            Some(provider) => provider.rows(method, ctx),
            // No provider: the invocation budget itself produces the rows.
            None => (0..method.invocation_count())
                .map(|_| Some(ParameterRow::new()))
                .collect(),
        };
        notify_each(ctx.data_provider_listeners(), |listener| {
            listener.after_data_provider_execution(method, ctx);
        });

        let parallel = method.data_provider().map_or(false, |p| p.is_parallel())
            || method.thread_pool_size() > 1;

        if parallel {
            Self::run_in_parallel(&arguments, ctx, 0, rows, cancel)
        } else {
            let invocation_count = AtomicI64::new(i64::from(method.invocation_count()));
            let mut failure = FailureContext::default();
            Self::run_in_sequence(
                &arguments,
                ctx,
                &invocation_count,
                &mut failure,
                rows,
                skip_failed_invocation_counts,
                cancel,
            )
        }
    }

    /// Runs the rows in order on the calling thread.
    ///
    /// After each invocation the fresh results are kept verbatim if nothing
    /// has failed yet or the invocation succeeded; otherwise the invoker's
    /// retry hook decides what to keep. A positive failure count combined
    /// with the cascade-skip flag (suite-wide or per-method) synthesises
    /// skipped results for the remaining invocation budget and stops
    /// consuming rows.
    #[allow(clippy::too_many_arguments)]
    pub fn run_in_sequence(
        arguments: &TestMethodArguments,
        ctx: &Arc<TestContext>,
        invocation_count: &AtomicI64,
        failure: &mut FailureContext,
        rows: Vec<Option<ParameterRow>>,
        skip_failed_invocation_counts: bool,
        cancel: &CancelToken,
    ) -> Vec<TestResult> {
        let method = arguments.method();
        let invoker = ctx.configuration().test_invoker();
        let resolver = ctx.configuration().parameter_resolver();
        let mut results = Vec::new();

        for (parameters_index, row) in rows.into_iter().enumerate() {
            if cancel.is_cancelled() {
                debug!("`{method}`: cancelled, leaving remaining rows unrun");
                break;
            }
            // A missing row is a skip marker and contributes no result.
            let Some(row) = row else { continue };

            let values = resolver.inject_parameters(&row, method, ctx);
            let row_arguments = arguments
                .to_builder()
                .with_parameter_values(values)
                .with_parameters_index(parameters_index)
                .build();

            invocation_count.fetch_sub(1, Ordering::SeqCst);
            let mut fresh = Vec::new();
            match invoker.invoke_test_method(&row_arguments, ctx.suite(), failure) {
                Ok(result) => fresh.push(result),
                Err(error) => {
                    warn!("`{method}` row {parameters_index}: invoker error: {error}");
                }
            }

            let last_success = fresh
                .last()
                .map_or(false, |result| result.status() == TestStatus::Success);
            if failure.count == 0 || last_success {
                results.append(&mut fresh);
            } else {
                let mut retry_results = Vec::new();
                *failure =
                    invoker.retry_failed(&row_arguments, &mut retry_results, failure.count, ctx);
                results.append(&mut retry_results);
            }

            if failure.count > 0
                && (skip_failed_invocation_counts || method.skip_failed_invocations())
            {
                debug!("`{method}`: failure cascades over the remaining invocation budget");
                while invocation_count.fetch_sub(1, Ordering::SeqCst) > 0 {
                    let skipped =
                        invoker.register_skipped_test_result(method, Local::now(), None);
                    let invoked = InvokedMethod::new(Arc::clone(method), Local::now());
                    invoker.invoke_listeners_for_skipped(&skipped, &invoked);
                    results.push(skipped);
                }
                break;
            }
        }

        results
    }

    /// Fans the rows out over a pool and flattens the per-row results in
    /// submission order.
    ///
    /// Rows are independent: each task gets its own failure context seeded
    /// from `failure_count`, and no cascade skipping happens.
    pub fn run_in_parallel(
        arguments: &TestMethodArguments,
        ctx: &Arc<TestContext>,
        failure_count: u32,
        rows: Vec<Option<ParameterRow>>,
        cancel: &CancelToken,
    ) -> Vec<TestResult> {
        let method = arguments.method();
        let suite = ctx.suite();
        let reuse =
            suite.share_thread_pool_for_data_providers() || suite.use_global_thread_pool();
        let threads = if suite.use_global_thread_pool() {
            suite.thread_count().compute()
        } else if method.data_provider().map_or(false, |p| p.is_parallel()) {
            suite.data_provider_thread_count()
        } else {
            method.thread_pool_size()
        };

        let factory = ctx.configuration().pool_factory();
        let pool = if reuse {
            ctx.shared_pools()
                .get_or_create(threads, "dataprovider", factory.as_ref())
        } else {
            factory.create(threads, "dataprovider")
        };
        let pool = match pool {
            Ok(pool) => pool,
            Err(error) => {
                warn!("`{method}`: data-provider pool unavailable ({error}), running rows inline");
                return Self::run_rows_inline(arguments, ctx, failure_count, rows, cancel);
            }
        };

        let resolver = ctx.configuration().parameter_resolver();
        let mut buckets = Vec::new();
        let mut handles = Vec::new();
        for (parameters_index, row) in rows.into_iter().enumerate() {
            let Some(row) = row else { continue };

            let values = resolver.inject_parameters(&row, method, ctx);
            let row_arguments = arguments
                .to_builder()
                .with_parameter_values(values)
                .with_parameters_index(parameters_index)
                .build();

            let bucket = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let task_bucket = Arc::clone(&bucket);
            let task_ctx = Arc::clone(ctx);
            let outer_cancel = cancel.clone();
            let submitted = pool.submit(move |cx| {
                if cx.cancel_token().is_cancelled() || outer_cancel.is_cancelled() {
                    return;
                }
                let mut local_failure = FailureContext {
                    count: failure_count,
                };
                let invoker = task_ctx.configuration().test_invoker();
                match invoker.invoke_test_method(
                    &row_arguments,
                    task_ctx.suite(),
                    &mut local_failure,
                ) {
                    Ok(result) => task_bucket.lock().push(result),
                    Err(error) => {
                        warn!("parallel row {parameters_index}: invoker error: {error}");
                    }
                }
            });
            match submitted {
                Ok(handle) => {
                    buckets.push(bucket);
                    handles.push(handle);
                }
                Err(error) => warn!("`{method}` row {parameters_index}: {error}"),
            }
        }

        pool.await_all(&handles, None);
        if !reuse {
            pool.shutdown();
        }

        buckets
            .into_iter()
            .flat_map(|bucket| {
                let mut results = bucket.lock();
                std::mem::take(&mut *results)
            })
            .collect()
    }

    // Degraded path when no pool can be built: same independent-row
    // semantics, on the calling thread.
    fn run_rows_inline(
        arguments: &TestMethodArguments,
        ctx: &Arc<TestContext>,
        failure_count: u32,
        rows: Vec<Option<ParameterRow>>,
        cancel: &CancelToken,
    ) -> Vec<TestResult> {
        let method = arguments.method();
        let invoker = ctx.configuration().test_invoker();
        let resolver = ctx.configuration().parameter_resolver();
        let mut results = Vec::new();
        for (parameters_index, row) in rows.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let Some(row) = row else { continue };
            let values = resolver.inject_parameters(&row, method, ctx);
            let row_arguments = arguments
                .to_builder()
                .with_parameter_values(values)
                .with_parameters_index(parameters_index)
                .build();
            let mut local_failure = FailureContext {
                count: failure_count,
            };
            match invoker.invoke_test_method(&row_arguments, ctx.suite(), &mut local_failure) {
                Ok(result) => results.push(result),
                Err(error) => warn!("`{method}` row {parameters_index}: invoker error: {error}"),
            }
        }
        results
    }
}
