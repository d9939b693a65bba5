// ============================================================================
// File: packages/ovbackup/src/platform/polling.rs
// ----------------------------------------------------------------------------
// Bounded polling and retry helpers for control-plane calls.
//
// Waiting never busy-loops: every poll is followed by a tokio sleep whose
// length grows exponentially up to a ceiling, and the total wait is capped by
// the caller's timeout.
// ============================================================================

use std::future::Future;
use std::iter;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::client::PlatformClient;
use super::errors::{PlatformError, PlatformResult};
use super::types::{ResourceRef, ResourceStatus, VmStatus};

/// Exponential backoff between polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// First delay
    pub initial: Duration,

    /// Upper bound for a single delay
    pub max: Duration,

    /// Growth factor applied after every delay
    pub factor: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            factor: 2,
        }
    }

    /// Infinite sequence of delays: `initial`, `initial * factor`, ... capped at `max`
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let max = self.max;
        let factor = self.factor.max(1);
        iter::successors(Some(self.initial.min(max)), move |delay| {
            Some(delay.saturating_mul(factor).min(max))
        })
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(15))
    }
}

/// How often a single control-plane call may be repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,

    pub backoff: Backoff,

    /// Also retry `409 Conflict` (locked resources during release)
    pub retry_conflicts: bool,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            retry_conflicts: false,
        }
    }

    pub fn with_conflicts(mut self) -> Self {
        self.retry_conflicts = true;
        self
    }

    fn should_retry(&self, err: &PlatformError) -> bool {
        err.is_transient() || (self.retry_conflicts && err.is_conflict())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Backoff::default())
    }
}

/// Run `call` until it succeeds, fails permanently, or attempts run out
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> PlatformResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PlatformResult<T>>,
{
    let mut delays = policy.backoff.delays();
    let mut attempt = 1;

    loop {
        match call().await {
            Err(err) if attempt < policy.attempts && policy.should_retry(&err) => {
                pause(policy, operation, attempt, &err, &mut delays).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

/// Like [`with_retry`] for calls that create a resource
///
/// A failed attempt may still have created the resource on the engine, so
/// every retry first asks `find` for it and adopts what it returns instead
/// of creating a second one.
pub async fn create_with_retry<T, C, CFut, F, FFut>(
    policy: &RetryPolicy,
    operation: &str,
    mut create: C,
    mut find: F,
) -> PlatformResult<T>
where
    C: FnMut() -> CFut,
    CFut: Future<Output = PlatformResult<T>>,
    F: FnMut() -> FFut,
    FFut: Future<Output = PlatformResult<Option<T>>>,
{
    let mut delays = policy.backoff.delays();
    let mut attempt = 1;

    loop {
        let outcome = if attempt == 1 {
            create().await
        } else {
            match find().await {
                Ok(Some(existing)) => {
                    info!("{operation}: adopting the resource created by attempt {}", attempt - 1);
                    return Ok(existing);
                }
                Ok(None) => create().await,
                Err(err) => Err(err),
            }
        };

        match outcome {
            Err(err) if attempt < policy.attempts && policy.should_retry(&err) => {
                pause(policy, operation, attempt, &err, &mut delays).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

async fn pause(
    policy: &RetryPolicy,
    operation: &str,
    attempt: u32,
    err: &PlatformError,
    delays: &mut impl Iterator<Item = Duration>,
) {
    let delay = delays.next().unwrap_or(policy.backoff.max);
    warn!(
        "{operation} failed (attempt {attempt}/{}): {err}; retrying in {}ms",
        policy.attempts,
        delay.as_millis()
    );
    tokio::time::sleep(delay).await;
}

enum Verdict {
    Done,
    Wait(String),
    Fail(PlatformError),
}

async fn poll_until<P, F>(
    client: &P,
    resource: ResourceRef<'_>,
    timeout: Duration,
    backoff: &Backoff,
    mut judge: F,
) -> PlatformResult<()>
where
    P: PlatformClient,
    F: FnMut(ResourceStatus) -> Verdict,
{
    let started = Instant::now();
    let mut delays = backoff.delays();

    loop {
        match client.status(resource).await {
            Ok(status) => match judge(status) {
                Verdict::Done => return Ok(()),
                Verdict::Wait(state) => debug!("Waiting for {resource}, state is now '{state}'"),
                Verdict::Fail(err) => return Err(err),
            },
            Err(err) if err.is_transient() => {
                warn!("Polling {resource} failed transiently: {err}");
            }
            Err(err) => return Err(err),
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(PlatformError::Timeout {
                resource: resource.to_string(),
                waited: timeout,
            });
        }

        let delay = delays.next().unwrap_or(backoff.max).min(timeout - elapsed);
        tokio::time::sleep(delay).await;
    }
}

/// Wait until the engine reports `resource` as ready
///
/// Transient polling errors are tolerated until the deadline. A resource that
/// disappears or fails while being prepared is reported immediately.
pub async fn wait_ready<P: PlatformClient>(
    client: &P,
    resource: ResourceRef<'_>,
    timeout: Duration,
    backoff: &Backoff,
) -> PlatformResult<()> {
    poll_until(client, resource, timeout, backoff, |status| match status {
        ResourceStatus::Ready => Verdict::Done,
        ResourceStatus::Pending(state) => Verdict::Wait(state),
        ResourceStatus::Failed(state) => Verdict::Fail(PlatformError::Failed {
            resource: resource.to_string(),
            state,
        }),
        ResourceStatus::Missing => Verdict::Fail(PlatformError::NotFound {
            resource: resource.to_string(),
        }),
    })
    .await
}

/// Wait until `resource` no longer exists on the engine
pub async fn wait_released<P: PlatformClient>(
    client: &P,
    resource: ResourceRef<'_>,
    timeout: Duration,
    backoff: &Backoff,
) -> PlatformResult<()> {
    poll_until(client, resource, timeout, backoff, |status| match status {
        ResourceStatus::Missing => Verdict::Done,
        ResourceStatus::Ready => Verdict::Wait("present".to_string()),
        ResourceStatus::Pending(state) | ResourceStatus::Failed(state) => Verdict::Wait(state),
    })
    .await
}

/// Wait until the VM runs on `host` and has left the `migrating` state
///
/// An engine may keep reporting the VM as `up` on its old host for a moment
/// after accepting a migration, so the host itself is compared.
pub async fn wait_on_host<P: PlatformClient>(
    client: &P,
    vm_id: &str,
    host: &str,
    timeout: Duration,
    backoff: &Backoff,
) -> PlatformResult<()> {
    let started = Instant::now();
    let mut delays = backoff.delays();

    loop {
        match client.get_vm(vm_id).await {
            Ok(vm) if vm.host.as_deref() == Some(host) && vm.status != VmStatus::Migrating => {
                return Ok(());
            }
            Ok(vm) => debug!(
                "Waiting for VM {vm_id} to reach host {host}, it is {} on {}",
                vm.status,
                vm.host.as_deref().unwrap_or("no host")
            ),
            Err(err) if err.is_transient() => {
                warn!("Polling VM {vm_id} failed transiently: {err}");
            }
            Err(err) => return Err(err),
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(PlatformError::Timeout {
                resource: format!("migration of VM {vm_id} to host {host}"),
                waited: timeout,
            });
        }

        let delay = delays.next().unwrap_or(backoff.max).min(timeout - elapsed);
        tokio::time::sleep(delay).await;
    }
}
