//! Ordered supervision of long running units.
//!
//! Members start one at a time: a member is spawned only after the one
//! before it signalled [`Ready`]. Once everything is up, the first member to
//! exit takes the whole group down by cancelling the shared token, and the
//! first error any member returned becomes the group's result.

use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Readiness notifier handed to every runner.
#[derive(Debug)]
pub struct Ready(Option<oneshot::Sender<()>>);

impl Ready {
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// A notifier nobody listens to.
    pub fn detached() -> Self {
        Self(None)
    }

    /// Idempotent.
    pub fn signal(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
pub trait Runner: Send + 'static {
    /// Runs until `shutdown` is cancelled (returning `Ok`) or the unit fails.
    async fn run(&mut self, shutdown: CancellationToken, ready: Ready) -> Result<()>;
}

/// Adapts a closure into a [`Runner`].
pub struct RunFn<F>(Option<F>);

pub fn run_fn<F, Fut>(f: F) -> RunFn<F>
where
    F: FnOnce(CancellationToken, Ready) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    RunFn(Some(f))
}

#[async_trait]
impl<F, Fut> Runner for RunFn<F>
where
    F: FnOnce(CancellationToken, Ready) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&mut self, shutdown: CancellationToken, ready: Ready) -> Result<()> {
        match self.0.take() {
            Some(f) => f(shutdown, ready).await,
            None => Ok(()),
        }
    }
}

pub struct Member {
    pub name: String,
    runner: Box<dyn Runner>,
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member").field("name", &self.name).finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct ProcessGroup {
    members: Vec<Member>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn member(mut self, name: impl Into<String>, runner: impl Runner) -> Self {
        self.members.push(Member {
            name: name.into(),
            runner: Box::new(runner),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

type Running = Vec<(String, JoinHandle<Result<()>>)>;
type Exits = FuturesUnordered<BoxFuture<'static, (String, Result<()>)>>;

/// Spawns members in order. On failure returns what is already running
/// together with the result the group should report.
async fn start(members: Vec<Member>, token: &CancellationToken) -> std::result::Result<Running, (Running, Result<()>)> {
    let mut running = Vec::with_capacity(members.len());

    for Member { name, mut runner } in members {
        let (ready, ready_rx) = Ready::channel();
        let member_token = token.clone();
        let mut handle = tokio::spawn(async move { runner.run(member_token, ready).await });

        tokio::select! {
            signalled = ready_rx => {
                if signalled.is_ok() {
                    tracing::info!(member = %name, "group.member-ready");
                    running.push((name, handle));
                    continue;
                }
                // Ready dropped without a signal: the member is returning.
                let result = joined(&name, (&mut handle).await);
                return Err((running, not_ready(&name, result, token)));
            }
            result = &mut handle => {
                let result = joined(&name, result);
                return Err((running, not_ready(&name, result, token)));
            }
            () = token.cancelled() => {
                running.push((name, handle));
                return Err((running, Ok(())));
            }
        }
    }

    Ok(running)
}

fn joined(name: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    result.unwrap_or_else(|e| {
        Err(Error::MemberExited {
            name: name.to_string(),
            reason: e.to_string(),
        })
    })
}

fn not_ready(name: &str, result: Result<()>, token: &CancellationToken) -> Result<()> {
    match result {
        Err(e) => {
            tracing::error!(member = %name, error = %e, "group.member-failed-to-start");
            Err(e)
        }
        Ok(()) if token.is_cancelled() => Ok(()),
        Ok(()) => Err(Error::MemberExited {
            name: name.to_string(),
            reason: "exited before becoming ready".to_string(),
        }),
    }
}

fn exits(running: Running) -> Exits {
    running
        .into_iter()
        .map(|(name, handle)| {
            async move {
                let result = joined(&name, handle.await);
                (name, result)
            }
            .boxed()
        })
        .collect()
}

/// Keeps the earliest error.
fn record(first: &mut Result<()>, name: &str, result: Result<()>) {
    match result {
        Ok(()) => tracing::info!(member = %name, "group.member-exited"),
        Err(e) => {
            tracing::error!(member = %name, error = %e, "group.member-exited-with-error");
            if first.is_ok() {
                *first = Err(e);
            }
        }
    }
}

async fn drain(mut exits: Exits, mut first: Result<()>) -> Result<()> {
    while let Some((name, result)) = exits.next().await {
        record(&mut first, &name, result);
    }
    first
}

#[async_trait]
impl Runner for ProcessGroup {
    async fn run(&mut self, shutdown: CancellationToken, mut ready: Ready) -> Result<()> {
        let members = std::mem::take(&mut self.members);
        // Member failures cancel this token, never the caller's.
        let token = shutdown.child_token();

        let running = match start(members, &token).await {
            Ok(running) => running,
            Err((running, result)) => {
                token.cancel();
                return drain(exits(running), result).await;
            }
        };

        ready.signal();

        let mut exits = exits(running);
        let mut first = Ok(());
        tokio::select! {
            Some((name, result)) = exits.next() => record(&mut first, &name, result),
            () = token.cancelled() => tracing::info!("group.signalled"),
        }

        token.cancel();
        drain(exits, first).await
    }
}
