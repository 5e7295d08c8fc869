//! Cluster Context
//!
//! Everything the orchestration code shares: how to reach a node, where
//! things live in the tree, how long to wait and how to ask the operator.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::PollingConfig;
use crate::directory::{Connector, Directory, Layout};
use crate::error::{Error, Result};
use crate::prompt::{Confirm, Interrupt, StdinConfirm};

/// Result of waiting on server-side work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// The work reached a final state
    Finished(T),
    /// The deadline passed first; the work may still be running
    TimedOut,
    /// The operator pressed Ctrl+C; the work continues in the background
    Interrupted,
}

impl<T> WaitOutcome<T> {
    pub fn is_finished(&self) -> bool {
        matches!(self, WaitOutcome::Finished(_))
    }
}

/// Why a poll loop stopped before the work finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStop {
    TimedOut,
    Interrupted,
}

impl<T> From<WaitStop> for WaitOutcome<T> {
    fn from(stop: WaitStop) -> Self {
        match stop {
            WaitStop::TimedOut => WaitOutcome::TimedOut,
            WaitStop::Interrupted => WaitOutcome::Interrupted,
        }
    }
}

/// Result of one step of a multi-node loop. Failures are kept, not raised.
#[derive(Debug)]
pub struct PeerOutcome<T> {
    pub host: String,
    pub result: Result<T>,
}

impl<T> PeerOutcome<T> {
    pub fn new(host: impl Into<String>, result: Result<T>) -> Self {
        Self {
            host: host.into(),
            result,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Shared state for multi-node operations
#[derive(Clone)]
pub struct ClusterContext {
    connector: Arc<dyn Connector>,
    layout: Layout,
    polling: PollingConfig,
    confirm: Arc<dyn Confirm>,
    interrupt: Interrupt,
    lookup: bool,
}

impl ClusterContext {
    pub fn new(connector: Arc<dyn Connector>, layout: Layout) -> Self {
        Self {
            connector,
            layout,
            polling: PollingConfig::default(),
            confirm: Arc::new(StdinConfirm),
            interrupt: Interrupt::new(),
            lookup: true,
        }
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_confirm(mut self, confirm: Arc<dyn Confirm>) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Enable or disable host name resolution checks
    pub fn with_lookup(mut self, lookup: bool) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn polling(&self) -> &PollingConfig {
        &self.polling
    }

    pub fn confirm(&self) -> &dyn Confirm {
        self.confirm.as_ref()
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Open an authenticated session to `host`. The caller must unbind it.
    pub async fn open(&self, host: &str) -> Result<Box<dyn Directory>> {
        self.connector.connect(host).await
    }

    /// Fail with `UnknownHost` when `host` does not resolve
    pub async fn ensure_resolvable(&self, host: &str) -> Result<()> {
        if !self.lookup {
            return Ok(());
        }
        match tokio::net::lookup_host((host, 389)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(_) => Ok(()),
                None => Err(Error::UnknownHost {
                    host: host.to_string(),
                    reason: "no address records".into(),
                }),
            },
            Err(e) => Err(Error::UnknownHost {
                host: host.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Deadline for a wait of `timeout` starting now
    pub fn deadline(&self, timeout: Duration) -> Instant {
        Instant::now() + timeout
    }

    /// Sleep one poll interval unless the wait should stop
    pub async fn tick(&self, deadline: Instant) -> std::result::Result<(), WaitStop> {
        if self.interrupt.is_set() {
            return Err(WaitStop::Interrupted);
        }
        if Instant::now() >= deadline {
            return Err(WaitStop::TimedOut);
        }
        tokio::time::sleep(self.polling.interval()).await;
        if self.interrupt.is_set() {
            return Err(WaitStop::Interrupted);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::directory::MemoryCluster;
    use crate::prompt::AutoConfirm;

    /// Context over a simulated cluster with fast polling and canned answers
    pub fn context(cluster: &MemoryCluster, answer: bool) -> (ClusterContext, Arc<AutoConfirm>) {
        let confirm = Arc::new(AutoConfirm::new(answer));
        let polling = PollingConfig {
            interval_ms: 5,
            init_timeout_secs: 2,
            update_timeout_secs: 2,
            task_timeout_secs: 2,
        };
        let ctx = ClusterContext::new(Arc::new(cluster.clone()), Layout::new("dc=example,dc=com"))
            .with_polling(polling)
            .with_confirm(confirm.clone())
            .with_lookup(false);
        (ctx, confirm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ClusterBuilder, MemoryCluster};

    #[tokio::test]
    async fn test_tick_stops_on_interrupt_and_deadline() {
        let cluster = ClusterBuilder::new("dc=example,dc=com")
            .master("a.example.com", 4, &[])
            .build()
            .await;
        let (ctx, _) = testing::context(&cluster, true);

        let deadline = ctx.deadline(Duration::from_secs(5));
        assert_eq!(ctx.tick(deadline).await, Ok(()));

        let past = ctx.deadline(Duration::ZERO);
        assert_eq!(ctx.tick(past).await, Err(WaitStop::TimedOut));

        ctx.interrupt().trigger();
        assert_eq!(ctx.tick(deadline).await, Err(WaitStop::Interrupted));
    }

    #[tokio::test]
    async fn test_open_and_lookup_bypass() {
        let cluster = ClusterBuilder::new("dc=example,dc=com")
            .master("a.example.com", 4, &[])
            .build()
            .await;
        let (ctx, _) = testing::context(&cluster, true);

        assert!(ctx.ensure_resolvable("does-not-exist.invalid").await.is_ok());
        let mut session = ctx.open("a.example.com").await.unwrap();
        assert_eq!(session.host(), "a.example.com");
        session.unbind().await;
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let cluster = MemoryCluster::new();
        let ctx = ClusterContext::new(Arc::new(cluster), Layout::new("dc=example,dc=com"));
        let err = ctx.ensure_resolvable("host.invalid").await.unwrap_err();
        assert!(matches!(err, Error::UnknownHost { .. }));
        assert!(ctx.ensure_resolvable("127.0.0.1").await.is_ok());
    }
}
