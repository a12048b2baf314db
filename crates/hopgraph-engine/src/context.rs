//! Per-request execution context.
//!
//! Everything a request needs beyond its inputs travels here: the tenant,
//! the wall-clock deadline and an optional progress channel. Nothing in the
//! engine keeps request state in globals, so concurrent requests never see
//! each other's notifications.

use hopgraph_core::{Action, TenantId};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StepStarted {
        step_id: String,
        action: Action,
        collection: String,
    },
    StepFinished {
        step_id: String,
        status: String,
        documents: usize,
    },
    ChainBroken {
        step_id: String,
        reason: String,
    },
    Phase {
        phase: String,
        iteration: u32,
    },
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub tenant_id: TenantId,
    started: Instant,
    deadline: Option<Instant>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            started: Instant::now(),
            deadline: None,
            progress: None,
        }
    }

    /// Context plus the receiving end of its progress channel.
    pub fn with_channel(
        tenant_id: impl Into<TenantId>,
    ) -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tenant_id).with_progress(tx), rx)
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.deadline = Some(self.started + budget);
        self
    }

    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    // A closed receiver is not an error for the request.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn budget_exceeded(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}
