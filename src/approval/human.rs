//! Human approval capability
//!
//! `request_approval` hands a plan or step to a reviewer and returns an
//! approval id; `await_decision` blocks the caller (never other plans) until
//! the reviewer approves or rejects.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

use super::ApprovalDecision;

/// What a reviewer is asked to sign off
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub task_id: String,
    pub plan_id: String,
    pub plan_version: u32,
    /// None for a plan-level request
    pub step_id: Option<String>,
    pub summary: String,
    /// Gate metadata for plan-level requests
    pub decision: Option<ApprovalDecision>,
}

impl ApprovalRequest {
    pub fn is_plan_level(&self) -> bool {
        self.step_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ApprovalVerdict {
    Approved,
    Rejected { reason: Option<String> },
}

impl ApprovalVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalVerdict::Approved)
    }
}

#[async_trait]
pub trait ApprovalService: Send + Sync {
    /// Submit a request, returning its approval id
    async fn request_approval(&self, request: ApprovalRequest) -> Result<String>;

    /// Wait until the request is resolved
    async fn await_decision(&self, approval_id: &str) -> Result<ApprovalVerdict>;
}

/// Approves everything immediately
#[derive(Debug, Clone, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalService for AutoApprove {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<String> {
        tracing::debug!("Auto-approving {} ({:?})", request.plan_id, request.step_id);
        Ok(format!("auto-{}", uuid::Uuid::new_v4()))
    }

    async fn await_decision(&self, _approval_id: &str) -> Result<ApprovalVerdict> {
        Ok(ApprovalVerdict::Approved)
    }
}

struct Pending {
    request: ApprovalRequest,
    tx: Option<oneshot::Sender<ApprovalVerdict>>,
    rx: Option<oneshot::Receiver<ApprovalVerdict>>,
}

/// Approval requests parked until someone calls [`PendingApprovals::resolve`].
///
/// Cloning shares the same queue, so one clone can be handed to the engine
/// and another to whatever surface shows requests to humans.
#[derive(Clone, Default)]
pub struct PendingApprovals {
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    notify: Option<mpsc::UnboundedSender<(String, ApprovalRequest)>>,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also push every new request to `tx`
    pub fn with_notifier(mut self, tx: mpsc::UnboundedSender<(String, ApprovalRequest)>) -> Self {
        self.notify = Some(tx);
        self
    }

    /// Requests that have not been resolved yet
    pub fn list(&self) -> Result<Vec<(String, ApprovalRequest)>> {
        let pending = self
            .pending
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        Ok(pending
            .iter()
            .filter(|(_, p)| p.tx.is_some())
            .map(|(id, p)| (id.clone(), p.request.clone()))
            .collect())
    }

    pub fn resolve(&self, approval_id: &str, verdict: ApprovalVerdict) -> Result<()> {
        let tx = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            pending
                .get_mut(approval_id)
                .and_then(|p| p.tx.take())
                .with_context(|| format!("No pending approval {}", approval_id))?
        };
        tracing::info!("Approval {} resolved: {:?}", approval_id, verdict);
        // The waiter may have given up (timeout); the verdict is then dropped
        let _ = tx.send(verdict);
        Ok(())
    }

    pub fn approve(&self, approval_id: &str) -> Result<()> {
        self.resolve(approval_id, ApprovalVerdict::Approved)
    }

    pub fn reject(&self, approval_id: &str, reason: impl Into<String>) -> Result<()> {
        self.resolve(
            approval_id,
            ApprovalVerdict::Rejected {
                reason: Some(reason.into()),
            },
        )
    }
}

#[async_trait]
impl ApprovalService for PendingApprovals {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<String> {
        let id = format!("approval-{}", uuid::Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            pending.insert(
                id.clone(),
                Pending {
                    request: request.clone(),
                    tx: Some(tx),
                    rx: Some(rx),
                },
            );
        }
        if let Some(notify) = &self.notify {
            let _ = notify.send((id.clone(), request));
        }
        Ok(id)
    }

    async fn await_decision(&self, approval_id: &str) -> Result<ApprovalVerdict> {
        let rx = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            pending
                .get_mut(approval_id)
                .and_then(|p| p.rx.take())
                .with_context(|| format!("Approval {} is unknown or already awaited", approval_id))?
        };
        let verdict = rx.await.context("Approval channel closed")?;

        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(approval_id);
        }
        Ok(verdict)
    }
}

/// Asks on the terminal. Used by the CLI.
#[derive(Debug, Clone, Default)]
pub struct ConsoleApprover {
    requests: Arc<Mutex<HashMap<String, ApprovalRequest>>>,
}

impl ConsoleApprover {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalService for ConsoleApprover {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<String> {
        let id = format!("console-{}", uuid::Uuid::new_v4());
        self.requests
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .insert(id.clone(), request);
        Ok(id)
    }

    async fn await_decision(&self, approval_id: &str) -> Result<ApprovalVerdict> {
        let request = self
            .requests
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .remove(approval_id)
            .with_context(|| format!("Unknown approval {}", approval_id))?;

        tokio::task::spawn_blocking(move || -> Result<ApprovalVerdict> {
            println!();
            match &request.step_id {
                Some(step) => println!("⏸  Step '{}' of plan v{} needs approval", step, request.plan_version),
                None => println!("📋 Plan v{} needs approval", request.plan_version),
            }
            println!("{}", request.summary);
            if let Some(decision) = &request.decision {
                println!(
                    "   {} risk {:.2} | trust {:.2} | {}",
                    decision.risk_band.icon(),
                    decision.risk,
                    decision.effective_trust,
                    decision.reason
                );
            }
            print!("Approve? [y/N] ");
            io::stdout().flush()?;

            let mut input = String::new();
            io::stdin().read_line(&mut input)?;
            Ok(match input.trim().to_lowercase().as_str() {
                "y" | "yes" => ApprovalVerdict::Approved,
                _ => ApprovalVerdict::Rejected {
                    reason: Some("rejected at console".to_string()),
                },
            })
        })
        .await
        .context("Console prompt panicked")?
    }
}
