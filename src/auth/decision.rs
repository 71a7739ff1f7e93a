use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::brokerage::BrokerageId;

/// The proceed/abort point reached when some logins failed. `true` means
/// carry on with the brokerages that did authenticate.
#[async_trait]
pub trait DecisionHandler: Send + Sync {
    async fn decide(&self, failed: &[BrokerageId]) -> bool;
}

/// Always gives the same answer. Used for headless runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub bool);

#[async_trait]
impl DecisionHandler for FixedDecision {
    async fn decide(&self, _failed: &[BrokerageId]) -> bool {
        self.0
    }
}

/// Wraps a synchronous closure.
pub struct FnDecision<F>(pub F);

#[async_trait]
impl<F> DecisionHandler for FnDecision<F>
where
    F: Fn(&[BrokerageId]) -> bool + Send + Sync,
{
    async fn decide(&self, failed: &[BrokerageId]) -> bool {
        (self.0)(failed)
    }
}

/// A pending question for whoever drives the session (a prompt, a UI).
#[derive(Debug)]
pub struct DecisionRequest {
    pub failed: Vec<BrokerageId>,
    reply: oneshot::Sender<bool>,
}

impl DecisionRequest {
    pub fn respond(self, proceed: bool) {
        // The coordinator may have gone away; nothing left to tell.
        let _ = self.reply.send(proceed);
    }
}

/// Sends each decision out over a channel and waits for the answer.
/// A closed channel or a request dropped without reply counts as abort.
#[derive(Debug, Clone)]
pub struct ChannelDecision {
    tx: mpsc::Sender<DecisionRequest>,
}

impl ChannelDecision {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<DecisionRequest>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DecisionHandler for ChannelDecision {
    async fn decide(&self, failed: &[BrokerageId]) -> bool {
        let (reply, answer) = oneshot::channel();
        let request = DecisionRequest {
            failed: failed.to_vec(),
            reply,
        };
        if self.tx.send(request).await.is_err() {
            tracing::warn!("Decision channel closed, aborting");
            return false;
        }
        answer.await.unwrap_or(false)
    }
}
