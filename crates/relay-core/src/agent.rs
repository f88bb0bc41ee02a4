use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::errors::AgentError;
use crate::ids::{AgentId, RunId, SessionId};
use crate::memory::{KeyPresence, MemorySnapshot};

/// What an agent pushes to the executor while it runs.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentOutput {
    /// A presentation fragment. Never touches memory.
    Chunk(String),
    /// A complete value for one declared key. Staged until the agent ends.
    Write { key: String, value: Value },
}

/// Trait implemented by each capability unit.
///
/// `execute` runs on its own task. Everything it produces goes through the
/// context; returning `Ok(())` means every declared key has been provided.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn execute(&self, ctx: &mut AgentContext) -> Result<(), AgentError>;
}

/// Registration record for one agent. Immutable once registered.
#[derive(Clone)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub purpose: String,
    pub requires: Vec<String>,
    pub provides: Vec<String>,
    handler: Arc<dyn Agent>,
}

impl AgentDescriptor {
    pub fn new(
        id: impl Into<AgentId>,
        purpose: impl Into<String>,
        handler: Arc<dyn Agent>,
    ) -> Self {
        Self {
            id: id.into(),
            purpose: purpose.into(),
            requires: Vec::new(),
            provides: Vec::new(),
            handler,
        }
    }

    pub fn requires<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn provides<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn handler(&self) -> Arc<dyn Agent> {
        Arc::clone(&self.handler)
    }

    pub fn declares(&self, key: &str) -> bool {
        self.provides.iter().any(|k| k == key)
    }

    /// Required keys not yet available, in declaration order.
    pub fn missing<'a>(&'a self, available: &dyn KeyPresence) -> Vec<&'a str> {
        self.requires
            .iter()
            .filter(|k| !available.has_key(k))
            .map(String::as_str)
            .collect()
    }

    pub fn unmet_count(&self, available: &dyn KeyPresence) -> usize {
        self.requires.iter().filter(|k| !available.has_key(k)).count()
    }
}

impl fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("id", &self.id)
            .field("purpose", &self.purpose)
            .field("requires", &self.requires)
            .field("provides", &self.provides)
            .finish_non_exhaustive()
    }
}

/// Everything needed to build an [`AgentContext`].
pub struct ContextParts {
    pub query: String,
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub run_id: RunId,
    pub memory: MemorySnapshot,
    pub provides: Vec<String>,
    pub tx: mpsc::Sender<AgentOutput>,
    pub cancel: CancellationToken,
}

/// The agent's window onto the session while it runs.
///
/// Reads see the memory snapshot taken when the agent started, overlaid with
/// the agent's own writes.
pub struct AgentContext {
    query: String,
    agent_id: AgentId,
    session_id: SessionId,
    run_id: RunId,
    memory: MemorySnapshot,
    staged: HashMap<String, Value>,
    provides: Vec<String>,
    tx: mpsc::Sender<AgentOutput>,
    cancel: CancellationToken,
}

impl AgentContext {
    pub fn new(parts: ContextParts) -> Self {
        Self {
            query: parts.query,
            agent_id: parts.agent_id,
            session_id: parts.session_id,
            run_id: parts.run_id,
            memory: parts.memory,
            staged: HashMap::new(),
            provides: parts.provides,
            tx: parts.tx,
            cancel: parts.cancel,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn read(&self, key: &str) -> Option<&Value> {
        self.staged.get(key).or_else(|| self.memory.get(key))
    }

    pub fn require(&self, key: &str) -> Result<&Value, AgentError> {
        self.read(key)
            .ok_or_else(|| AgentError::MissingInput(key.to_string()))
    }

    /// Stream one presentation fragment.
    pub async fn emit(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.send(AgentOutput::Chunk(text.into())).await
    }

    /// Write the complete value of a declared key.
    pub async fn provide(
        &mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), AgentError> {
        let key = key.into();
        if !self.provides.iter().any(|k| *k == key) {
            return Err(AgentError::UndeclaredKey(key));
        }
        self.send(AgentOutput::Write {
            key: key.clone(),
            value: value.clone(),
        })
        .await?;
        self.staged.insert(key, value);
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled. For use in `tokio::select!`.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    async fn send(&self, output: AgentOutput) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            sent = self.tx.send(output) => sent.map_err(|_| AgentError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl Agent for Noop {
        async fn execute(&self, _ctx: &mut AgentContext) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn context(
        memory: MemorySnapshot,
        provides: &[&str],
        buffer: usize,
    ) -> (AgentContext, mpsc::Receiver<AgentOutput>, CancellationToken) {
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        let ctx = AgentContext::new(ContextParts {
            query: "list tables".into(),
            agent_id: AgentId::from("lister"),
            session_id: SessionId::new(),
            run_id: RunId::new(),
            memory,
            provides: provides.iter().map(|s| s.to_string()).collect(),
            tx,
            cancel: cancel.clone(),
        });
        (ctx, rx, cancel)
    }

    #[test]
    fn descriptor_builder_and_missing() {
        let d = AgentDescriptor::new("charter", "draw a chart", Arc::new(Noop))
            .requires(["result", "style"])
            .provides(["chart"]);

        let mut store = MemoryStore::new();
        store.set("style", json!("bar"), &AgentId::from("x"));

        assert_eq!(d.missing(&store), vec!["result"]);
        assert_eq!(d.unmet_count(&store), 1);
        assert!(d.declares("chart"));
        assert!(!d.declares("result"));
        assert!(format!("{d:?}").contains("charter"));
    }

    #[tokio::test]
    async fn emit_and_provide_flow_through_channel() {
        let (mut ctx, mut rx, _cancel) = context(MemorySnapshot::default(), &["tables"], 8);

        ctx.emit("found 2 tables").await.unwrap();
        ctx.provide("tables", json!(["a", "b"])).await.unwrap();

        assert_eq!(rx.recv().await, Some(AgentOutput::Chunk("found 2 tables".into())));
        assert_eq!(
            rx.recv().await,
            Some(AgentOutput::Write {
                key: "tables".into(),
                value: json!(["a", "b"])
            })
        );
        assert_eq!(ctx.read("tables"), Some(&json!(["a", "b"])));
    }

    #[tokio::test]
    async fn undeclared_write_rejected() {
        let (mut ctx, mut rx, _cancel) = context(MemorySnapshot::default(), &["tables"], 8);
        let err = ctx.provide("chart", json!(1)).await.unwrap_err();
        assert_eq!(err, AgentError::UndeclaredKey("chart".into()));
        drop(ctx);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn reads_see_snapshot() {
        let mut store = MemoryStore::new();
        store.set("tables", json!(["orders"]), &AgentId::from("lister"));
        let (ctx, _rx, _cancel) = context(store.snapshot(), &[], 8);

        assert_eq!(ctx.require("tables").unwrap(), &json!(["orders"]));
        assert_eq!(
            ctx.require("result").unwrap_err(),
            AgentError::MissingInput("result".into())
        );
    }

    #[tokio::test]
    async fn emit_after_cancel_fails() {
        let (ctx, _rx, cancel) = context(MemorySnapshot::default(), &[], 1);
        cancel.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.emit("late").await.unwrap_err(), AgentError::Cancelled);
    }

    #[tokio::test]
    async fn emit_with_closed_receiver_is_cancelled() {
        let (ctx, rx, _cancel) = context(MemorySnapshot::default(), &[], 1);
        drop(rx);
        assert_eq!(ctx.emit("nobody listening").await.unwrap_err(), AgentError::Cancelled);
    }
}
