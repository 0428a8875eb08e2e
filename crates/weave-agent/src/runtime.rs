use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use weave_core::config::{AgentConfig, RuntimeConfig};
use weave_core::context::AgentLogic;
use weave_core::error::{Result, WeaveError};
use weave_core::event::{EventBus, WeaveEvent};
use weave_core::traits::LlmProvider;
use weave_core::types::{new_id, AgentId, ExecutionResult, LogLevel};

use crate::agent::Agent;

/// Agents in creation order.
#[derive(Default)]
struct Registry {
    agents: HashMap<AgentId, Arc<Agent>>,
    order: Vec<AgentId>,
}

/// Holds agents, provider bindings and the concurrency ceiling.
///
/// Admission is checked, not queued: once `max_concurrent_executions`
/// executions are in flight, further `execute_agent` calls fail with
/// `ConcurrencyLimit`. Use the task queue for back-pressure.
pub struct AgentRuntime {
    config: RuntimeConfig,
    events: Arc<EventBus>,
    registry: RwLock<Registry>,
    providers: RwLock<HashMap<String, Arc<dyn LlmProvider>>>,
    default_provider: RwLock<Option<String>>,
    running: Mutex<HashSet<String>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Holds one slot of the concurrency ceiling until dropped.
struct AdmissionPermit<'a> {
    running: &'a Mutex<HashSet<String>>,
    ticket: String,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        lock(self.running).remove(&self.ticket);
    }
}

impl AgentRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity.max(1)));
        Self::with_event_bus(config, events)
    }

    /// Build a runtime publishing to an existing bus.
    pub fn with_event_bus(config: RuntimeConfig, events: Arc<EventBus>) -> Self {
        let default_provider = config.default_provider.clone();
        Self {
            config,
            events,
            registry: RwLock::new(Registry::default()),
            providers: RwLock::new(HashMap::new()),
            default_provider: RwLock::new(default_provider),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Register a provider under `name`, replacing any previous one.
    ///
    /// Agents bind their provider when they are created or reloaded, so
    /// register providers first.
    pub fn register_provider(&self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        let name = name.into();
        debug!(provider = %name, "Provider registered");
        write(&self.providers).insert(name, provider);
    }

    pub fn set_default_provider(&self, name: &str) -> Result<()> {
        if !read(&self.providers).contains_key(name) {
            return Err(WeaveError::ProviderNotFound(name.to_string()));
        }
        *write(&self.default_provider) = Some(name.to_string());
        Ok(())
    }

    pub fn get_provider(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        read(&self.providers).get(name).cloned()
    }

    pub fn default_provider(&self) -> Option<Arc<dyn LlmProvider>> {
        let name = read(&self.default_provider).clone()?;
        self.get_provider(&name)
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.providers).keys().cloned().collect();
        names.sort();
        names
    }

    /// Provider for an agent: its named binding, else the default.
    fn resolve_provider(&self, config: &AgentConfig) -> Result<Option<Arc<dyn LlmProvider>>> {
        match &config.provider {
            Some(name) => self
                .get_provider(name)
                .map(Some)
                .ok_or_else(|| WeaveError::ProviderNotFound(name.clone())),
            None => Ok(self.default_provider()),
        }
    }

    fn build_agent(&self, id: AgentId, config: AgentConfig, logic: AgentLogic) -> Result<Agent> {
        let provider = self.resolve_provider(&config)?;
        Ok(Agent::new(id, config, logic, self.events.clone())?
            .with_provider(provider)
            .with_backoff(self.config.backoff.clone()))
    }

    /// Validate `config` and register a new idle agent.
    pub fn create_agent(&self, config: AgentConfig, logic: AgentLogic) -> Result<Arc<Agent>> {
        let agent = Arc::new(self.build_agent(AgentId::new(), config, logic)?);

        let mut registry = write(&self.registry);
        registry.order.push(agent.id().clone());
        registry.agents.insert(agent.id().clone(), agent.clone());
        drop(registry);

        info!(agent_id = %agent.id(), agent = %agent.name(), model = %agent.config().model, "Agent created");
        self.events.publish(WeaveEvent::log(
            LogLevel::Info,
            format!("agent '{}' created ({})", agent.name(), agent.id()),
        ));
        Ok(agent)
    }

    pub fn get_agent(&self, id: &AgentId) -> Option<Arc<Agent>> {
        read(&self.registry).agents.get(id).cloned()
    }

    /// First agent created with `name`. Names are not unique.
    pub fn get_agent_by_name(&self, name: &str) -> Option<Arc<Agent>> {
        let registry = read(&self.registry);
        registry
            .order
            .iter()
            .filter_map(|id| registry.agents.get(id))
            .find(|agent| agent.name() == name)
            .cloned()
    }

    /// All agents in creation order.
    pub fn list_agents(&self) -> Vec<Arc<Agent>> {
        let registry = read(&self.registry);
        registry
            .order
            .iter()
            .filter_map(|id| registry.agents.get(id).cloned())
            .collect()
    }

    /// Unregister an agent. Executions already running finish normally.
    pub fn remove_agent(&self, id: &AgentId) -> bool {
        let mut registry = write(&self.registry);
        let removed = registry.agents.remove(id).is_some();
        if removed {
            registry.order.retain(|existing| existing != id);
            info!(agent_id = %id, "Agent removed");
        }
        removed
    }

    /// Executions currently admitted.
    pub fn running_count(&self) -> usize {
        lock(&self.running).len()
    }

    fn admit(&self) -> Result<AdmissionPermit<'_>> {
        let mut running = lock(&self.running);
        let limit = self.config.max_concurrent_executions;
        if running.len() >= limit {
            warn!(limit, "Concurrent execution limit reached");
            return Err(WeaveError::ConcurrencyLimit { limit });
        }
        let ticket = new_id();
        running.insert(ticket.clone());
        Ok(AdmissionPermit {
            running: &self.running,
            ticket,
        })
    }

    /// Execute an agent by id.
    ///
    /// Errors are admission errors only. Execution failures come back as
    /// a `failed` or `timeout` result.
    pub async fn execute_agent(
        &self,
        id: &AgentId,
        input: serde_json::Value,
    ) -> Result<ExecutionResult> {
        let agent = self
            .get_agent(id)
            .ok_or_else(|| WeaveError::AgentNotFound(id.to_string()))?;
        let _permit = self.admit()?;
        Ok(agent.execute(input).await)
    }

    /// Swap an agent's config and logic, keeping its id and state.
    ///
    /// The replacement is built before anything visible changes. If that
    /// fails, the registered agent is untouched, `agent:reload-failed` is
    /// published and `ReloadFailed` returned.
    pub async fn reload_agent(
        &self,
        id: &AgentId,
        config: AgentConfig,
        logic: AgentLogic,
    ) -> Result<Arc<Agent>> {
        let current = self
            .get_agent(id)
            .ok_or_else(|| WeaveError::AgentNotFound(id.to_string()))?;

        let replacement = match self.build_agent(id.clone(), config, logic) {
            Ok(agent) => Arc::new(agent.with_state(current.state())),
            Err(e) => {
                let reason = e.to_string();
                warn!(agent_id = %id, error = %reason, "Agent reload failed, keeping previous version");
                self.events.publish(WeaveEvent::AgentReloadFailed {
                    agent_id: id.clone(),
                    reason: reason.clone(),
                });
                return Err(WeaveError::ReloadFailed {
                    agent_id: id.to_string(),
                    reason,
                });
            }
        };

        {
            let mut registry = write(&self.registry);
            match registry.agents.get_mut(id) {
                Some(slot) => *slot = replacement.clone(),
                None => return Err(WeaveError::AgentNotFound(id.to_string())),
            }
        }

        info!(
            agent_id = %id,
            agent = %replacement.name(),
            model = %replacement.config().model,
            "Agent reloaded"
        );
        self.events.publish(WeaveEvent::AgentReloaded {
            agent_id: id.clone(),
            agent_name: replacement.name().to_string(),
        });
        Ok(replacement)
    }

    /// Drop every agent and provider, forget in-flight admissions and
    /// detach all event subscribers. Call once.
    pub async fn shutdown(&self) {
        let agents = {
            let mut registry = write(&self.registry);
            registry.order.clear();
            std::mem::take(&mut registry.agents).len()
        };
        write(&self.providers).clear();
        *write(&self.default_provider) = None;
        lock(&self.running).clear();
        self.events.close();
        info!(agents, "Agent runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::broadcast::error::RecvError;
    use weave_core::types::{AgentStatus, ExecutionStatus};
    use weave_test_utils::*;

    fn runtime(max_concurrent: usize) -> Arc<AgentRuntime> {
        Arc::new(AgentRuntime::new(RuntimeConfig {
            max_concurrent_executions: max_concurrent,
            ..RuntimeConfig::default()
        }))
    }

    #[tokio::test]
    async fn lookup_by_id_and_name() {
        let rt = runtime(4);
        let first = rt.create_agent(test_config("dup"), echo_logic()).unwrap();
        let second = rt.create_agent(test_config("dup"), echo_logic()).unwrap();
        let other = rt.create_agent(test_config("other"), echo_logic()).unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(rt.get_agent(second.id()).unwrap().id(), second.id());
        assert_eq!(rt.get_agent_by_name("dup").unwrap().id(), first.id());
        assert!(rt.get_agent_by_name("missing").is_none());

        let ids: Vec<AgentId> = rt.list_agents().iter().map(|a| a.id().clone()).collect();
        assert_eq!(ids, vec![first.id().clone(), second.id().clone(), other.id().clone()]);

        assert!(rt.remove_agent(first.id()));
        assert!(!rt.remove_agent(first.id()));
        assert_eq!(rt.get_agent_by_name("dup").unwrap().id(), second.id());
        assert_eq!(rt.list_agents().len(), 2);
    }

    #[tokio::test]
    async fn invalid_config_is_not_registered() {
        let rt = runtime(4);
        let err = rt
            .create_agent(test_config("bad").with_temperature(3.0), echo_logic())
            .unwrap_err();
        assert!(matches!(err, WeaveError::InvalidAgentConfig(_)));
        assert!(rt.list_agents().is_empty());
    }

    #[tokio::test]
    async fn execute_unknown_agent() {
        let rt = runtime(4);
        let err = rt
            .execute_agent(&AgentId::from_string("nope"), serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, WeaveError::AgentNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_rejects_instead_of_queueing() {
        let rt = runtime(1);
        let slow = rt
            .create_agent(test_config("slow"), sleeping_logic(500, serde_json::json!(1)))
            .unwrap();
        let fast = rt.create_agent(test_config("fast"), echo_logic()).unwrap();

        let background = {
            let rt = rt.clone();
            let id = slow.id().clone();
            tokio::spawn(async move { rt.execute_agent(&id, serde_json::Value::Null).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rt.running_count(), 1);

        let err = rt
            .execute_agent(fast.id(), serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, WeaveError::ConcurrencyLimit { limit: 1 }));

        let result = background.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(rt.running_count(), 0);

        let result = rt.execute_agent(fast.id(), serde_json::json!(2)).await.unwrap();
        assert_eq!(result.output, serde_json::json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_swaps_behavior_and_keeps_identity() {
        let rt = runtime(4);
        let agent = rt
            .create_agent(test_config("v1"), constant_logic(serde_json::json!("one")))
            .unwrap();
        agent.set_state("counter", serde_json::json!(7));
        let mut rx = rt.event_bus().subscribe();

        let reloaded = rt
            .reload_agent(
                agent.id(),
                test_config("v2").with_model("claude-3-haiku"),
                constant_logic(serde_json::json!("two")),
            )
            .await
            .unwrap();

        assert_eq!(reloaded.id(), agent.id());
        assert_eq!(reloaded.get_state("counter"), Some(serde_json::json!(7)));
        let current = rt.get_agent(agent.id()).unwrap();
        assert_eq!(current.config().model, "claude-3-haiku");
        assert_eq!(current.status(), AgentStatus::Idle);

        let result = rt.execute_agent(agent.id(), serde_json::Value::Null).await.unwrap();
        assert_eq!(result.output, serde_json::json!("two"));

        match rx.recv().await.unwrap() {
            WeaveEvent::AgentReloaded { agent_id, agent_name } => {
                assert_eq!(&agent_id, agent.id());
                assert_eq!(agent_name, "v2");
            }
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reload_rolls_back() {
        let rt = runtime(4);
        let agent = rt
            .create_agent(test_config("stable"), constant_logic(serde_json::json!("v1")))
            .unwrap();
        let before = rt.get_agent(agent.id()).unwrap().config().clone();
        let mut rx = rt.event_bus().subscribe();

        let err = rt
            .reload_agent(
                agent.id(),
                test_config("stable").with_timeout_ms(5),
                constant_logic(serde_json::json!("v2")),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, WeaveError::ReloadFailed { .. }));
        assert_eq!(rt.get_agent(agent.id()).unwrap().config(), &before);
        match rx.recv().await.unwrap() {
            WeaveEvent::AgentReloadFailed { agent_id, reason } => {
                assert_eq!(&agent_id, agent.id());
                assert!(reason.contains("timeout"));
            }
            other => panic!("unexpected {}", other.name()),
        }

        let result = rt.execute_agent(agent.id(), serde_json::Value::Null).await.unwrap();
        assert_eq!(result.output, serde_json::json!("v1"));
    }

    #[tokio::test]
    async fn reload_to_unknown_provider_fails() {
        let rt = runtime(4);
        let agent = rt.create_agent(test_config("a"), echo_logic()).unwrap();
        let err = rt
            .reload_agent(agent.id(), test_config("a").with_provider("ghost"), echo_logic())
            .await
            .unwrap_err();
        match err {
            WeaveError::ReloadFailed { reason, .. } => assert!(reason.contains("ghost")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn agents_bind_named_or_default_provider() {
        let rt = runtime(4);
        rt.register_provider("primary", Arc::new(MockProvider::new("primary").with_fallback("from primary")));
        rt.register_provider("backup", Arc::new(MockProvider::new("backup").with_fallback("from backup")));
        assert!(matches!(
            rt.set_default_provider("missing"),
            Err(WeaveError::ProviderNotFound(_))
        ));
        rt.set_default_provider("primary").unwrap();
        assert_eq!(rt.provider_names(), vec!["backup", "primary"]);

        let plain = rt.create_agent(test_config("plain"), provider_logic()).unwrap();
        let pinned = rt
            .create_agent(test_config("pinned").with_provider("backup"), provider_logic())
            .unwrap();
        assert!(matches!(
            rt.create_agent(test_config("lost").with_provider("ghost"), provider_logic()),
            Err(WeaveError::ProviderNotFound(_))
        ));

        let a = rt.execute_agent(plain.id(), serde_json::json!("hi")).await.unwrap();
        let b = rt.execute_agent(pinned.id(), serde_json::json!("hi")).await.unwrap();
        assert_eq!(a.output, serde_json::json!("from primary"));
        assert_eq!(b.output, serde_json::json!("from backup"));
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let rt = runtime(4);
        rt.register_provider("p", Arc::new(MockProvider::new("p")));
        let agent = rt.create_agent(test_config("a"), echo_logic()).unwrap();
        let mut rx = rt.event_bus().subscribe();

        rt.shutdown().await;

        assert!(rt.get_agent(agent.id()).is_none());
        assert!(rt.list_agents().is_empty());
        assert!(rt.get_provider("p").is_none());
        assert_eq!(rt.running_count(), 0);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }
}
