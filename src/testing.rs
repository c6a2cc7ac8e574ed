//! Test doubles shared by unit tests across the crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::agents::Agent;
use crate::capacity::ProviderBudget;
use crate::config::{ProviderConfig, SwarmConfig};
use crate::context::SwarmContext;
use crate::events::NullEventSink;
use crate::provider::{CallParams, ProviderClient, ProviderError, ProviderRegistry, ProviderResponse};

/// What a scripted provider does for one call.
#[derive(Clone)]
pub enum Step {
    Reply(String),
    ReplyWithSeverity(String, f64),
    Fail(ProviderError),
    /// Never answers
    Hang,
    /// Answers after a delay
    Delay(Duration, String),
    /// Panics inside the call
    Panic,
}

impl Step {
    pub fn reply(s: &str) -> Self {
        Step::Reply(s.to_string())
    }
}

/// Provider whose answers are scripted per call.
pub struct ScriptedProvider {
    id: String,
    queue: Mutex<VecDeque<Step>>,
    default: Step,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(id: &str, default: Step) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            queue: Mutex::new(VecDeque::new()),
            default,
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn replying(id: &str, content: &str) -> Arc<Self> {
        Self::new(id, Step::reply(content))
    }

    /// Queue a one-off step ahead of the default.
    pub fn push(&self, step: Step) {
        self.queue.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(
        &self,
        prompt: &str,
        _params: &CallParams,
        _timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());

        match self.next_step() {
            Step::Reply(content) => Ok(ProviderResponse {
                content,
                token_cost: 10,
                severity: None,
            }),
            Step::ReplyWithSeverity(content, severity) => Ok(ProviderResponse {
                content,
                token_cost: 10,
                severity: Some(severity),
            }),
            Step::Fail(e) => Err(e),
            Step::Hang => std::future::pending().await,
            Step::Delay(d, content) => {
                tokio::time::sleep(d).await;
                Ok(ProviderResponse {
                    content,
                    token_cost: 10,
                    severity: None,
                })
            }
            Step::Panic => panic!("scripted provider {} panicked", self.id),
        }
    }
}

pub fn agent(role: &str, provider: &str, priority: u32) -> Agent {
    Agent::new(role, provider).with_priority(priority)
}

/// Config with generous budgets for each provider and fast, jitter-free retries.
pub fn config_for(providers: &[&str]) -> SwarmConfig {
    let mut config = SwarmConfig::default();
    config.retry.jitter = 0.0;
    config.retry.base_delay_ms = 10;
    config.orchestrator.call_timeout_ms = 1_000;
    for id in providers {
        config.providers.insert(
            id.to_string(),
            ProviderConfig {
                budget: Some(ProviderBudget {
                    requests_per_minute: 10_000,
                    tokens_per_minute: 100_000_000,
                    max_concurrent: None,
                }),
                ..Default::default()
            },
        );
    }
    config
}

pub fn context_with(config: &SwarmConfig, providers: &[Arc<ScriptedProvider>]) -> Arc<SwarmContext> {
    let mut registry = ProviderRegistry::new();
    for p in providers {
        registry.register(p.clone());
    }
    Arc::new(SwarmContext::new(config, registry, Arc::new(NullEventSink)))
}

pub fn context(providers: &[Arc<ScriptedProvider>]) -> Arc<SwarmContext> {
    let ids: Vec<&str> = providers.iter().map(|p| p.id.as_str()).collect();
    context_with(&config_for(&ids), providers)
}
