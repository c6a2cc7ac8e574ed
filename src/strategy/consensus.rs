//! Parallel consensus and single-agent execution.

use futures::future::join_all;

use crate::aggregate::{Algorithm, Quorum};
use crate::task::{FailureReason, SwarmResult};

use super::{shrink, Dispatch, StrategyEngine, StrategyKind};

impl StrategyEngine {
    /// Dispatch every eligible agent concurrently and aggregate what comes back.
    pub(crate) async fn run_consensus(&self, d: &Dispatch<'_>, prompt: &str) -> SwarmResult {
        let agents = shrink(d.pool.clone(), d.level());
        d.claim(&agents);

        tracing::debug!(
            task_id = %d.task.id(),
            agents = agents.len(),
            "Dispatching parallel consensus"
        );

        let results = join_all(agents.iter().map(|a| self.dispatch(a, prompt, d))).await;
        self.aggregator
            .aggregate(d.task.id(), results, d.team.algorithm, d.team.quorum)
    }

    /// One call to the best available agent.
    pub(crate) async fn run_single(&self, d: &Dispatch<'_>, prompt: &str) -> SwarmResult {
        let Some(agent) = self.best_available(d) else {
            return SwarmResult::failure(d.task.id(), StrategyKind::SingleAgent, FailureReason::NoCapableAgent);
        };
        d.claim(&[agent]);

        let result = self.dispatch(agent, prompt, d).await;
        self.aggregator
            .aggregate(d.task.id(), vec![result], Algorithm::Final, Quorum::AtLeast(1))
    }
}
