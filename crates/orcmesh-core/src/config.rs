//! Configuration structs accepted by the Orchestrator and its subcomponents.
//!
//! Every field here is populated in-memory by the caller; nothing in this
//! module reads a file or an environment variable. That is the CLI/config
//! collaborator's job, not the core's.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{ResourceEnvelope, RetryPolicy};
use crate::worker::RestartPolicy;

/// Top-level configuration accepted by [`crate::orchestrator::Orchestrator::initialize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_agents: usize,
    pub min_agents: usize,
    pub tick_interval: Duration,
    pub health_check_interval: Duration,
    pub autoscale_interval: Duration,
    /// `None` disables periodic checkpointing.
    pub checkpoint_interval: Option<Duration>,
    pub drain_timeout: Duration,
    pub graceful_cancel_window: Duration,
    pub restart_policy: RestartPolicy,
    pub default_retry_policy: RetryPolicy,
    pub default_timeout: Duration,
    pub max_queue_size: usize,
    pub aging_interval: Duration,
    pub aging_threshold: Duration,
    pub autoscaler: AutoscalerConfig,
    pub max_knowledge: usize,
    pub consensus_threshold: f64,
    pub result_retention: Duration,
    pub sustained_overage_window: Duration,
    /// Ceiling on cumulative reserved resources across all `Busy` workers.
    /// Exceeding it continuously for longer than `sustained_overage_window`
    /// is the fatal condition in §4.1: the orchestrator transitions
    /// `Running -> Failed` rather than merely alerting. Defaults to
    /// effectively unbounded so the check is opt-in.
    pub resource_hard_cap: ResourceEnvelope,
    /// Whether a graph-wide starvation condition (no workers, no capacity
    /// to create more, tasks still pending) is fatal. If `false` (default)
    /// the orchestrator stays `Running` and emits `Degraded` alerts.
    pub fail_on_starvation: bool,
}

/// Autoscaler thresholds and step sizes, consulted by the Auto Strategy's
/// `should_scale`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub up_step: u32,
    pub down_step: u32,
    /// Number of rolling scheduler-tick samples the performance trend is
    /// computed over.
    pub trend_window: usize,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            scale_up_threshold: 0.85,
            scale_down_threshold: 0.3,
            up_step: 2,
            down_step: 1,
            trend_window: 20,
        }
    }
}

impl AutoscalerConfig {
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.up_step == 0 || self.up_step > 5 {
            return Err(OrchestratorError::InvalidArgument(
                "autoscaler.up_step must be in 1..=5".into(),
            ));
        }
        if self.down_step == 0 || self.down_step > 2 {
            return Err(OrchestratorError::InvalidArgument(
                "autoscaler.down_step must be in 1..=2".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scale_up_threshold) || !(0.0..=1.0).contains(&self.scale_down_threshold)
        {
            return Err(OrchestratorError::InvalidArgument(
                "autoscaler thresholds must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: 10,
            min_agents: 1,
            tick_interval: Duration::from_millis(100),
            health_check_interval: Duration::from_secs(10),
            autoscale_interval: Duration::from_secs(5),
            checkpoint_interval: None,
            drain_timeout: Duration::from_secs(30),
            graceful_cancel_window: Duration::from_secs(5),
            restart_policy: RestartPolicy::default(),
            default_retry_policy: RetryPolicy::default(),
            default_timeout: Duration::from_secs(60),
            max_queue_size: 1000,
            aging_interval: Duration::from_secs(30),
            aging_threshold: Duration::from_secs(60),
            autoscaler: AutoscalerConfig::default(),
            max_knowledge: 1000,
            consensus_threshold: 0.5,
            result_retention: Duration::from_secs(300),
            sustained_overage_window: Duration::from_secs(60),
            resource_hard_cap: ResourceEnvelope {
                cpu: f64::MAX,
                memory: f64::MAX,
            },
            fail_on_starvation: false,
        }
    }
}

impl OrchestratorConfig {
    /// Validate this configuration, rejecting nonsensical combinations
    /// before the Orchestrator constructs any subcomponent.
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.max_agents == 0 {
            return Err(OrchestratorError::InvalidArgument(
                "max_agents must be at least 1".into(),
            ));
        }
        if self.min_agents > self.max_agents {
            return Err(OrchestratorError::InvalidArgument(
                "min_agents cannot exceed max_agents".into(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(OrchestratorError::InvalidArgument(
                "tick_interval must be positive".into(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(OrchestratorError::InvalidArgument(
                "max_queue_size must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.consensus_threshold) {
            return Err(OrchestratorError::InvalidArgument(
                "consensus_threshold must be within [0, 1]".into(),
            ));
        }
        if self.resource_hard_cap.cpu < 0.0 || self.resource_hard_cap.memory < 0.0 {
            return Err(OrchestratorError::InvalidArgument(
                "resource_hard_cap must be non-negative".into(),
            ));
        }
        self.autoscaler.validate()?;
        Ok(())
    }
}
