use crate::discovery::{self, parse_chat_event, DiscoveryTable, PassReport};
use crate::dispatch::{self, DispatchOutcome};
use crate::error::MissionError;
use crate::gateway::AgentGateway;
use crate::watcher::WatcherTable;
use crate::{MissionConfig, MissionContext};
use chrono::Utc;
use ocp_core::protocol::CHAT_EVENT;
use ocp_core::session::DEFAULT_AGENT_ID;
use ocp_core::{canonical_session_key, NormalizedMessage, Task, TaskStore};
use ocp_gateway::{ConnectionStatus, GatewayEvent};
use std::collections::HashSet;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Orchestration state for one gateway.
pub struct MissionControl {
    ctx: MissionContext,
    discovery: Mutex<DiscoveryTable>,
    watchers: WatcherTable,
}

impl MissionControl {
    pub fn new(
        config: MissionConfig,
        gateway: Arc<dyn AgentGateway>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            ctx: MissionContext::new(config, gateway, store),
            discovery: Mutex::new(DiscoveryTable::new()),
            watchers: WatcherTable::new(),
        }
    }

    pub fn config(&self) -> &MissionConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &MissionContext {
        &self.ctx
    }

    pub fn watchers(&self) -> &WatcherTable {
        &self.watchers
    }

    /// Dispatches `task` and, when the gateway accepted it, starts watching it
    /// from the session history read before the send.
    ///
    /// A task that lost its session key to this dispatch stops being watched.
    pub async fn dispatch_task(&self, task: &Task) -> Result<DispatchOutcome, MissionError> {
        let dispatched = dispatch::dispatch(&self.ctx, task).await?;
        if let Some(previous) = dispatched.outcome.released_task_id.as_deref() {
            self.watchers.stop(previous);
        }
        if dispatched.outcome.success && dispatched.task.is_watchable() {
            self.watchers.stop(&dispatched.task.id);
            self.watchers.start_with_baseline(
                &self.ctx,
                &dispatched.task,
                dispatched.baseline.as_ref(),
            );
        }
        Ok(dispatched.outcome)
    }

    /// Newest messages of a session. A blank key falls back to the agent's
    /// main session.
    pub async fn tail_session(
        &self,
        session_key: &str,
        agent_id: Option<&str>,
    ) -> Vec<NormalizedMessage> {
        let key = match session_key.trim() {
            "" => canonical_session_key(agent_id.unwrap_or(DEFAULT_AGENT_ID)),
            key => key.to_string(),
        };
        dispatch::tail_session(&self.ctx, &key, self.ctx.config.tail_limit).await
    }

    /// Starts a watcher for every in-progress task bound to a session that
    /// does not already have one. Returns how many were started.
    pub fn resume_watchers(&self, tasks: &[Task]) -> usize {
        let started = tasks
            .iter()
            .filter(|task| task.is_watchable())
            .filter(|task| self.watchers.start(&self.ctx, task))
            .count();
        if started > 0 {
            info!("watchers_resumed: count={started}");
        }
        started
    }

    pub async fn resume_from_store(&self) -> usize {
        match self.ctx.store.list_tasks(&self.ctx.config.gateway_id).await {
            Ok(tasks) => self.resume_watchers(&tasks),
            Err(err) => {
                warn!("watchers_resume_failed: {err}");
                0
            }
        }
    }

    pub fn stop_all_watchers(&self) -> usize {
        self.watchers.stop_all()
    }

    pub fn active_watchers(&self) -> usize {
        self.watchers.len()
    }

    /// Records a chat event for discovery. Returns true when a pass should be
    /// scheduled.
    pub async fn observe_event(&self, event: &GatewayEvent) -> bool {
        if event.event != CHAT_EVENT {
            return false;
        }
        let Some((session_key, state)) = parse_chat_event(&event.payload) else {
            return false;
        };
        self.discovery
            .lock()
            .await
            .observe_chat(&session_key, state, Instant::now());
        true
    }

    /// Lists sessions and runs a pass if any new candidate turned up.
    pub async fn poll_sessions(&self) -> PassReport {
        if !self.ctx.gateway.is_connected() {
            return PassReport::default();
        }
        let Some(sessions) = self.ctx.gateway.list_sessions().await else {
            return PassReport::default();
        };
        let bound: HashSet<String> = match self.ctx.store.list_tasks(&self.ctx.config.gateway_id).await {
            Ok(tasks) => tasks
                .iter()
                .filter_map(|task| task.session_key().map(str::to_string))
                .collect(),
            Err(err) => {
                warn!("discovery_list_tasks_failed: {err}");
                return PassReport::default();
            }
        };
        let added = self.discovery.lock().await.observe_listing(
            &sessions,
            &bound,
            Utc::now(),
            self.ctx.config.recency_window,
            Instant::now(),
        );
        if added == 0 {
            return PassReport::default();
        }
        debug!("discovery_poll_candidates: count={added}");
        self.run_discovery_pass().await
    }

    /// Drains the discovery table once and starts watching every task the
    /// pass created.
    pub async fn run_discovery_pass(&self) -> PassReport {
        let report = {
            let mut table = self.discovery.lock().await;
            discovery::run_pass(&mut table, &self.ctx, &self.watchers).await
        };
        for task_id in &report.created {
            match self.ctx.store.get_task(task_id).await {
                Ok(Some(task)) if task.is_watchable() => {
                    self.watchers.start(&self.ctx, &task);
                }
                Ok(_) => {}
                Err(err) => warn!("discovery_watch_failed: task={task_id} {err}"),
            }
        }
        report
    }

    /// Drives discovery and watcher resumption until `shutdown` fires, then
    /// stops every watcher.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<GatewayEvent>,
        mut status: watch::Receiver<ConnectionStatus>,
        shutdown: CancellationToken,
    ) {
        let config = &self.ctx.config;
        let mut poll = interval_at(
            Instant::now() + config.poll_initial_delay,
            config.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut debounce_at: Option<Instant> = None;
        let mut events_open = true;
        let mut status_open = true;

        info!("mission_started: gateway={}", config.gateway_id);
        let initial = *status.borrow_and_update();
        if initial == ConnectionStatus::Connected {
            self.resume_from_store().await;
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    self.poll_sessions().await;
                }
                _ = sleep_until_deadline(debounce_at) => {
                    debounce_at = None;
                    self.run_discovery_pass().await;
                }
                received = events.recv(), if events_open => match received {
                    Ok(event) => {
                        if self.observe_event(&event).await && debounce_at.is_none() {
                            debounce_at = Some(Instant::now() + config.debounce);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("mission_events_lagged: skipped={skipped}");
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
                changed = status.changed(), if status_open => match changed {
                    Ok(()) => {
                        let current = *status.borrow_and_update();
                        debug!("mission_gateway_status: {current}");
                        if current == ConnectionStatus::Connected {
                            self.resume_from_store().await;
                        }
                    }
                    Err(_) => status_open = false,
                },
            }
        }

        let stopped = self.stop_all_watchers();
        info!("mission_stopped: gateway={} watchers={stopped}", config.gateway_id);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}
