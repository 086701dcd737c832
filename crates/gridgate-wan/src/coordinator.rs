//! Cluster-wide sender lifecycle: member agents, scope resolution, and
//! fanned-out create/start/stop/pause/resume/destroy with per-member
//! results.
//!
//! Each member runs an agent task servicing typed requests over an mpsc
//! channel with oneshot replies. The coordinator validates centrally,
//! resolves the sender scope to a target member set, fans out concurrently
//! under a per-member timeout, and aggregates one ordered outcome row per
//! target.

use crate::config::{MemberId, SenderConfig, SiteId};
use crate::error::WanError;
use crate::filter::FilterRegistry;
use crate::queue::ReplicationQueue;
use crate::registry::SenderRegistry;
use crate::sender::{GatewaySender, RuntimeState};
use crate::transport::{GatewayLink, RemoteSite};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

/// How long the coordinator waits for one member's reply.
pub const DEFAULT_MEMBER_TIMEOUT_MS: u64 = 5_000;

/// Lifecycle request serviced by a member agent.
#[derive(Debug)]
pub enum MemberRequest {
    /// Instantiate a pipeline for this configuration.
    Create(Box<SenderConfig>),
    /// Destroy the pipeline with this id.
    Destroy(String),
    /// Start dispatching.
    Start(String),
    /// Halt dispatch, preserving the queue.
    Stop(String),
    /// Hold dispatch.
    Pause(String),
    /// Resume after a pause.
    Resume(String),
    /// Report the pipeline's runtime state.
    Describe(String),
    /// Destroy every pipeline on the member.
    Teardown,
}

/// Successful reply from a member agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberReply {
    /// The operation completed; `detail` is a short human-readable note.
    Done {
        /// What happened on the member.
        detail: String,
    },
    /// The pipeline's runtime state (reply to `Describe`).
    State(RuntimeState),
}

type ReplyTx = oneshot::Sender<Result<MemberReply, WanError>>;

/// Handle used by the coordinator to reach one member's agent task.
#[derive(Clone)]
pub struct MemberAgentHandle {
    member_id: MemberId,
    tx: mpsc::Sender<(MemberRequest, ReplyTx)>,
}

impl MemberAgentHandle {
    /// The member this handle reaches.
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Send one request and wait up to `timeout_ms` for the reply.
    pub async fn request(
        &self,
        request: MemberRequest,
        timeout_ms: u64,
    ) -> Result<MemberReply, WanError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send((request, reply_tx)).await.is_err() {
            return Err(WanError::MemberUnreachable {
                member_id: self.member_id.clone(),
                msg: "agent task has exited".to_string(),
            });
        }
        match timeout(Duration::from_millis(timeout_ms), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WanError::MemberUnreachable {
                member_id: self.member_id.clone(),
                msg: "agent dropped the request".to_string(),
            }),
            Err(_) => Err(WanError::MemberUnreachable {
                member_id: self.member_id.clone(),
                msg: format!("no reply within {timeout_ms}ms"),
            }),
        }
    }
}

/// Per-member servicing task for sender lifecycle requests.
pub struct MemberAgent {
    member_id: MemberId,
    site_id: SiteId,
    local_partitions: Vec<u32>,
    registry: Arc<SenderRegistry>,
    sites: HashMap<SiteId, Arc<RemoteSite>>,
    filters: Arc<FilterRegistry>,
}

impl MemberAgent {
    /// Spawn the agent task for one member.
    ///
    /// `sites` maps reachable remote site ids to their receiving side; a
    /// sender targeting an unlisted site is still created, its dispatchers
    /// retrying until the site becomes reachable in a later incarnation.
    /// Returns the handle plus the member's registry, which callers wire
    /// into the capture hook.
    pub fn spawn(
        member_id: impl Into<MemberId>,
        site_id: SiteId,
        local_partitions: Vec<u32>,
        sites: HashMap<SiteId, Arc<RemoteSite>>,
        filters: Arc<FilterRegistry>,
    ) -> (MemberAgentHandle, Arc<SenderRegistry>) {
        let member_id = member_id.into();
        let registry = Arc::new(SenderRegistry::new(member_id.clone()));
        let agent = MemberAgent {
            member_id: member_id.clone(),
            site_id,
            local_partitions,
            registry: registry.clone(),
            sites,
            filters,
        };
        let (tx, mut rx) = mpsc::channel::<(MemberRequest, ReplyTx)>(32);
        tokio::spawn(async move {
            while let Some((request, reply_tx)) = rx.recv().await {
                let result = agent.handle(request).await;
                let _ = reply_tx.send(result);
            }
        });
        (MemberAgentHandle { member_id, tx }, registry)
    }

    async fn handle(&self, request: MemberRequest) -> Result<MemberReply, WanError> {
        match request {
            MemberRequest::Create(config) => self.create(*config).await,
            MemberRequest::Destroy(id) => {
                let sender = self.registry.remove(&id).await?;
                let dropped = sender.destroy().await?;
                Ok(MemberReply::Done {
                    detail: format!("destroyed, {dropped} queued events discarded"),
                })
            }
            MemberRequest::Start(id) => {
                self.lookup(&id).await?.start()?;
                Ok(MemberReply::Done {
                    detail: "started".to_string(),
                })
            }
            MemberRequest::Stop(id) => {
                self.lookup(&id).await?.stop()?;
                Ok(MemberReply::Done {
                    detail: "stopped".to_string(),
                })
            }
            MemberRequest::Pause(id) => {
                self.lookup(&id).await?.pause()?;
                Ok(MemberReply::Done {
                    detail: "paused".to_string(),
                })
            }
            MemberRequest::Resume(id) => {
                self.lookup(&id).await?.resume()?;
                Ok(MemberReply::Done {
                    detail: "resumed".to_string(),
                })
            }
            MemberRequest::Describe(id) => {
                Ok(MemberReply::State(self.lookup(&id).await?.state()))
            }
            MemberRequest::Teardown => {
                let count = self.registry.teardown().await;
                Ok(MemberReply::Done {
                    detail: format!("{count} senders destroyed"),
                })
            }
        }
    }

    async fn lookup(&self, id: &str) -> Result<Arc<GatewaySender>, WanError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| WanError::SenderNotFound { id: id.to_string() })
    }

    async fn create(&self, config: SenderConfig) -> Result<MemberReply, WanError> {
        config.validate()?;
        let event_filters = self.filters.resolve_event_filters(&config.event_filters)?;
        let transport_filters = self
            .filters
            .resolve_transport_filters(&config.transport_filters)?;

        let lane_count = ReplicationQueue::lane_count_for(&config, &self.local_partitions);
        let links: Vec<GatewayLink> = match self.sites.get(&config.remote_site_id) {
            Some(site) => site.connect(lane_count, transport_filters),
            None => {
                warn!(
                    member_id = %self.member_id,
                    sender_id = %config.id,
                    remote_site_id = config.remote_site_id,
                    "remote site not reachable, sender will retry until it is"
                );
                (0..lane_count)
                    .map(|_| GatewayLink::pair(64, transport_filters.clone()).0)
                    .collect()
            }
        };

        let manual_start = config.manual_start;
        let sender = GatewaySender::build(
            config,
            self.member_id.clone(),
            self.site_id,
            &self.local_partitions,
            links,
            event_filters,
            None,
        )
        .await?;
        if let Err(e) = self.registry.insert(sender.clone()).await {
            let _ = sender.destroy().await;
            return Err(e);
        }
        if !manual_start {
            sender.start()?;
        }
        Ok(MemberReply::Done {
            detail: format!("created, state {}", sender.state()),
        })
    }
}

/// Outcome status of one member's row in an aggregated result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// The operation succeeded on the member.
    Ok,
    /// The operation failed on the member; `detail` carries the reason.
    Error,
}

/// One row of an aggregated lifecycle result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberOutcome {
    /// The member the row describes.
    pub member_id: MemberId,
    /// Whether the operation succeeded there.
    pub status: OutcomeStatus,
    /// Success note or error description.
    pub detail: String,
}

impl MemberOutcome {
    fn from_reply(member_id: MemberId, reply: Result<MemberReply, WanError>) -> Self {
        match reply {
            Ok(MemberReply::Done { detail }) => Self {
                member_id,
                status: OutcomeStatus::Ok,
                detail,
            },
            Ok(MemberReply::State(state)) => Self {
                member_id,
                status: OutcomeStatus::Ok,
                detail: state.to_string(),
            },
            Err(e) => Self {
                member_id,
                status: OutcomeStatus::Error,
                detail: e.to_string(),
            },
        }
    }

    /// True when the row reports success.
    pub fn is_ok(&self) -> bool {
        self.status == OutcomeStatus::Ok
    }
}

/// A sender definition plus each target member's runtime state.
#[derive(Debug, Clone)]
pub struct SenderDescription {
    /// The cluster-wide definition.
    pub config: SenderConfig,
    /// One row per target member.
    pub member_states: Vec<MemberOutcome>,
}

struct MemberEntry {
    member_id: MemberId,
    groups: Vec<String>,
    handle: MemberAgentHandle,
}

#[derive(Default)]
struct CoordinatorInner {
    members: Vec<MemberEntry>,
    definitions: HashMap<String, SenderConfig>,
}

/// Cluster-wide sender lifecycle coordinator.
///
/// Owns the definition table and the member roster; every operation
/// resolves a target set, fans out, and returns one ordered outcome row per
/// target. A failing or unreachable member yields an error row and never
/// aborts its siblings.
pub struct SenderLifecycleCoordinator {
    inner: Mutex<CoordinatorInner>,
    member_timeout_ms: u64,
}

impl Default for SenderLifecycleCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SenderLifecycleCoordinator {
    /// Create a coordinator with no members and no definitions.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CoordinatorInner::default()),
            member_timeout_ms: DEFAULT_MEMBER_TIMEOUT_MS,
        }
    }

    /// Override the per-member reply timeout.
    pub fn with_member_timeout(mut self, timeout_ms: u64) -> Self {
        self.member_timeout_ms = timeout_ms;
        self
    }

    /// Add a member to the roster and instantiate pipelines for every
    /// existing definition whose scope covers it. Returns one outcome row
    /// per definition applied.
    pub async fn member_joined(
        &self,
        handle: MemberAgentHandle,
        groups: Vec<String>,
    ) -> Vec<MemberOutcome> {
        let member_id = handle.member_id().to_string();
        let covering: Vec<SenderConfig> = {
            let mut inner = self.inner.lock().await;
            inner.members.push(MemberEntry {
                member_id: member_id.clone(),
                groups: groups.clone(),
                handle: handle.clone(),
            });
            inner
                .definitions
                .values()
                .filter(|d| d.covers_member(&member_id, &groups))
                .cloned()
                .collect()
        };

        let mut outcomes = Vec::with_capacity(covering.len());
        for config in covering {
            let id = config.id.clone();
            let reply = handle
                .request(
                    MemberRequest::Create(Box::new(config)),
                    self.member_timeout_ms,
                )
                .await;
            let outcome = MemberOutcome::from_reply(member_id.clone(), reply);
            info!(
                member_id = %member_id,
                sender_id = %id,
                ok = outcome.is_ok(),
                detail = %outcome.detail,
                "applied existing sender definition to joining member"
            );
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Remove a member from the roster, destroying its pipelines
    /// best-effort.
    pub async fn member_left(&self, member_id: &str) {
        let entry = {
            let mut inner = self.inner.lock().await;
            let pos = inner.members.iter().position(|m| m.member_id == member_id);
            pos.map(|p| inner.members.remove(p))
        };
        if let Some(entry) = entry {
            let _ = entry
                .handle
                .request(MemberRequest::Teardown, self.member_timeout_ms)
                .await;
            info!(member_id = %member_id, "member left, pipelines torn down");
        }
    }

    /// Cluster-unique sender ids with a stored definition, sorted.
    pub async fn sender_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.definitions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Create a sender across the cluster.
    ///
    /// The configuration is validated centrally; an invalid configuration
    /// or a duplicate id returns an error without touching any member. A
    /// scope matching zero members succeeds with an empty result.
    pub async fn create_sender(
        &self,
        config: SenderConfig,
    ) -> Result<Vec<MemberOutcome>, WanError> {
        config.validate()?;
        let targets = {
            let mut inner = self.inner.lock().await;
            if inner.definitions.contains_key(&config.id) {
                return Err(WanError::DuplicateSender {
                    id: config.id.clone(),
                });
            }
            inner.definitions.insert(config.id.clone(), config.clone());
            Self::resolve_targets(&inner, &config)
        };

        info!(
            sender_id = %config.id,
            targets = targets.len(),
            "creating gateway sender across cluster"
        );
        Ok(self
            .fan_out(&targets, |_| MemberRequest::Create(Box::new(config.clone())))
            .await)
    }

    /// Destroy a sender across the cluster.
    ///
    /// Fans out even when no definition is stored; each member without the
    /// pipeline contributes an error row, matching the per-member ground
    /// truth.
    pub async fn destroy_sender(&self, id: &str) -> Vec<MemberOutcome> {
        let targets = {
            let mut inner = self.inner.lock().await;
            let targets = match inner.definitions.get(id) {
                Some(config) => {
                    let config = config.clone();
                    Self::resolve_targets(&inner, &config)
                }
                None => inner.members.iter().map(|m| m.handle.clone()).collect(),
            };
            inner.definitions.remove(id);
            targets
        };
        info!(sender_id = %id, targets = targets.len(), "destroying gateway sender across cluster");
        self.fan_out(&targets, |_| MemberRequest::Destroy(id.to_string()))
            .await
    }

    /// Start a sender on every member its scope covers.
    pub async fn start_sender(&self, id: &str) -> Vec<MemberOutcome> {
        let targets = self.targets_for(id).await;
        self.fan_out(&targets, |_| MemberRequest::Start(id.to_string()))
            .await
    }

    /// Stop a sender on every member its scope covers. Queues are
    /// preserved.
    pub async fn stop_sender(&self, id: &str) -> Vec<MemberOutcome> {
        let targets = self.targets_for(id).await;
        self.fan_out(&targets, |_| MemberRequest::Stop(id.to_string()))
            .await
    }

    /// Pause dispatch on every member the sender's scope covers.
    pub async fn pause_sender(&self, id: &str) -> Vec<MemberOutcome> {
        let targets = self.targets_for(id).await;
        self.fan_out(&targets, |_| MemberRequest::Pause(id.to_string()))
            .await
    }

    /// Resume dispatch on every member the sender's scope covers.
    pub async fn resume_sender(&self, id: &str) -> Vec<MemberOutcome> {
        let targets = self.targets_for(id).await;
        self.fan_out(&targets, |_| MemberRequest::Resume(id.to_string()))
            .await
    }

    /// The stored definition plus each target member's runtime state.
    pub async fn describe(&self, id: &str) -> Result<SenderDescription, WanError> {
        let (config, targets) = {
            let inner = self.inner.lock().await;
            let config = inner
                .definitions
                .get(id)
                .cloned()
                .ok_or_else(|| WanError::SenderNotFound { id: id.to_string() })?;
            let targets = Self::resolve_targets(&inner, &config);
            (config, targets)
        };
        let member_states = self
            .fan_out(&targets, |_| MemberRequest::Describe(id.to_string()))
            .await;
        Ok(SenderDescription {
            config,
            member_states,
        })
    }

    async fn targets_for(&self, id: &str) -> Vec<MemberAgentHandle> {
        let inner = self.inner.lock().await;
        match inner.definitions.get(id) {
            Some(config) => {
                let config = config.clone();
                Self::resolve_targets(&inner, &config)
            }
            None => inner.members.iter().map(|m| m.handle.clone()).collect(),
        }
    }

    fn resolve_targets(inner: &CoordinatorInner, config: &SenderConfig) -> Vec<MemberAgentHandle> {
        inner
            .members
            .iter()
            .filter(|m| config.covers_member(&m.member_id, &m.groups))
            .map(|m| m.handle.clone())
            .collect()
    }

    /// Fan one request out to every target concurrently, collecting rows in
    /// roster order.
    async fn fan_out<F>(&self, targets: &[MemberAgentHandle], make_request: F) -> Vec<MemberOutcome>
    where
        F: Fn(&MemberAgentHandle) -> MemberRequest,
    {
        let timeout_ms = self.member_timeout_ms;
        let tasks: Vec<_> = targets
            .iter()
            .map(|handle| {
                let handle = handle.clone();
                let request = make_request(&handle);
                tokio::spawn(async move {
                    let member_id = handle.member_id().to_string();
                    let reply = handle.request(request, timeout_ms).await;
                    MemberOutcome::from_reply(member_id, reply)
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (task, handle) in tasks.into_iter().zip(targets) {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(_) => outcomes.push(MemberOutcome {
                    member_id: handle.member_id().to_string(),
                    status: OutcomeStatus::Error,
                    detail: "agent task panicked".to_string(),
                }),
            }
        }
        outcomes
    }
}
