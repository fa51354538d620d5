//! Message dispatcher
//!
//! Routes each inbound PRIVMSG to the command interpreter or the
//! enforcement pipeline. Only the shard that owns a channel reacts to its
//! messages, so a brief double-carry during handover cannot produce
//! duplicate replies or timeouts.
//!
//! Commands for one channel run on a dedicated worker in IRC receive
//! order, so back-to-back mutations cannot land out of order. Enforcement
//! has no cross-message ordering requirement and each message gets its
//! own task: the IRC read loop never blocks on control-plane or Helix
//! calls, and a panic in one worker cannot touch other messages.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::commands::{self, CommandInterpreter};
use crate::irc::{ChatMessage, ShardEvent};
use crate::policy::{ChannelPolicy, EnforcementMode, PolicyStore};
use crate::rank::{meets_minimum, RankRecord, RankStore};
use crate::roles::{RoleResolver, Roles};
use crate::scheduler::JoinScheduler;

/// Enforcement outcome for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Timeout,
}

/// Pure policy evaluation. Fail-open is structural: a missing or disabled
/// policy, an exempt author, or an unknown rank all allow the message.
pub fn decide(policy: &ChannelPolicy, exempt: bool, rank: &RankRecord) -> Decision {
    if !policy.enabled || exempt {
        return Decision::Allow;
    }
    match policy.mode {
        EnforcementMode::HasRank => {
            if rank.present {
                Decision::Allow
            } else {
                Decision::Timeout
            }
        }
        EnforcementMode::MinRank => {
            if !rank.present {
                return Decision::Timeout;
            }
            if meets_minimum(
                rank.tier,
                rank.division,
                policy.min_rank_tier,
                policy.min_rank_division,
            ) {
                Decision::Allow
            } else {
                Decision::Timeout
            }
        }
    }
}

/// Receives timeout decisions. Production implementation is the
/// moderation executor; tests record the calls.
#[async_trait]
pub trait TimeoutSink: Send + Sync {
    async fn execute(&self, channel: &str, user: &str, user_roles: Roles, policy: &ChannelPolicy);
}

/// Routes shard events into commands and enforcement
pub struct Dispatcher {
    policies: Arc<PolicyStore>,
    ranks: Arc<RankStore>,
    roles: RoleResolver,
    interpreter: Arc<CommandInterpreter>,
    scheduler: Arc<JoinScheduler>,
    sink: Arc<dyn TimeoutSink>,
    /// One sequential command worker per channel, keyed by channel login
    command_queues: parking_lot::Mutex<HashMap<String, mpsc::UnboundedSender<(Option<usize>, ChatMessage)>>>,
}

impl Dispatcher {
    pub fn new(
        policies: Arc<PolicyStore>,
        ranks: Arc<RankStore>,
        roles: RoleResolver,
        interpreter: Arc<CommandInterpreter>,
        scheduler: Arc<JoinScheduler>,
        sink: Arc<dyn TimeoutSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            policies,
            ranks,
            roles,
            interpreter,
            scheduler,
            sink,
            command_queues: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Entry point for everything a shard reports.
    pub async fn handle_event(self: &Arc<Self>, event: ShardEvent) {
        match event {
            ShardEvent::Registered { shard } => {
                self.scheduler.rejoin_shard(shard).await;
            }
            ShardEvent::Privmsg { shard, message } => {
                self.handle_privmsg(shard, message);
            }
        }
    }

    /// Route one chat line. Non-owner shards drop it entirely.
    pub fn handle_privmsg(self: &Arc<Self>, shard: usize, message: ChatMessage) {
        let owner = self.scheduler.owner(&message.channel);
        if owner != Some(shard) {
            debug!(
                shard,
                channel = %message.channel,
                "dropping message on non-owner shard"
            );
            return;
        }

        if commands::is_command(&message.text) {
            // Commands in one channel must execute in receive order.
            self.enqueue_command(owner, message);
            return;
        }

        let dispatcher = Arc::clone(self);
        // One worker per message; the read loop stays free and a panic
        // here is contained by the task boundary.
        tokio::spawn(async move {
            dispatcher.enforce(message).await;
        });
    }

    /// Hand a command to the channel's sequential worker, spawning it on
    /// first use. Workers live for the process lifetime; the channel set
    /// is bounded by shard capacity.
    fn enqueue_command(&self, owner: Option<usize>, message: ChatMessage) {
        let mut queues = self.command_queues.lock();
        let tx = queues.entry(message.channel.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(Self::command_loop(
                Arc::clone(&self.interpreter),
                Arc::clone(&self.scheduler),
                rx,
            ));
            tx
        });
        if tx.send((owner, message)).is_err() {
            warn!("command worker gone, command dropped");
        }
    }

    /// Drains one channel's commands strictly in arrival order.
    async fn command_loop(
        interpreter: Arc<CommandInterpreter>,
        scheduler: Arc<JoinScheduler>,
        mut rx: mpsc::UnboundedReceiver<(Option<usize>, ChatMessage)>,
    ) {
        while let Some((owner, message)) = rx.recv().await {
            let author_roles = Roles::resolve(&message.tags, &message.author, &message.channel);
            let reply = interpreter
                .handle(
                    &message.channel,
                    &message.author,
                    author_roles,
                    &message.text,
                    owner,
                )
                .await;
            if let Some(reply) = reply {
                scheduler.say(&message.channel, &reply).await;
            }
        }
    }

    async fn enforce(&self, message: ChatMessage) {
        let policy = match self.policies.get(&message.channel).await {
            Some(policy) => policy,
            None => return, // unconfigured or control plane down: allow
        };
        if !policy.enabled {
            return; // standby: joined but not enforcing
        }

        let author_roles = Roles::resolve(&message.tags, &message.author, &message.channel);
        if self.roles.is_exempt(&message.author, author_roles) {
            // Exempt authors never cost a rank lookup.
            return;
        }

        let rank = self.ranks.get(&message.author).await;
        if decide(&policy, false, &rank) == Decision::Timeout {
            warn!(
                channel = %message.channel,
                user = %message.author,
                mode = policy.mode.as_str(),
                "rank policy violated, issuing timeout"
            );
            self.sink
                .execute(&message.channel, &message.author, author_roles, &policy)
                .await;
        }
    }
}
