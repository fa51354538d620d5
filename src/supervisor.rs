//! Process supervisor
//!
//! Owns every component for the process lifetime: boots them in order,
//! wires shard events into the dispatcher, runs the background loops
//! (token monitor, cache sweeper, expected-set reconciliation), and
//! drives graceful shutdown on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use crate::auth::{RefreshOutcome, TokenProvider, CHECK_INTERVAL};
use crate::commands::CommandInterpreter;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::BotError;
use crate::irc::{spawn_shard, ShardEvent, ShardHandle};
use crate::moderation::{HelixClient, ModerationExecutor};
use crate::policy::PolicyStore;
use crate::pubsub;
use crate::rank::RankStore;
use crate::roles::RoleResolver;
use crate::rpc::SignedClient;
use crate::scheduler::JoinScheduler;

/// Delay before connecting the second shard, avoiding a login burst
const SHARD_STAGGER: Duration = Duration::from_secs(2);
/// Boot fails if no shard registers within this window
const REGISTRATION_DEADLINE: Duration = Duration::from_secs(60);
/// Expected-set reconciliation cadence (safety net behind pub/sub)
const RECONCILE_INTERVAL: Duration = Duration::from_secs(300);
/// Sweeper base interval; up to 30s of jitter is added per cycle
const SWEEP_BASE_INTERVAL: Duration = Duration::from_secs(90);

const FAREWELL: &str = "EloWard bot shutting down";

/// Boot the bot and run until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    info!("===========================================");
    info!("  EloWard bot starting");
    info!("===========================================");

    let tokens = Arc::new(TokenProvider::new(&config.api_base_url)?);
    let credential = tokens.boot().await.context("credential boot")?;
    info!(login = %credential.login, "authenticated as bot account");

    let api: Arc<dyn crate::rpc::ControlApi> = Arc::new(SignedClient::new(
        &config.api_base_url,
        &config.hmac_secret,
        &config.region,
    )?);

    let policies = Arc::new(PolicyStore::new(Arc::clone(&api)));
    let ranks = Arc::new(RankStore::new(Arc::clone(&api)));
    let roles = RoleResolver::new(config.super_admins.clone());

    let auth_nudge = Arc::new(Notify::new());
    let helix = HelixClient::new(&config.client_id)?;
    let executor = Arc::new(ModerationExecutor::new(
        helix,
        Arc::clone(&tokens),
        roles.clone(),
        config.site.clone(),
        Arc::clone(&auth_nudge),
    ));

    // Shards report registration and chat lines on one channel.
    let (event_tx, mut event_rx) = mpsc::channel::<ShardEvent>(1024);

    let mut shards: Vec<ShardHandle> = Vec::with_capacity(config.shard_count);
    for id in 0..config.shard_count {
        if id > 0 {
            tokio::time::sleep(SHARD_STAGGER).await;
        }
        shards.push(spawn_shard(
            id,
            config.irc_addr.clone(),
            Arc::clone(&tokens),
            event_tx.clone(),
        ));
    }

    let scheduler = Arc::new(JoinScheduler::new(shards.clone(), Arc::clone(&api)));
    let interpreter = Arc::new(CommandInterpreter::new(
        Arc::clone(&api),
        Arc::clone(&policies),
        roles.clone(),
        config.site.clone(),
    ));
    let dispatcher = Dispatcher::new(
        Arc::clone(&policies),
        Arc::clone(&ranks),
        roles,
        interpreter,
        Arc::clone(&scheduler),
        executor,
    );

    spawn_token_monitor(Arc::clone(&tokens), shards.clone(), Arc::clone(&auth_nudge));
    spawn_sweeper(Arc::clone(&ranks), Arc::clone(&policies));

    match &config.redis_url {
        Some(url) => {
            tokio::spawn(pubsub::run_subscriber(
                url.clone(),
                Arc::clone(&policies),
                Arc::clone(&scheduler),
            ));
        }
        None => warn!("no redis url configured, instant config propagation disabled"),
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    // Boot is not complete until a shard actually reaches the server. If
    // none registers within the deadline the process exits non-zero so
    // the orchestrator restarts it.
    let first_shard = wait_for_registration(&mut event_rx).await?;
    info!(shard = first_shard, "first shard registered, loading expected channels");
    spawn_channel_loader(Arc::clone(&scheduler));

    info!("===========================================");
    info!("  EloWard bot is live");
    info!("===========================================");

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => break,
                };
                dispatcher.handle_event(event).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
        }
    }

    shutdown(&shards).await;
    Ok(())
}

/// Block until any shard reports `Registered`, bounded by the deadline.
async fn wait_for_registration(
    event_rx: &mut mpsc::Receiver<ShardEvent>,
) -> Result<usize, BotError> {
    let deadline = tokio::time::sleep(REGISTRATION_DEADLINE);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(ShardEvent::Registered { shard }) => return Ok(shard),
                Some(_) => {} // nothing else arrives pre-registration
                None => {
                    return Err(BotError::FatalBoot(
                        "shard event channel closed during boot".into(),
                    ));
                }
            },
            _ = &mut deadline => {
                return Err(BotError::FatalBoot(format!(
                    "no shard registered within {}s",
                    REGISTRATION_DEADLINE.as_secs()
                )));
            }
        }
    }
}

/// Initial expected-set walk, then the periodic reconciliation loop.
fn spawn_channel_loader(scheduler: Arc<JoinScheduler>) {
    tokio::spawn(async move {
        match scheduler.load_expected().await {
            Ok(count) => info!(count, "initial channel walk queued"),
            Err(e) => error!(error = %e, "failed to load expected channel set"),
        }

        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        ticker.tick().await; // immediate tick; the walk above just ran
        loop {
            ticker.tick().await;
            if let Err(e) = scheduler.reconcile().await {
                warn!(error = %e, "expected-set reconciliation failed");
            }
        }
    });
}

/// Periodic credential check, plus immediate checks when the moderation
/// layer sees a 401/403. Rotation closes and reconnects every shard.
fn spawn_token_monitor(
    tokens: Arc<TokenProvider>,
    shards: Vec<ShardHandle>,
    auth_nudge: Arc<Notify>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        ticker.tick().await; // skip the immediate tick; boot just fetched
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = auth_nudge.notified() => {
                    info!("auth failure reported, checking credential now");
                }
            }
            match tokens.check().await {
                Ok(RefreshOutcome::Rotated) => {
                    info!("credential rotated, reconnecting shards");
                    for shard in &shards {
                        shard.rotate().await;
                    }
                }
                Ok(RefreshOutcome::Unchanged) => {}
                Err(e) => warn!(error = %e, "credential check failed"),
            }
        }
    });
}

/// Evicts expired rank entries on a jittered cadence. Policy entries are
/// permanent until invalidated and are only counted here.
fn spawn_sweeper(ranks: Arc<RankStore>, policies: Arc<PolicyStore>) {
    tokio::spawn(async move {
        loop {
            let jitter = rand::thread_rng().gen_range(0..=30);
            tokio::time::sleep(SWEEP_BASE_INTERVAL + Duration::from_secs(jitter)).await;
            let evicted = ranks.sweep().await;
            if evicted > 0 {
                let remaining = ranks.len().await;
                info!(
                    evicted,
                    remaining,
                    policies = policies.entry_count(),
                    "rank cache swept"
                );
            }
        }
    });
}

async fn shutdown(shards: &[ShardHandle]) {
    info!("shutting down");
    for shard in shards {
        shard.quit(FAREWELL).await;
    }
    // Short grace window for the QUITs to flush
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("goodbye");
}
