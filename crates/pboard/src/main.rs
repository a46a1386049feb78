mod cli_args;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use cli_args::Cli;
use pboard_core::auth::{AuthResolver, AuthState, CallbackOutcome};
use pboard_core::backend::{Backend, HttpBackend};
use pboard_core::config::{FileConfig, load_config};
use pboard_core::deeplink::{DeepLinkCallback, DeepLinkRouter, scan_args};
use pboard_core::logging::{LoggingDestination, init_logging};
use pboard_core::protocol::{RegistrationMode, register_protocol};
use pboard_core::provider::{HttpIdentityProvider, IdentityProvider};
use pboard_core::session::{SessionManager, TokioScheduler};
use pboard_core::stats::StatsService;
use pboard_core::token_store::TokenStore;
use pboard_core::usage::{UsageStore, UsageTracker};
use pboard_ipc::events::{AppEvent, EventHub};
use pboard_ipc::instance::{InstanceGate, acquire_instance, forward_deep_link};
use pboard_ipc::server::{AppContext, serve};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let load = load_config();
    let config = load.config.clone();
    let port = cli.port.unwrap_or(config.ipc_port);

    // The instance check comes before logging: a rejected second launch only
    // forwards its argv, so it logs to the shared file (append-only) and
    // stays quiet on the stderr of whatever launched it.
    let listener = match acquire_instance(port).await? {
        InstanceGate::Primary(listener) => listener,
        InstanceGate::AlreadyRunning => {
            init_logging(LoggingDestination::FileOnly)?;
            return hand_off_to_primary(&cli, &config, port).await;
        }
    };

    let destination = if cli.stderr_log {
        LoggingDestination::StderrOnly
    } else {
        LoggingDestination::FileAndStderr
    };
    init_logging(destination)?;
    for warning in &load.warnings {
        warn!(%warning, "configuration warning");
    }

    if cli.no_register {
        info!("scheme registration skipped by flag");
    } else {
        let mode = match cli.dev_script.clone() {
            Some(launch_script) => RegistrationMode::Development { launch_script },
            None => RegistrationMode::Packaged,
        };
        register_protocol(&config.scheme, &mode);
    }

    let ctx = assemble(&config);
    wire_deep_links(&ctx);

    // A deep link may already be sitting in argv from the launch itself.
    ctx.deeplinks.route_from_args(&cli.args, &config.scheme);

    serve(listener, ctx).await
}

/// Second-instance path: push any scheme URL from argv at the primary, then
/// exit without bringing up a UI.
async fn hand_off_to_primary(cli: &Cli, config: &FileConfig, port: u16) -> anyhow::Result<()> {
    match scan_args(&cli.args, &config.scheme) {
        Some(url) => forward_deep_link(port, &url).await,
        None => {
            info!("another instance is already running; exiting");
            Ok(())
        }
    }
}

fn assemble(config: &FileConfig) -> AppContext {
    let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(config.backend_url.clone()));
    let provider = Arc::new(HttpIdentityProvider::new(config.identity.clone()));
    let scheduler = Arc::new(TokioScheduler);
    let renewal = Duration::from_secs_f64(f64::from(config.session_hours) * 3600.0);

    let usage = Arc::new(UsageTracker::new(UsageStore::new()));
    AppContext {
        auth: AuthState::new(),
        provider: provider.clone(),
        sessions: Arc::new(SessionManager::with_renewal_interval(
            backend.clone(),
            scheduler,
            renewal,
        )),
        stats: Arc::new(StatsService::new(backend, usage.clone())),
        usage,
        deeplinks: Arc::new(DeepLinkRouter::new()),
        tokens: TokenStore::new(),
        events: EventHub::new(),
    }
}

/// Attach the deep-link consumer: every routed URL is announced to the UI,
/// resolved against the identity provider, and on sign-in the refresh token
/// is stored, an app session started, and stats pulled once.
fn wire_deep_links(ctx: &AppContext) {
    let provider: Arc<dyn IdentityProvider> = ctx.provider.clone();
    let resolver = Arc::new(AuthResolver::new(provider, ctx.auth.clone()));
    let sessions = ctx.sessions.clone();
    let stats = ctx.stats.clone();
    let tokens = ctx.tokens.clone();
    let events = ctx.events.clone();

    let callback: DeepLinkCallback = Arc::new(move |url: String| {
        events.publish(AppEvent::auth_callback_url(url.clone()));

        let resolver = resolver.clone();
        let sessions = sessions.clone();
        let stats = stats.clone();
        let tokens = tokens.clone();
        let events = events.clone();
        tokio::spawn(async move {
            match resolver.resolve_callback(&url).await {
                CallbackOutcome::SignedIn => {
                    events.publish(AppEvent::auth_changed(true));
                    let Some(session) = resolver.state().session() else {
                        return;
                    };
                    if let Err(err) = tokens.store(&session.user_id, &session.refresh_token) {
                        warn!(%err, "could not persist refresh token");
                    }
                    match sessions.start_active_session(&session.access_token).await {
                        Ok(app_session) => events
                            .publish(AppEvent::session_changed(Some(app_session.session_id))),
                        Err(err) => warn!(%err, "app session start after sign-in failed"),
                    }
                    if let Err(err) = stats.refresh(&session.access_token, &session.user_id).await
                    {
                        warn!(%err, "initial stats refresh failed");
                    }
                }
                CallbackOutcome::Failed => events.publish(AppEvent::auth_changed(false)),
                CallbackOutcome::Ignored => {}
            }
        });
    });

    ctx.deeplinks.set_callback(callback);
}
