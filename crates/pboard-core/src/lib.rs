//! Core library crate for the Pulseboard desktop client: authentication,
//! deep-link routing, and app-session lifecycle tracking.

pub mod auth;
pub mod backend;
pub mod config;
pub mod deeplink;
pub mod logging;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod stats;
pub mod token_store;
pub mod usage;

pub use auth::{AuthResolver, AuthSession, AuthSnapshot, AuthState};
pub use backend::{ApiResponse, Backend, HttpBackend};
pub use config::{
    ConfigError, ConfigLoadResult, ConfigSource, FileConfig, config_directory, config_path,
    load_config, save_config,
};
pub use deeplink::DeepLinkRouter;
pub use logging::{LoggingDestination, LoggingError, init_logging};
pub use protocol::{RegistrationMode, register_protocol};
pub use provider::{HttpIdentityProvider, IdentityProvider, ProviderError};
pub use session::{CancelToken, Scheduler, SessionManager, TokioScheduler};
pub use stats::StatsService;
pub use token_store::TokenStore;
pub use usage::{UsageStore, UsageTracker};
