// # lbaasctl - load-balancer convergence driver
//
// Thin integration layer: reads configuration from the environment, wires the
// HTTP client into the convergence engine, and runs one operation to
// completion. All retry, polling and locking behaviour lives in lbaas-core.
//
// ## Configuration
//
// ### API
// - `LBAAS_ENDPOINT`: Load-balancing API base URL
// - `LBAAS_TOKEN`: Pre-issued token (cannot be refreshed), or:
// - `LBAAS_AUTH_URL`, `LBAAS_USERNAME`, `LBAAS_PASSWORD`: Password credentials
// - `LBAAS_PROJECT`: Project to scope the token to (default: admin)
// - `LBAAS_DOMAIN`: User and project domain (default: Default)
//
// ### Operation
// - `LBAAS_ACTION`: One of wait-active, wait-deleted, delete
// - `LBAAS_RESOURCE_KIND`: loadbalancer, listener, pool, l7policy (default: loadbalancer)
// - `LBAAS_RESOURCE_ID`: Resource to operate on
// - `LBAAS_PARENT_ID`: Load balancer whose lock serializes the delete
//   (default: the resource itself)
// - `LBAAS_TIMEOUT_SECS`: Deadline for the whole operation (default per action)
// - `LBAAS_POLL_INTERVAL_MS`: Interval between status fetches (default: 2000)
// - `LBAAS_LOG_LEVEL`: trace, debug, info, warn, error (default: info)
//
// ## Example
//
// ```bash
// export LBAAS_ENDPOINT=https://lb.example.test:9876
// export LBAAS_AUTH_URL=https://identity.example.test:5000
// export LBAAS_USERNAME=admin
// export LBAAS_PASSWORD=secret
// export LBAAS_ACTION=delete
// export LBAAS_RESOURCE_KIND=listener
// export LBAAS_RESOURCE_ID=0c1e4ee5-4b0b-4a3f-9f2c-0d6f1b1f2a10
// export LBAAS_PARENT_ID=7d2f3c5e-6a1b-4c8d-9e0f-112233445566
//
// lbaasctl
// ```

use anyhow::Result;
use lbaas_core::{
    ConvergenceConfig, ConvergenceEngine, EngineEvent, OperationContext, OperationKind, ResourceId,
    RetryExecutor, RetryMode,
};
use lbaas_provider_http::{LbaasClient, PasswordAuth, ResourceKind, StaticToken, TokenStore};
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// - 0: Operation completed
/// - 1: Configuration or startup error
/// - 2: Operation failed
#[derive(Debug, Clone, Copy)]
enum CtlExitCode {
    /// Operation completed
    Success = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Operation failed (timeout, API error, cancellation)
    RuntimeError = 2,
}

impl From<CtlExitCode> for ExitCode {
    fn from(code: CtlExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Operation to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Poll until ACTIVE (fails on ERROR)
    WaitActive,
    /// Poll until the API reports the resource gone
    WaitDeleted,
    /// Request deletion, then wait until gone
    Delete,
}

impl Action {
    fn operation_kind(&self) -> OperationKind {
        match self {
            Action::WaitActive => OperationKind::Update,
            Action::WaitDeleted | Action::Delete => OperationKind::Delete,
        }
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wait-active" => Ok(Action::WaitActive),
            "wait-deleted" => Ok(Action::WaitDeleted),
            "delete" => Ok(Action::Delete),
            other => anyhow::bail!(
                "LBAAS_ACTION '{}' is not supported. \
                Supported actions: wait-active, wait-deleted, delete",
                other
            ),
        }
    }
}

/// Credentials for the API
enum Credentials {
    Token(String),
    Password {
        auth_url: String,
        username: String,
        password: String,
        project: String,
        domain: String,
    },
}

/// Application configuration
struct Config {
    endpoint: String,
    credentials: Credentials,
    action: Action,
    kind: ResourceKind,
    resource_id: String,
    parent_id: Option<String>,
    timeout_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    log_level: String,
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_number(name: &str) -> Result<Option<u64>> {
    optional_var(name)
        .map(|v| {
            v.parse()
                .map_err(|_| anyhow::anyhow!("{} must be a positive integer. Got: {}", name, v))
        })
        .transpose()
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let credentials = match optional_var("LBAAS_TOKEN") {
            Some(token) => Credentials::Token(token),
            None => Credentials::Password {
                auth_url: optional_var("LBAAS_AUTH_URL").unwrap_or_default(),
                username: optional_var("LBAAS_USERNAME").unwrap_or_default(),
                password: optional_var("LBAAS_PASSWORD").unwrap_or_default(),
                project: optional_var("LBAAS_PROJECT").unwrap_or_else(|| "admin".to_string()),
                domain: optional_var("LBAAS_DOMAIN").unwrap_or_else(|| "Default".to_string()),
            },
        };

        Ok(Self {
            endpoint: optional_var("LBAAS_ENDPOINT").unwrap_or_default(),
            credentials,
            action: optional_var("LBAAS_ACTION").unwrap_or_default().parse()?,
            kind: optional_var("LBAAS_RESOURCE_KIND")
                .unwrap_or_else(|| "loadbalancer".to_string())
                .parse()?,
            resource_id: optional_var("LBAAS_RESOURCE_ID").unwrap_or_default(),
            parent_id: optional_var("LBAAS_PARENT_ID"),
            timeout_secs: parse_number("LBAAS_TIMEOUT_SECS")?,
            poll_interval_ms: parse_number("LBAAS_POLL_INTERVAL_MS")?,
            log_level: optional_var("LBAAS_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        validate_url("LBAAS_ENDPOINT", &self.endpoint)?;

        if let Credentials::Password {
            auth_url,
            username,
            password,
            ..
        } = &self.credentials
        {
            if username.is_empty() || password.is_empty() {
                anyhow::bail!(
                    "Credentials are required. Set LBAAS_TOKEN, or \
                    LBAAS_AUTH_URL, LBAAS_USERNAME and LBAAS_PASSWORD"
                );
            }
            validate_url("LBAAS_AUTH_URL", auth_url)?;
        }

        if self.resource_id.is_empty() {
            anyhow::bail!("LBAAS_RESOURCE_ID is required");
        }

        if let Some(timeout) = self.timeout_secs
            && (!(1..=86_400).contains(&timeout))
        {
            anyhow::bail!(
                "LBAAS_TIMEOUT_SECS must be between 1 and 86400 seconds. Got: {}",
                timeout
            );
        }

        if let Some(interval) = self.poll_interval_ms
            && (!(100..=600_000).contains(&interval))
        {
            anyhow::bail!(
                "LBAAS_POLL_INTERVAL_MS must be between 100 and 600000. Got: {}",
                interval
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "LBAAS_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    /// Convergence settings with any overrides applied
    fn convergence_config(&self) -> ConvergenceConfig {
        let mut config = ConvergenceConfig::new();
        if let Some(interval) = self.poll_interval_ms {
            config.poll.interval_ms = interval;
            config.poll.delete_interval_ms = interval;
        }
        config
    }

    /// A fresh context for this run's single operation
    fn operation_context(&self, convergence: &ConvergenceConfig) -> OperationContext {
        match self.timeout_secs {
            Some(secs) => OperationContext::with_timeout(Duration::from_secs(secs)),
            None => convergence.timeouts.context_for(self.action.operation_kind()),
        }
    }
}

fn validate_url(name: &str, url: &str) -> Result<()> {
    if url.is_empty() {
        anyhow::bail!("{} is required", name);
    }

    if !url.starts_with("https://") && !url.starts_with("http://") {
        anyhow::bail!("{} must use HTTP or HTTPS scheme. Got: {}", name, url);
    }

    if url.starts_with("http://") {
        eprintln!("WARNING: {name} uses HTTP (not HTTPS). Credentials travel in clear text.");
    }

    Ok(())
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return CtlExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return CtlExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return CtlExitCode::ConfigError.into();
    }

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return CtlExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        match run(config).await {
            Ok(()) => CtlExitCode::Success,
            Err(e) => {
                error!("Operation failed: {:#}", e);
                CtlExitCode::RuntimeError
            }
        }
    })
    .into()
}

/// Wire the client into the engine and run the configured action
async fn run(config: Config) -> Result<()> {
    let tokens = TokenStore::new();

    let executor = match &config.credentials {
        Credentials::Token(token) => {
            tokens.set(token.as_str());
            RetryExecutor::new(Arc::new(StaticToken))
        }
        Credentials::Password {
            auth_url,
            username,
            password,
            project,
            domain,
        } => {
            let auth = PasswordAuth::new(
                auth_url.as_str(),
                username.as_str(),
                password.as_str(),
                project.as_str(),
                domain.as_str(),
                tokens.clone(),
            )?;
            auth.authenticate().await?;
            RetryExecutor::new(Arc::new(auth))
        }
    };

    let client = LbaasClient::new(config.endpoint.as_str(), tokens)?;
    let api = client.resource(config.kind);

    let convergence = config.convergence_config();
    let (engine, events) = ConvergenceEngine::new(executor, &convergence)?;
    let event_logger = tokio::spawn(log_events(events));

    let ctx = config.operation_context(&convergence);
    let shutdown = ctx.cancellation_token().clone();
    let signals = tokio::spawn(cancel_on_signal(shutdown));

    let id = ResourceId::new(config.resource_id.as_str());
    info!(
        action = ?config.action,
        resource_type = %config.kind,
        id = %id,
        "Starting operation"
    );

    let result = match config.action {
        Action::WaitActive => engine.wait_active(&ctx, &api, &id).await.map(|resource| {
            info!(
                id = %resource.id,
                status = %resource.provisioning_status,
                operating_status = resource.operating_status.as_deref().unwrap_or("-"),
                "Resource is active"
            );
        }),
        Action::WaitDeleted => engine.wait_deleted(&ctx, &api, &id).await,
        Action::Delete => {
            let parent = config
                .parent_id
                .as_deref()
                .map(ResourceId::from)
                .unwrap_or_else(|| id.clone());
            engine
                .delete_resource(&ctx, &api, &parent, &id, RetryMode::Conflict)
                .await
        }
    };

    signals.abort();
    drop(engine);
    if let Err(e) = event_logger.await {
        debug!("Event logger ended abnormally: {}", e);
    }

    result?;
    info!("Operation completed");
    Ok(())
}

/// Log engine events until every engine handle is dropped
async fn log_events(mut events: mpsc::Receiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::LockAcquired { parent } => debug!(parent = %parent, "Lock acquired"),
            EngineEvent::MutationAccepted { action, resource } => {
                info!(action = %action, resource = %resource, "Request accepted")
            }
            EngineEvent::Converged { action, resource } => {
                info!(action = %action, resource = %resource, "Converged")
            }
            EngineEvent::Deleted { resource } => info!(resource = %resource, "Deleted"),
            EngineEvent::Failed { action, resource_type, error } => {
                warn!(action = %action, resource_type = %resource_type, error = %error, "Failed")
            }
        }
    }
}

/// Cancel the running operation on SIGTERM or SIGINT
#[cfg(unix)]
async fn cancel_on_signal(token: CancellationToken) {
    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to set up signal handlers: {}", e);
            return;
        }
    };

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };

    warn!("Received {}, cancelling operation", name);
    token.cancel();
}

/// Cancel the running operation on CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn cancel_on_signal(token: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("Received CTRL-C, cancelling operation");
            token.cancel();
        }
        Err(e) => warn!("Failed to wait for CTRL-C: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(action: Action) -> Config {
        Config {
            endpoint: "https://lb.example.test".to_string(),
            credentials: Credentials::Token("tok".to_string()),
            action,
            kind: ResourceKind::Listener,
            resource_id: "l-1".to_string(),
            parent_id: None,
            timeout_secs: None,
            poll_interval_ms: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_action_from_str() {
        assert_eq!("wait-active".parse::<Action>().unwrap(), Action::WaitActive);
        assert_eq!("delete".parse::<Action>().unwrap(), Action::Delete);
        assert!("create".parse::<Action>().is_err());
    }

    #[test]
    fn test_valid_config() {
        assert!(config(Action::WaitActive).validate().is_ok());
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut cfg = config(Action::Delete);
        cfg.credentials = Credentials::Password {
            auth_url: "https://id.example.test".to_string(),
            username: String::new(),
            password: String::new(),
            project: "admin".to_string(),
            domain: "Default".to_string(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_values_rejected() {
        let mut cfg = config(Action::Delete);
        cfg.endpoint = "ftp://lb.example.test".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = config(Action::Delete);
        cfg.resource_id.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = config(Action::Delete);
        cfg.timeout_secs = Some(0);
        assert!(cfg.validate().is_err());

        let mut cfg = config(Action::Delete);
        cfg.log_level = "loud".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_poll_interval_override() {
        let mut cfg = config(Action::WaitDeleted);
        cfg.poll_interval_ms = Some(500);

        let convergence = cfg.convergence_config();
        assert_eq!(convergence.poll.interval(), Duration::from_millis(500));
        assert_eq!(convergence.poll.delete_interval(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_timeout_override() {
        let mut cfg = config(Action::WaitActive);
        cfg.timeout_secs = Some(30);

        let ctx = cfg.operation_context(&cfg.convergence_config());
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(30));
    }
}
