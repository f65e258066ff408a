use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use tokenward::{
    config::Mode, AccessToken, ClientId, ClientSecret, Config, Event, RefreshToken, SubjectId,
    TokenFields, TokenService,
};
use tokenward_clock::DurationSecs;
use tokio::time;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliMode {
    Single,
    Multi,
}

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[clap(short, long, env)]
    token_url: String,

    /// The client ID of the client
    #[clap(short, long, env)]
    client_id: ClientId,

    /// The client secret used to identify the client to the issuing authority
    #[clap(short = 's', long, env, hide_env_values = true)]
    client_secret: ClientSecret,

    /// A base64-encoded 32-byte key used to seal tokens at rest
    #[clap(short = 'k', long, env = "TOKENWARD_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    /// The local file used to persist sealed tokens
    #[clap(short = 'f', long, env, default_value = ".tokens.json")]
    store_path: PathBuf,

    /// Whether to track one identity or every stored identity
    #[clap(short, long, env, value_enum, default_value = "single")]
    mode: CliMode,

    /// Seed the store with this refresh token before starting
    #[clap(long, env, hide_env_values = true)]
    seed_refresh_token: Option<RefreshToken>,

    /// How often to check for tokens needing refresh, in seconds
    #[clap(long, env, default_value = "300")]
    check_interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let mut config = Config::new(opts.token_url, opts.client_id, opts.client_secret)
        .with_store_path(opts.store_path)
        .with_check_interval(DurationSecs(opts.check_interval))
        .with_mode(match opts.mode {
            CliMode::Single => Mode::Single,
            CliMode::Multi => Mode::Multi,
        });
    match opts.encryption_key {
        Some(key) => config = config.with_encryption_key(key),
        None => config.allow_ephemeral_key = true,
    }

    let service = TokenService::from_config(&config)?;
    service.subscribe(|event: &Event| -> Result<(), tokenward::backends::BoxError> {
        tracing::info!(event = %serde_json::to_string(event)?, "token event");
        Ok(())
    });

    let subject = service
        .single_subject()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| SubjectId::from_static("demo"));

    if let Some(refresh_token) = opts.seed_refresh_token {
        // an already-expired placeholder forces a refresh on the first pass
        let fields = TokenFields::new(AccessToken::from_static("placeholder"))
            .with_refresh_token(refresh_token)
            .with_expires_in(DurationSecs(1));
        service.save_token(&subject, fields).await?;
        time::sleep(Duration::from_secs(1)).await;
    }

    if !service.start() {
        color_eyre::eyre::bail!("background refresh could not be started");
    }

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        match service.get_token(&subject).await {
            Ok(token) => {
                tracing::debug!(
                    token = format_args!("{:#?}", token.access_token),
                    expires_at = token.effective_expires_at().0,
                    "pulled token"
                );
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "no usable token"
                );
            }
        }

        let stats = service.stats();
        tracing::trace!(
            attempted = stats.attempted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "refresh stats"
        );
    }

    service.stop().await;
    Ok(())
}
