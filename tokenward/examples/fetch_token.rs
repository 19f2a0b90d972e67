use std::{path::PathBuf, time::Duration};

use clap::Parser;
use color_eyre::eyre::WrapErr;
use tokenward::{
    ClientId, ClientSecret, ClientSecretStrategy, DelegatedCredential,
    DelegatedCredentialStrategy, DelegatedToken, ProviderConfig, Scope, TokenExchangeClient,
    TokenProvider, TokenProviderBuilder,
};
use tokenward_clock::DurationSecs;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// A JSON provider configuration; overrides the individual options below
    #[arg(long, env)]
    config: Option<PathBuf>,

    /// The issuing authority's token request URL
    #[arg(short, long, env)]
    token_url: Option<reqwest::Url>,

    /// The client ID of the client
    #[arg(short, long, env)]
    client_id: Option<String>,

    /// The client secret used to identify the client to the issuing authority
    #[arg(short = 's', long, env, hide_env_values = true)]
    client_secret: Option<String>,

    /// A delegated bearer value for a signed-in user, tried before the client secret
    #[arg(long, env, hide_env_values = true)]
    delegated_token: Option<String>,

    /// The local file used to cache credentials
    #[arg(short = 'f', long, env, default_value = ".credentials.json")]
    credentials_file: PathBuf,

    /// The scopes to request tokens for
    #[arg(long = "scope", default_value = "platform")]
    scopes: Vec<String>,

    /// Seconds between polls
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,
}

fn provider_from_opts(opts: &Opts, delegated: &DelegatedCredential) -> color_eyre::Result<TokenProvider> {
    if let Some(path) = &opts.config {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("unable to read {}", path.display()))?;
        let config: ProviderConfig = serde_json::from_str(&raw)?;
        return Ok(config.build(delegated)?);
    }

    let token_url = opts
        .token_url
        .clone()
        .ok_or_else(|| color_eyre::eyre::eyre!("either --config or --token-url is required"))?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let exchange = TokenExchangeClient::new(client, token_url);

    let mut builder = TokenProviderBuilder::new()
        .safety_margin(DurationSecs::from_mins(5))
        .file_store(&opts.credentials_file)
        .strategy(DelegatedCredentialStrategy::new(exchange.clone(), delegated.clone()));

    if let (Some(id), Some(secret)) = (&opts.client_id, &opts.client_secret) {
        builder = builder.strategy(ClientSecretStrategy::new(
            exchange,
            ClientId::new(id.clone()),
            ClientSecret::new(secret.clone()),
        ));
    }

    Ok(builder.build()?)
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

    let delegated = DelegatedCredential::empty();
    if let Some(token) = &opts.delegated_token {
        delegated.set(DelegatedToken::new(token.clone()));
    }

    let provider = provider_from_opts(&opts, &delegated)?;
    let scopes: Vec<Scope> = opts.scopes.iter().cloned().map(Scope::new).collect();

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        for scope in &scopes {
            match provider.get_valid_record(scope).await {
                Ok(record) => tracing::info!(
                    %scope,
                    token = format_args!("{:#?}", record.value()),
                    expires_at = record.expires_at().0,
                    "pulled token"
                ),
                Err(error) => tracing::error!(
                    %scope,
                    retryable = error.is_retryable(),
                    reauthenticate = error.needs_reauthentication(),
                    error = %error,
                    "unable to obtain token"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_zero_interval_is_refused() {
        assert!(Opts::try_parse_from(["fetch_token", "--interval", "0"]).is_err());
        let opts = Opts::try_parse_from(["fetch_token", "--interval", "1"]).unwrap();
        assert_eq!(opts.interval, 1);
    }
}
