use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use shared::{
    authorizations::{AuthorizationDecryptor, AuthorizationState, AuthorizationsCollection},
    crypto::keys::KeyManager,
    flows::{
        authorizations::AuthorizationsApi, default_expires_at, parse_deep_link, ConnectionManager, CreationOutcome,
        ProviderClient,
    },
    primitives::Connection,
    store::ConnectionStore,
};
use std::{sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::persistence::{FileConnectionStore, FileKeyStore};

mod config;
mod persistence;

#[derive(Args, Debug)]
struct ConnectInput {
    /// Deep link carrying `configuration`, or a provider configuration url
    link: String,
    #[arg(long)]
    connect_query: Option<String>,
}

#[derive(Args, Debug)]
struct FinishRedirectInput {
    guid: String,
    /// Url the provider redirected to at the end of its web flow
    url: String,
}

#[derive(Args, Debug)]
struct AuthorizationInput {
    connection_id: String,
    authorization_id: String,
}

#[derive(Args, Debug)]
struct RevokeInput {
    connection_id: String,
}

#[derive(Args, Debug)]
struct WatchInput {
    #[arg(long, default_value_t = 3)]
    interval_secs: u64,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    Connect(ConnectInput),
    FinishRedirect(FinishRedirectInput),
    Connections,
    Authorizations,
    Confirm(AuthorizationInput),
    Deny(AuthorizationInput),
    Consents,
    Revoke(RevokeInput),
    Watch(WatchInput),
}

#[derive(Parser, Debug)]
#[command(name = "authenticator", about = "Device side of the SCA connection protocol")]
struct Arguments {
    #[command(subcommand)]
    command: Subcommands,
    #[command(flatten)]
    settings: Settings,
}

struct App {
    connections: Arc<FileConnectionStore>,
    keys: Arc<KeyManager<FileKeyStore>>,
    manager: ConnectionManager<FileConnectionStore, FileKeyStore>,
    api: AuthorizationsApi<FileKeyStore>,
}

impl App {
    fn new(settings: &Settings) -> Result<App> {
        let data_dir = settings.data_dir()?;
        let connections = Arc::new(FileConnectionStore::new(&data_dir));
        let keys = Arc::new(KeyManager::with_modulus_bits(
            FileKeyStore::new(&data_dir, settings.storage_key()?),
            settings.key_bits,
        ));

        let client = ProviderClient::new(settings.client_settings(), Arc::clone(&keys))
            .context("could not build the http client")?;
        let manager = ConnectionManager::new(client.clone(), Arc::clone(&connections))
            .with_device_info(Arc::new(settings.device_info()));

        Ok(App {
            connections,
            keys,
            manager,
            api: AuthorizationsApi::new(client),
        })
    }

    fn active_connection(&self, connection_id: &str) -> Result<Connection> {
        self.connections
            .find_by_id(connection_id)?
            .filter(Connection::is_active)
            .ok_or_else(|| anyhow!("no active connection with id {}", connection_id))
    }
}

async fn connect(app: &App, input: ConnectInput) -> Result<()> {
    let (configuration_url, connect_query) = match parse_deep_link(&input.link) {
        Some(link) => (link.configuration_url, link.connect_query.or(input.connect_query)),
        None => (input.link, input.connect_query),
    };

    let outcome = app
        .manager
        .connect(&configuration_url, connect_query.as_deref())
        .await
        .map_err(|err| anyhow!(err.user_message()))?;

    match outcome {
        CreationOutcome::Active { connection, .. } => {
            println!("Connected to {} (id {})", connection.name, connection.id);
        }
        CreationOutcome::Redirect {
            connection,
            connect_url,
        } => {
            println!("Continue in the browser: {}", connect_url);
            println!(
                "Then run: authenticator finish-redirect {} <url you were sent to>",
                connection.guid
            );
        }
    }
    Ok(())
}

async fn finish_redirect(app: &App, input: FinishRedirectInput) -> Result<()> {
    let connection = app
        .manager
        .complete_redirect(&input.guid, &input.url)
        .await
        .map_err(|err| anyhow!(err.user_message()))?;
    println!("Connected to {} (id {})", connection.name, connection.id);
    Ok(())
}

fn list_connections(app: &App) -> Result<()> {
    for connection in app.connections.all()? {
        println!(
            "{:<8} {:<40} {:<18} {}",
            connection.id,
            connection.guid,
            format!("{:?}", connection.status),
            connection.name
        );
    }
    Ok(())
}

fn print_collection(collection: &AuthorizationsCollection) {
    let now = Utc::now();
    if collection.live(now).next().is_none() {
        println!("No pending authorizations");
        return;
    }

    for view_model in collection.live(now) {
        let remaining = (view_model.expires_at - now).num_seconds();
        println!(
            "[{}/{}] {} ({}s left)\n    {}",
            view_model.connection_id, view_model.authorization_id, view_model.title, remaining, view_model.description
        );
    }
}

async fn list_authorizations(app: &App) -> Result<()> {
    let mut collection = AuthorizationsCollection::new();
    app.api
        .refresh(app.connections.as_ref(), &mut collection, default_expires_at())
        .await?;
    print_collection(&collection);
    Ok(())
}

async fn answer(app: &App, input: AuthorizationInput, confirm: bool) -> Result<()> {
    let connection = app.active_connection(&input.connection_id)?;

    let envelope = app
        .api
        .fetch_authorization(&connection, &input.authorization_id, default_expires_at())
        .await
        .map_err(|err| anyhow!(err.user_message()))?;
    let authorization = AuthorizationDecryptor::new(app.connections.as_ref(), app.keys.as_ref())
        .decrypt_authorization(&envelope)
        .filter(|authorization| authorization.expires_at > Utc::now())
        .ok_or_else(|| anyhow!("authorization {} is unavailable or expired", input.authorization_id))?;

    let code = authorization.authorization_code.as_deref();
    let answered = if confirm {
        app.api
            .confirm(&connection, &authorization.id, code, default_expires_at())
            .await
    } else {
        app.api.deny(&connection, &authorization.id, code, default_expires_at()).await
    };
    let accepted = answered.map_err(|err| anyhow!(err.user_message()))?;

    let state = match (accepted, confirm) {
        (false, _) => AuthorizationState::Error,
        (true, true) => AuthorizationState::Confirmed,
        (true, false) => AuthorizationState::Denied,
    };
    println!("{}: {:?}", authorization.title, state);
    Ok(())
}

async fn list_consents(app: &App) -> Result<()> {
    let consents = app
        .api
        .consents(app.connections.as_ref(), default_expires_at())
        .await?;
    if consents.is_empty() {
        println!("No consents");
    }
    for consent in consents {
        println!(
            "[{}/{}] {} ({}), {} account(s), expires {}",
            consent.connection_id,
            consent.id,
            consent.tpp_name,
            consent.consent_type,
            consent.accounts.len(),
            consent.expires_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}

async fn revoke(app: &App, input: RevokeInput) -> Result<()> {
    let connection = app.active_connection(&input.connection_id)?;
    let result = app.manager.revoke(&connection, default_expires_at()).await;

    println!("Removed {} from this device", connection.name);
    result.map_err(|err| anyhow!("the provider was not notified: {}", err.user_message()))
}

async fn watch(app: &App, input: WatchInput) -> Result<()> {
    let mut collection = AuthorizationsCollection::new();
    let mut interval = tokio::time::interval(Duration::from_secs(input.interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let changed = app
                    .api
                    .refresh(app.connections.as_ref(), &mut collection, default_expires_at())
                    .await?;
                let expired = collection.remove_expired(Utc::now());
                if !changed.is_empty() || !expired.is_empty() {
                    print_collection(&collection);
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Arguments::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.settings.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let app = App::new(&args.settings)?;

    match args.command {
        Subcommands::Connect(input) => connect(&app, input).await,
        Subcommands::FinishRedirect(input) => finish_redirect(&app, input).await,
        Subcommands::Connections => list_connections(&app),
        Subcommands::Authorizations => list_authorizations(&app).await,
        Subcommands::Confirm(input) => answer(&app, input, true).await,
        Subcommands::Deny(input) => answer(&app, input, false).await,
        Subcommands::Consents => list_consents(&app).await,
        Subcommands::Revoke(input) => revoke(&app, input).await,
        Subcommands::Watch(input) => watch(&app, input).await,
    }
}
