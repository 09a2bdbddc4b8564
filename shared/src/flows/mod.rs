//! Connection lifecycle: provider discovery, the creation handshake, redirect
//! continuation and revocation.
//!
//! `Creating -> {Active | AwaitingRedirect} -> [Active] -> Revoked`

pub mod authorizations;
pub mod redirect;

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{header, Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::crypto::keys::{KeyManager, KeyStore};
use crate::error::{CreationError, KeyError, NetworkError, GENERIC_FAILURE_MESSAGE};
use crate::primitives::{AccessToken, Connection};
use crate::rpc::{
    CreateConnectionRequest, CreateConnectionResponse, Data, ProviderErrorResponse, ProviderResponse,
    RevokeConnectionResponse,
};
use crate::store::ConnectionStore;
use crate::utils::b64_encode;

pub use redirect::{parse_deep_link, parse_redirect, DeepLink, RedirectOutcome};

pub const API_PREFIX: &str = "api/authenticator/v1";
pub const ACCESS_TOKEN_HEADER: &str = "Access-Token";
pub const EXPIRES_AT_HEADER: &str = "Expires-At";
pub const SIGNATURE_HEADER: &str = "Signature";
pub const DEFAULT_RETURN_URL: &str = "authenticator://oauth/redirect";

/// Network availability gate checked before any protocol request.
pub trait Reachability: Send + Sync {
    fn is_reachable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

impl Reachability for AlwaysReachable {
    fn is_reachable(&self) -> bool {
        true
    }
}

/// Opaque device strings forwarded verbatim in creation requests.
pub trait DeviceInfo: Send + Sync {
    fn push_token(&self) -> Option<String>;
    fn app_language(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct StaticDeviceInfo {
    pub push_token: Option<String>,
    pub app_language: String,
}

impl Default for StaticDeviceInfo {
    fn default() -> Self {
        StaticDeviceInfo {
            push_token: None,
            app_language: "en".to_string(),
        }
    }
}

impl DeviceInfo for StaticDeviceInfo {
    fn push_token(&self) -> Option<String> {
        self.push_token.clone()
    }

    fn app_language(&self) -> String {
        self.app_language.clone()
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub return_url: String,
    pub request_timeout: Duration,
    pub platform: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            return_url: DEFAULT_RETURN_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Terminal result of a successful creation request.
#[derive(Debug)]
pub enum CreationOutcome {
    Active {
        connection: Connection,
        access_token: AccessToken,
    },
    Redirect {
        connection: Connection,
        connect_url: String,
    },
}

impl CreationOutcome {
    pub fn connection(&self) -> &Connection {
        match self {
            CreationOutcome::Active { connection, .. } | CreationOutcome::Redirect { connection, .. } => connection,
        }
    }
}

/// `"{method}|{url}|{expires_at}|{body}"`, the string a connection signs.
pub fn signature_message(method: &str, url: &str, expires_at: i64, body: &str) -> String {
    format!("{}|{}|{}|{}", method.to_lowercase(), url, expires_at, body)
}

/// Unix time a few minutes ahead, used for `Expires-At` when the caller has no opinion.
pub fn default_expires_at() -> i64 {
    (Utc::now() + ChronoDuration::minutes(5)).timestamp()
}

/// Appends `segments` to `base` without dropping any path `base` already has.
pub fn endpoint(base: &Url, segments: &str) -> Result<Url, NetworkError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| NetworkError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(API_PREFIX.split('/'))
        .extend(segments.split('/').filter(|segment| !segment.is_empty()));
    Ok(url)
}

/// A connection's display name, suffixed with a running count when it
/// collides with an existing active connection.
pub fn display_name(provider_name: &str, active_names: &[String]) -> String {
    if active_names.iter().any(|name| name == provider_name) {
        format!("{} ({})", provider_name, active_names.len() + 1)
    } else {
        provider_name.to_string()
    }
}

/// HTTP plumbing shared by the connection and authorization flows.
pub struct ProviderClient<S> {
    http: Client,
    settings: ClientSettings,
    keys: Arc<KeyManager<S>>,
    reachability: Arc<dyn Reachability>,
}

impl<S> Clone for ProviderClient<S> {
    fn clone(&self) -> Self {
        ProviderClient {
            http: self.http.clone(),
            settings: self.settings.clone(),
            keys: Arc::clone(&self.keys),
            reachability: Arc::clone(&self.reachability),
        }
    }
}

impl<S: KeyStore> ProviderClient<S> {
    pub fn new(settings: ClientSettings, keys: Arc<KeyManager<S>>) -> Result<ProviderClient<S>, NetworkError> {
        let http = Client::builder().timeout(settings.request_timeout).build()?;

        Ok(ProviderClient {
            http,
            settings,
            keys,
            reachability: Arc::new(AlwaysReachable),
        })
    }

    pub fn with_reachability(mut self, reachability: Arc<dyn Reachability>) -> ProviderClient<S> {
        self.reachability = reachability;
        self
    }

    pub fn keys(&self) -> &Arc<KeyManager<S>> {
        &self.keys
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn ensure_reachable(&self) -> Result<(), NetworkError> {
        if self.reachability.is_reachable() {
            Ok(())
        } else {
            Err(NetworkError::Unreachable)
        }
    }

    async fn get_data<T: DeserializeOwned>(&self, url: Url) -> Result<T, NetworkError> {
        self.ensure_reachable()?;
        let response = self.http.get(url).send().await?;
        into_data(read_body(response).await?)
    }

    /// Sends a request authenticated by `connection`: access token, expiry and
    /// an RSA signature over method, url, expiry and body.
    pub(crate) async fn send_signed(
        &self,
        connection: &Connection,
        method: Method,
        url: Url,
        body: Option<String>,
        expires_at: i64,
    ) -> Result<Value, NetworkError> {
        self.ensure_reachable()?;
        let access_token = connection
            .access_token
            .as_ref()
            .filter(|_| connection.is_active())
            .ok_or(NetworkError::NotActive)?;

        let body = body.unwrap_or_default();
        let message = signature_message(method.as_str(), url.as_str(), expires_at, &body);
        let signature = self.keys.sign(&connection.key_tag(), message.as_bytes())?;

        let mut request = self
            .http
            .request(method, url)
            .header(ACCESS_TOKEN_HEADER, access_token.as_str())
            .header(EXPIRES_AT_HEADER, expires_at.to_string())
            .header(SIGNATURE_HEADER, b64_encode(&signature));
        if !body.is_empty() {
            request = request.header(header::CONTENT_TYPE, "application/json").body(body);
        }

        read_body(request.send().await?).await
    }
}

/// Reads a JSON body, mapping non-2xx statuses to provider errors.
pub(crate) async fn read_body(response: Response) -> Result<Value, NetworkError> {
    let status = response.status();
    let text = response.text().await?;
    let body: Option<Value> = serde_json::from_str(&text).ok();

    if !status.is_success() {
        let error = body
            .and_then(|body| serde_json::from_value::<ProviderErrorResponse>(body).ok())
            .map(|error| NetworkError::Provider {
                class: error.error_class,
                message: error.error_message,
            })
            .unwrap_or_else(|| NetworkError::Transport(format!("provider responded with {}", status)));
        return Err(error);
    }

    body.ok_or_else(|| NetworkError::MalformedResponse("response body is not JSON".to_string()))
}

pub(crate) fn into_data<T: DeserializeOwned>(body: Value) -> Result<T, NetworkError> {
    serde_json::from_value::<Data<T>>(body)
        .map(|wrapper| wrapper.data)
        .map_err(|err| NetworkError::MalformedResponse(err.to_string()))
}

/// Owns connection records from discovery to revocation.
pub struct ConnectionManager<C, S> {
    client: ProviderClient<S>,
    connections: Arc<C>,
    device: Arc<dyn DeviceInfo>,
}

impl<C: ConnectionStore, S: KeyStore + 'static> ConnectionManager<C, S> {
    pub fn new(client: ProviderClient<S>, connections: Arc<C>) -> ConnectionManager<C, S> {
        ConnectionManager {
            client,
            connections,
            device: Arc::new(StaticDeviceInfo::default()),
        }
    }

    pub fn with_device_info(mut self, device: Arc<dyn DeviceInfo>) -> ConnectionManager<C, S> {
        self.device = device;
        self
    }

    pub fn connections(&self) -> &Arc<C> {
        &self.connections
    }

    pub async fn discover_provider(&self, configuration_url: &str) -> Result<ProviderResponse, NetworkError> {
        let url = Url::parse(configuration_url).map_err(|_| NetworkError::InvalidUrl(configuration_url.to_string()))?;
        let provider: ProviderResponse = self.client.get_data(url).await?;
        info!(code = %provider.code, name = %provider.name, "discovered provider");
        Ok(provider)
    }

    /// Discovery followed by creation, as started from a QR code or deep link.
    pub async fn connect(
        &self,
        configuration_url: &str,
        connect_query: Option<&str>,
    ) -> Result<CreationOutcome, CreationError> {
        let provider = self.discover_provider(configuration_url).await?;
        self.create_connection(&provider, connect_query).await
    }

    /// Runs the creation handshake. A key pair is generated for the new
    /// connection's guid on the blocking pool; on any failure it is deleted
    /// again and nothing is persisted.
    pub async fn create_connection(
        &self,
        provider: &ProviderResponse,
        connect_query: Option<&str>,
    ) -> Result<CreationOutcome, CreationError> {
        self.client.ensure_reachable()?;

        let names = self.connections.active_names()?;
        let mut connection = Connection::new(
            provider.code.clone(),
            display_name(&provider.name, &names),
            provider.connect_url.clone(),
        );
        connection.support_email = provider.support_email.clone().unwrap_or_default();
        connection.logo_url_string = provider.logo_url.clone().unwrap_or_default();

        let tag = connection.key_tag();
        let keys = Arc::clone(&self.client.keys);
        let key_tag = tag.clone();
        tokio::task::spawn_blocking(move || keys.create_key_pair(&key_tag))
            .await
            .map_err(|_| KeyError::GenerationFailed)??;

        match self.request_create_connection(connection, connect_query).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(key_err) = self.client.keys.delete_key_pair(&tag) {
                    warn!(%tag, error = %key_err, "could not discard key pair of failed connection");
                }
                Err(err)
            }
        }
    }

    async fn request_create_connection(
        &self,
        mut connection: Connection,
        connect_query: Option<&str>,
    ) -> Result<CreationOutcome, CreationError> {
        let base_url = connection
            .base_url()
            .map_err(|_| NetworkError::InvalidUrl(connection.base_url_string.clone()))?;
        let url = endpoint(&base_url, "connections")?;

        let body = Data::new(CreateConnectionRequest {
            public_key: self.client.keys.public_key_pem(&connection.key_tag())?,
            return_url: self.client.settings.return_url.clone(),
            platform: self.client.settings.platform.clone(),
            push_token: self.device.push_token(),
            connect_query: connect_query.map(str::to_owned),
        });

        let response = self
            .client
            .http
            .post(url)
            .header(header::ACCEPT_LANGUAGE, self.device.app_language())
            .json(&body)
            .send()
            .await
            .map_err(NetworkError::from)?;
        let response: CreateConnectionResponse = into_data(read_body(response).await?)?;

        if response.id.is_empty() {
            return Err(CreationError::MalformedResponse);
        }
        connection.id = response.id;

        let access_token = response.access_token.filter(|token| !token.is_empty());
        let connect_url = response.connect_url.filter(|url| !url.is_empty());

        let outcome = match (access_token, connect_url) {
            (Some(token), _) => {
                let access_token = AccessToken::new(token);
                connection.activate(access_token.clone());
                self.connections.save(&connection)?;
                info!(id = %connection.id, guid = %connection.guid, "connection active");
                CreationOutcome::Active {
                    connection,
                    access_token,
                }
            }
            (None, Some(connect_url)) => {
                connection.await_redirect();
                self.connections.save(&connection)?;
                info!(id = %connection.id, guid = %connection.guid, "connection awaiting redirect");
                CreationOutcome::Redirect {
                    connection,
                    connect_url,
                }
            }
            (None, None) => return Err(CreationError::MalformedResponse),
        };

        Ok(outcome)
    }

    /// Finishes a redirect-based creation from the URL the provider sent the
    /// user back to. A provider-reported failure retires the connection and
    /// its key pair.
    pub async fn complete_redirect(&self, guid: &str, redirect_url: &str) -> Result<Connection, CreationError> {
        let mut connection = self
            .connections
            .find_by_guid(guid)?
            .filter(Connection::is_awaiting_redirect)
            .ok_or(CreationError::InvalidState)?;

        match parse_redirect(redirect_url, &self.client.settings.return_url) {
            RedirectOutcome::NotRedirect => Err(CreationError::NotRedirect),
            RedirectOutcome::Success(access_token) => {
                connection.activate(access_token);
                self.connections.save(&connection)?;
                info!(id = %connection.id, guid = %connection.guid, "redirect completed, connection active");
                Ok(connection)
            }
            RedirectOutcome::Failure(reason) => {
                warn!(guid = %connection.guid, %reason, "provider rejected connection");
                self.retire(&mut connection);
                Err(CreationError::Redirect(reason))
            }
        }
    }

    /// Best-effort remote revocation. Local cleanup (record marked revoked,
    /// key pair deleted) happens whatever the provider answers.
    pub async fn revoke(&self, connection: &Connection, expires_at: i64) -> Result<(), NetworkError> {
        let remote = if connection.is_active() {
            self.request_revoke(connection, expires_at).await
        } else {
            Ok(())
        };

        let mut local = match self.connections.find_by_guid(&connection.guid) {
            Ok(Some(stored)) => stored,
            Ok(None) => connection.clone(),
            Err(err) => {
                warn!(guid = %connection.guid, error = %err, "could not reload connection before revoking");
                connection.clone()
            }
        };
        self.retire(&mut local);

        if let Err(err) = &remote {
            warn!(id = %connection.id, error = %err, "remote revocation failed");
        } else {
            info!(id = %connection.id, "connection revoked");
        }
        remote
    }

    async fn request_revoke(&self, connection: &Connection, expires_at: i64) -> Result<(), NetworkError> {
        let base_url = connection
            .base_url()
            .map_err(|_| NetworkError::InvalidUrl(connection.base_url_string.clone()))?;
        let url = endpoint(&base_url, "connections")?;

        let body = self
            .client
            .send_signed(connection, Method::DELETE, url, None, expires_at)
            .await?;
        let response: RevokeConnectionResponse = into_data(body)?;

        if response.success {
            Ok(())
        } else {
            Err(NetworkError::Provider {
                class: "RevokeFailed".to_string(),
                message: GENERIC_FAILURE_MESSAGE.to_string(),
            })
        }
    }

    fn retire(&self, connection: &mut Connection) {
        connection.mark_revoked();
        if let Err(err) = self.connections.save(connection) {
            warn!(guid = %connection.guid, error = %err, "could not persist revoked connection");
        }
        match self.client.keys.delete_key_pair(&connection.key_tag()) {
            Ok(()) | Err(KeyError::TagNotFound(_)) => {}
            Err(err) => warn!(guid = %connection.guid, error = %err, "could not delete key pair"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colliding_names_get_a_running_suffix() {
        let names = vec!["Demo Bank".to_string(), "Other Bank".to_string()];
        assert_eq!(display_name("Demo Bank", &names), "Demo Bank (3)");
        assert_eq!(display_name("Fresh Bank", &names), "Fresh Bank");
        assert_eq!(display_name("Demo Bank", &[]), "Demo Bank");
    }

    #[test]
    fn endpoints_keep_base_path() {
        let base = Url::parse("https://bank.test/sca").unwrap();
        assert_eq!(
            endpoint(&base, "connections").unwrap().as_str(),
            "https://bank.test/sca/api/authenticator/v1/connections"
        );

        let base = Url::parse("http://127.0.0.1:3000/").unwrap();
        assert_eq!(
            endpoint(&base, "authorizations/42").unwrap().as_str(),
            "http://127.0.0.1:3000/api/authenticator/v1/authorizations/42"
        );
    }

    #[test]
    fn signature_message_layout() {
        assert_eq!(
            signature_message("DELETE", "https://bank.test/api", 1700000000, ""),
            "delete|https://bank.test/api|1700000000|"
        );
        assert_eq!(
            signature_message("PUT", "https://bank.test/api", 1, "{\"data\":{}}"),
            "put|https://bank.test/api|1|{\"data\":{}}"
        );
    }
}
