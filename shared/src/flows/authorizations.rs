//! Signed authorization and consent endpoints of an active connection.

use reqwest::Method;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{endpoint, into_data, ProviderClient};
use crate::authorizations::{AuthorizationDecryptor, AuthorizationsCollection, DecryptedConsent};
use crate::crypto::keys::{KeyManager, KeyStore};
use crate::envelope::Envelope;
use crate::error::{NetworkError, StoreError};
use crate::primitives::Connection;
use crate::rpc::{parse_envelope_list, parse_single_envelope, ConfirmAuthorizationRequest, ConfirmAuthorizationResponse, Data};
use crate::store::{ConnectionStore, InMemoryConnectionStore};

pub struct AuthorizationsApi<S> {
    client: ProviderClient<S>,
}

impl<S: KeyStore + 'static> AuthorizationsApi<S> {
    pub fn new(client: ProviderClient<S>) -> AuthorizationsApi<S> {
        AuthorizationsApi { client }
    }

    pub async fn fetch_authorizations(&self, connection: &Connection, expires_at: i64) -> Result<Vec<Envelope>, NetworkError> {
        let body = self.get(connection, "authorizations", expires_at).await?;
        parse_envelope_list(body).ok_or_else(|| NetworkError::MalformedResponse("expected a list of envelopes".into()))
    }

    pub async fn fetch_authorization(
        &self,
        connection: &Connection,
        authorization_id: &str,
        expires_at: i64,
    ) -> Result<Envelope, NetworkError> {
        let body = self
            .get(connection, &format!("authorizations/{}", authorization_id), expires_at)
            .await?;
        parse_single_envelope(body).ok_or_else(|| NetworkError::MalformedResponse("expected an envelope".into()))
    }

    pub async fn fetch_consents(&self, connection: &Connection, expires_at: i64) -> Result<Vec<Envelope>, NetworkError> {
        let body = self.get(connection, "consents", expires_at).await?;
        parse_envelope_list(body).ok_or_else(|| NetworkError::MalformedResponse("expected a list of envelopes".into()))
    }

    pub async fn confirm(
        &self,
        connection: &Connection,
        authorization_id: &str,
        authorization_code: Option<&str>,
        expires_at: i64,
    ) -> Result<bool, NetworkError> {
        self.answer(connection, authorization_id, true, authorization_code, expires_at)
            .await
    }

    pub async fn deny(
        &self,
        connection: &Connection,
        authorization_id: &str,
        authorization_code: Option<&str>,
        expires_at: i64,
    ) -> Result<bool, NetworkError> {
        self.answer(connection, authorization_id, false, authorization_code, expires_at)
            .await
    }

    /// Polls every active connection once and folds the decrypted results into
    /// `collection`. Connections whose request fails are skipped.
    pub async fn refresh<C: ConnectionStore + ?Sized>(
        &self,
        connections: &C,
        collection: &mut AuthorizationsCollection,
        expires_at: i64,
    ) -> Result<BTreeSet<usize>, StoreError> {
        let active = connections.active()?;
        let mut envelopes = Vec::new();
        for connection in &active {
            match self.fetch_authorizations(connection, expires_at).await {
                Ok(batch) => envelopes.extend(batch),
                Err(err) => warn!(id = %connection.id, error = %err, "could not fetch authorizations"),
            }
        }

        let received = envelopes.len();
        let decrypted = self
            .decrypt_batch(active, envelopes, |decryptor, envelopes| {
                decryptor.decrypt_authorizations(envelopes)
            })
            .await;
        debug!(received, decrypted = decrypted.len(), "authorizations refreshed");

        Ok(collection.update(decrypted))
    }

    /// Fetches and decrypts the consents of every active connection.
    pub async fn consents<C: ConnectionStore + ?Sized>(
        &self,
        connections: &C,
        expires_at: i64,
    ) -> Result<Vec<DecryptedConsent>, StoreError> {
        let active = connections.active()?;
        let mut envelopes = Vec::new();
        for connection in &active {
            match self.fetch_consents(connection, expires_at).await {
                Ok(batch) => envelopes.extend(batch),
                Err(err) => warn!(id = %connection.id, error = %err, "could not fetch consents"),
            }
        }

        Ok(self
            .decrypt_batch(active, envelopes, |decryptor, envelopes| decryptor.decrypt_consents(envelopes))
            .await)
    }

    /// Runs the RSA work of a batch on the blocking pool, resolving envelopes
    /// against the connections that were polled.
    async fn decrypt_batch<T, F>(&self, polled: Vec<Connection>, envelopes: Vec<Envelope>, open: F) -> Vec<T>
    where
        T: Send + 'static,
        F: FnOnce(&AuthorizationDecryptor<'_, InMemoryConnectionStore, S>, &[Envelope]) -> Vec<T> + Send + 'static,
    {
        if envelopes.is_empty() {
            return Vec::new();
        }

        let keys = Arc::clone(self.client.keys());
        let decrypted = tokio::task::spawn_blocking(move || {
            let snapshot: InMemoryConnectionStore = polled.into_iter().collect();
            let keys: &KeyManager<S> = &keys;
            open(&AuthorizationDecryptor::new(&snapshot, keys), &envelopes)
        })
        .await;

        decrypted.unwrap_or_else(|err| {
            warn!(error = %err, "decryption batch did not finish");
            Vec::new()
        })
    }

    async fn answer(
        &self,
        connection: &Connection,
        authorization_id: &str,
        confirm: bool,
        authorization_code: Option<&str>,
        expires_at: i64,
    ) -> Result<bool, NetworkError> {
        let url = self.url(connection, &format!("authorizations/{}", authorization_id))?;
        let body = serde_json::to_string(&Data::new(ConfirmAuthorizationRequest {
            confirm,
            authorization_code: authorization_code.map(str::to_owned),
        }))
        .map_err(|err| NetworkError::MalformedResponse(err.to_string()))?;

        let response = self
            .client
            .send_signed(connection, Method::PUT, url, Some(body), expires_at)
            .await?;
        let response: ConfirmAuthorizationResponse = into_data(response)?;
        Ok(response.success)
    }

    async fn get(&self, connection: &Connection, path: &str, expires_at: i64) -> Result<serde_json::Value, NetworkError> {
        let url = self.url(connection, path)?;
        self.client
            .send_signed(connection, Method::GET, url, None, expires_at)
            .await
    }

    fn url(&self, connection: &Connection, path: &str) -> Result<url::Url, NetworkError> {
        let base_url = connection
            .base_url()
            .map_err(|_| NetworkError::InvalidUrl(connection.base_url_string.clone()))?;
        endpoint(&base_url, path)
    }
}
