use chrono::{DateTime, Utc};
use shared::authorizations::{ConsentAccount, ConsentSharedData, DecryptedAuthorization, DecryptedConsent};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_REVOKED: &str = "revoked";
pub const STATUS_CONFIRMED: &str = "confirmed";
pub const STATUS_DENIED: &str = "denied";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConnectionRow {
    pub id: i64,
    pub public_key: String,
    pub return_url: String,
    pub platform: String,
    pub push_token: Option<String>,
    pub access_token: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthorizationRow {
    pub id: i64,
    pub connection_id: i64,
    pub title: String,
    pub description: String,
    pub authorization_code: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationRow {
    pub fn payload(&self) -> DecryptedAuthorization {
        DecryptedAuthorization {
            id: self.id.to_string(),
            connection_id: self.connection_id.to_string(),
            title: self.title.clone(),
            description: self.description.clone(),
            authorization_code: self.authorization_code.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConsentRow {
    pub id: i64,
    pub connection_id: i64,
    pub tpp_name: String,
    pub consent_type: String,
    /// JSON array of accounts.
    pub accounts: String,
    pub shared_data: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConsentRow {
    pub fn payload(&self) -> Result<DecryptedConsent, serde_json::Error> {
        let accounts: Vec<ConsentAccount> = serde_json::from_str(&self.accounts)?;
        let shared_data: Option<ConsentSharedData> = self
            .shared_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(DecryptedConsent {
            id: self.id.to_string(),
            connection_id: self.connection_id.to_string(),
            title: format!("{} access", self.tpp_name),
            description: String::new(),
            tpp_name: self.tpp_name.clone(),
            consent_type: self.consent_type.clone(),
            accounts,
            shared_data,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}
