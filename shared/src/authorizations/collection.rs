use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use super::DecryptedAuthorization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthorizationState {
    #[default]
    Base,
    Processing,
    Confirmed,
    Denied,
    Error,
    Expired,
}

/// Presentation-ready projection of a decrypted authorization.
///
/// Two view models are equal when they share `(connection_id, authorization_id)`.
#[derive(Debug, Clone)]
pub struct AuthorizationViewModel {
    pub authorization_id: String,
    pub connection_id: String,
    pub title: String,
    pub description: String,
    pub authorization_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: AuthorizationState,
}

impl AuthorizationViewModel {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn same_identity(&self, connection_id: &str, authorization_id: &str) -> bool {
        self.connection_id == connection_id && self.authorization_id == authorization_id
    }

    fn same_content(&self, other: &AuthorizationViewModel) -> bool {
        self.title == other.title
            && self.description == other.description
            && self.authorization_code == other.authorization_code
            && self.created_at == other.created_at
            && self.expires_at == other.expires_at
    }
}

impl PartialEq for AuthorizationViewModel {
    fn eq(&self, other: &Self) -> bool {
        self.same_identity(&other.connection_id, &other.authorization_id)
    }
}

impl Eq for AuthorizationViewModel {}

impl From<DecryptedAuthorization> for AuthorizationViewModel {
    fn from(authorization: DecryptedAuthorization) -> Self {
        AuthorizationViewModel {
            authorization_id: authorization.id,
            connection_id: authorization.connection_id,
            title: authorization.title,
            description: authorization.description,
            authorization_code: authorization.authorization_code,
            created_at: authorization.created_at,
            expires_at: authorization.expires_at,
            state: AuthorizationState::Base,
        }
    }
}

/// Ordered set of authorization view models, unique by identity.
///
/// Single writer: callers serialize `update`/`remove` on one timeline.
/// Expiry is not applied by the mutators; use [`live`](Self::live) or
/// [`remove_expired`](Self::remove_expired).
#[derive(Debug, Default)]
pub struct AuthorizationsCollection {
    view_models: Vec<AuthorizationViewModel>,
}

impl AuthorizationsCollection {
    pub fn new() -> AuthorizationsCollection {
        AuthorizationsCollection::default()
    }

    /// Upserts `authorizations` in arrival order and returns the indices whose
    /// contents changed. Entries absent from the batch are left alone.
    pub fn update(&mut self, authorizations: impl IntoIterator<Item = DecryptedAuthorization>) -> BTreeSet<usize> {
        let mut changed = BTreeSet::new();

        for authorization in authorizations {
            let incoming = AuthorizationViewModel::from(authorization);

            match self.position(&incoming.connection_id, &incoming.authorization_id) {
                Some(index) => {
                    let existing = &mut self.view_models[index];
                    if !existing.same_content(&incoming) {
                        let state = existing.state;
                        *existing = AuthorizationViewModel { state, ..incoming };
                        changed.insert(index);
                    }
                }
                None => {
                    self.view_models.push(incoming);
                    changed.insert(self.view_models.len() - 1);
                }
            }
        }

        changed
    }

    pub fn remove(&mut self, view_model: &AuthorizationViewModel) -> Option<usize> {
        let index = self.index_of(view_model)?;
        self.view_models.remove(index);
        Some(index)
    }

    /// Drops every view model that belongs to `connection_id`, returning their former indices.
    pub fn remove_connection(&mut self, connection_id: &str) -> Vec<usize> {
        self.remove_where(|view_model| view_model.connection_id == connection_id)
    }

    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> Vec<usize> {
        self.remove_where(|view_model| view_model.is_expired(now))
    }

    fn remove_where(&mut self, predicate: impl Fn(&AuthorizationViewModel) -> bool) -> Vec<usize> {
        let removed: Vec<usize> = self
            .view_models
            .iter()
            .enumerate()
            .filter(|&(_, view_model)| predicate(view_model))
            .map(|(index, _)| index)
            .collect();
        self.view_models.retain(|view_model| !predicate(view_model));
        removed
    }

    pub fn view_model_at(&self, index: usize) -> Option<&AuthorizationViewModel> {
        self.view_models.get(index)
    }

    pub fn view_model_by(&self, connection_id: &str, authorization_id: &str) -> Option<&AuthorizationViewModel> {
        self.position(connection_id, authorization_id)
            .map(|index| &self.view_models[index])
    }

    pub fn index_of(&self, view_model: &AuthorizationViewModel) -> Option<usize> {
        self.position(&view_model.connection_id, &view_model.authorization_id)
    }

    /// Sets the local presentation state of one entry.
    pub fn set_state(&mut self, connection_id: &str, authorization_id: &str, state: AuthorizationState) -> Option<usize> {
        let index = self.position(connection_id, authorization_id)?;
        self.view_models[index].state = state;
        Some(index)
    }

    pub fn sections(&self) -> usize {
        if self.view_models.is_empty() {
            0
        } else {
            1
        }
    }

    pub fn rows(&self) -> usize {
        self.view_models.len()
    }

    pub fn has_data_to_show(&self) -> bool {
        !self.view_models.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuthorizationViewModel> {
        self.view_models.iter()
    }

    pub fn live(&self, now: DateTime<Utc>) -> impl Iterator<Item = &AuthorizationViewModel> {
        self.view_models.iter().filter(move |view_model| !view_model.is_expired(now))
    }

    fn position(&self, connection_id: &str, authorization_id: &str) -> Option<usize> {
        self.view_models
            .iter()
            .position(|view_model| view_model.same_identity(connection_id, authorization_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn authorization(connection_id: &str, id: &str, title: &str) -> DecryptedAuthorization {
        DecryptedAuthorization {
            id: id.into(),
            connection_id: connection_id.into(),
            title: title.into(),
            description: "Test authorization".into(),
            authorization_code: None,
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(5),
        }
    }

    fn populated() -> (AuthorizationsCollection, AuthorizationViewModel, AuthorizationViewModel) {
        let first = authorization("12345", "00000", "Authorization");
        let second = authorization("12345", "00001", "Second Authorization");
        let first_model = AuthorizationViewModel::from(first.clone());
        let second_model = AuthorizationViewModel::from(second.clone());

        let mut collection = AuthorizationsCollection::new();
        let changed = collection.update(vec![first, second]);
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec![0, 1]);

        (collection, first_model, second_model)
    }

    fn zombie() -> AuthorizationViewModel {
        AuthorizationViewModel::from(authorization("113223", "123343543535", "Zombie Authorization"))
    }

    #[test]
    fn sections_and_rows() {
        let (collection, _, _) = populated();
        assert_eq!(collection.sections(), 1);
        assert_eq!(collection.rows(), 2);
        assert!(collection.has_data_to_show());
        assert_eq!(AuthorizationsCollection::new().sections(), 0);
    }

    #[test]
    fn lookup_by_index_and_identity() {
        let (collection, first, second) = populated();
        assert_eq!(collection.view_model_at(0), Some(&first));
        assert_eq!(collection.view_model_at(1), Some(&second));
        assert_eq!(collection.view_model_at(5), None);

        assert_eq!(collection.view_model_by("12345", "00000"), Some(&first));
        assert_eq!(collection.view_model_by("09876", "1234565657575"), None);

        assert_eq!(collection.index_of(&first), Some(0));
        assert_eq!(collection.index_of(&zombie()), None);
    }

    #[test]
    fn remove_returns_prior_index_once() {
        let (mut collection, first, second) = populated();
        assert_eq!(collection.remove(&zombie()), None);
        assert_eq!(collection.remove(&first), Some(0));
        assert_eq!(collection.rows(), 1);
        assert_eq!(collection.remove(&first), None);
        assert_eq!(collection.index_of(&second), Some(0));
    }

    #[test]
    fn update_replaces_in_place_and_never_removes() {
        let (mut collection, _, second) = populated();
        collection.set_state("12345", "00000", AuthorizationState::Processing);

        let mut renamed = authorization("12345", "00000", "Renamed");
        renamed.authorization_code = Some("abc".into());
        let changed = collection.update(vec![renamed, authorization("12345", "00002", "Third")]);

        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(collection.rows(), 3);
        let replaced = collection.view_model_at(0).unwrap();
        assert_eq!(replaced.title, "Renamed");
        assert_eq!(replaced.state, AuthorizationState::Processing);
        assert_eq!(collection.index_of(&second), Some(1));
    }

    #[test]
    fn identical_updates_report_no_changes() {
        let first = authorization("12345", "00000", "Authorization");
        let mut collection = AuthorizationsCollection::new();
        collection.update(vec![first.clone()]);
        assert!(collection.update(vec![first.clone()]).is_empty());

        let duplicate_batch = collection.update(vec![
            authorization("12345", "00009", "Once"),
            authorization("12345", "00009", "Twice"),
        ]);
        assert_eq!(duplicate_batch.into_iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(collection.rows(), 2);
        assert_eq!(collection.view_model_by("12345", "00009").unwrap().title, "Twice");
    }

    #[test]
    fn expiry_is_a_query_time_filter_until_purged() {
        let mut expired = authorization("12345", "00000", "Old");
        expired.created_at = Utc::now() - Duration::minutes(10);
        expired.expires_at = Utc::now() - Duration::minutes(5);
        let fresh = authorization("12345", "00001", "Fresh");

        let mut collection = AuthorizationsCollection::new();
        collection.update(vec![expired, fresh]);

        let now = Utc::now();
        let live: Vec<_> = collection.live(now).map(|m| m.authorization_id.as_str()).collect();
        assert_eq!(live, vec!["00001"]);
        assert_eq!(collection.rows(), 2);

        assert_eq!(collection.remove_expired(now), vec![0]);
        assert_eq!(collection.rows(), 1);
    }

    #[test]
    fn removing_a_connection_drops_its_entries() {
        let (mut collection, _, _) = populated();
        collection.update(vec![authorization("777", "1", "Other bank")]);
        assert_eq!(collection.remove_connection("12345"), vec![0, 1]);
        assert_eq!(collection.rows(), 1);
        assert_eq!(collection.view_model_at(0).unwrap().connection_id, "777");
    }
}
