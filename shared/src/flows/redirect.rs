use url::Url;

use crate::error::GENERIC_FAILURE_MESSAGE;
use crate::primitives::AccessToken;
use crate::utils::query_item;

/// What a URL reached during the provider's web flow means for the pending connection.
#[derive(Debug, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// Not addressed to us; the web flow is still in progress.
    NotRedirect,
    Success(AccessToken),
    Failure(String),
}

pub fn parse_redirect(url: &str, return_url: &str) -> RedirectOutcome {
    if !url.starts_with(return_url) {
        return RedirectOutcome::NotRedirect;
    }

    let Ok(parsed) = Url::parse(url) else {
        return RedirectOutcome::Failure(GENERIC_FAILURE_MESSAGE.to_string());
    };

    match query_item(&parsed, "access_token") {
        Some(token) => RedirectOutcome::Success(AccessToken::new(token)),
        None => RedirectOutcome::Failure(
            query_item(&parsed, "error_class").unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_string()),
        ),
    }
}

/// `configuration` and optional `connect_query` carried by a QR code or app link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeepLink {
    pub configuration_url: String,
    pub connect_query: Option<String>,
}

pub fn parse_deep_link(link: &str) -> Option<DeepLink> {
    let url = Url::parse(link).ok()?;
    let configuration = Url::parse(&query_item(&url, "configuration")?).ok()?;

    Some(DeepLink {
        configuration_url: configuration.to_string(),
        connect_query: query_item(&url, "connect_query"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETURN_URL: &str = "authenticator://oauth/redirect";

    #[test]
    fn foreign_urls_are_not_redirects() {
        assert_eq!(
            parse_redirect("https://bank.test/login?step=2", RETURN_URL),
            RedirectOutcome::NotRedirect
        );
    }

    #[test]
    fn access_token_wins() {
        assert_eq!(
            parse_redirect("authenticator://oauth/redirect?access_token=abc&error_class=Nope", RETURN_URL),
            RedirectOutcome::Success(AccessToken::new("abc"))
        );
    }

    #[test]
    fn error_class_is_surfaced_verbatim() {
        assert_eq!(
            parse_redirect("authenticator://oauth/redirect?error_class=InvalidCredentials", RETURN_URL),
            RedirectOutcome::Failure("InvalidCredentials".to_string())
        );
        assert_eq!(
            parse_redirect("authenticator://oauth/redirect", RETURN_URL),
            RedirectOutcome::Failure(GENERIC_FAILURE_MESSAGE.to_string())
        );
        assert_eq!(
            parse_redirect("authenticator://oauth/redirect?access_token=", RETURN_URL),
            RedirectOutcome::Failure(GENERIC_FAILURE_MESSAGE.to_string())
        );
    }

    #[test]
    fn deep_links_carry_configuration_and_query() {
        let link = parse_deep_link(
            "authenticator://saltedge.com/connect?configuration=https%3A%2F%2Fbank.test%2Fconfiguration&connect_query=1234567890",
        )
        .unwrap();
        assert_eq!(link.configuration_url, "https://bank.test/configuration");
        assert_eq!(link.connect_query.as_deref(), Some("1234567890"));

        let link = parse_deep_link("authenticator://connect?configuration=https://bank.test/configuration").unwrap();
        assert!(link.connect_query.is_none());

        assert!(parse_deep_link("authenticator://connect?connect_query=1").is_none());
        assert!(parse_deep_link("authenticator://connect?configuration=not%20a%20url").is_none());
    }
}
