/// Supplies short-lived credentials for join and attach messages. Providers
/// are asked for a token on every emission, including replays after a
/// reconnect; nothing in this client caches tokens across connection drops.
pub trait TokenProvider {
    fn issue_token(&mut self) -> Option<String>;
}

/// Token taken from configuration or the environment. Deployments with a
/// real auth service swap in a provider that calls it; that surface lives
/// outside this client.
pub struct ConfigTokenProvider {
    token: Option<String>,
}

impl ConfigTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl TokenProvider for ConfigTokenProvider {
    fn issue_token(&mut self) -> Option<String> {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_provider_hands_out_configured_token() {
        let mut p = ConfigTokenProvider::new(Some("abc".into()));
        assert_eq!(p.issue_token(), Some("abc".into()));
        assert_eq!(p.issue_token(), Some("abc".into()));
        let mut none = ConfigTokenProvider::new(None);
        assert_eq!(none.issue_token(), None);
    }
}
