use std::sync::Arc;

use parking_lot::RwLock;
use url::Url;

use crate::auth::{Location, Navigator};
use crate::instagram::TokenProvider;
use crate::storage;

const TOKEN_PARAM: &str = "token";
const ERROR_PARAM: &str = "error";

/// Owns the bearer token: where it comes from, where it is kept, and when it
/// is thrown away. Nothing here returns an error; storage and navigation
/// failures are logged and the in-memory state stays authoritative.
pub struct Manager {
    store: Arc<storage::Store>,
    navigator: Arc<dyn Navigator>,
    login_url: Url,
    token: RwLock<Option<String>>,
    callback_error: RwLock<Option<String>>,
}

impl Manager {
    pub fn new(store: Arc<storage::Store>, navigator: Arc<dyn Navigator>, login_url: Url) -> Self {
        Self {
            store,
            navigator,
            login_url,
            token: RwLock::new(None),
            callback_error: RwLock::new(None),
        }
    }

    /// Restores the persisted token, then consumes any login outcome carried
    /// by `location`. A callback token wins over the restored one.
    pub fn initialize(&self, location: &mut dyn Location) {
        let restored = match self.store.token() {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(error = %err, "could not restore session token");
                None
            }
        };
        *self.token.write() = restored;

        let href = location.href();
        let mut token_param = None;
        let mut error_param = None;
        let mut seen = false;
        for (key, value) in href.query_pairs() {
            match key.as_ref() {
                TOKEN_PARAM => {
                    seen = true;
                    token_param = Some(value.into_owned());
                }
                ERROR_PARAM => {
                    seen = true;
                    error_param = Some(value.into_owned());
                }
                _ => {}
            }
        }

        if let Some(error) = error_param.filter(|error| !error.trim().is_empty()) {
            tracing::warn!(%error, "login callback reported an error");
            *self.callback_error.write() = Some(error);
        } else if let Some(token) = token_param.filter(|token| !token.trim().is_empty()) {
            if let Err(err) = self.store.save_token(&token) {
                tracing::warn!(error = %err, "could not persist session token");
            }
            *self.token.write() = Some(token);
            *self.callback_error.write() = None;
            tracing::info!("signed in from login callback");
        }

        if seen {
            location.replace(strip_callback_params(&href));
        }
    }

    /// Sends the browser to the login backend. The outcome arrives later as a
    /// callback location.
    pub fn login(&self) {
        if let Err(err) = self.navigator.navigate(&self.login_url) {
            tracing::warn!(error = %err, "could not open login page");
        }
    }

    pub fn logout(&self) {
        if let Err(err) = self.store.clear_token() {
            tracing::warn!(error = %err, "could not clear stored session token");
        }
        let previous = self.token.write().take();
        if previous.is_some() {
            tracing::info!("signed out");
        }
    }

    /// Called when the API rejects the token.
    pub fn notify_unauthorized(&self) {
        tracing::warn!("session rejected by the api; signing out");
        self.logout();
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token
            .read()
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }

    pub fn callback_error(&self) -> Option<String> {
        self.callback_error.read().clone()
    }

    pub fn clear_callback_error(&self) {
        *self.callback_error.write() = None;
    }

    pub fn login_url(&self) -> &Url {
        &self.login_url
    }
}

impl TokenProvider for Manager {
    fn bearer_token(&self) -> Option<String> {
        self.token().filter(|token| !token.is_empty())
    }
}

fn strip_callback_params(href: &Url) -> Url {
    let kept: Vec<(String, String)> = href
        .query_pairs()
        .filter(|(key, _)| key != TOKEN_PARAM && key != ERROR_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut cleaned = href.clone();
    if kept.is_empty() {
        cleaned.set_query(None);
    } else {
        cleaned.query_pairs_mut().clear().extend_pairs(kept);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryLocation;
    use anyhow::Result;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingNavigator {
        visited: Mutex<Vec<Url>>,
    }

    impl Navigator for RecordingNavigator {
        fn navigate(&self, url: &Url) -> Result<()> {
            self.visited.lock().push(url.clone());
            Ok(())
        }
    }

    fn manager(store: Arc<storage::Store>) -> (Manager, Arc<RecordingNavigator>) {
        let navigator = Arc::new(RecordingNavigator::default());
        let login = Url::parse("http://api.test/api/instagram/login").unwrap();
        (Manager::new(store, navigator.clone(), login), navigator)
    }

    fn memory_store() -> Arc<storage::Store> {
        Arc::new(storage::Store::in_memory().unwrap())
    }

    #[test]
    fn starts_unauthenticated_without_token() {
        let (session, _) = manager(memory_store());
        let mut location = MemoryLocation::parse("http://localhost:65010/callback").unwrap();
        session.initialize(&mut location);
        assert!(!session.is_authenticated());
        assert_eq!(session.token(), None);
        assert_eq!(session.bearer_token(), None);
    }

    #[test]
    fn callback_token_is_persisted_and_stripped() {
        let store = memory_store();
        let (session, _) = manager(store.clone());
        let mut location =
            MemoryLocation::parse("http://localhost:65010/callback?token=abc123&tab=feed").unwrap();
        session.initialize(&mut location);

        assert!(session.is_authenticated());
        assert_eq!(session.token().as_deref(), Some("abc123"));
        assert_eq!(store.token().unwrap().as_deref(), Some("abc123"));
        assert_eq!(
            location.href().as_str(),
            "http://localhost:65010/callback?tab=feed"
        );
    }

    #[test]
    fn reload_restores_without_reading_the_url_again() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let open = || {
            Arc::new(
                storage::Store::open(storage::Options {
                    path: Some(path.clone()),
                })
                .unwrap(),
            )
        };

        let mut location = MemoryLocation::parse("http://localhost:65010/?token=abc123").unwrap();
        {
            let (session, _) = manager(open());
            session.initialize(&mut location);
            assert!(session.is_authenticated());
        }
        assert_eq!(location.href().query(), None);

        let (reloaded, _) = manager(open());
        reloaded.initialize(&mut location);
        assert!(reloaded.is_authenticated());
        assert_eq!(reloaded.token().as_deref(), Some("abc123"));
    }

    #[test]
    fn callback_token_overrides_restored_token() {
        let store = memory_store();
        store.save_token("old").unwrap();
        let (session, _) = manager(store.clone());
        let mut location = MemoryLocation::parse("http://localhost/?token=new").unwrap();
        session.initialize(&mut location);
        assert_eq!(session.token().as_deref(), Some("new"));
        assert_eq!(store.token().unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn callback_error_is_recorded_not_used_as_token() {
        let (session, _) = manager(memory_store());
        let mut location =
            MemoryLocation::parse("http://localhost/?error=User%20denied%20access").unwrap();
        session.initialize(&mut location);
        assert!(!session.is_authenticated());
        assert_eq!(
            session.callback_error().as_deref(),
            Some("User denied access")
        );
        assert_eq!(location.href().query(), None);

        session.clear_callback_error();
        assert_eq!(session.callback_error(), None);
    }

    #[test]
    fn empty_token_param_is_ignored() {
        let store = memory_store();
        store.save_token("kept").unwrap();
        let (session, _) = manager(store);
        let mut location = MemoryLocation::parse("http://localhost/?token=").unwrap();
        session.initialize(&mut location);
        assert_eq!(session.token().as_deref(), Some("kept"));
        assert_eq!(location.href().query(), None);
    }

    #[test]
    fn logout_twice_matches_logout_once() {
        let store = memory_store();
        store.save_token("abc123").unwrap();
        let (session, _) = manager(store.clone());
        let mut location = MemoryLocation::parse("http://localhost/").unwrap();
        session.initialize(&mut location);
        assert!(session.is_authenticated());

        session.logout();
        let once = (session.token(), store.token().unwrap());
        session.logout();
        let twice = (session.token(), store.token().unwrap());
        assert_eq!(once, (None, None));
        assert_eq!(once, twice);
    }

    #[test]
    fn unauthorized_signs_out() {
        let store = memory_store();
        store.save_token("abc123").unwrap();
        let (session, _) = manager(store.clone());
        let mut location = MemoryLocation::parse("http://localhost/").unwrap();
        session.initialize(&mut location);
        session.notify_unauthorized();
        assert!(!session.is_authenticated());
        assert_eq!(store.token().unwrap(), None);
    }

    #[test]
    fn login_navigates_without_touching_state() {
        let (session, navigator) = manager(memory_store());
        session.login();
        assert!(!session.is_authenticated());
        let visited = navigator.visited.lock();
        assert_eq!(visited.len(), 1);
        assert_eq!(visited[0].as_str(), "http://api.test/api/instagram/login");
    }
}
