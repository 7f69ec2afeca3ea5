//! Where the client sends the user when the session cannot be recovered.

use parking_lot::Mutex;

/// Path of the login page.
pub const LOGIN_PATH: &str = "/login";

/// The embedding application's notion of "current page" and "go to page".
pub trait Navigator: Send + Sync {
    /// Location to come back to after logging in.
    fn current_location(&self) -> String;
    fn redirect(&self, url: &str);
}

/// Build `/login?returnUrl=<location>`.
pub fn login_url(return_url: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("returnUrl", return_url)
        .finish();
    format!("{LOGIN_PATH}?{query}")
}

/// Headless navigator: remembers the location it was given and logs redirects.
pub struct LogNavigator {
    location: Mutex<String>,
    last_redirect: Mutex<Option<String>>,
}

impl Default for LogNavigator {
    fn default() -> Self {
        Self {
            location: Mutex::new("/".to_string()),
            last_redirect: Mutex::new(None),
        }
    }
}

impl LogNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_location(&self, location: impl Into<String>) {
        *self.location.lock() = location.into();
    }

    pub fn last_redirect(&self) -> Option<String> {
        self.last_redirect.lock().clone()
    }
}

impl Navigator for LogNavigator {
    fn current_location(&self) -> String {
        self.location.lock().clone()
    }

    fn redirect(&self, url: &str) {
        tracing::warn!(%url, "session expired; login required");
        *self.last_redirect.lock() = Some(url.to_string());
    }
}
