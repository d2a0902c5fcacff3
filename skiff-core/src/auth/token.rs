//! Access token lifecycle
//!
//! `TokenRefreshCoordinator` holds the token pair, renews it before expiry
//! and makes sure concurrent callers that notice an expiring token share a
//! single refresh call instead of racing each other with the same
//! refresh token.

use crate::api::BackendApi;
use crate::config::AuthConfig;
use crate::error::{ApiError, AuthError, StorageError};
use crate::storage::{
    self, KeyValueStore, KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN, KEY_TOKEN_EXPIRE_AT, KEY_USER,
};
use crate::sync::timer::{spawn_periodic, TaskHandle};
use crate::types::{AccessToken, Password, RefreshToken, User};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Credential material for one login
#[derive(Clone, Debug)]
pub struct TokenState {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub expires_at: DateTime<Utc>,
}

impl TokenState {
    /// Build a state from a token response received at `now`
    pub fn issued_at(
        access_token: String,
        refresh_token: String,
        expires_in_secs: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: AccessToken::new(access_token),
            refresh_token: RefreshToken::new(refresh_token),
            expires_at: now + ChronoDuration::seconds(expires_in_secs),
        }
    }

    /// The access token is usable: non-empty and not past expiry
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && now < self.expires_at
    }

    /// The access token is inside the refresh window before expiry
    pub fn is_expiring_soon_at(&self, now: DateTime<Utc>, threshold: ChronoDuration) -> bool {
        !self.access_token.is_empty() && now > self.expires_at - threshold
    }
}

type RefreshFlight = Shared<BoxFuture<'static, bool>>;

#[derive(Default)]
struct AuthState {
    tokens: Option<TokenState>,
    user: Option<User>,
}

/// Owns `TokenState` and the user profile
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TokenRefreshCoordinator {
    backend: Arc<dyn BackendApi>,
    secure_store: Arc<dyn KeyValueStore>,
    profile_store: Arc<dyn KeyValueStore>,
    config: AuthConfig,
    state: Arc<Mutex<AuthState>>,
    inflight: Arc<Mutex<HashMap<String, RefreshFlight>>>,
    auto_refresh: Arc<Mutex<TaskHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl TokenRefreshCoordinator {
    /// Create a coordinator
    ///
    /// # Arguments
    /// * `backend` - Account backend used for login/refresh/logout/profile
    /// * `secure_store` - Where tokens are persisted (normally the keyring)
    /// * `profile_store` - Where the user profile is persisted
    /// * `config` - Refresh threshold and background check interval
    pub fn new(
        backend: Arc<dyn BackendApi>,
        secure_store: Arc<dyn KeyValueStore>,
        profile_store: Arc<dyn KeyValueStore>,
        config: AuthConfig,
    ) -> Self {
        Self {
            backend,
            secure_store,
            profile_store,
            config,
            state: Arc::new(Mutex::new(AuthState::default())),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            auto_refresh: Arc::new(Mutex::new(TaskHandle::new())),
        }
    }

    fn threshold(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.refresh_threshold_secs as i64)
    }

    /// Load persisted tokens and profile
    ///
    /// Returns whether a token pair was found.
    pub fn restore(&self) -> Result<bool, StorageError> {
        let access = self.secure_store.get(KEY_ACCESS_TOKEN)?;
        let refresh = self.secure_store.get(KEY_REFRESH_TOKEN)?;
        let expire_ms = self
            .secure_store
            .get(KEY_TOKEN_EXPIRE_AT)?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);
        let user: Option<User> = storage::load_json(self.profile_store.as_ref(), KEY_USER)?;

        let tokens = match access {
            Some(access) if !access.is_empty() => Some(TokenState {
                access_token: AccessToken::new(access),
                refresh_token: RefreshToken::new(refresh.unwrap_or_default()),
                expires_at: Utc
                    .timestamp_millis_opt(expire_ms)
                    .single()
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            }),
            _ => None,
        };

        let found = tokens.is_some();
        let mut state = lock(&self.state);
        state.tokens = tokens;
        state.user = user;
        debug!(found, has_user = state.user.is_some(), "Restored credentials");
        Ok(found)
    }

    /// Log in with account and password
    #[tracing::instrument(skip(self, password))]
    pub async fn login(&self, account: &str, password: &Password) -> Result<User, AuthError> {
        let response = self.backend.login(account, password).await.map_err(|e| {
            error!(error = %e, "Login request failed");
            AuthError::LoginFailed(match e {
                ApiError::Transport(_) => "Network unavailable".to_string(),
                ApiError::Status { message, .. } | ApiError::Envelope { message, .. } => message,
                ApiError::Decode(_) => "Invalid response".to_string(),
            })
        })?;

        let tokens = TokenState::issued_at(
            response.access_token,
            response.refresh_token,
            response.expires_in,
            Utc::now(),
        );
        self.install_tokens(tokens);
        self.set_user(response.user.clone());
        info!(user = %response.user.username, "Logged in");

        self.start_auto_refresh();
        Ok(response.user)
    }

    /// Best-effort backend logout followed by a full local clear
    pub async fn logout(&self) {
        if let Some(token) = self.access_token() {
            if let Err(e) = self.backend.logout(&token).await {
                warn!(error = %e, "Backend logout failed");
            }
        }
        self.clear();
        info!("Logged out");
    }

    /// Drop tokens, profile and in-flight refreshes, locally and in storage
    pub fn clear(&self) {
        {
            let mut state = lock(&self.state);
            state.tokens = None;
            state.user = None;
        }
        lock(&self.inflight).clear();
        self.stop_auto_refresh();

        for key in [KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN, KEY_TOKEN_EXPIRE_AT] {
            if let Err(e) = self.secure_store.remove(key) {
                warn!(key, error = %e, "Failed to remove credential");
            }
        }
        if let Err(e) = self.profile_store.remove(KEY_USER) {
            warn!(error = %e, "Failed to remove stored profile");
        }
    }

    pub fn is_valid(&self) -> bool {
        let now = Utc::now();
        lock(&self.state)
            .tokens
            .as_ref()
            .is_some_and(|t| t.is_valid_at(now))
    }

    pub fn is_expiring_soon(&self) -> bool {
        let now = Utc::now();
        let threshold = self.threshold();
        lock(&self.state)
            .tokens
            .as_ref()
            .is_some_and(|t| t.is_expiring_soon_at(now, threshold))
    }

    /// A profile is present and its access token is valid
    pub fn is_authenticated(&self) -> bool {
        let now = Utc::now();
        let state = lock(&self.state);
        state.user.is_some() && state.tokens.as_ref().is_some_and(|t| t.is_valid_at(now))
    }

    pub fn needs_login(&self) -> bool {
        !self.is_authenticated()
    }

    /// A profile and a token pair are present, whether or not the access
    /// token has expired
    pub fn has_session(&self) -> bool {
        let state = lock(&self.state);
        state.user.is_some() && state.tokens.is_some()
    }

    pub fn access_token(&self) -> Option<AccessToken> {
        lock(&self.state)
            .tokens
            .as_ref()
            .filter(|t| !t.access_token.is_empty())
            .map(|t| t.access_token.clone())
    }

    pub fn tokens(&self) -> Option<TokenState> {
        lock(&self.state).tokens.clone()
    }

    pub fn current_user(&self) -> Option<User> {
        lock(&self.state).user.clone()
    }

    fn refresh_token(&self) -> Option<RefreshToken> {
        lock(&self.state)
            .tokens
            .as_ref()
            .filter(|t| !t.refresh_token.is_empty())
            .map(|t| t.refresh_token.clone())
    }

    /// Replace all three token fields at once and persist them
    fn install_tokens(&self, tokens: TokenState) {
        let persisted = [
            (KEY_ACCESS_TOKEN, tokens.access_token.expose().to_string()),
            (KEY_REFRESH_TOKEN, tokens.refresh_token.expose().to_string()),
            (KEY_TOKEN_EXPIRE_AT, tokens.expires_at.timestamp_millis().to_string()),
        ];
        lock(&self.state).tokens = Some(tokens);

        for (key, value) in persisted {
            if let Err(e) = self.secure_store.set(key, &value) {
                warn!(key, error = %e, "Failed to persist credential");
            }
        }
    }

    fn set_user(&self, user: User) {
        if let Err(e) = storage::save_json(self.profile_store.as_ref(), KEY_USER, &user) {
            warn!(error = %e, "Failed to persist profile");
        }
        lock(&self.state).user = Some(user);
    }

    /// Exchange the refresh token for a new token pair
    ///
    /// Callers arriving while a refresh for the same refresh token is in
    /// flight await that call's outcome. A rejected refresh clears all
    /// credentials; a network failure leaves them in place.
    pub async fn refresh(&self) -> bool {
        let Some(refresh_token) = self.refresh_token() else {
            warn!("No refresh token available");
            return false;
        };
        let key = refresh_token.expose().to_string();

        let flight = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(&key) {
                Some(existing) => {
                    debug!("Waiting for in-flight token refresh");
                    existing.clone()
                }
                None => {
                    let flight = self
                        .clone()
                        .run_refresh(refresh_token, key.clone())
                        .boxed()
                        .shared();
                    inflight.insert(key, flight.clone());
                    flight
                }
            }
        };

        flight.await
    }

    async fn run_refresh(self, refresh_token: RefreshToken, key: String) -> bool {
        let outcome = match self.backend.refresh(&refresh_token).await {
            Ok(response) if !response.access_token.is_empty() => {
                let tokens = TokenState::issued_at(
                    response.access_token,
                    response.refresh_token,
                    response.expires_in,
                    Utc::now(),
                );
                let expires_at = tokens.expires_at;
                self.install_tokens(tokens);
                info!(%expires_at, "Token refreshed");
                true
            }
            Ok(_) => {
                error!("Refresh response carried no access token");
                self.clear();
                false
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Token refresh deferred, backend unreachable");
                false
            }
            Err(e) => {
                error!(error = %e, "Token refresh rejected, clearing session");
                self.clear();
                false
            }
        };

        lock(&self.inflight).remove(&key);
        outcome
    }

    /// Make sure a usable, non-expiring access token is available
    pub async fn ensure_fresh(&self) -> bool {
        if self.is_valid() && !self.is_expiring_soon() {
            return true;
        }
        if self.refresh_token().is_none() {
            return false;
        }
        if self.refresh().await {
            return true;
        }
        // A deferred refresh leaves a still-valid token usable
        self.is_valid()
    }

    /// Run an authenticated call, refreshing once and retrying on HTTP 401
    pub async fn with_auth<T, F, Fut>(&self, call: F) -> Result<T, ApiError>
    where
        F: Fn(AccessToken) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let token = self.access_token().ok_or_else(not_logged_in)?;
        match call(token).await {
            Err(e) if e.is_unauthorized() => {
                debug!("Access token rejected, refreshing before retry");
                if !self.refresh().await {
                    return Err(ApiError::Status {
                        status: 401,
                        message: AuthError::SessionExpired.to_string(),
                    });
                }
                let token = self.access_token().ok_or_else(not_logged_in)?;
                call(token).await
            }
            other => other,
        }
    }

    /// Re-fetch the profile, e.g. after a plan purchase
    pub async fn refresh_user_info(&self) -> bool {
        let backend = self.backend.clone();
        match self
            .with_auth(|token| {
                let backend = backend.clone();
                async move { backend.profile(&token).await }
            })
            .await
        {
            Ok(user) => {
                self.set_user(user);
                info!("User info refreshed");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to refresh user info");
                false
            }
        }
    }

    /// Start the background check that refreshes ahead of expiry
    pub fn start_auto_refresh(&self) {
        let this = self.clone();
        let handle = spawn_periodic(self.config.refresh_check_interval(), false, move || {
            let this = this.clone();
            async move {
                if this.is_expiring_soon() && this.refresh_token().is_some() {
                    info!("Auto-refreshing token");
                    this.refresh().await;
                }
                ControlFlow::Continue(())
            }
        });
        lock(&self.auto_refresh).replace(handle);
    }

    pub fn stop_auto_refresh(&self) {
        lock(&self.auto_refresh).stop();
    }

    pub fn is_auto_refresh_active(&self) -> bool {
        lock(&self.auto_refresh).is_active()
    }
}

fn not_logged_in() -> ApiError {
    ApiError::Status {
        status: 401,
        message: AuthError::NotAuthenticated.to_string(),
    }
}
