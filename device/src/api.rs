//! # Signed API client
//!
//! ```text
//! register  POST /api/v1/auth/register      x-admin-key         {deviceId, secret, info}
//! login     POST /api/v1/auth/device-login  (none)              {deviceId, secret} -> {token}
//! heartbeat POST /api/v1/heartbeat          Bearer + signature  HeartbeatPayload
//! location  POST /api/v1/location           Bearer + signature  LocationPayload
//! ```
//!
//! Telemetry is signed with the headers produced by
//! [`RequestSignature`](crate::signing::RequestSignature). A missing token
//! triggers a login before the first submission, and a 401 triggers one
//! re-login followed by a single retry.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ApiResult, TransportError};
use crate::net::{normalize_base_url, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::signing::RequestSignature;
use crate::storage::CredentialStore;
use crate::types::{
    DeviceIdentity, DeviceInfo, HeartbeatPayload, LocationPayload, LoginRequest, LoginResponse,
    RegisterRequest,
};

pub const REGISTER_PATH: &str = "/api/v1/auth/register";
pub const LOGIN_PATH: &str = "/api/v1/auth/device-login";
pub const HEARTBEAT_PATH: &str = "/api/v1/heartbeat";
pub const LOCATION_PATH: &str = "/api/v1/location";

/// Re-logins allowed per signed submission.
pub const MAX_AUTH_RETRIES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    /// The device was already known to the server.
    LoggedIn,
    /// The device had to be registered before logging in.
    Registered,
}

pub struct ApiClient<T = ReqwestTransport> {
    store: Arc<CredentialStore>,
    identity: DeviceIdentity,
    transport: T,
    // Held for the whole login exchange so concurrent refreshes collapse into one.
    login_lock: Mutex<()>,
}

impl<T: HttpTransport> ApiClient<T> {
    pub fn new(store: Arc<CredentialStore>, identity: DeviceIdentity, transport: T) -> Self {
        Self {
            store,
            identity,
            transport,
            login_lock: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    fn base_url(&self) -> ApiResult<String> {
        normalize_base_url(&self.store.server_base_url())
    }

    pub async fn register_device(&self, admin_key: &str, info: &DeviceInfo) -> ApiResult<()> {
        let admin_key = admin_key.trim();
        if admin_key.is_empty() {
            return Err(ApiError::Configuration("admin key must not be blank".to_string()));
        }
        let base_url = self.base_url()?;

        let body = to_json(&RegisterRequest {
            device_id: &self.identity.device_id,
            secret: &self.identity.device_secret,
            info,
        })?;
        let request = HttpRequest::post_json(format!("{base_url}{REGISTER_PATH}"), body)
            .header("x-admin-key", admin_key);

        let response = self.transport.post(request).await?;
        if !response.is_success() {
            return Err(server_error(response));
        }

        info!(device_id = %self.identity.device_id, "Device registered");
        Ok(())
    }

    /// Exchanges the device credentials for a token and persists it.
    pub async fn login(&self) -> ApiResult<String> {
        let _guard = self.login_lock.lock().await;
        self.login_locked().await
    }

    async fn login_locked(&self) -> ApiResult<String> {
        let base_url = self.base_url()?;
        let body = to_json(&LoginRequest {
            device_id: &self.identity.device_id,
            secret: &self.identity.device_secret,
        })?;
        let request = HttpRequest::post_json(format!("{base_url}{LOGIN_PATH}"), body);

        let response = match self.transport.post(request).await {
            Ok(response) => response,
            Err(e @ TransportError::Other { .. }) => return Err(e.into()),
            Err(e) => return Err(e.with_url(base_url).into()),
        };

        if !response.is_success() {
            return Err(match response.status {
                401 | 403 => ApiError::Authentication(format!(
                    "device credentials rejected ({}): {}",
                    response.status, response.body
                )),
                _ => server_error(response),
            });
        }

        let parsed: LoginResponse = serde_json::from_str(&response.body)
            .map_err(|e| ApiError::Protocol(format!("invalid login response: {e}")))?;
        let token = parsed
            .token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| ApiError::Authentication("server did not return a token".to_string()))?;

        self.store.set_token(&token).map_err(ApiError::Storage)?;
        info!(device_id = %self.identity.device_id, "Logged in");
        Ok(token)
    }

    /// Logs in unless another task replaced `stale` while this one waited
    /// for the login lock, in which case the newer token is returned.
    async fn refresh_token(&self, stale: &str) -> ApiResult<String> {
        let _guard = self.login_lock.lock().await;
        let current = self.store.token();
        if !current.trim().is_empty() && current != stale {
            debug!("Token already refreshed by a concurrent login");
            return Ok(current);
        }
        self.login_locked().await
    }

    /// Logs in, registering the device first if the server does not know it.
    pub async fn enroll(&self, admin_key: &str, info: &DeviceInfo) -> ApiResult<EnrollOutcome> {
        match self.login().await {
            Ok(_) => Ok(EnrollOutcome::LoggedIn),
            Err(e @ (ApiError::Configuration(_) | ApiError::Transport(_) | ApiError::Storage(_))) => Err(e),
            Err(e) => {
                warn!(error = %e, "Login failed, registering with admin key");
                self.register_device(admin_key, info).await?;
                self.login().await?;
                Ok(EnrollOutcome::Registered)
            }
        }
    }

    pub async fn send_heartbeat(&self, payload: &HeartbeatPayload) -> ApiResult<()> {
        self.signed_post(HEARTBEAT_PATH, to_json(payload)?).await
    }

    pub async fn send_location(&self, payload: &LocationPayload) -> ApiResult<()> {
        self.signed_post(LOCATION_PATH, to_json(payload)?).await
    }

    async fn signed_post(&self, path: &str, body: String) -> ApiResult<()> {
        let base_url = self.base_url()?;
        let url = format!("{base_url}{path}");

        let mut token = self.store.token();
        if token.trim().is_empty() {
            token = self.refresh_token(&token).await?;
        }

        let mut retries = 0;
        loop {
            let signature = RequestSignature::fresh(path, &body, &self.identity.device_secret)?;
            let request = HttpRequest::post_json(url.clone(), body.clone())
                .header("Authorization", format!("Bearer {token}"))
                .header("x-timestamp", signature.timestamp)
                .header("x-nonce", signature.nonce)
                .header("x-signature", signature.signature);

            let response = self.transport.post(request).await?;

            if response.status == 401 && retries < MAX_AUTH_RETRIES {
                retries += 1;
                warn!(path = path, "Token rejected, logging in again");
                token = self.refresh_token(&token).await?;
                continue;
            }

            if !response.is_success() {
                return Err(server_error(response));
            }

            debug!(path = path, retries, "Signed submission accepted");
            return Ok(());
        }
    }
}

fn to_json<S: Serialize>(value: &S) -> ApiResult<String> {
    serde_json::to_string(value).map_err(|e| ApiError::Protocol(e.to_string()))
}

fn server_error(response: HttpResponse) -> ApiError {
    ApiError::Server {
        status: response.status,
        body: response.body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::MockHttpTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const BASE: &str = "https://guard.example.com";

    fn client(mock: MockHttpTransport) -> ApiClient<MockHttpTransport> {
        let store = Arc::new(CredentialStore::open_in_memory().unwrap());
        store.set_server_base_url("https://guard.example.com/").unwrap();
        let identity = store.ensure_initialized("unit").unwrap();
        ApiClient::new(store, identity, mock)
    }

    fn respond(status: u16, body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status,
            body: body.to_string(),
        })
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            model: "Pixel 7".into(),
            brand: "google".into(),
            os_version: "14".into(),
            sdk_int: 34,
            manufacturer: "Google".into(),
        }
    }

    fn heartbeat() -> HeartbeatPayload {
        HeartbeatPayload {
            collected_at: "2024-01-01T00:00:00Z".into(),
            battery_pct: 80,
            charging: false,
            network_type: "WIFI".into(),
            app_version: "1.0".into(),
        }
    }

    fn is_login(req: &HttpRequest) -> bool {
        req.url == format!("{BASE}{LOGIN_PATH}")
    }

    fn is_heartbeat(req: &HttpRequest) -> bool {
        req.url == format!("{BASE}{HEARTBEAT_PATH}")
    }

    #[tokio::test]
    async fn blank_admin_key_fails_before_network() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().never();
        let api = client(mock);

        let err = api.register_device("   ", &info()).await.unwrap_err();
        assert!(matches!(err, ApiError::Configuration(_)));
    }

    #[tokio::test]
    async fn register_rejects_malformed_base_url() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().never();
        let api = client(mock);
        api.store().set_server_base_url("guard.example.com").unwrap();

        let err = api.register_device("admin", &info()).await.unwrap_err();
        assert!(matches!(err, ApiError::Configuration(_)));
    }

    #[tokio::test]
    async fn register_sends_identity_and_admin_key() {
        let captured = Arc::new(StdMutex::new(None));
        let sink = captured.clone();
        let mut mock = MockHttpTransport::new();
        mock.expect_post().times(1).returning(move |req| {
            *sink.lock().unwrap() = Some(req);
            respond(201, "{}")
        });
        let api = client(mock);

        api.register_device(" admin-123 ", &info()).await.unwrap();

        let req = captured.lock().unwrap().take().unwrap();
        assert_eq!(req.url, format!("{BASE}{REGISTER_PATH}"));
        assert_eq!(req.header_value("x-admin-key"), Some("admin-123"));
        let body: serde_json::Value = serde_json::from_str(&req.body).unwrap();
        assert_eq!(body["deviceId"], "dev_unit");
        assert_eq!(body["secret"], api.identity().device_secret.as_str());
        assert_eq!(body["info"]["sdkInt"], 34);
        assert_eq!(body["info"]["osVersion"], "14");
    }

    #[tokio::test]
    async fn register_reports_status_and_body() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().returning(|_| respond(409, "already registered"));
        let api = client(mock);

        match api.register_device("admin", &info()).await.unwrap_err() {
            ApiError::Server { status, body } => {
                assert_eq!(status, 409);
                assert_eq!(body, "already registered");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn login_persists_token() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post()
            .withf(|req| is_login(req) && req.header_value("authorization").is_none())
            .times(1)
            .returning(|_| respond(200, r#"{"token":"tok-1"}"#));
        let api = client(mock);

        assert_eq!(api.login().await.unwrap(), "tok-1");
        assert_eq!(api.store().token(), "tok-1");
    }

    #[tokio::test]
    async fn login_accepts_numeric_token() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().withf(is_login).returning(|_| respond(200, r#"{"token":123}"#));
        let api = client(mock);

        assert_eq!(api.login().await.unwrap(), "123");
        assert_eq!(api.store().token(), "123");
    }

    #[tokio::test]
    async fn login_without_token_is_failure() {
        for body in [r#"{"ok":true}"#, r#"{"token":""}"#, r#"{"token":"  "}"#, r#"{"token":null}"#] {
            let mut mock = MockHttpTransport::new();
            let body = body.to_string();
            mock.expect_post().returning(move |_| respond(200, &body));
            let api = client(mock);

            let err = api.login().await.unwrap_err();
            assert!(matches!(err, ApiError::Authentication(_)), "{err:?}");
            assert_eq!(api.store().token(), "");
        }
    }

    #[tokio::test]
    async fn login_with_malformed_json_is_protocol_error() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().returning(|_| respond(200, "<html>"));
        let api = client(mock);

        assert!(matches!(api.login().await.unwrap_err(), ApiError::Protocol(_)));
    }

    #[tokio::test]
    async fn login_rejection_is_authentication_error() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().returning(|_| respond(401, "bad secret"));
        let api = client(mock);

        assert!(matches!(api.login().await.unwrap_err(), ApiError::Authentication(_)));
    }

    #[tokio::test]
    async fn login_remaps_network_failures_to_base_url() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().returning(|req| {
            Err(TransportError::Dns { url: req.url })
        });
        let api = client(mock);

        match api.login().await.unwrap_err() {
            ApiError::Transport(TransportError::Dns { url }) => assert_eq!(url, BASE),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn login_passes_other_transport_failures_through() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().returning(|req| {
            Err(TransportError::Other { url: req.url, message: "tls handshake".into() })
        });
        let api = client(mock);

        match api.login().await.unwrap_err() {
            ApiError::Transport(TransportError::Other { url, message }) => {
                assert_eq!(url, format!("{BASE}{LOGIN_PATH}"));
                assert_eq!(message, "tls handshake");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_logs_in_lazily_and_signs() {
        let captured = Arc::new(StdMutex::new(Vec::new()));
        let sink = captured.clone();
        let mut mock = MockHttpTransport::new();
        mock.expect_post()
            .withf(is_login)
            .times(1)
            .returning(|_| respond(200, r#"{"token":"tok-1"}"#));
        mock.expect_post()
            .withf(is_heartbeat)
            .times(1)
            .returning(move |req| {
                sink.lock().unwrap().push(req);
                respond(200, "{}")
            });
        let api = client(mock);

        api.send_heartbeat(&heartbeat()).await.unwrap();

        let requests = captured.lock().unwrap();
        let req = &requests[0];
        assert_eq!(
            req.body,
            r#"{"collectedAt":"2024-01-01T00:00:00Z","batteryPct":80,"charging":false,"networkType":"WIFI","appVersion":"1.0"}"#
        );
        assert_eq!(req.header_value("authorization"), Some("Bearer tok-1"));

        let ts = req.header_value("x-timestamp").unwrap().to_string();
        let nonce = req.header_value("x-nonce").unwrap().to_string();
        assert!(ts.parse::<i64>().is_ok());
        assert!(uuid::Uuid::parse_str(&nonce).is_ok());

        let expected = RequestSignature::compute(
            HEARTBEAT_PATH,
            &req.body,
            &api.identity().device_secret,
            ts,
            nonce,
        )
        .unwrap();
        assert_eq!(req.header_value("x-signature"), Some(expected.signature.as_str()));
    }

    #[tokio::test]
    async fn lazy_login_failure_skips_submission() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().withf(is_login).returning(|_| respond(401, "unknown device"));
        mock.expect_post().withf(is_heartbeat).never();
        let api = client(mock);

        let err = api.send_heartbeat(&heartbeat()).await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)));
    }

    #[tokio::test]
    async fn unauthorized_triggers_one_relogin_and_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(StdMutex::new(Vec::new()));
        let (counter, sink) = (attempts.clone(), captured.clone());

        let mut mock = MockHttpTransport::new();
        mock.expect_post()
            .withf(is_login)
            .times(1)
            .returning(|_| respond(200, r#"{"token":"fresh"}"#));
        mock.expect_post()
            .withf(is_heartbeat)
            .times(2)
            .returning(move |req| {
                sink.lock().unwrap().push(req);
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    respond(401, "expired")
                } else {
                    respond(200, "{}")
                }
            });
        let api = client(mock);
        api.store().set_token("stale").unwrap();

        api.send_heartbeat(&heartbeat()).await.unwrap();

        let requests = captured.lock().unwrap();
        assert_eq!(requests[0].header_value("authorization"), Some("Bearer stale"));
        assert_eq!(requests[1].header_value("authorization"), Some("Bearer fresh"));
        assert_eq!(requests[0].body, requests[1].body);
        assert_ne!(requests[0].header_value("x-nonce"), requests[1].header_value("x-nonce"));
        assert_eq!(api.store().token(), "fresh");
    }

    #[tokio::test]
    async fn second_unauthorized_is_terminal() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post()
            .withf(is_login)
            .times(1)
            .returning(|_| respond(200, r#"{"token":"fresh"}"#));
        mock.expect_post()
            .withf(is_heartbeat)
            .times(2)
            .returning(|_| respond(401, "still expired"));
        let api = client(mock);
        api.store().set_token("stale").unwrap();

        let err = api.send_heartbeat(&heartbeat()).await.unwrap_err();
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn server_error_is_not_retried() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().withf(is_login).never();
        mock.expect_post()
            .withf(|req| req.url == format!("{BASE}{LOCATION_PATH}"))
            .times(1)
            .returning(|_| respond(500, "boom"));
        let api = client(mock);
        api.store().set_token("tok").unwrap();

        let payload = LocationPayload {
            collected_at: "2024-01-01T00:00:00Z".into(),
            lat: 1.0,
            lon: 2.0,
            accuracy_m: 3.0,
            speed_mps: 0.5,
        };
        match api.send_location(&payload).await.unwrap_err() {
            ApiError::Server { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn submission_rejects_malformed_base_url_before_login() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().never();
        let api = client(mock);
        api.store().set_server_base_url("ftp://guard.example.com").unwrap();

        let err = api.send_heartbeat(&heartbeat()).await.unwrap_err();
        assert!(matches!(err, ApiError::Configuration(_)));
    }

    #[tokio::test]
    async fn refresh_reuses_token_replaced_concurrently() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().never();
        let api = client(mock);
        api.store().set_token("newer").unwrap();

        assert_eq!(api.refresh_token("older").await.unwrap(), "newer");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_rejections_share_one_login() {
        let logins = Arc::new(AtomicUsize::new(0));
        let counter = logins.clone();
        let mut mock = MockHttpTransport::new();
        mock.expect_post().withf(is_login).returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(50));
            respond(200, r#"{"token":"fresh"}"#)
        });
        mock.expect_post().withf(is_heartbeat).returning(|req| {
            match req.header_value("authorization") {
                Some("Bearer fresh") => respond(200, "{}"),
                _ => respond(401, "token expired"),
            }
        });
        let api = Arc::new(client(mock));
        api.store().set_token("stale").unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let api = api.clone();
                tokio::spawn(async move { api.send_heartbeat(&heartbeat()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(logins.load(Ordering::SeqCst), 1);
        assert_eq!(api.store().token(), "fresh");
    }

    #[tokio::test]
    async fn enroll_registers_unknown_device() {
        let logins = Arc::new(AtomicUsize::new(0));
        let counter = logins.clone();
        let mut mock = MockHttpTransport::new();
        mock.expect_post().withf(is_login).times(2).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                respond(401, "unknown device")
            } else {
                respond(200, r#"{"token":"tok-1"}"#)
            }
        });
        mock.expect_post()
            .withf(|req| req.url.ends_with(REGISTER_PATH))
            .times(1)
            .returning(|_| respond(200, "{}"));
        let api = client(mock);

        assert_eq!(api.enroll("admin", &info()).await.unwrap(), EnrollOutcome::Registered);
        assert_eq!(api.store().token(), "tok-1");
    }

    #[tokio::test]
    async fn enroll_skips_registration_for_known_device() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post().withf(is_login).times(1).returning(|_| respond(200, r#"{"token":"t"}"#));
        mock.expect_post().withf(|req| req.url.ends_with(REGISTER_PATH)).never();
        let api = client(mock);

        assert_eq!(api.enroll("", &info()).await.unwrap(), EnrollOutcome::LoggedIn);
    }

    #[tokio::test]
    async fn enroll_does_not_register_when_server_unreachable() {
        let mut mock = MockHttpTransport::new();
        mock.expect_post()
            .withf(is_login)
            .returning(|req| Err(TransportError::ConnectionRefused { url: req.url }));
        mock.expect_post().withf(|req| req.url.ends_with(REGISTER_PATH)).never();
        let api = client(mock);

        let err = api.enroll("admin", &info()).await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(TransportError::ConnectionRefused { .. })));
    }
}
