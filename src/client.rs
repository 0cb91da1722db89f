use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use reqwest::StatusCode;

use crate::{
    deep_link,
    error::TransportError,
    locks::KeyedLocks,
    models::{
        AppOpenRequest, BrandCode, CodeValidateRequest, CodeValidateResponse, ConversionUser,
        IdentityFields, KeyValidateResponse, NewUserRequest, PurchaseRequest,
        TrackingSessionRequest,
    },
    state::{AttributionState, CodeState, Identity, StateKey},
    transport::{Endpoint, HttpTransport, Request},
    ClientConfig, DeviceInfoProvider, Error, Platform, Result, Transport, UserProfile,
    ValidatedCode,
};

const SETUP_LOCK: &str = "setup";
const AUTO_GENERATED_ID_LOCK: &str = "auto_generated_id";

/// A client for the Shinara API. It owns all attribution state of the application.
///
/// In order to create a client instance, first create [`ClientConfig`]. Create one client at
/// application startup and share it (e.g., in an `Arc`) with the rest of the application.
///
/// # Initialization
///
/// Call [`Client::initialize()`] once after creating the client. It validates the API key, sends
/// the one-time tracking session and reports an app open if the backend asks for it.
///
/// # Examples
/// ```no_run
/// # async fn test() -> shinara::Result<()> {
/// # use shinara::{Client, ClientConfig};
/// let client = Client::new(ClientConfig::from_api_key("api-key"))?;
/// client.initialize().await?;
/// client.validate_code("PROMO10").await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    state: AttributionState,
    transport: Arc<dyn Transport>,
    device_info: Arc<dyn DeviceInfoProvider>,
    platform: Platform,
    api_key: String,
    deep_link_param: String,
    /// Set from the key validation response.
    track_retention: AtomicBool,
    locks: KeyedLocks,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// ```
    /// # use shinara::{ClientConfig, Client};
    /// let client = Client::new(ClientConfig::from_api_key("api-key")).unwrap();
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBaseUrl`] if the configured base URL can't be parsed.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = match config.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                &config.base_url,
                config.api_key.clone(),
                config.platform,
            )?),
        };

        Ok(Client {
            state: AttributionState::new(config.store),
            transport,
            device_info: config.device_info,
            platform: config.platform,
            api_key: config.api_key,
            deep_link_param: config.deep_link_param,
            track_retention: AtomicBool::new(false),
            locks: KeyedLocks::new(),
        })
    }

    /// Platform this client was configured for.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Validate the API key and start tracking.
    ///
    /// This runs [`Client::ensure_setup()`] and [`Client::trigger_app_open()`] after the key is
    /// validated.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if the API key is empty or rejected by the server.
    /// - [`Error::Transport`] if the server could not be reached.
    /// - [`Error::StorageRead`]/[`Error::StorageWrite`] if the store fails.
    pub async fn initialize(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::Configuration("API key is empty".to_owned()));
        }

        self.validate_api_key().await?;
        self.ensure_setup().await?;
        self.trigger_app_open().await?;

        log::info!(target: "shinara", platform = self.platform.as_str(); "Shinara SDK initialized");
        Ok(())
    }

    async fn validate_api_key(&self) -> Result<()> {
        log::debug!(target: "shinara", "validating API key");
        let response = match self.transport.send(Request::get(Endpoint::ValidateKey)).await {
            Ok(response) => response,
            Err(TransportError::Http { status })
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
            {
                log::warn!(target: "shinara", "client is not authorized. Check your API key");
                return Err(Error::Configuration("API key was rejected".to_owned()));
            }
            Err(err) => {
                log::warn!(target: "shinara", "error while validating API key: {:?}", err);
                return Err(err.into());
            }
        };

        // An empty or non-object body carries no app_id.
        let response: KeyValidateResponse = if response.is_object() {
            serde_json::from_value(response).map_err(TransportError::from)?
        } else {
            KeyValidateResponse::default()
        };
        if response.app_id.as_deref().map_or(true, str::is_empty) {
            log::warn!(target: "shinara", "API key validation response has no app_id");
            return Err(Error::Configuration("invalid API key".to_owned()));
        }

        self.track_retention
            .store(response.track_retention, Ordering::Relaxed);
        log::debug!(target: "shinara", track_retention = response.track_retention; "API key is valid");
        Ok(())
    }

    /// Validate a referral or brand code and store it as the active code.
    ///
    /// An affiliate code replaces any stored brand code and vice versa.
    ///
    /// # Errors
    ///
    /// - [`Error::ValidationFailed`] if the request failed. No state is changed.
    /// - [`Error::InvalidCode`] if the server doesn't recognize the code. No state is changed.
    /// - [`Error::StorageWrite`] if the code could not be stored.
    pub async fn validate_code(&self, code: &str) -> Result<ValidatedCode> {
        let code = code.trim();
        if code.is_empty() {
            return Err(Error::InvalidCode);
        }

        log::debug!(target: "shinara", code; "validating code");
        let request = Request::post(
            Endpoint::ValidateCode,
            &CodeValidateRequest {
                code,
                platform: self.platform,
            },
        )?;
        let response = self.transport.send(request).await.map_err(|err| {
            log::warn!(target: "shinara", code; "error validating code: {:?}", err);
            Error::ValidationFailed(err)
        })?;

        let response: CodeValidateResponse = if response.is_null() {
            CodeValidateResponse::default()
        } else {
            serde_json::from_value(response)
                .map_err(|err| Error::ValidationFailed(err.into()))?
        };

        let (code_state, validated) = if let Some(program_id) = response.campaign_id {
            (
                CodeState::Affiliate {
                    code: code.to_owned(),
                    program_id: program_id.clone(),
                    affiliate_code_id: response.affiliate_code_id.clone(),
                },
                ValidatedCode::Affiliate {
                    program_id,
                    affiliate_code_id: response.affiliate_code_id,
                },
            )
        } else if let Some(brand_code_data) = response.brand_code_data {
            let brand_code = BrandCode::from(brand_code_data);
            (
                CodeState::Brand(brand_code.clone()),
                ValidatedCode::Brand(brand_code),
            )
        } else {
            log::warn!(target: "shinara", code; "code validation response has no code data");
            return Err(Error::InvalidCode);
        };

        self.state.commit_code_state(code_state).await?;

        log::debug!(target: "shinara", code, validated:serde; "code validated");
        Ok(validated)
    }

    /// Extract the referral code from a deep link and validate it.
    ///
    /// Returns `Ok(None)` without contacting the server if the link is malformed or doesn't carry
    /// the code parameter.
    ///
    /// # Errors
    ///
    /// Same as [`Client::validate_code()`].
    pub async fn handle_deep_link(&self, link: &str) -> Result<Option<ValidatedCode>> {
        let Some(code) = deep_link::extract_code(link, &self.deep_link_param) else {
            return Ok(None);
        };
        self.validate_code(&code).await.map(Some)
    }

    /// Send the one-time tracking session, unless it has already been sent from this install.
    ///
    /// The session is identified by the registered user id or, before registration, by the
    /// auto-generated user id (created here if needed).
    ///
    /// A failed request is not returned as an error. If the server responded with an HTTP error
    /// status, the session is sent again on the next call; any other failure (e.g., device info
    /// could not be collected) marks setup as completed, so a permanently broken environment does
    /// not retry forever.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageRead`]/[`Error::StorageWrite`] if the store fails.
    pub async fn ensure_setup(&self) -> Result<()> {
        let _guard = self.locks.lock(SETUP_LOCK).await;

        if self
            .state
            .get_flag(StateKey::SetupCompleted)
            .await?
            .unwrap_or(false)
        {
            log::trace!(target: "shinara", "tracking session already sent");
            return Ok(());
        }

        let session_id = match self.resolve_identity().await? {
            Identity::External(id) | Identity::AutoGenerated(id) => id,
        };

        match self.send_tracking_session(session_id).await {
            Ok(()) => {
                log::debug!(target: "shinara", "tracking session sent");
            }
            Err(err) if err.is_http_status() => {
                log::warn!(target: "shinara", "failed to send tracking session, will retry: {:?}", err);
                return Ok(());
            }
            Err(err) => {
                log::warn!(target: "shinara", "failed to send tracking session, not retrying: {:?}", err);
            }
        }

        self.state.set_flag(StateKey::SetupCompleted, true).await
    }

    async fn send_tracking_session(&self, session_id: String) -> Result<()> {
        let device = self.device_info.collect().await?;
        let request = Request::post(
            Endpoint::NewTrackingSession,
            &TrackingSessionRequest { session_id, device },
        )?;
        self.transport.send(request).await?;
        Ok(())
    }

    /// Register a user who converted through the stored referral code.
    ///
    /// Registering the same user again is a no-op. If the request fails, the failure is logged
    /// and nothing is stored, so the next call tries again.
    ///
    /// On success, `user_id` becomes the identity for further events and the auto-generated user
    /// id is discarded.
    ///
    /// # Errors
    ///
    /// - [`Error::NoReferralCode`] if no affiliate code has been validated.
    /// - [`Error::StorageRead`]/[`Error::StorageWrite`] if the store fails.
    pub async fn register_user(&self, user_id: &str, profile: &UserProfile) -> Result<()> {
        let Some(code) = self.state.get(StateKey::ReferralCode).await? else {
            log::debug!(target: "shinara", user_id; "no stored referral code, skipping user registration");
            return Err(Error::NoReferralCode);
        };

        let _guard = self.locks.lock(&format!("user:{user_id}")).await;

        if self
            .state
            .set_contains(StateKey::RegisteredUsers, user_id)
            .await?
        {
            log::trace!(target: "shinara", user_id; "user already registered");
            return Ok(());
        }

        // Held until the auto-generated id is discarded, so no anonymous event can pick up an id
        // that this registration does not link to the user.
        let _identity_guard = self.locks.lock(AUTO_GENERATED_ID_LOCK).await;

        let request = Request::post(
            Endpoint::NewUser,
            &NewUserRequest {
                code: &code,
                platform: self.platform,
                conversion_user: ConversionUser {
                    external_user_id: user_id,
                    name: profile.name.as_deref(),
                    email: profile.email.as_deref(),
                    phone: profile.phone.as_deref(),
                    auto_generated_external_user_id: self
                        .state
                        .get(StateKey::AutoGeneratedExternalUserId)
                        .await?,
                },
                affiliate_code_id: self.state.get(StateKey::AffiliateCodeId).await?,
            },
        )?;

        if let Err(err) = self.transport.send(request).await {
            log::warn!(target: "shinara", user_id; "error registering user: {:?}", err);
            return Ok(());
        }

        self.state.set(StateKey::ExternalUserId, user_id).await?;
        self.state
            .remove(StateKey::AutoGeneratedExternalUserId)
            .await?;
        self.state
            .append_to_set(StateKey::RegisteredUsers, user_id)
            .await?;

        log::debug!(target: "shinara", user_id; "user registered");
        Ok(())
    }

    /// Attribute a purchase to the stored referral code.
    ///
    /// Each transaction is sent at most once: attributing an already processed `transaction_id` is
    /// a no-op. If the request fails, the failure is logged and the transaction is not marked as
    /// processed, so it is sent again on the next call.
    ///
    /// `token` is the store's purchase token. It is required on [`Platform::Android`].
    ///
    /// # Errors
    ///
    /// - [`Error::NoReferralCode`] if no affiliate code has been validated.
    /// - [`Error::MissingToken`] if the platform requires a purchase token and none was given.
    /// - [`Error::StorageRead`]/[`Error::StorageWrite`] if the store fails.
    pub async fn attribute_purchase(
        &self,
        product_id: &str,
        transaction_id: &str,
        token: Option<&str>,
    ) -> Result<()> {
        let Some(code) = self.state.get(StateKey::ReferralCode).await? else {
            log::debug!(target: "shinara", transaction_id; "no stored referral code, skipping purchase");
            return Err(Error::NoReferralCode);
        };

        let token = token.filter(|token| !token.is_empty());
        if token.is_none() && self.platform.requires_purchase_token() {
            return Err(Error::MissingToken);
        }

        let _guard = self.locks.lock(&format!("transaction:{transaction_id}")).await;

        if self
            .state
            .set_contains(StateKey::ProcessedTransactions, transaction_id)
            .await?
        {
            log::trace!(target: "shinara", transaction_id; "transaction already processed");
            return Ok(());
        }

        let identity = self.resolve_identity().await?;

        let request = Request::post(
            Endpoint::Purchase,
            &PurchaseRequest {
                product_id,
                transaction_id,
                code: &code,
                platform: self.platform,
                identity: Some(identity).into(),
                affiliate_code_id: self.state.get(StateKey::AffiliateCodeId).await?,
                token,
            },
        )?;

        if let Err(err) = self.transport.send(request).await {
            log::warn!(target: "shinara", product_id, transaction_id; "error sending purchase event: {:?}", err);
            return Ok(());
        }

        self.state
            .append_to_set(StateKey::ProcessedTransactions, transaction_id)
            .await?;

        log::debug!(target: "shinara", product_id, transaction_id; "purchase attributed");
        Ok(())
    }

    /// Report that the app was opened.
    ///
    /// Does nothing unless the backend requested retention tracking during
    /// [`Client::initialize()`] and an affiliate code is stored. A failed request is logged and
    /// otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageRead`] if the store fails.
    pub async fn trigger_app_open(&self) -> Result<()> {
        if !self.track_retention.load(Ordering::Relaxed) {
            log::trace!(target: "shinara", "retention tracking is disabled");
            return Ok(());
        }

        let Some(affiliate_code_id) = self.state.get(StateKey::AffiliateCodeId).await? else {
            log::trace!(target: "shinara", "no affiliate code, skipping app open");
            return Ok(());
        };

        let request = Request::post(
            Endpoint::AppOpen,
            &AppOpenRequest {
                affiliate_code_id,
                identity: IdentityFields::from(self.state.current_identity().await?),
            },
        )?;

        match self.transport.send(request).await {
            Ok(_) => log::debug!(target: "shinara", "app open sent"),
            Err(err) => log::warn!(target: "shinara", "error sending app open: {:?}", err),
        }
        Ok(())
    }

    /// The identity for the next event: the registered user, or an anonymous id created on first
    /// use. Resolved under the same lock `register_user` holds while it swaps identities.
    async fn resolve_identity(&self) -> Result<Identity> {
        let _guard = self.locks.lock(AUTO_GENERATED_ID_LOCK).await;
        match self.state.current_identity().await? {
            Some(identity) => Ok(identity),
            None => Ok(Identity::AutoGenerated(
                self.state.get_or_create_auto_generated_id().await?,
            )),
        }
    }

    /// Get the stored affiliate referral code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageRead`] if the store fails. A missing value is `Ok(None)`.
    pub async fn get_referral_code(&self) -> Result<Option<String>> {
        self.state.get(StateKey::ReferralCode).await
    }

    /// Get the campaign id of the stored affiliate code.
    pub async fn get_program_id(&self) -> Result<Option<String>> {
        self.state.get(StateKey::ProgramId).await
    }

    /// Get the server-assigned id of the stored affiliate code.
    pub async fn get_affiliate_code_id(&self) -> Result<Option<String>> {
        self.state.get(StateKey::AffiliateCodeId).await
    }

    /// Get the registered user id.
    pub async fn get_user_id(&self) -> Result<Option<String>> {
        self.state.get(StateKey::ExternalUserId).await
    }

    /// Get the anonymous user id used before a user is registered.
    pub async fn get_auto_generated_user_id(&self) -> Result<Option<String>> {
        self.state.get(StateKey::AutoGeneratedExternalUserId).await
    }

    /// Get the id of the stored brand code.
    pub async fn get_brand_code_id(&self) -> Result<Option<String>> {
        self.state.get(StateKey::BrandCodeId).await
    }

    /// Whether the stored brand code unlocks the product for free. `None` if there's no brand
    /// code or it is tied to a placement.
    pub async fn get_promo_code_is_free(&self) -> Result<Option<bool>> {
        self.state.get_flag(StateKey::BrandCodeIsFree).await
    }

    /// Placement id of the stored brand code.
    pub async fn get_promo_code_placement_id(&self) -> Result<Option<String>> {
        self.state.get(StateKey::BrandCodePlacementId).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde_json::{json, Value};

    use crate::{
        error::{StoreError, TransportError},
        transport::{Endpoint, Request},
        BrandOffer, Client, ClientConfig, DeviceInfo, DeviceInfoProvider, Error, InMemoryStore,
        KeyValueStore, Platform, Transport, UserProfile, ValidatedCode,
    };

    /// Records requests and replies with scripted responses (JSON null once the script runs out).
    #[derive(Clone, Default)]
    struct FakeTransport {
        inner: Arc<FakeTransportInner>,
    }

    #[derive(Default)]
    struct FakeTransportInner {
        requests: Mutex<Vec<Request>>,
        responses: Mutex<HashMap<Endpoint, VecDeque<Result<Value, TransportError>>>>,
        delay: Mutex<Option<Duration>>,
    }

    impl FakeTransport {
        fn respond(&self, endpoint: Endpoint, response: Result<Value, TransportError>) {
            self.inner
                .responses
                .lock()
                .unwrap()
                .entry(endpoint)
                .or_default()
                .push_back(response);
        }

        fn fail_with_status(&self, endpoint: Endpoint, status: StatusCode) {
            self.respond(endpoint, Err(TransportError::Http { status }));
        }

        fn set_delay(&self, delay: Duration) {
            *self.inner.delay.lock().unwrap() = Some(delay);
        }

        fn requests_to(&self, endpoint: Endpoint) -> Vec<Value> {
            self.inner
                .requests
                .lock()
                .unwrap()
                .iter()
                .filter(|request| request.endpoint == endpoint)
                .map(|request| request.body.clone().unwrap_or(Value::Null))
                .collect()
        }

        fn request_count(&self) -> usize {
            self.inner.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, request: Request) -> Result<Value, TransportError> {
            let endpoint = request.endpoint;
            self.inner.requests.lock().unwrap().push(request);
            let delay = *self.inner.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let response = self
                .inner
                .responses
                .lock()
                .unwrap()
                .get_mut(&endpoint)
                .and_then(VecDeque::pop_front);
            response.unwrap_or(Ok(Value::Null))
        }
    }

    struct BrokenDevice;

    #[async_trait]
    impl DeviceInfoProvider for BrokenDevice {
        async fn collect(&self) -> crate::Result<DeviceInfo> {
            Err(Error::DeviceInfo("screen metrics unavailable".to_owned()))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err("storage unavailable".into())
        }
        async fn set(&self, _key: &str, _value: String) -> Result<(), StoreError> {
            Err("storage unavailable".into())
        }
        async fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err("storage unavailable".into())
        }
    }

    /// Wraps a shared in-memory store, so a test can inspect it and build several clients on top.
    #[derive(Clone, Default)]
    struct SharedStore(Arc<InMemoryStore>);

    #[async_trait]
    impl KeyValueStore for SharedStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
            self.0.set(key, value).await
        }
        async fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.0.remove(key).await
        }
    }

    /// Suspends on every read, so concurrent operations interleave inside their store accesses.
    struct YieldingStore(SharedStore);

    #[async_trait]
    impl KeyValueStore for YieldingStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            tokio::task::yield_now().await;
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
            self.0.set(key, value).await
        }
        async fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.0.remove(key).await
        }
    }

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn client_with(transport: &FakeTransport, platform: Platform) -> Client {
        init_logger();
        ClientConfig::from_api_key("api-key")
            .platform(platform)
            .transport(transport.clone())
            .to_client()
            .unwrap()
    }

    fn client(transport: &FakeTransport) -> Client {
        client_with(transport, Platform::Ios)
    }

    async fn with_affiliate_code(transport: &FakeTransport, client: &Client) {
        transport.respond(
            Endpoint::ValidateCode,
            Ok(json!({"campaign_id": "camp_1", "affiliate_code_id": "aff_1"})),
        );
        client.validate_code("PROMO10").await.unwrap();
    }

    #[tokio::test]
    async fn affiliate_code_is_stored() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        transport.respond(
            Endpoint::ValidateCode,
            Ok(json!({"campaign_id": "camp_1", "affiliate_code_id": "aff_1"})),
        );

        let validated = client.validate_code("PROMO10").await.unwrap();

        assert_eq!(validated.program_id(), Some("camp_1"));
        assert_eq!(
            transport.requests_to(Endpoint::ValidateCode),
            vec![json!({"code": "PROMO10", "platform": "ios"})]
        );
        assert_eq!(client.get_referral_code().await.unwrap().as_deref(), Some("PROMO10"));
        assert_eq!(client.get_program_id().await.unwrap().as_deref(), Some("camp_1"));
        assert_eq!(client.get_affiliate_code_id().await.unwrap().as_deref(), Some("aff_1"));
        assert_eq!(client.get_brand_code_id().await.unwrap(), None);
        assert_eq!(client.get_promo_code_is_free().await.unwrap(), None);
        assert_eq!(client.get_promo_code_placement_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn brand_code_replaces_affiliate_code() {
        let transport = FakeTransport::default();
        let client = client(&transport);

        transport.respond(Endpoint::ValidateCode, Ok(json!({"campaign_id": "camp_1"})));
        client.validate_code("PROMO10").await.unwrap();
        assert_eq!(client.get_program_id().await.unwrap().as_deref(), Some("camp_1"));

        transport.respond(
            Endpoint::ValidateCode,
            Ok(json!({"brand_code_data": {"code_id": "bc_1", "is_free": true}})),
        );
        let validated = client.validate_code("BRAND5").await.unwrap();

        assert_eq!(validated.program_id(), None);
        assert_eq!(validated.brand_code().map(|it| &it.offer), Some(&BrandOffer::Free));
        assert_eq!(client.get_program_id().await.unwrap(), None);
        assert_eq!(client.get_referral_code().await.unwrap(), None);
        assert_eq!(client.get_affiliate_code_id().await.unwrap(), None);
        assert_eq!(client.get_brand_code_id().await.unwrap().as_deref(), Some("bc_1"));
        assert_eq!(client.get_promo_code_is_free().await.unwrap(), Some(true));
        assert_eq!(client.get_promo_code_placement_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn affiliate_code_replaces_brand_code() {
        let transport = FakeTransport::default();
        let client = client(&transport);

        transport.respond(
            Endpoint::ValidateCode,
            Ok(json!({"brand_code_data": {"code_id": "bc_1", "is_free": false, "placement_id": "pl_1"}})),
        );
        client.validate_code("BRAND5").await.unwrap();
        assert_eq!(client.get_promo_code_placement_id().await.unwrap().as_deref(), Some("pl_1"));

        transport.respond(Endpoint::ValidateCode, Ok(json!({"campaign_id": "camp_2"})));
        let validated = client.validate_code("PROMO20").await.unwrap();

        assert_eq!(
            validated,
            ValidatedCode::Affiliate {
                program_id: "camp_2".to_owned(),
                affiliate_code_id: None,
            }
        );
        assert_eq!(client.get_referral_code().await.unwrap().as_deref(), Some("PROMO20"));
        assert_eq!(client.get_brand_code_id().await.unwrap(), None);
        assert_eq!(client.get_promo_code_is_free().await.unwrap(), None);
        assert_eq!(client.get_promo_code_placement_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn response_without_code_data_is_invalid_code() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        with_affiliate_code(&transport, &client).await;

        transport.respond(Endpoint::ValidateCode, Ok(json!({"message": "ok"})));
        assert!(matches!(
            client.validate_code("NOPE").await,
            Err(Error::InvalidCode)
        ));

        // empty response body
        assert!(matches!(
            client.validate_code("NOPE").await,
            Err(Error::InvalidCode)
        ));

        // previous code is untouched
        assert_eq!(client.get_referral_code().await.unwrap().as_deref(), Some("PROMO10"));
        assert_eq!(client.get_program_id().await.unwrap().as_deref(), Some("camp_1"));
    }

    #[tokio::test]
    async fn transport_failure_is_validation_failed() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        transport.fail_with_status(Endpoint::ValidateCode, StatusCode::NOT_FOUND);

        assert!(matches!(
            client.validate_code("PROMO10").await,
            Err(Error::ValidationFailed(TransportError::Http { .. }))
        ));
        assert_eq!(client.get_referral_code().await.unwrap(), None);
    }

    #[tokio::test]
    async fn blank_code_is_rejected_locally() {
        let transport = FakeTransport::default();
        let client = client(&transport);

        assert!(matches!(client.validate_code("  ").await, Err(Error::InvalidCode)));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn purchase_before_code_fails_without_network() {
        let transport = FakeTransport::default();
        let client = client(&transport);

        assert!(matches!(
            client.attribute_purchase("sku_1", "txn_1", None).await,
            Err(Error::NoReferralCode)
        ));
        assert!(matches!(
            client.register_user("user_1", &UserProfile::new()).await,
            Err(Error::NoReferralCode)
        ));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn anonymous_purchase_is_attributed_once() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        with_affiliate_code(&transport, &client).await;

        client.attribute_purchase("sku_1", "txn_1", None).await.unwrap();

        let auto_id = client.get_auto_generated_user_id().await.unwrap().unwrap();
        assert_eq!(
            transport.requests_to(Endpoint::Purchase),
            vec![json!({
                "product_id": "sku_1",
                "transaction_id": "txn_1",
                "code": "PROMO10",
                "platform": "ios",
                "auto_generated_external_user_id": auto_id,
                "affiliate_code_id": "aff_1",
            })]
        );

        client.attribute_purchase("sku_1", "txn_1", None).await.unwrap();
        assert_eq!(transport.requests_to(Endpoint::Purchase).len(), 1);

        client.attribute_purchase("sku_1", "txn_2", None).await.unwrap();
        let requests = transport.requests_to(Endpoint::Purchase);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1]["auto_generated_external_user_id"], auto_id.as_str());
    }

    #[tokio::test]
    async fn failed_purchase_is_retried() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        with_affiliate_code(&transport, &client).await;

        transport.fail_with_status(Endpoint::Purchase, StatusCode::INTERNAL_SERVER_ERROR);
        client.attribute_purchase("sku_1", "txn_1", None).await.unwrap();
        client.attribute_purchase("sku_1", "txn_1", None).await.unwrap();
        client.attribute_purchase("sku_1", "txn_1", None).await.unwrap();

        assert_eq!(transport.requests_to(Endpoint::Purchase).len(), 2);
    }

    #[tokio::test]
    async fn concurrent_duplicate_purchases_are_sent_once() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        with_affiliate_code(&transport, &client).await;
        transport.set_delay(Duration::from_millis(20));

        let (a, b, c) = tokio::join!(
            client.attribute_purchase("sku_1", "txn_1", None),
            client.attribute_purchase("sku_1", "txn_1", None),
            client.attribute_purchase("sku_2", "txn_2", None),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let requests = transport.requests_to(Endpoint::Purchase);
        assert_eq!(requests.len(), 2);
        // both transactions share one anonymous id
        assert_eq!(
            requests[0]["auto_generated_external_user_id"],
            requests[1]["auto_generated_external_user_id"]
        );
    }

    #[tokio::test]
    async fn concurrent_purchases_of_different_transactions_are_all_recorded() {
        init_logger();
        let transport = FakeTransport::default();
        let shared = SharedStore::default();
        let client = ClientConfig::from_api_key("api-key")
            .store(YieldingStore(shared.clone()))
            .transport(transport.clone())
            .to_client()
            .unwrap();
        with_affiliate_code(&transport, &client).await;
        transport.set_delay(Duration::from_millis(10));

        let (a, b) = tokio::join!(
            client.attribute_purchase("sku_1", "txn_1", None),
            client.attribute_purchase("sku_2", "txn_2", None),
        );
        a.unwrap();
        b.unwrap();

        let processed: Vec<String> = serde_json::from_str(
            &shared
                .get("SHINARA_SDK_PROCESSED_TRANSACTIONS")
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert!(processed.contains(&"txn_1".to_owned()));
        assert!(processed.contains(&"txn_2".to_owned()));

        let (a, b) = tokio::join!(
            client.attribute_purchase("sku_1", "txn_1", None),
            client.attribute_purchase("sku_2", "txn_2", None),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(transport.requests_to(Endpoint::Purchase).len(), 2);
    }

    #[tokio::test]
    async fn android_purchase_requires_token() {
        let transport = FakeTransport::default();
        let client = client_with(&transport, Platform::Android);
        with_affiliate_code(&transport, &client).await;

        assert!(matches!(
            client.attribute_purchase("sku_1", "txn_1", None).await,
            Err(Error::MissingToken)
        ));
        assert!(matches!(
            client.attribute_purchase("sku_1", "txn_1", Some("")).await,
            Err(Error::MissingToken)
        ));
        assert!(transport.requests_to(Endpoint::Purchase).is_empty());

        client
            .attribute_purchase("sku_1", "txn_1", Some("purchase-token"))
            .await
            .unwrap();
        let requests = transport.requests_to(Endpoint::Purchase);
        assert_eq!(requests[0]["token"], "purchase-token");
        assert_eq!(requests[0]["platform"], "android");
    }

    #[tokio::test]
    async fn registration_replaces_auto_generated_id() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        with_affiliate_code(&transport, &client).await;

        client.attribute_purchase("sku_1", "txn_1", None).await.unwrap();
        let auto_id = client.get_auto_generated_user_id().await.unwrap().unwrap();

        client
            .register_user("user_1", &UserProfile::new().name("Ada").email("ada@example.com"))
            .await
            .unwrap();

        assert_eq!(
            transport.requests_to(Endpoint::NewUser),
            vec![json!({
                "code": "PROMO10",
                "platform": "ios",
                "conversion_user": {
                    "external_user_id": "user_1",
                    "name": "Ada",
                    "email": "ada@example.com",
                    "auto_generated_external_user_id": auto_id,
                },
                "affiliate_code_id": "aff_1",
            })]
        );
        assert_eq!(client.get_user_id().await.unwrap().as_deref(), Some("user_1"));
        assert_eq!(client.get_auto_generated_user_id().await.unwrap(), None);

        client.attribute_purchase("sku_1", "txn_2", None).await.unwrap();
        let requests = transport.requests_to(Endpoint::Purchase);
        assert_eq!(requests[1]["external_user_id"], "user_1");
        assert!(requests[1].get("auto_generated_external_user_id").is_none());
        assert_eq!(client.get_auto_generated_user_id().await.unwrap(), None);
    }

    /// An anonymous purchase racing a registration is either sent for the registered user or
    /// under an anonymous id that the registration links to that user.
    fn assert_purchase_linked_to_user(transport: &FakeTransport) {
        let purchases = transport.requests_to(Endpoint::Purchase);
        let registrations = transport.requests_to(Endpoint::NewUser);
        assert_eq!(purchases.len(), 1);
        assert_eq!(registrations.len(), 1);

        match purchases[0].get("auto_generated_external_user_id") {
            Some(auto_id) => assert_eq!(
                &registrations[0]["conversion_user"]["auto_generated_external_user_id"],
                auto_id
            ),
            None => assert_eq!(purchases[0]["external_user_id"], "user_1"),
        }
    }

    #[tokio::test]
    async fn registration_racing_anonymous_purchase_keeps_attribution() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        with_affiliate_code(&transport, &client).await;
        transport.set_delay(Duration::from_millis(10));

        let profile = UserProfile::new();
        let (registered, purchased) = tokio::join!(
            client.register_user("user_1", &profile),
            client.attribute_purchase("sku_1", "txn_1", None),
        );
        registered.unwrap();
        purchased.unwrap();

        assert_purchase_linked_to_user(&transport);
        assert_eq!(client.get_user_id().await.unwrap().as_deref(), Some("user_1"));
        assert_eq!(client.get_auto_generated_user_id().await.unwrap(), None);

        // the purchase reaches the identity first
        let transport = FakeTransport::default();
        let client = client_with(&transport, Platform::Ios);
        with_affiliate_code(&transport, &client).await;
        transport.set_delay(Duration::from_millis(10));

        let profile = UserProfile::new();
        let (purchased, registered) = tokio::join!(
            client.attribute_purchase("sku_1", "txn_1", None),
            client.register_user("user_1", &profile),
        );
        registered.unwrap();
        purchased.unwrap();

        assert_purchase_linked_to_user(&transport);
        assert_eq!(client.get_auto_generated_user_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_duplicate_registrations_are_sent_once() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        with_affiliate_code(&transport, &client).await;
        transport.set_delay(Duration::from_millis(20));

        let profile = UserProfile::new().email("ada@example.com");
        let (a, b) = tokio::join!(
            client.register_user("user_1", &profile),
            client.register_user("user_1", &profile),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(transport.requests_to(Endpoint::NewUser).len(), 1);
        assert_eq!(client.get_user_id().await.unwrap().as_deref(), Some("user_1"));
    }

    #[tokio::test]
    async fn user_is_registered_once() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        with_affiliate_code(&transport, &client).await;

        client.register_user("user_1", &UserProfile::new()).await.unwrap();
        client.register_user("user_1", &UserProfile::new()).await.unwrap();

        assert_eq!(transport.requests_to(Endpoint::NewUser).len(), 1);
    }

    #[tokio::test]
    async fn failed_registration_commits_nothing() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        with_affiliate_code(&transport, &client).await;
        client.attribute_purchase("sku_1", "txn_1", None).await.unwrap();

        transport.fail_with_status(Endpoint::NewUser, StatusCode::BAD_GATEWAY);
        client.register_user("user_1", &UserProfile::new()).await.unwrap();

        assert_eq!(client.get_user_id().await.unwrap(), None);
        assert!(client.get_auto_generated_user_id().await.unwrap().is_some());

        client.register_user("user_1", &UserProfile::new()).await.unwrap();
        assert_eq!(transport.requests_to(Endpoint::NewUser).len(), 2);
        assert_eq!(client.get_user_id().await.unwrap().as_deref(), Some("user_1"));
    }

    #[tokio::test]
    async fn initialize_sends_tracking_session_once() {
        let store = SharedStore::default();
        let transport = FakeTransport::default();
        let device = DeviceInfo {
            device_model: Some("iPhone15,2".to_owned()),
            ..DeviceInfo::default()
        };
        let new_client = || {
            ClientConfig::from_api_key("api-key")
                .store(store.clone())
                .device_info(device.clone())
                .transport(transport.clone())
                .to_client()
                .unwrap()
        };

        transport.respond(Endpoint::ValidateKey, Ok(json!({"app_id": "app_1"})));
        new_client().initialize().await.unwrap();

        let auto_id = store
            .get("SHINARA_SDK_AUTO_GEN_EXTERNAL_USER_ID")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            transport.requests_to(Endpoint::NewTrackingSession),
            vec![json!({"session_id": auto_id, "device_model": "iPhone15,2"})]
        );

        // next launch
        transport.respond(Endpoint::ValidateKey, Ok(json!({"app_id": "app_1"})));
        new_client().initialize().await.unwrap();
        assert_eq!(transport.requests_to(Endpoint::NewTrackingSession).len(), 1);
        assert_eq!(transport.requests_to(Endpoint::ValidateKey).len(), 2);
    }

    #[tokio::test]
    async fn setup_retries_after_http_error_only() {
        let transport = FakeTransport::default();
        let client = client(&transport);

        transport.fail_with_status(Endpoint::NewTrackingSession, StatusCode::SERVICE_UNAVAILABLE);
        client.ensure_setup().await.unwrap();
        client.ensure_setup().await.unwrap();
        client.ensure_setup().await.unwrap();
        assert_eq!(transport.requests_to(Endpoint::NewTrackingSession).len(), 2);

        let transport = FakeTransport::default();
        let client = ClientConfig::from_api_key("api-key")
            .device_info(BrokenDevice)
            .transport(transport.clone())
            .to_client()
            .unwrap();
        client.ensure_setup().await.unwrap();
        client.ensure_setup().await.unwrap();
        assert_eq!(transport.request_count(), 0);
        assert!(client.state.get_flag(crate::state::StateKey::SetupCompleted).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn setup_uses_registered_user_id() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        with_affiliate_code(&transport, &client).await;
        client.register_user("user_1", &UserProfile::new()).await.unwrap();

        client.ensure_setup().await.unwrap();

        assert_eq!(
            transport.requests_to(Endpoint::NewTrackingSession)[0]["session_id"],
            "user_1"
        );
        assert_eq!(client.get_auto_generated_user_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejected_api_key_is_configuration_error() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        transport.fail_with_status(Endpoint::ValidateKey, StatusCode::UNAUTHORIZED);
        assert!(matches!(client.initialize().await, Err(Error::Configuration(_))));

        transport.respond(Endpoint::ValidateKey, Ok(json!({"message": "unknown key"})));
        assert!(matches!(client.initialize().await, Err(Error::Configuration(_))));

        // empty body
        transport.respond(Endpoint::ValidateKey, Ok(Value::Null));
        assert!(matches!(client.initialize().await, Err(Error::Configuration(_))));

        transport.respond(Endpoint::ValidateKey, Ok(json!(["app_1"])));
        assert!(matches!(client.initialize().await, Err(Error::Configuration(_))));

        transport.fail_with_status(Endpoint::ValidateKey, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(matches!(client.initialize().await, Err(Error::Transport(_))));

        assert!(transport.requests_to(Endpoint::NewTrackingSession).is_empty());
    }

    #[tokio::test]
    async fn empty_api_key_is_configuration_error() {
        let transport = FakeTransport::default();
        let client = ClientConfig::from_api_key("")
            .transport(transport.clone())
            .to_client()
            .unwrap();

        assert!(matches!(client.initialize().await, Err(Error::Configuration(_))));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn app_open_requires_retention_and_affiliate_code() {
        let transport = FakeTransport::default();
        let client = client(&transport);

        // retention tracking not requested
        transport.respond(Endpoint::ValidateKey, Ok(json!({"app_id": "app_1"})));
        client.initialize().await.unwrap();
        with_affiliate_code(&transport, &client).await;
        client.trigger_app_open().await.unwrap();
        assert!(transport.requests_to(Endpoint::AppOpen).is_empty());

        transport.respond(
            Endpoint::ValidateKey,
            Ok(json!({"app_id": "app_1", "track_retention": true})),
        );
        client.initialize().await.unwrap();

        let auto_id = client.get_auto_generated_user_id().await.unwrap().unwrap();
        assert_eq!(
            transport.requests_to(Endpoint::AppOpen),
            vec![json!({"affiliate_code_id": "aff_1", "auto_generated_external_user_id": auto_id})]
        );

        // no affiliate code after switching to a brand code
        transport.respond(
            Endpoint::ValidateCode,
            Ok(json!({"brand_code_data": {"code_id": "bc_1"}})),
        );
        client.validate_code("BRAND5").await.unwrap();
        client.trigger_app_open().await.unwrap();
        assert_eq!(transport.requests_to(Endpoint::AppOpen).len(), 1);
    }

    #[tokio::test]
    async fn app_open_failure_is_swallowed() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        with_affiliate_code(&transport, &client).await;
        transport.respond(
            Endpoint::ValidateKey,
            Ok(json!({"app_id": "app_1", "track_retention": true})),
        );
        transport.fail_with_status(Endpoint::AppOpen, StatusCode::BAD_GATEWAY);

        client.initialize().await.unwrap();
        assert_eq!(transport.requests_to(Endpoint::AppOpen).len(), 1);
    }

    #[tokio::test]
    async fn deep_link_validates_code() {
        let transport = FakeTransport::default();
        let client = client(&transport);

        assert_eq!(client.handle_deep_link("myapp://open").await.unwrap(), None);
        assert_eq!(client.handle_deep_link("::not a link::").await.unwrap(), None);
        assert_eq!(transport.request_count(), 0);

        transport.respond(Endpoint::ValidateCode, Ok(json!({"campaign_id": "camp_1"})));
        let validated = client
            .handle_deep_link("myapp://open?shinara_code=PROMO10")
            .await
            .unwrap();

        assert_eq!(validated.as_ref().and_then(ValidatedCode::program_id), Some("camp_1"));
        assert_eq!(client.get_referral_code().await.unwrap().as_deref(), Some("PROMO10"));
    }

    #[tokio::test]
    async fn getters_surface_storage_errors() {
        let transport = FakeTransport::default();
        let client = ClientConfig::from_api_key("api-key")
            .store(BrokenStore)
            .transport(transport.clone())
            .to_client()
            .unwrap();

        assert!(matches!(
            client.get_referral_code().await,
            Err(Error::StorageRead { key: "SHINARA_SDK_REFERRAL_CODE", .. })
        ));
        assert!(matches!(
            client.attribute_purchase("sku_1", "txn_1", None).await,
            Err(Error::StorageRead { .. })
        ));
        assert_eq!(transport.request_count(), 0);
    }
}
