use std::sync::Arc;

use crate::{
    deep_link::DEFAULT_DEEP_LINK_PARAM, Client, DeviceInfo, DeviceInfoProvider, InMemoryStore,
    KeyValueStore, Platform, Result, Transport,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use shinara::{ClientConfig, FileStore, Platform};
/// let client = ClientConfig::from_api_key("api-key")
///     .platform(Platform::Android)
///     .store(FileStore::new("/data/app/shinara.json"))
///     .to_client()
///     .unwrap();
/// ```
pub struct ClientConfig {
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) platform: Platform,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) device_info: Arc<dyn DeviceInfoProvider>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) deep_link_param: String,
}

impl ClientConfig {
    /// Create a default Shinara configuration using the specified API key.
    ///
    /// Defaults to iOS, an in-memory store and an empty device descriptor. Production apps should
    /// set a persistent [`store`](ClientConfig::store), otherwise attribution state is lost on
    /// restart.
    ///
    /// ```
    /// # use shinara::ClientConfig;
    /// ClientConfig::from_api_key("api-key");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            platform: Platform::Ios,
            store: Arc::new(InMemoryStore::new()),
            device_info: Arc::new(DeviceInfo::default()),
            transport: None,
            deep_link_param: DEFAULT_DEEP_LINK_PARAM.to_owned(),
        }
    }

    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://sdk-gateway-b85kv8d1.ue.gateway.dev";

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the platform the host application runs on.
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Set the store used to persist attribution state between launches.
    pub fn store(mut self, store: impl KeyValueStore + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }

    /// Set the source of the device descriptor sent when tracking starts.
    ///
    /// ```
    /// # use shinara::{ClientConfig, DeviceInfo};
    /// let config = ClientConfig::from_api_key("api-key").device_info(DeviceInfo {
    ///     device_model: Some("Pixel 8".to_owned()),
    ///     ..DeviceInfo::default()
    /// });
    /// ```
    pub fn device_info(mut self, device_info: impl DeviceInfoProvider + 'static) -> Self {
        self.device_info = Arc::new(device_info);
        self
    }

    /// Replace the HTTP transport. When set, [`base_url`](ClientConfig::base_url) is ignored.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Override the deep-link query parameter carrying the referral code.
    pub fn deep_link_param(mut self, param: impl Into<String>) -> Self {
        self.deep_link_param = param.into();
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use shinara::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_api_key("api-key").to_client().unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}
