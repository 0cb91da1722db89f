use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Static description of the device and session, sent once when tracking starts.
///
/// All fields are optional; whatever the host application knows about the device goes here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// HTTP user agent of the platform web view, or `{os} {version}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Hardware model identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    /// Operating system name and version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Formatted as `{width}x{height}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_resolution: Option<String>,
    /// IANA time zone name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// BCP 47 language tag of the preferred locale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Any additional fields. These are flattened into the payload.
    #[serde(flatten)]
    pub extra: HashMap<String, String>,
}

/// Source of [`DeviceInfo`].
///
/// `DeviceInfo` itself implements this trait, returning a copy of itself, which covers the common
/// case of collecting the descriptor once at startup.
#[async_trait]
pub trait DeviceInfoProvider: Send + Sync {
    /// Collect the device descriptor.
    ///
    /// Return [`Error::DeviceInfo`](crate::Error::DeviceInfo) if the environment doesn't allow it.
    async fn collect(&self) -> Result<DeviceInfo>;
}

#[async_trait]
impl DeviceInfoProvider for DeviceInfo {
    async fn collect(&self) -> Result<DeviceInfo> {
        Ok(self.clone())
    }
}
