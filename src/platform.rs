use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Mobile platform the host application runs on.
///
/// The platform is sent along with every request and decides whether a purchase token is required
/// to attribute a purchase.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Apple iOS. Purchases are identified by transaction id alone.
    #[display(fmt = "ios")]
    Ios,
    /// Google Android. Purchases must carry a Play Billing purchase token.
    #[display(fmt = "android")]
    Android,
}

impl Platform {
    /// Name of the platform as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }

    /// Whether purchase attribution on this platform requires a purchase token.
    pub fn requires_purchase_token(&self) -> bool {
        matches!(self, Platform::Android)
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            other => Err(Error::Configuration(format!(
                "platform {other:?} is not supported, Shinara SDK runs on iOS and Android"
            ))),
        }
    }
}
