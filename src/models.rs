//! Request and response bodies exchanged with the Shinara backend.
use serde::{Deserialize, Serialize};

use crate::{device::DeviceInfo, state::Identity, Platform};

/// Offer attached to a brand code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrandOffer {
    /// The code unlocks the product for free.
    Free,
    /// The code points at a paywall placement.
    Placement(String),
    /// Neither free nor tied to a placement.
    Paid,
}

/// A validated brand (promo) code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandCode {
    /// Server-assigned id of the brand code.
    pub code_id: String,
    /// What the code grants.
    pub offer: BrandOffer,
}

impl BrandCode {
    /// Returns `true` if the code unlocks the product for free.
    pub fn is_free(&self) -> bool {
        self.offer == BrandOffer::Free
    }

    /// Placement id, if the code is tied to a placement.
    pub fn placement_id(&self) -> Option<&str> {
        match &self.offer {
            BrandOffer::Placement(id) => Some(id),
            _ => None,
        }
    }
}

/// Result of a successful code validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidatedCode {
    /// Referral code tied to an affiliate campaign.
    Affiliate {
        /// Campaign the code belongs to.
        program_id: String,
        /// Server-assigned id of the affiliate code.
        affiliate_code_id: Option<String>,
    },
    /// Brand (promo) code.
    Brand(BrandCode),
}

impl ValidatedCode {
    /// Campaign id for affiliate codes. Brand codes don't have one.
    pub fn program_id(&self) -> Option<&str> {
        match self {
            ValidatedCode::Affiliate { program_id, .. } => Some(program_id),
            ValidatedCode::Brand(_) => None,
        }
    }

    /// Brand code descriptor, if this is a brand code.
    pub fn brand_code(&self) -> Option<&BrandCode> {
        match self {
            ValidatedCode::Brand(brand_code) => Some(brand_code),
            ValidatedCode::Affiliate { .. } => None,
        }
    }
}

/// Optional profile fields sent along with a user registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Display name.
    pub name: Option<String>,
    /// Email address.
    pub email: Option<String>,
    /// Phone number.
    pub phone: Option<String>,
}

impl UserProfile {
    /// Create an empty profile.
    pub fn new() -> UserProfile {
        UserProfile::default()
    }

    /// Set display name.
    pub fn name(mut self, name: impl Into<String>) -> UserProfile {
        self.name = Some(name.into());
        self
    }

    /// Set email address.
    pub fn email(mut self, email: impl Into<String>) -> UserProfile {
        self.email = Some(email.into());
        self
    }

    /// Set phone number.
    pub fn phone(mut self, phone: impl Into<String>) -> UserProfile {
        self.phone = Some(phone.into());
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct KeyValidateResponse {
    pub app_id: Option<String>,
    #[serde(default)]
    pub track_retention: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CodeValidateRequest<'a> {
    pub code: &'a str,
    pub platform: Platform,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct CodeValidateResponse {
    pub campaign_id: Option<String>,
    pub affiliate_code_id: Option<String>,
    pub brand_code_data: Option<BrandCodeData>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BrandCodeData {
    pub code_id: String,
    #[serde(default)]
    pub is_free: bool,
    pub placement_id: Option<String>,
}

impl From<BrandCodeData> for BrandCode {
    fn from(data: BrandCodeData) -> BrandCode {
        let offer = match (data.is_free, data.placement_id) {
            (true, _) => BrandOffer::Free,
            (false, Some(placement_id)) => BrandOffer::Placement(placement_id),
            (false, None) => BrandOffer::Paid,
        };
        BrandCode {
            code_id: data.code_id,
            offer,
        }
    }
}

/// User identity as it appears on the wire: at most one of the two fields is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub(crate) struct IdentityFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_generated_external_user_id: Option<String>,
}

impl From<Option<Identity>> for IdentityFields {
    fn from(identity: Option<Identity>) -> IdentityFields {
        match identity {
            Some(Identity::External(id)) => IdentityFields {
                external_user_id: Some(id),
                auto_generated_external_user_id: None,
            },
            Some(Identity::AutoGenerated(id)) => IdentityFields {
                external_user_id: None,
                auto_generated_external_user_id: Some(id),
            },
            None => IdentityFields::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TrackingSessionRequest {
    pub session_id: String,
    #[serde(flatten)]
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct NewUserRequest<'a> {
    pub code: &'a str,
    pub platform: Platform,
    pub conversion_user: ConversionUser<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affiliate_code_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ConversionUser<'a> {
    pub external_user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_generated_external_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct PurchaseRequest<'a> {
    pub product_id: &'a str,
    pub transaction_id: &'a str,
    pub code: &'a str,
    pub platform: Platform,
    #[serde(flatten)]
    pub identity: IdentityFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affiliate_code_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct AppOpenRequest {
    pub affiliate_code_id: String,
    #[serde(flatten)]
    pub identity: IdentityFields,
}
