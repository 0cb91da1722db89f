//! The Rust SDK for Shinara, a referral and promo code attribution platform.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that attributes in-app purchases and user registrations to
//! a previously validated referral code. A code reaches the app either directly (e.g., entered by
//! the user) through [`Client::validate_code()`] or through a deep link handled by
//! [`Client::handle_deep_link()`]. Once a code is stored, [`Client::register_user()`] and
//! [`Client::attribute_purchase()`] report conversions to the Shinara backend.
//!
//! There are two kinds of codes:
//! - *affiliate* codes, tied to a campaign ([`ValidatedCode::Affiliate`]);
//! - *brand* (promo) codes, tied to a paywall placement or unlocking the product for free
//!   ([`ValidatedCode::Brand`]).
//!
//! Only one code is active at a time: validating one kind clears the other.
//!
//! # State
//!
//! Attribution state is persisted in a [`KeyValueStore`]. It remembers the active code, the user
//! identity, and which users and transactions have already been reported, so each of them is sent
//! at most once across application launches. Use [`FileStore`] (or your own implementation) in
//! production; the default [`InMemoryStore`] forgets everything on restart.
//!
//! Before a user registers, events are attributed to an anonymous, locally generated id. It is
//! discarded once a real user id is registered.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Initialization, code validation and getters return errors to the caller. Reporting
//! registrations, purchases and app opens never fails because of the network: failed requests are
//! logged and retried on the next call, so that attribution never interrupts the purchase flow.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! target `shinara`. Consider integrating a `log`-compatible logger implementation for better
//! visibility into SDK operations.
//!
//! # Examples
//!
//! ```no_run
//! # async fn test() -> shinara::Result<()> {
//! use shinara::{ClientConfig, FileStore, Platform, UserProfile};
//!
//! let client = ClientConfig::from_api_key("api-key")
//!     .platform(Platform::Ios)
//!     .store(FileStore::new("shinara.json"))
//!     .to_client()?;
//! client.initialize().await?;
//!
//! client.handle_deep_link("myapp://open?shinara_code=PROMO10").await?;
//! client
//!     .register_user("user-1", &UserProfile::new().email("user@example.com"))
//!     .await?;
//! client.attribute_purchase("premium_monthly", "1000000123456789", None).await?;
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod client;
mod config;
mod deep_link;
mod device;
mod error;
mod locks;
mod models;
mod platform;
mod state;
mod store;
mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use deep_link::DEFAULT_DEEP_LINK_PARAM;
pub use device::{DeviceInfo, DeviceInfoProvider};
pub use error::{Error, Result, StoreError, TransportError};
pub use models::{BrandCode, BrandOffer, UserProfile, ValidatedCode};
pub use platform::Platform;
pub use store::{FileStore, InMemoryStore, KeyValueStore, StoreOp};
pub use transport::{
    Endpoint, HttpTransport, Request, Transport, API_KEY_HEADER, PLATFORM_HEADER,
};
