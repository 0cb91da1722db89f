//! Typed access to attribution records persisted in a [`KeyValueStore`].
use std::sync::Arc;

use crate::{
    locks::KeyedLocks,
    models::{BrandCode, BrandOffer},
    store::{KeyValueStore, StoreOp},
    Error, Result,
};

/// Fixed storage keys, one per persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum StateKey {
    ReferralCode,
    ProgramId,
    AffiliateCodeId,
    BrandCodeId,
    BrandCodeIsFree,
    BrandCodePlacementId,
    ExternalUserId,
    AutoGeneratedExternalUserId,
    SetupCompleted,
    RegisteredUsers,
    ProcessedTransactions,
}

impl StateKey {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            StateKey::ReferralCode => "SHINARA_SDK_REFERRAL_CODE",
            StateKey::ProgramId => "SHINARA_SDK_PROGRAM_ID",
            StateKey::AffiliateCodeId => "SHINARA_SDK_AFFILIATE_CODE_ID",
            StateKey::BrandCodeId => "SHINARA_SDK_BRAND_CODE_ID",
            StateKey::BrandCodeIsFree => "SHINARA_SDK_BRAND_CODE_IS_FREE",
            StateKey::BrandCodePlacementId => "SHINARA_SDK_BRAND_CODE_PLACEMENT_ID",
            StateKey::ExternalUserId => "SHINARA_SDK_EXTERNAL_USER_ID",
            StateKey::AutoGeneratedExternalUserId => "SHINARA_SDK_AUTO_GEN_EXTERNAL_USER_ID",
            StateKey::SetupCompleted => "SHINARA_SDK_SETUP_COMPLETED",
            StateKey::RegisteredUsers => "SHINARA_SDK_REGISTERED_USERS",
            StateKey::ProcessedTransactions => "SHINARA_SDK_PROCESSED_TRANSACTIONS",
        }
    }
}

/// The kind of code that is currently active. Affiliate and brand codes are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CodeState {
    Affiliate {
        code: String,
        program_id: String,
        affiliate_code_id: Option<String>,
    },
    Brand(BrandCode),
}

/// Identity attached to events sent on behalf of the current user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Identity {
    External(String),
    AutoGenerated(String),
}

/// `AttributionState` maps attribution records onto raw store keys and values.
#[derive(Clone)]
pub(crate) struct AttributionState {
    store: Arc<dyn KeyValueStore>,
    // Serializes read-modify-write updates of set-valued records.
    record_locks: Arc<KeyedLocks>,
}

impl AttributionState {
    pub(crate) fn new(store: Arc<dyn KeyValueStore>) -> AttributionState {
        AttributionState {
            store,
            record_locks: Arc::new(KeyedLocks::new()),
        }
    }

    pub(crate) async fn get(&self, key: StateKey) -> Result<Option<String>> {
        self.store
            .get(key.as_str())
            .await
            .map_err(|err| Error::storage_read(key.as_str(), err))
    }

    pub(crate) async fn set(&self, key: StateKey, value: impl Into<String>) -> Result<()> {
        self.store
            .set(key.as_str(), value.into())
            .await
            .map_err(|err| Error::storage_write(key.as_str(), err))
    }

    pub(crate) async fn remove(&self, key: StateKey) -> Result<()> {
        self.store
            .remove(key.as_str())
            .await
            .map_err(|err| Error::storage_write(key.as_str(), err))
    }

    pub(crate) async fn get_flag(&self, key: StateKey) -> Result<Option<bool>> {
        Ok(self.get(key).await?.map(|value| value == "true"))
    }

    pub(crate) async fn set_flag(&self, key: StateKey, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" }).await
    }

    /// Read a set-valued record. A missing record is an empty set.
    pub(crate) async fn get_set(&self, key: StateKey) -> Result<Vec<String>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&raw).map_err(|err| Error::storage_read(key.as_str(), err.into()))
    }

    pub(crate) async fn set_contains(&self, key: StateKey, member: &str) -> Result<bool> {
        Ok(self.get_set(key).await?.iter().any(|it| it == member))
    }

    /// Append `member` to a set-valued record. Appending an existing member is a no-op.
    ///
    /// The whole read-modify-write runs under a lock for `key`, so concurrent appends of
    /// different members never overwrite each other.
    pub(crate) async fn append_to_set(&self, key: StateKey, member: &str) -> Result<()> {
        let _guard = self.record_locks.lock(key.as_str()).await;
        let mut members = self.get_set(key).await?;
        if members.iter().any(|it| it == member) {
            return Ok(());
        }
        members.push(member.to_owned());
        let raw = serde_json::to_string(&members)
            .map_err(|err| Error::storage_write(key.as_str(), err.into()))?;
        self.set(key, raw).await
    }

    /// Commit a validated code, clearing all fields of the other code kind.
    ///
    /// All writes are issued as a single [`KeyValueStore::apply`] batch. Within the batch,
    /// `ProgramId` is written before `ReferralCode`, so a store that applies the batch
    /// non-atomically never exposes a referral code without its program id.
    ///
    /// A failed batch is reported against the record identifying the committed code:
    /// `ReferralCode` for affiliate codes, `BrandCodeId` for brand codes.
    pub(crate) async fn commit_code_state(&self, state: CodeState) -> Result<()> {
        let (committed_key, ops) = match state {
            CodeState::Affiliate {
                code,
                program_id,
                affiliate_code_id,
            } => {
                let mut ops = vec![
                    StoreOp::Remove(StateKey::BrandCodeId.as_str()),
                    StoreOp::Remove(StateKey::BrandCodeIsFree.as_str()),
                    StoreOp::Remove(StateKey::BrandCodePlacementId.as_str()),
                    StoreOp::Set(StateKey::ProgramId.as_str(), program_id),
                ];
                ops.push(match affiliate_code_id {
                    Some(id) => StoreOp::Set(StateKey::AffiliateCodeId.as_str(), id),
                    None => StoreOp::Remove(StateKey::AffiliateCodeId.as_str()),
                });
                ops.push(StoreOp::Set(StateKey::ReferralCode.as_str(), code));
                (StateKey::ReferralCode, ops)
            }
            CodeState::Brand(BrandCode { code_id, offer }) => {
                let mut ops = vec![
                    StoreOp::Remove(StateKey::ReferralCode.as_str()),
                    StoreOp::Remove(StateKey::ProgramId.as_str()),
                    StoreOp::Remove(StateKey::AffiliateCodeId.as_str()),
                    StoreOp::Set(StateKey::BrandCodeId.as_str(), code_id),
                ];
                match offer {
                    BrandOffer::Free => {
                        ops.push(StoreOp::Set(
                            StateKey::BrandCodeIsFree.as_str(),
                            "true".to_owned(),
                        ));
                        ops.push(StoreOp::Remove(StateKey::BrandCodePlacementId.as_str()));
                    }
                    BrandOffer::Paid => {
                        ops.push(StoreOp::Set(
                            StateKey::BrandCodeIsFree.as_str(),
                            "false".to_owned(),
                        ));
                        ops.push(StoreOp::Remove(StateKey::BrandCodePlacementId.as_str()));
                    }
                    BrandOffer::Placement(placement_id) => {
                        ops.push(StoreOp::Remove(StateKey::BrandCodeIsFree.as_str()));
                        ops.push(StoreOp::Set(
                            StateKey::BrandCodePlacementId.as_str(),
                            placement_id,
                        ));
                    }
                }
                (StateKey::BrandCodeId, ops)
            }
        };

        self.store
            .apply(ops)
            .await
            .map_err(|err| Error::storage_write(committed_key.as_str(), err))
    }

    /// Resolve the identity to attach to an event without creating one.
    pub(crate) async fn current_identity(&self) -> Result<Option<Identity>> {
        if let Some(id) = self.get(StateKey::ExternalUserId).await? {
            return Ok(Some(Identity::External(id)));
        }
        Ok(self
            .get(StateKey::AutoGeneratedExternalUserId)
            .await?
            .map(Identity::AutoGenerated))
    }

    /// Get the auto-generated user id, creating and persisting a new UUID v4 if there is none.
    pub(crate) async fn get_or_create_auto_generated_id(&self) -> Result<String> {
        if let Some(id) = self.get(StateKey::AutoGeneratedExternalUserId).await? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.set(StateKey::AutoGeneratedExternalUserId, id.clone())
            .await?;
        log::debug!(target: "shinara", auto_generated_external_user_id = id.as_str(); "generated anonymous user id");
        Ok(id)
    }
}
