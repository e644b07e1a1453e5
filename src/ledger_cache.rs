//! Cached ledger views served through [`CachedFetcher`], one TTL per kind of data.

use crate::cache::CacheKey;
use crate::client::{LedgerClient, NftOfferBook};
use crate::error::LedgerError;
use crate::fetch::{CachedFetcher, Fetched};
use crate::protocol::{AccountInfo, NfToken};
use crate::settings::Settings;
use std::time::Duration;

pub const ACCOUNT_INFO_KIND: &str = "account_info";
pub const ACCOUNT_NFTS_KIND: &str = "account_nfts";
pub const NFT_OFFERS_KIND: &str = "nft_offers";

#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub account_info: Duration,
    pub nfts: Duration,
    pub nft_offers: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            account_info: Duration::from_secs(10),
            nfts: Duration::from_secs(60),
            nft_offers: Duration::from_secs(30),
        }
    }
}

impl CacheTtls {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            account_info: Duration::from_secs(settings.cache.account_info_ttl_seconds),
            nfts: Duration::from_secs(settings.cache.nfts_ttl_seconds),
            nft_offers: Duration::from_secs(settings.cache.nft_offers_ttl_seconds),
        }
    }
}

#[derive(Clone)]
pub struct LedgerCache {
    client: LedgerClient,
    fetcher: CachedFetcher,
    ttls: CacheTtls,
}

impl LedgerCache {
    pub fn new(client: LedgerClient, fetcher: CachedFetcher, ttls: CacheTtls) -> Self {
        Self {
            client,
            fetcher,
            ttls,
        }
    }

    pub fn client(&self) -> &LedgerClient {
        &self.client
    }

    pub fn fetcher(&self) -> &CachedFetcher {
        &self.fetcher
    }

    pub fn key(&self, kind: &str, param: &str) -> CacheKey {
        CacheKey::new(kind, self.client.network(), &[param])
    }

    pub async fn account_info(&self, account: &str) -> Result<Fetched<AccountInfo>, LedgerError> {
        let client = self.client.clone();
        let account_owned = account.to_string();
        self.fetcher
            .fetch_with_revalidate(
                &self.key(ACCOUNT_INFO_KIND, account),
                move || {
                    let client = client.clone();
                    let account = account_owned.clone();
                    async move { client.account_info(&account).await }
                },
                self.ttls.account_info,
                None,
            )
            .await
    }

    /// Every NFT owned by `account`.
    pub async fn account_nfts(&self, account: &str) -> Result<Fetched<Vec<NfToken>>, LedgerError> {
        let client = self.client.clone();
        let account_owned = account.to_string();
        self.fetcher
            .fetch_with_revalidate(
                &self.key(ACCOUNT_NFTS_KIND, account),
                move || {
                    let client = client.clone();
                    let account = account_owned.clone();
                    async move { client.get_all_nfts(&account).await }
                },
                self.ttls.nfts,
                None,
            )
            .await
    }

    pub async fn nft_offers(&self, nft_id: &str) -> Result<Fetched<NftOfferBook>, LedgerError> {
        let client = self.client.clone();
        let nft_id_owned = nft_id.to_string();
        self.fetcher
            .fetch_with_revalidate(
                &self.key(NFT_OFFERS_KIND, nft_id),
                move || {
                    let client = client.clone();
                    let nft_id = nft_id_owned.clone();
                    async move { client.nft_offers(&nft_id).await }
                },
                self.ttls.nft_offers,
                None,
            )
            .await
    }

    /// Drops the cached views that mention `account`.
    pub async fn invalidate_account(&self, account: &str) {
        if let Some(store) = self.fetcher.store() {
            for kind in [ACCOUNT_INFO_KIND, ACCOUNT_NFTS_KIND] {
                let key = self.key(kind, account);
                if let Err(e) = store.delete(key.as_str()).await {
                    log::warn!("⚠️ [LedgerCache] Could not invalidate {}: {}", key, e);
                }
            }
        }
    }
}
