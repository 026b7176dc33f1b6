// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Announcement scanner.
//!
//! A single global task that trial-derives every unattributed announcement
//! against every registered user's viewing key. Each pass pages through the
//! backlog in keyset order, so users registered after an announcement was
//! ingested are matched on the next pass without any extra bookkeeping.
//! Matches persist the derived stealth address and flag the announcement
//! atomically; everything else stays in the backlog.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use veil_indexer_schema::models::{StoredAnnouncement, StoredUserStealthAddress};

use crate::config::ScannerConfig;
use crate::error::IndexerResult;
use crate::metrics::IndexerMetrics;
use crate::stealth::{view_tag_from_metadata, StealthKeys, SCHEME_ID_SECP256K1};
use crate::store::{AnnouncementKey, Store};

pub struct AnnouncementScanner {
    store: Store,
    config: ScannerConfig,
    metrics: IndexerMetrics,
}

struct UserKeys {
    user_id: i64,
    keys: StealthKeys,
}

impl AnnouncementScanner {
    pub fn new(store: Store, config: ScannerConfig, metrics: IndexerMetrics) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> IndexerResult<()> {
        info!("Starting announcement scanner");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Announcement scanner shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }
            if let Err(e) = self.scan_pass().await {
                warn!("Scan pass failed: {e:?}");
                self.metrics
                    .indexer_errors
                    .with_label_values(&["scanner", e.error_type()])
                    .inc();
            }
        }
    }

    async fn scan_pass(&self) -> IndexerResult<()> {
        let users = self.load_users().await?;
        if users.is_empty() {
            return Ok(());
        }

        let mut after: Option<AnnouncementKey> = None;
        loop {
            let page = self
                .store
                .unattributed_announcements(after, self.config.page_size)
                .await?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            after = Some(AnnouncementKey::of(last));
            let exhausted = (page.len() as i64) < self.config.page_size;

            for announcement in &page {
                self.scan_announcement(announcement, &users).await?;
            }
            if exhausted {
                return Ok(());
            }
        }
    }

    async fn load_users(&self) -> IndexerResult<Vec<UserKeys>> {
        let mut users = Vec::new();
        for user in self.store.all_users().await? {
            match StealthKeys::from_bytes(&user.spending_pub_key, &user.viewing_priv_key) {
                Ok(keys) => users.push(UserKeys {
                    user_id: user.id,
                    keys,
                }),
                Err(e) => warn!("User {} has unusable keys: {e:?}", user.id),
            }
        }
        Ok(users)
    }

    async fn scan_announcement(
        &self,
        announcement: &StoredAnnouncement,
        users: &[UserKeys],
    ) -> IndexerResult<()> {
        let Some(view_tag) = scan_disposition(announcement) else {
            // A foreign scheme or malformed metadata can never match any
            // user, now or later; drop the row from the scan set for good.
            self.store
                .skip_announcement(AnnouncementKey::of(announcement))
                .await?;
            return Ok(());
        };

        for user in users {
            let derived = match user.keys.scan(&announcement.ephemeral_pub_key, view_tag) {
                Ok(Some(address)) => address,
                Ok(None) => {
                    self.metrics.scan_view_tag_rejections.inc();
                    continue;
                }
                Err(_) => {
                    // A bad ephemeral key fails identically for every user.
                    self.store
                        .skip_announcement(AnnouncementKey::of(announcement))
                        .await?;
                    return Ok(());
                }
            };
            if derived.as_bytes() != announcement.stealth_address.as_slice() {
                continue;
            }

            self.store
                .attribute_announcement(
                    StoredUserStealthAddress {
                        address: announcement.stealth_address.clone(),
                        user_id: user.user_id,
                        signer_address: user.keys.signer_address().as_bytes().to_vec(),
                        ephemeral_pub_key: announcement.ephemeral_pub_key.clone(),
                        view_tag: view_tag as i16,
                        label: None,
                    },
                    announcement.chain_id,
                    announcement.block_number,
                    announcement.tx_index,
                    announcement.log_index,
                )
                .await?;
            // Transfers indexed before this address was attributed get their
            // stealth flags backfilled.
            let relinked = self
                .store
                .relink_traces(&announcement.stealth_address)
                .await?;
            if relinked > 0 {
                info!(
                    "Backfilled {relinked} trace rows for stealth address 0x{}",
                    hex::encode(&announcement.stealth_address)
                );
            }
            // Transfer passes that already ran past the announcement block
            // could not have seen this address; rewind them so the range is
            // re-indexed with the address known.
            let rewound = self
                .store
                .rewind_transfer_cursors(announcement.chain_id, announcement.block_number)
                .await?;
            if rewound > 0 {
                info!(
                    "[{}] Rewound {rewound} transfer cursors to block {}",
                    announcement.chain_id,
                    announcement.block_number - 1
                );
            }
            self.metrics
                .announcements_attributed
                .with_label_values(&[&announcement.chain_id.to_string()])
                .inc();
            return Ok(());
        }
        Ok(())
    }
}

/// Classifies an announcement before trial derivation: `Some(view_tag)` for
/// scannable rows, `None` for rows no user can ever match.
fn scan_disposition(announcement: &StoredAnnouncement) -> Option<u8> {
    if announcement.scheme_id != SCHEME_ID_SECP256K1 as i64 {
        return None;
    }
    view_tag_from_metadata(&announcement.metadata).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stealth::prepare_stealth_payment;
    use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
    use ethers::core::k256::SecretKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    // The store-backed paths are covered by the ignored postgres tests in
    // the store module; here we exercise the matching logic end to end.
    #[test]
    fn test_announcement_matching_against_multiple_users() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut users = Vec::new();
        let mut pubs = Vec::new();
        for id in 0..3i64 {
            let spending = SecretKey::random(&mut rng);
            let viewing = SecretKey::random(&mut rng);
            let spending_pub = spending.public_key().to_encoded_point(true).as_bytes().to_vec();
            let viewing_pub = viewing.public_key().to_encoded_point(true).as_bytes().to_vec();
            users.push(UserKeys {
                user_id: id,
                keys: StealthKeys::from_bytes(&spending_pub, &viewing.to_bytes()).unwrap(),
            });
            pubs.push((spending_pub, viewing_pub));
        }

        // Payment addressed to user 1
        let ephemeral = SecretKey::random(&mut rng);
        let (derivation, ephemeral_pub) =
            prepare_stealth_payment(&pubs[1].0, &pubs[1].1, &ephemeral).unwrap();

        let matches: Vec<i64> = users
            .iter()
            .filter(|u| {
                u.keys
                    .matches_announcement(
                        &ephemeral_pub,
                        derivation.view_tag,
                        derivation.address.as_bytes(),
                    )
                    .unwrap()
            })
            .map(|u| u.user_id)
            .collect();
        assert_eq!(matches, vec![1]);
    }

    fn stored(scheme_id: i64, metadata: Vec<u8>) -> StoredAnnouncement {
        StoredAnnouncement {
            chain_id: 1,
            block_number: 100,
            tx_index: 0,
            log_index: 0,
            scheme_id,
            stealth_address: vec![0xaa; 20],
            ephemeral_pub_key: vec![0x02; 33],
            metadata,
            caller: vec![0xcc; 20],
            attributed: false,
            skipped: false,
        }
    }

    #[test]
    fn test_unmatchable_announcements_are_terminal() {
        assert_eq!(scan_disposition(&stored(1, vec![0xf1, 0x00])), Some(0xf1));
        // Foreign scheme: no secp256k1 derivation exists.
        assert_eq!(scan_disposition(&stored(2, vec![0xf1])), None);
        // Empty metadata carries no view tag.
        assert_eq!(scan_disposition(&stored(1, Vec::new())), None);
    }
}
