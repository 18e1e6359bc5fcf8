//! Query/filter façade over the store.
//!
//! Every call reads one consistent snapshot of the last committed mirror
//! state; reconciliation hiccups never surface here, the façade simply
//! keeps serving the freshest state it has (availability over freshness).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sg_common::{Address, Amount, ListingKey, TicketTier};

use crate::lifecycle::{Auction, AuctionStatus};
use crate::store::{MarketStore, UserBalance};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    /// Soonest-ending first.
    EndTime,
    /// Highest current bid first ("popular").
    HighestBid,
}

/// Filter for [`QueryFacade::list_active`]. All fields are optional and
/// combine conjunctively.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AuctionFilter {
    pub tier: Option<TicketTier>,
    /// Only auctions ending within this many seconds of `now`.
    pub ending_within_secs: Option<u64>,
    pub sort_by: Option<SortBy>,
}

/// Read-model of an auction: the mirrored record plus the lazily derived
/// status and the minimum admissible next bid.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionView {
    pub key: ListingKey,
    pub seller: Address,
    pub tier: Option<TicketTier>,
    pub starting_price: Amount,
    pub reserve_price: Amount,
    pub min_bid_increment: Amount,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AuctionStatus,
    pub highest_bid: Amount,
    pub highest_bidder: Option<Address>,
    pub extension_count: u32,
    pub reserve_met: Option<bool>,
    pub minimum_next_bid: Amount,
}

pub struct QueryFacade {
    store: Arc<MarketStore>,
}

impl QueryFacade {
    pub fn new(store: Arc<MarketStore>) -> Self {
        Self { store }
    }

    /// Active auctions matching `filter`, evaluated at `now`.
    pub fn list_active(&self, filter: &AuctionFilter, now: DateTime<Utc>) -> Vec<AuctionView> {
        let snapshot = self.store.snapshot();
        let lifecycle = self.store.lifecycle();

        let mut views: Vec<AuctionView> = snapshot
            .auctions()
            .filter(|a| lifecycle.effective_status(a, now) == AuctionStatus::Active)
            .filter(|a| filter.tier.is_none() || a.tier == filter.tier)
            .filter(|a| match filter.ending_within_secs {
                Some(secs) => a.end_time - now <= Duration::seconds(secs as i64),
                None => true,
            })
            .map(|a| self.view(a, now))
            .collect();

        match filter.sort_by {
            Some(SortBy::HighestBid) => {
                views.sort_by(|a, b| b.highest_bid.cmp(&a.highest_bid).then(a.key.cmp(&b.key)))
            }
            // Soonest-ending first is also the default presentation.
            Some(SortBy::EndTime) | None => {
                views.sort_by(|a, b| a.end_time.cmp(&b.end_time).then(a.key.cmp(&b.key)))
            }
        }
        views
    }

    pub fn get_auction(&self, key: &ListingKey, now: DateTime<Utc>) -> Option<AuctionView> {
        let snapshot = self.store.snapshot();
        snapshot.auction(key).map(|a| self.view(a, now))
    }

    pub fn user_balance(&self, account: Address, event: Address) -> Option<UserBalance> {
        self.store.snapshot().balance(account, event).copied()
    }

    /// Ticket keys currently owned by `owner`, per the ownership mirror.
    pub fn holdings(&self, owner: Address) -> Vec<ListingKey> {
        let mut keys: Vec<ListingKey> = self.store.snapshot().holdings(owner).collect();
        keys.sort();
        keys
    }

    fn view(&self, auction: &Auction, now: DateTime<Utc>) -> AuctionView {
        let lifecycle = self.store.lifecycle();
        AuctionView {
            key: auction.key,
            seller: auction.seller,
            tier: auction.tier,
            starting_price: auction.starting_price,
            reserve_price: auction.reserve_price,
            min_bid_increment: auction.min_bid_increment,
            start_time: auction.start_time,
            end_time: auction.end_time,
            status: lifecycle.effective_status(auction, now),
            highest_bid: auction.highest_bid,
            highest_bidder: auction.highest_bidder,
            extension_count: auction.extension_count,
            reserve_met: auction.reserve_met,
            minimum_next_bid: lifecycle.minimum_bid(auction),
        }
    }
}
