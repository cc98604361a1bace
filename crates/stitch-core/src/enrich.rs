//! Best-effort enrichment lookups.
//!
//! Resolves ad → campaign → advertiser and channel → content distributor.
//! A miss is never an error: the enriched field is simply left null. Only a
//! structural failure of the resolver itself (`Err`) aborts a merge.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::event::RawEvent;

/// Campaign metadata resolved from an ad id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignRef {
    pub campaign_id: i64,
    /// `None` when the campaign itself is unknown to the reference data.
    pub advertiser_id: Option<i64>,
}

/// Key-value reference lookups used at merge time.
pub trait EnrichmentResolver {
    /// Resolve an ad to its campaign. `Ok(None)` is a miss.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lookup backend itself fails.
    fn lookup_campaign(&self, ad_id: i64) -> Result<Option<CampaignRef>>;

    /// Resolve a channel to its content distributor. `Ok(None)` is a miss.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lookup backend itself fails.
    fn lookup_distributor(&self, channel_id: i64) -> Result<Option<i64>>;
}

/// Enrichment fields attached to one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Enrichment {
    pub campaign_id: Option<i64>,
    pub advertiser_id: Option<i64>,
    pub content_distributor_id: Option<i64>,
}

/// Resolve all enrichment fields for one raw event.
///
/// # Errors
///
/// Propagates resolver backend failures; misses yield null fields.
pub fn enrich(resolver: &dyn EnrichmentResolver, row: &RawEvent) -> Result<Enrichment> {
    let campaign = match row.ad_id {
        Some(ad_id) => resolver.lookup_campaign(ad_id)?,
        None => None,
    };
    let content_distributor_id = resolver.lookup_distributor(row.channel_id)?;

    Ok(Enrichment {
        campaign_id: campaign.map(|c| c.campaign_id),
        advertiser_id: campaign.and_then(|c| c.advertiser_id),
        content_distributor_id,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdRow {
    pub ad_id: i64,
    pub campaign_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignRow {
    pub campaign_id: i64,
    #[serde(default)]
    pub advertiser_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub channel_id: i64,
    pub content_distributor_id: i64,
}

/// Reference file layout: three flat tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceFile {
    #[serde(default)]
    pub ads: Vec<AdRow>,
    #[serde(default)]
    pub campaigns: Vec<CampaignRow>,
    #[serde(default)]
    pub channels: Vec<ChannelRow>,
}

impl ReferenceFile {
    /// Parse a JSON reference file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON of
    /// the expected shape.
    pub fn from_json_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Counts written by [`save_reference`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReferenceCounts {
    pub ads: usize,
    pub campaigns: usize,
    pub channels: usize,
}

/// Upsert reference rows into the store's `ref_*` tables in one transaction.
///
/// # Errors
///
/// Returns an error if any write fails; nothing is written in that case.
pub fn save_reference(conn: &mut Connection, data: &ReferenceFile) -> Result<ReferenceCounts> {
    let tx = conn.transaction().context("begin reference load")?;
    for ad in &data.ads {
        tx.execute(
            "INSERT INTO ref_ads (ad_id, campaign_id) VALUES (?1, ?2)
             ON CONFLICT(ad_id) DO UPDATE SET campaign_id = excluded.campaign_id",
            params![ad.ad_id, ad.campaign_id],
        )
        .with_context(|| format!("upsert ad {}", ad.ad_id))?;
    }
    for campaign in &data.campaigns {
        tx.execute(
            "INSERT INTO ref_campaigns (campaign_id, advertiser_id) VALUES (?1, ?2)
             ON CONFLICT(campaign_id) DO UPDATE SET advertiser_id = excluded.advertiser_id",
            params![campaign.campaign_id, campaign.advertiser_id],
        )
        .with_context(|| format!("upsert campaign {}", campaign.campaign_id))?;
    }
    for channel in &data.channels {
        tx.execute(
            "INSERT INTO ref_channels (channel_id, content_distributor_id) VALUES (?1, ?2)
             ON CONFLICT(channel_id) DO UPDATE
                 SET content_distributor_id = excluded.content_distributor_id",
            params![channel.channel_id, channel.content_distributor_id],
        )
        .with_context(|| format!("upsert channel {}", channel.channel_id))?;
    }
    tx.commit().context("commit reference load")?;

    let counts = ReferenceCounts {
        ads: data.ads.len(),
        campaigns: data.campaigns.len(),
        channels: data.channels.len(),
    };
    tracing::info!(
        ads = counts.ads,
        campaigns = counts.campaigns,
        channels = counts.channels,
        "reference data loaded"
    );
    Ok(counts)
}

/// In-memory reference snapshot implementing [`EnrichmentResolver`].
///
/// Reference data is small, so the batch cycle snapshots the store's
/// `ref_*` tables once per cycle instead of querying inside the merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceData {
    ads: HashMap<i64, i64>,
    campaigns: HashMap<i64, Option<i64>>,
    channels: HashMap<i64, i64>,
}

impl ReferenceData {
    /// Empty reference data: every lookup misses.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot the store's reference tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference tables cannot be read.
    pub fn load_from_store(conn: &Connection) -> Result<Self> {
        let mut data = Self::default();

        let mut stmt = conn.prepare("SELECT ad_id, campaign_id FROM ref_ads")?;
        for row in stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
            let (ad, campaign) = row.context("read ref_ads row")?;
            data.ads.insert(ad, campaign);
        }

        let mut stmt = conn.prepare("SELECT campaign_id, advertiser_id FROM ref_campaigns")?;
        for row in stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
            let (campaign, advertiser) = row.context("read ref_campaigns row")?;
            data.campaigns.insert(campaign, advertiser);
        }

        let mut stmt = conn.prepare("SELECT channel_id, content_distributor_id FROM ref_channels")?;
        for row in stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
            let (channel, distributor) = row.context("read ref_channels row")?;
            data.channels.insert(channel, distributor);
        }

        Ok(data)
    }

    /// Total number of reference entries across the three tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ads.len() + self.campaigns.len() + self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&ReferenceFile> for ReferenceData {
    fn from(file: &ReferenceFile) -> Self {
        Self {
            ads: file.ads.iter().map(|r| (r.ad_id, r.campaign_id)).collect(),
            campaigns: file
                .campaigns
                .iter()
                .map(|r| (r.campaign_id, r.advertiser_id))
                .collect(),
            channels: file
                .channels
                .iter()
                .map(|r| (r.channel_id, r.content_distributor_id))
                .collect(),
        }
    }
}

impl EnrichmentResolver for ReferenceData {
    fn lookup_campaign(&self, ad_id: i64) -> Result<Option<CampaignRef>> {
        Ok(self.ads.get(&ad_id).map(|&campaign_id| CampaignRef {
            campaign_id,
            advertiser_id: self.campaigns.get(&campaign_id).copied().flatten(),
        }))
    }

    fn lookup_distributor(&self, channel_id: i64) -> Result<Option<i64>> {
        Ok(self.channels.get(&channel_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::event::EventKind;

    fn sample_file() -> ReferenceFile {
        ReferenceFile {
            ads: vec![AdRow {
                ad_id: 5,
                campaign_id: 50,
            }],
            campaigns: vec![CampaignRow {
                campaign_id: 50,
                advertiser_id: Some(500),
            }],
            channels: vec![ChannelRow {
                channel_id: 3,
                content_distributor_id: 30,
            }],
        }
    }

    fn row(ad_id: Option<i64>, channel_id: i64) -> RawEvent {
        RawEvent {
            event_time_us: 10,
            ad_id,
            session_id: "S1".into(),
            viewer_id: "v1".into(),
            event_type: EventKind::CLICK,
            channel_id,
            source_file_name: "a.jsonl".into(),
            source_file_timestamp_us: 0,
        }
    }

    #[test]
    fn full_hit_resolves_every_field() {
        let data = ReferenceData::from(&sample_file());
        let enrichment = enrich(&data, &row(Some(5), 3)).expect("enrich");
        assert_eq!(
            enrichment,
            Enrichment {
                campaign_id: Some(50),
                advertiser_id: Some(500),
                content_distributor_id: Some(30),
            }
        );
    }

    #[test]
    fn null_ad_and_unknown_channel_yield_nulls() {
        let data = ReferenceData::from(&sample_file());
        let enrichment = enrich(&data, &row(None, 99)).expect("enrich");
        assert_eq!(enrichment, Enrichment::default());
    }

    #[test]
    fn known_ad_with_unknown_campaign_keeps_campaign_id() {
        let mut file = sample_file();
        file.campaigns.clear();
        let data = ReferenceData::from(&file);
        let enrichment = enrich(&data, &row(Some(5), 3)).expect("enrich");
        assert_eq!(enrichment.campaign_id, Some(50));
        assert_eq!(enrichment.advertiser_id, None);
    }

    #[test]
    fn store_round_trip_and_upsert() {
        let mut conn = open_in_memory().expect("store");
        let counts = save_reference(&mut conn, &sample_file()).expect("save");
        assert_eq!(counts.ads, 1);

        let mut updated = sample_file();
        updated.channels[0].content_distributor_id = 31;
        save_reference(&mut conn, &updated).expect("save again");

        let data = ReferenceData::load_from_store(&conn).expect("load");
        assert_eq!(data.len(), 3);
        assert_eq!(data.lookup_distributor(3).expect("lookup"), Some(31));
    }

    #[test]
    fn reference_file_parses_with_missing_sections() {
        let file: ReferenceFile =
            serde_json::from_str(r#"{"ads":[{"ad_id":1,"campaign_id":2}]}"#).expect("parse");
        assert_eq!(file.ads.len(), 1);
        assert!(file.channels.is_empty());
    }
}
