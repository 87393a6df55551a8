//! Off-chain oracle price time series, fetched from the data API.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::errors::LoaderError;
use crate::ranges::Range;

/// Client for the price data API.
#[derive(Debug, Clone)]
pub struct PriceApiClient {
    client: reqwest::Client,
    base_url: String,
}

/// One raw sample as the API returns it: unix seconds and a float price.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPriceSample {
    pub t: i64,
    pub v: f64,
}

/// A decoded oracle price sample.
#[derive(Debug, Clone)]
pub struct OraclePriceSample {
    pub datetime: DateTime<Utc>,
    pub price: Decimal,
}

impl PriceApiClient {
    pub fn new(base_url: String) -> Result<Self, LoaderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("beefy-importer/0.3")
            .build()
            .map_err(|e| LoaderError::PriceApi(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base_url })
    }

    /// Fetch the price series of one feed over one date range.
    pub async fn fetch_price_range(
        &self,
        feed_key: &str,
        range: &Range<DateTime<Utc>>,
    ) -> Result<Vec<OraclePriceSample>, LoaderError> {
        let url = format!(
            "{}/api/v2/prices/range?oracle_id={}&from={}&to={}",
            self.base_url,
            feed_key,
            range.from.timestamp(),
            range.to.timestamp()
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LoaderError::PriceApi(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LoaderError::PriceApi(format!(
                "price API returned {} for feed {}",
                response.status(),
                feed_key
            )));
        }
        let raw: Vec<RawPriceSample> = response
            .json()
            .await
            .map_err(|e| LoaderError::PriceApi(format!("malformed price payload: {}", e)))?;

        let mut samples = Vec::with_capacity(raw.len());
        for sample in raw {
            let datetime = Utc
                .timestamp_opt(sample.t, 0)
                .single()
                .ok_or_else(|| {
                    LoaderError::PriceApi(format!("out-of-range timestamp {}", sample.t))
                })?;
            let price = Decimal::from_f64_retain(sample.v).ok_or_else(|| {
                LoaderError::PriceApi(format!("non-finite price {} for {}", sample.v, feed_key))
            })?;
            samples.push(OraclePriceSample { datetime, price });
        }
        debug!(feed = feed_key, samples = samples.len(), "Fetched price range");
        Ok(samples)
    }
}
