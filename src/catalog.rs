use crate::http::build_client;
use crate::pricing::PriceOptionRow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no marketplace listing with id {0}")]
    ListingNotFound(i64),
    #[error("catalog request failed: {0}")]
    Request(String),
    #[error("invalid catalog response: {0}")]
    Deserialize(String),
    #[error("listing {listing_id} has commission_rate {rate}, expected 0 <= r < 1")]
    InvalidCommissionRate { listing_id: i64, rate: f64 },
}

/// Everything a pipeline run needs to know about one marketplace listing,
/// fetched up front so the stages themselves do no hidden reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingSnapshot {
    pub id: i64,
    /// Listing id on the external marketplace.
    pub external_id: String,
    pub seller_code: String,
    pub device_variant_id: i64,
    /// Sell price currently on file with the marketplace.
    pub registered_price: u32,
    /// Fraction of the sell price the marketplace keeps, 0 ≤ r < 1.
    pub commission_rate: f64,
    /// Percent above the registered price that option prices may reach.
    pub ceiling_rate: f64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ListingSnapshot {
    /// A commission rate at or above 1 makes the gross-up divide by zero or
    /// go negative, so a bad row is rejected before any stage runs.
    pub fn check_rates(&self) -> Result<(), CatalogError> {
        if !(0.0..1.0).contains(&self.commission_rate) {
            return Err(CatalogError::InvalidCommissionRate {
                listing_id: self.id,
                rate: self.commission_rate,
            });
        }
        Ok(())
    }
}

/// Boundary to the catalog database. The listing row is mutated only through
/// [`Catalog::update_registered_price`]; everything else is read-only input.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn fetch_listing(&self, listing_id: i64) -> Result<ListingSnapshot, CatalogError>;

    /// All internal price options for the listing's device variant. The
    /// selector narrows these down by carrier, contract, and discount type.
    async fn fetch_price_options(
        &self,
        device_variant_id: i64,
    ) -> Result<Vec<PriceOptionRow>, CatalogError>;

    /// Persists the accepted price and the sync timestamp in one request, so
    /// no observer can see one without the other. Called only after the
    /// marketplace has confirmed the price.
    async fn update_registered_price(
        &self,
        listing_id: i64,
        price: u32,
        synced_at: DateTime<Utc>,
    ) -> Result<(), CatalogError>;
}

/// Production catalog access over the backend's PostgREST endpoint.
#[derive(Debug, Clone)]
pub struct RestCatalog {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct PlanRow {
    short_name: String,
    price: u32,
    carrier: String,
}

#[derive(Debug, Deserialize)]
struct OptionRow {
    final_price: u32,
    contract_type: String,
    discount_type: String,
    plan: PlanRow,
}

#[derive(Debug, Serialize)]
struct PriceUpdate {
    registered_price: u32,
    last_synced_at: DateTime<Utc>,
}

impl RestCatalog {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("CATALOG_URL").ok()?;
        let service_key = std::env::var("CATALOG_SERVICE_KEY").ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }
}

#[async_trait]
impl Catalog for RestCatalog {
    async fn fetch_listing(&self, listing_id: i64) -> Result<ListingSnapshot, CatalogError> {
        let path = format!(
            "/rest/v1/open_market_listing?id=eq.{listing_id}&select=*&limit=1"
        );
        let response = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Request(format!("HTTP {}", response.status())));
        }
        let mut rows: Vec<ListingSnapshot> = response
            .json()
            .await
            .map_err(|err| CatalogError::Deserialize(err.to_string()))?;
        rows.pop().ok_or(CatalogError::ListingNotFound(listing_id))
    }

    async fn fetch_price_options(
        &self,
        device_variant_id: i64,
    ) -> Result<Vec<PriceOptionRow>, CatalogError> {
        let path = format!(
            "/rest/v1/product_option?device_variant_id=eq.{device_variant_id}\
             &select=final_price,contract_type,discount_type,plan:plan(short_name,price,carrier)"
        );
        let response = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Request(format!("HTTP {}", response.status())));
        }
        let rows: Vec<OptionRow> = response
            .json()
            .await
            .map_err(|err| CatalogError::Deserialize(err.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| PriceOptionRow {
                plan_name: row.plan.short_name,
                plan_monthly_price: row.plan.price,
                carrier: row.plan.carrier,
                contract_type: row.contract_type,
                discount_type: row.discount_type,
                final_price: row.final_price,
            })
            .collect())
    }

    async fn update_registered_price(
        &self,
        listing_id: i64,
        price: u32,
        synced_at: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        let path = format!("/rest/v1/open_market_listing?id=eq.{listing_id}");
        let response = self
            .request(reqwest::Method::PATCH, &path)
            .header("Prefer", "return=minimal")
            .json(&PriceUpdate {
                registered_price: price,
                last_synced_at: synced_at,
            })
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(commission_rate: f64) -> ListingSnapshot {
        ListingSnapshot {
            id: 7,
            external_id: "9105055842".to_string(),
            seller_code: "SK-MNP-S24U".to_string(),
            device_variant_id: 3,
            registered_price: 500_000,
            commission_rate,
            ceiling_rate: 10.0,
            last_synced_at: None,
        }
    }

    #[test]
    fn rates_within_range_pass() {
        assert!(snapshot(0.0).check_rates().is_ok());
        assert!(snapshot(0.14).check_rates().is_ok());
    }

    #[test]
    fn full_commission_is_rejected() {
        assert!(matches!(
            snapshot(1.0).check_rates(),
            Err(CatalogError::InvalidCommissionRate { listing_id: 7, .. })
        ));
        assert!(matches!(
            snapshot(-0.1).check_rates(),
            Err(CatalogError::InvalidCommissionRate { .. })
        ));
    }
}
