use crate::http::build_client;
use crate::market::config::{API_KEY_HEADER, MARKET_API_KEY, MARKET_HOST};
use crate::market::xml::{
    self, MarketOption, PriceReply,
};
use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use urlencoding::encode;

#[derive(Debug, Error)]
pub enum MarketError {
    /// The HTTP client's own timeout fired; negotiation counts this as a
    /// failed round instead of aborting.
    #[error("marketplace request timed out")]
    Timeout,
    #[error("marketplace request failed: {0}")]
    Request(String),
    #[error("unreadable marketplace response: {0}")]
    InvalidResponse(String),
}

impl MarketError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MarketError::Timeout
        } else {
            MarketError::Request(err.to_string())
        }
    }
}

/// One round of the price endpoint, as seen by the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceOutcome {
    /// The marketplace applied the proposed price and echoed it back.
    Accepted(u32),
    /// The marketplace kept `previous` on file and refused the proposal.
    Rejected { previous: u32 },
}

/// Boundary to the open market's product API. Object-safe so the pipeline
/// and negotiator can be exercised against stubs.
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Fully replaces the listing's option set; options are never patched
    /// incrementally.
    async fn replace_options(
        &self,
        external_id: &str,
        options: &[MarketOption],
    ) -> Result<(), MarketError>;

    /// Proposes a sell price for the listing.
    async fn propose_price(
        &self,
        external_id: &str,
        price: u32,
    ) -> Result<PriceOutcome, MarketError>;
}

/// Production client for the 11st open API.
pub struct ElevenStClient {
    http: Client,
}

impl ElevenStClient {
    pub fn new() -> Self {
        Self {
            http: build_client(),
        }
    }
}

impl Default for ElevenStClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Marketplace for ElevenStClient {
    async fn replace_options(
        &self,
        external_id: &str,
        options: &[MarketOption],
    ) -> Result<(), MarketError> {
        let url = format!(
            "{}/updateProductOption/{}",
            *MARKET_HOST,
            encode(external_id)
        );
        let payload = xml::option_update_payload(options);
        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, MARKET_API_KEY.as_str())
            .body(payload)
            .send()
            .await
            .map_err(MarketError::from_reqwest)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MarketError::Request(format!(
                "option update HTTP {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn propose_price(
        &self,
        external_id: &str,
        price: u32,
    ) -> Result<PriceOutcome, MarketError> {
        let url = format!(
            "{}/product/priceCoupon/{}",
            *MARKET_HOST,
            encode(external_id)
        );
        let payload = xml::price_update_payload(price);
        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, MARKET_API_KEY.as_str())
            .body(payload)
            .send()
            .await
            .map_err(MarketError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(MarketError::Request(format!(
                "price update HTTP {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(MarketError::from_reqwest)?;
        let reply: PriceReply = xml::parse_price_reply(&body)
            .map_err(|err| MarketError::InvalidResponse(err.to_string()))?;

        if reply.rejected {
            // parse_price_reply guarantees the previous price on rejection
            let previous = reply.previous_price.ok_or_else(|| {
                MarketError::InvalidResponse("rejection without preSelPrc".to_string())
            })?;
            Ok(PriceOutcome::Rejected { previous })
        } else {
            Ok(PriceOutcome::Accepted(price))
        }
    }
}
