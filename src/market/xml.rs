//! Wire-format adapters for the marketplace's XML API. Request bodies are
//! small fixed templates rendered directly; responses go through quick-xml.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// Literal marker the marketplace embeds in `message` when a price update is
/// rejected.
pub const REJECTION_MARKER: &str = "실패";

/// One `<ProductOption>` entry. `price_delta` is relative to the listing's
/// registered sell price, which is how the option endpoint expects prices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketOption {
    pub plan_name: String,
    pub price_delta: i64,
}

fn product_option_xml(option: &MarketOption) -> String {
    format!(
        "<ProductOption>\n  <useYn>Y</useYn>\n  <colOptPrice>{price}</colOptPrice>\n  <colValue0>{plan}</colValue0>\n  <colCount>10</colCount>\n  <colSellerStockCd>CDESAD001</colSellerStockCd>\n</ProductOption>",
        price = option.price_delta,
        plan = escape(option.plan_name.as_str()),
    )
}

/// Full replacement payload for `POST /updateProductOption/{id}`.
pub fn option_update_payload(options: &[MarketOption]) -> String {
    let body = options
        .iter()
        .map(product_option_xml)
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n<Product>\n  <optSelectYn>Y</optSelectYn>\n  <txtColCnt>1</txtColCnt>\n  <colTitle>요금제</colTitle>\n  <prdExposeClfCd>01</prdExposeClfCd>\n{body}\n</Product>\n"
    )
}

/// Payload for `POST /product/priceCoupon/{id}`.
pub fn price_update_payload(price: u32) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n<Product>\n  <selPrc>{price}</selPrc>\n  <cuponcheck>N</cuponcheck>\n</Product>\n"
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceReply {
    pub rejected: bool,
    /// Last price still on file, returned only alongside a rejection.
    pub previous_price: Option<u32>,
}

#[derive(Debug, Error)]
pub enum PriceReplyError {
    #[error("price response carries no message field")]
    MissingMessage,
    #[error("rejection without a preSelPrc field")]
    MissingPreviousPrice,
    #[error("malformed price response: {0}")]
    Malformed(String),
}

/// Parses the `priceCoupon` response: a `message` text (rejection is flagged
/// by a literal failure marker) and, on rejection, the `preSelPrc` the
/// negotiation should retreat from.
pub fn parse_price_reply(xml: &str) -> Result<PriceReply, PriceReplyError> {
    let message =
        text_of(xml, "message").map_err(PriceReplyError::Malformed)?;
    let message = message.ok_or(PriceReplyError::MissingMessage)?;

    if !message.contains(REJECTION_MARKER) {
        return Ok(PriceReply {
            rejected: false,
            previous_price: None,
        });
    }

    let previous = text_of(xml, "preSelPrc")
        .map_err(PriceReplyError::Malformed)?
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .ok_or(PriceReplyError::MissingPreviousPrice)?;
    Ok(PriceReply {
        rejected: true,
        previous_price: Some(previous),
    })
}

fn text_of(xml: &str, tag: &str) -> Result<Option<String>, String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if start.name().as_ref() == tag.as_bytes() => {
                return reader
                    .read_text(start.name())
                    .map(|text| Some(text.trim().to_string()))
                    .map_err(|err| err.to_string());
            }
            Ok(Event::Eof) => return Ok(None),
            Err(err) => return Err(err.to_string()),
            _ => {}
        }
    }
}
