pub mod client;
pub mod config;
pub mod xml;

pub use client::{ElevenStClient, MarketError, Marketplace, PriceOutcome};
pub use xml::MarketOption;
