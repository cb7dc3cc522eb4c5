#![allow(dead_code)]

use once_cell::sync::Lazy;
use std::env;

pub static MARKET_ENV: Lazy<String> =
    Lazy::new(|| env::var("MARKET_ENV").unwrap_or_else(|_| "SANDBOX".to_string()));

pub static MARKET_API_KEY: Lazy<String> =
    Lazy::new(|| env::var("MARKET_OPENAPI_KEY").unwrap_or_default());

pub static MARKET_HOST: Lazy<String> = Lazy::new(|| {
    if let Ok(host) = env::var("MARKET_HOST") {
        return host.trim_end_matches('/').to_string();
    }
    if MARKET_ENV.as_str().eq_ignore_ascii_case("PROD") {
        "https://api.11st.co.kr/rest".to_string()
    } else {
        "https://api.sandbox.11st.co.kr/rest".to_string()
    }
});

/// Header carrying the static marketplace API key.
pub const API_KEY_HEADER: &str = "openapikey";
