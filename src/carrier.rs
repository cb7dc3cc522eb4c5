use serde::Serialize;
use thiserror::Error;

/// Mobile carriers a listing can be tied to. The seller code on an open
/// market listing embeds exactly one of these tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Carrier {
    Sk,
    Kt,
    Lg,
}

impl Carrier {
    pub const ALL: [Carrier; 3] = [Carrier::Sk, Carrier::Kt, Carrier::Lg];

    pub fn token(&self) -> &'static str {
        match self {
            Carrier::Sk => "SK",
            Carrier::Kt => "KT",
            Carrier::Lg => "LG",
        }
    }

    /// The flagship plan shown as the zero-priced default option while a
    /// listing's real options are being rebuilt.
    pub fn default_plan_name(&self) -> &'static str {
        match self {
            Carrier::Sk => "플래티넘",
            Carrier::Kt => "초이스 프리미엄",
            Carrier::Lg => "프리미어 시그니처",
        }
    }
}

#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("seller code `{0}` matches no known carrier")]
    NoMatch(String),
    #[error("seller code `{0}` matches more than one carrier")]
    Ambiguous(String),
}

/// Derives the carrier implied by a seller code. A code is expected to embed
/// exactly one carrier token; anything else is a configuration defect and a
/// hard error, never resolved heuristically.
pub fn resolve_carrier(seller_code: &str) -> Result<Carrier, CarrierError> {
    let mut matches = Carrier::ALL
        .into_iter()
        .filter(|carrier| seller_code.contains(carrier.token()));
    match (matches.next(), matches.next()) {
        (Some(carrier), None) => Ok(carrier),
        (None, _) => Err(CarrierError::NoMatch(seller_code.to_string())),
        (Some(_), Some(_)) => Err(CarrierError::Ambiguous(seller_code.to_string())),
    }
}

/// Contract type a listing sells under, encoded in its seller code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    /// Number portability from another carrier (`MNP` in the seller code).
    CarrierSwitch,
    /// Device change on the same carrier.
    DeviceChange,
}

impl ContractType {
    /// Label the catalog stores on internal price options.
    pub fn label(&self) -> &'static str {
        match self {
            ContractType::CarrierSwitch => "번호이동",
            ContractType::DeviceChange => "기기변경",
        }
    }
}

pub fn contract_type_for(seller_code: &str) -> ContractType {
    if seller_code.contains("MNP") {
        ContractType::CarrierSwitch
    } else {
        ContractType::DeviceChange
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_single_token() {
        assert_eq!(resolve_carrier("LG-MNP-S24U").unwrap(), Carrier::Lg);
        assert_eq!(resolve_carrier("phone_KT_chg_01").unwrap(), Carrier::Kt);
    }

    #[test]
    fn rejects_unknown_code() {
        assert!(matches!(
            resolve_carrier("MVNO-S24"),
            Err(CarrierError::NoMatch(_))
        ));
        assert!(matches!(resolve_carrier(""), Err(CarrierError::NoMatch(_))));
    }

    #[test]
    fn rejects_ambiguous_code() {
        assert!(matches!(
            resolve_carrier("SK-KT-mixed"),
            Err(CarrierError::Ambiguous(_))
        ));
    }

    #[test]
    fn contract_type_from_seller_code() {
        assert_eq!(contract_type_for("LG-MNP-S24U"), ContractType::CarrierSwitch);
        assert_eq!(contract_type_for("LG-CHG-S24U"), ContractType::DeviceChange);
    }

    #[test]
    fn every_carrier_has_a_default_plan() {
        for carrier in Carrier::ALL {
            assert!(!carrier.default_plan_name().is_empty());
        }
    }
}
