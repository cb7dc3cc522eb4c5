use crate::carrier::{Carrier, ContractType};
use serde::Serialize;

/// Discount type used for publicly listed prices; other discount schemes are
/// never exposed as marketplace options.
pub const STANDARD_SUBSIDY: &str = "공시지원금";

/// Half-up rounding to the nearest 1,000 won, the marketplace's pricing
/// granularity for options.
pub fn round_to_1000(value: f64) -> u32 {
    ((value / 1000.0).round() * 1000.0).max(0.0) as u32
}

/// Ceiling to the next 100 won; the price endpoint only accepts 100-won
/// increments.
pub fn ceil_to_100(value: f64) -> u32 {
    ((value / 100.0).ceil() * 100.0).max(0.0) as u32
}

/// Marketplace-facing sell price for one internal price option.
///
/// `margin` is the operator-chosen minimum net profit per unit; dividing by
/// `1 - commission_rate` grosses the net target up to a sell price that still
/// nets `final_price + margin` after the marketplace takes its cut.
pub fn option_price(final_price: u32, margin: u32, commission_rate: f64) -> u32 {
    round_to_1000(f64::from(final_price + margin) / (1.0 - commission_rate))
}

/// Upper bound for option prices: `ceiling_rate` percent above the currently
/// registered sell price, at 1,000-won granularity.
pub fn option_ceiling(registered_price: u32, ceiling_rate: f64) -> u32 {
    round_to_1000(f64::from(registered_price) * (1.0 + ceiling_rate / 100.0))
}

/// One internal price option as read from the catalog: a (device variant,
/// carrier, contract type, discount type) tuple with its computed final
/// price and the underlying plan.
#[derive(Debug, Clone)]
pub struct PriceOptionRow {
    pub plan_name: String,
    pub plan_monthly_price: u32,
    pub carrier: String,
    pub contract_type: String,
    pub discount_type: String,
    pub final_price: u32,
}

/// A plan variant ready to be pushed to the marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedOption {
    pub plan_name: String,
    pub price: u32,
}

/// Filters and ranks internal price options into the subset usable as
/// marketplace options for one listing.
///
/// Keeps rows for the resolved carrier, the contract type implied by the
/// seller code, and the standard-subsidy discount; prices each survivor via
/// [`option_price`]; drops anything at or above the ceiling; orders the rest
/// ascending by plan monthly price so cheaper plans surface first. An empty
/// result is valid; the listing then only offers its default option.
pub fn select_options(
    registered_price: u32,
    ceiling_rate: f64,
    commission_rate: f64,
    margin: u32,
    carrier: Carrier,
    contract: ContractType,
    rows: &[PriceOptionRow],
) -> Vec<SelectedOption> {
    let ceiling = option_ceiling(registered_price, ceiling_rate);
    let mut candidates: Vec<&PriceOptionRow> = rows
        .iter()
        .filter(|row| {
            row.carrier == carrier.token()
                && row.contract_type == contract.label()
                && row.discount_type == STANDARD_SUBSIDY
        })
        .collect();
    candidates.sort_by_key(|row| row.plan_monthly_price);

    candidates
        .into_iter()
        .filter_map(|row| {
            let price = option_price(row.final_price, margin, commission_rate);
            (price < ceiling).then(|| SelectedOption {
                plan_name: row.plan_name.clone(),
                price,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(plan: &str, monthly: u32, final_price: u32) -> PriceOptionRow {
        PriceOptionRow {
            plan_name: plan.to_string(),
            plan_monthly_price: monthly,
            carrier: "SK".to_string(),
            contract_type: "기기변경".to_string(),
            discount_type: STANDARD_SUBSIDY.to_string(),
            final_price,
        }
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_to_1000(480_499.0), 480_000);
        assert_eq!(round_to_1000(480_500.0), 481_000);
        assert_eq!(ceil_to_100(119_901.0), 120_000);
        assert_eq!(ceil_to_100(120_000.0), 120_000);
    }

    #[test]
    fn option_price_grosses_up_for_commission() {
        // (400_000 + 30_000) / (1 - 0.14) = 500_000
        assert_eq!(option_price(400_000, 30_000, 0.14), 500_000);
        // zero commission passes the net target through
        assert_eq!(option_price(400_000, 30_000, 0.0), 430_000);
    }

    #[test]
    fn option_price_monotone_in_inputs() {
        let base = option_price(300_000, 30_000, 0.1);
        assert!(option_price(310_000, 30_000, 0.1) >= base);
        assert!(option_price(300_000, 40_000, 0.1) >= base);
        assert!(base > 0);
    }

    #[test]
    fn ceiling_matches_scenario_a() {
        // registered 480_000 at 10% -> 528_000
        assert_eq!(option_ceiling(480_000, 10.0), 528_000);
    }

    #[test]
    fn selector_drops_prices_at_or_above_ceiling() {
        let rows = vec![
            row("cheap", 45_000, 300_000),
            row("mid", 69_000, 420_000),
            row("heavy", 109_000, 900_000),
        ];
        let selected = select_options(
            500_000,
            10.0,
            0.1,
            30_000,
            Carrier::Sk,
            ContractType::DeviceChange,
            &rows,
        );
        let ceiling = option_ceiling(500_000, 10.0);
        assert!(selected.iter().all(|opt| opt.price < ceiling));
        assert!(selected.len() < rows.len());
    }

    #[test]
    fn removing_ceiling_never_shrinks_candidates() {
        let rows = vec![
            row("a", 45_000, 300_000),
            row("b", 69_000, 500_000),
            row("c", 109_000, 800_000),
        ];
        let bounded = select_options(
            500_000,
            10.0,
            0.1,
            30_000,
            Carrier::Sk,
            ContractType::DeviceChange,
            &rows,
        );
        // an effectively unbounded ceiling keeps every carrier/contract match
        let unbounded = select_options(
            u32::MAX / 2,
            10.0,
            0.1,
            30_000,
            Carrier::Sk,
            ContractType::DeviceChange,
            &rows,
        );
        assert!(unbounded.len() >= bounded.len());
        assert_eq!(unbounded.len(), rows.len());
    }

    #[test]
    fn selector_orders_by_plan_monthly_price() {
        let rows = vec![
            row("heavy", 109_000, 350_000),
            row("cheap", 45_000, 400_000),
            row("mid", 69_000, 380_000),
        ];
        let selected = select_options(
            900_000,
            10.0,
            0.1,
            30_000,
            Carrier::Sk,
            ContractType::DeviceChange,
            &rows,
        );
        let names: Vec<&str> = selected.iter().map(|o| o.plan_name.as_str()).collect();
        assert_eq!(names, vec!["cheap", "mid", "heavy"]);
    }

    #[test]
    fn selector_ignores_other_carriers_and_discounts() {
        let mut other_carrier = row("kt-plan", 45_000, 300_000);
        other_carrier.carrier = "KT".to_string();
        let mut other_discount = row("select-deal", 45_000, 300_000);
        other_discount.discount_type = "선택약정".to_string();
        let mut other_contract = row("mnp-deal", 45_000, 300_000);
        other_contract.contract_type = "번호이동".to_string();

        let selected = select_options(
            900_000,
            10.0,
            0.1,
            30_000,
            Carrier::Sk,
            ContractType::DeviceChange,
            &[other_carrier, other_discount, other_contract],
        );
        assert!(selected.is_empty());
    }
}
