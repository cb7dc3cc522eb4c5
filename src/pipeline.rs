use crate::alerts::{AlertSink, SyncFailure};
use crate::carrier::CarrierError;
use crate::catalog::{Catalog, CatalogError, ListingSnapshot};
use crate::market::{MarketError, Marketplace};
use crate::models::{StageReport, SyncRequest, SyncResponse};
use crate::negotiation::NegotiationSettings;
use serde::Serialize;
use serde_json::Value;
use std::{env, fmt, future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{error, info};

/// Default per-unit margin (won) kept after marketplace commission.
pub const DEFAULT_MARGIN: u32 = 30_000;

/// The pipeline's stages, in execution order. `Load` is the snapshot
/// prefetch; the three that follow each perform exactly one external effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Load,
    Clear,
    Price,
    Options,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Load => "load",
            SyncStage::Clear => "clear",
            SyncStage::Price => "price",
            SyncStage::Options => "options",
        }
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: SyncStage,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Internal,
    /// Seller code matched zero or multiple carriers, a configuration
    /// defect, never resolved heuristically.
    UnresolvedCarrier,
    /// Non-2xx or transport failure from the marketplace API.
    MarketplaceCall,
    /// Retry budget exhausted without the marketplace accepting a proposal.
    NegotiationDidNotConverge,
    /// Local write failed after the external call succeeded; marketplace
    /// and catalog state may now diverge.
    Persistence,
}

impl PipelineError {
    pub fn invalid_input(stage: SyncStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    fn unresolved_carrier(stage: SyncStage, err: CarrierError) -> Self {
        Self {
            stage,
            message: err.to_string(),
            kind: PipelineErrorKind::UnresolvedCarrier,
        }
    }

    fn market(stage: SyncStage, err: MarketError) -> Self {
        Self {
            stage,
            message: err.to_string(),
            kind: PipelineErrorKind::MarketplaceCall,
        }
    }

    fn catalog(stage: SyncStage, err: CatalogError) -> Self {
        let kind = match err {
            CatalogError::ListingNotFound(_) => PipelineErrorKind::InvalidInput,
            _ => PipelineErrorKind::Internal,
        };
        Self {
            stage,
            message: err.to_string(),
            kind,
        }
    }

    fn no_convergence(message: impl Into<String>) -> Self {
        Self {
            stage: SyncStage::Price,
            message: message.into(),
            kind: PipelineErrorKind::NegotiationDidNotConverge,
        }
    }

    fn persistence(message: impl Into<String>) -> Self {
        Self {
            stage: SyncStage::Price,
            message: message.into(),
            kind: PipelineErrorKind::Persistence,
        }
    }

    pub fn stage(&self) -> SyncStage {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub default_margin: u32,
    pub negotiation: NegotiationSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_margin: DEFAULT_MARGIN,
            negotiation: NegotiationSettings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let default_margin = env::var("DEFAULT_MARGIN")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MARGIN);
        Self {
            default_margin,
            negotiation: NegotiationSettings::from_env(),
        }
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

/// The listing sync orchestrator: clear options, negotiate the price,
/// regenerate options, in that order, with one failure alert at the
/// boundary. Stages never run out of order and a failed stage stops the
/// chain; recovery is a manual re-trigger of the pipeline or of a single
/// stage once the root cause is fixed.
#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    market: Arc<dyn Marketplace>,
    catalog: Arc<dyn Catalog>,
    alerts: Arc<dyn AlertSink>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        market: Arc<dyn Marketplace>,
        catalog: Arc<dyn Catalog>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            market,
            catalog,
            alerts,
        }
    }

    /// Runs the full chain for one listing. Any stage failure aborts the
    /// rest, emits exactly one [`SyncFailure`] to the alert sink, and is
    /// returned to the caller. Nothing is retried across stages.
    pub async fn run(&self, request: SyncRequest) -> Result<SyncResponse, PipelineError> {
        match self.execute(&request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                self.report_failure(request.listing_id, &err).await;
                Err(err)
            }
        }
    }

    async fn execute(&self, request: &SyncRequest) -> Result<SyncResponse, PipelineError> {
        if request.target_price == 0 {
            return Err(PipelineError::invalid_input(
                SyncStage::Load,
                "target_price must be positive",
            ));
        }
        let margin = request.margin.unwrap_or(self.config.default_margin);
        let mut stages = Vec::new();

        let (mut listing, rows) = self
            .capture_stage(
                SyncStage::Load,
                &mut stages,
                stages::load(self.catalog.as_ref(), request.listing_id),
            )
            .await?;

        self.capture_stage(
            SyncStage::Clear,
            &mut stages,
            stages::clear_options(self.market.as_ref(), &listing),
        )
        .await?;

        let negotiated = self
            .capture_stage(
                SyncStage::Price,
                &mut stages,
                stages::negotiate_price(
                    self.market.as_ref(),
                    self.catalog.as_ref(),
                    &listing,
                    request.target_price,
                    &self.config.negotiation,
                ),
            )
            .await?;
        crate::metrics::inc_negotiation_rounds(negotiated.rounds);
        listing.registered_price = negotiated.price;

        let selected = self
            .capture_stage(
                SyncStage::Options,
                &mut stages,
                stages::apply_options(self.market.as_ref(), &listing, &rows, margin),
            )
            .await?;

        Ok(SyncResponse {
            listing_id: listing.id,
            accepted_price: negotiated.price,
            negotiation_rounds: negotiated.rounds,
            options_pushed: selected.len(),
            stages,
        })
    }

    /// Manual re-trigger of stage "clear" only. Failures are alerted the
    /// same way full runs are.
    pub async fn run_clear_stage(
        &self,
        listing_id: i64,
    ) -> Result<Vec<StageReport>, PipelineError> {
        match self.clear_stage(listing_id).await {
            Ok(stages) => Ok(stages),
            Err(err) => {
                self.report_failure(listing_id, &err).await;
                Err(err)
            }
        }
    }

    /// Manual re-trigger of stage "price" only; persists the accepted price
    /// and alerts on failure exactly as the full pipeline does.
    pub async fn run_price_stage(
        &self,
        listing_id: i64,
        target_price: u32,
    ) -> Result<Vec<StageReport>, PipelineError> {
        match self.price_stage(listing_id, target_price).await {
            Ok(stages) => Ok(stages),
            Err(err) => {
                self.report_failure(listing_id, &err).await;
                Err(err)
            }
        }
    }

    /// Manual re-trigger of stage "options" only, against the currently
    /// registered price. Failures are alerted the same way full runs are.
    pub async fn run_options_stage(
        &self,
        listing_id: i64,
        margin: Option<u32>,
    ) -> Result<Vec<StageReport>, PipelineError> {
        match self.options_stage(listing_id, margin).await {
            Ok(stages) => Ok(stages),
            Err(err) => {
                self.report_failure(listing_id, &err).await;
                Err(err)
            }
        }
    }

    async fn clear_stage(&self, listing_id: i64) -> Result<Vec<StageReport>, PipelineError> {
        let mut stages = Vec::new();
        let listing = self
            .capture_stage(
                SyncStage::Load,
                &mut stages,
                stages::load_listing(self.catalog.as_ref(), listing_id),
            )
            .await?;
        self.capture_stage(
            SyncStage::Clear,
            &mut stages,
            stages::clear_options(self.market.as_ref(), &listing),
        )
        .await?;
        Ok(stages)
    }

    async fn price_stage(
        &self,
        listing_id: i64,
        target_price: u32,
    ) -> Result<Vec<StageReport>, PipelineError> {
        let mut stages = Vec::new();
        let listing = self
            .capture_stage(
                SyncStage::Load,
                &mut stages,
                stages::load_listing(self.catalog.as_ref(), listing_id),
            )
            .await?;
        self.capture_stage(
            SyncStage::Price,
            &mut stages,
            stages::negotiate_price(
                self.market.as_ref(),
                self.catalog.as_ref(),
                &listing,
                target_price,
                &self.config.negotiation,
            ),
        )
        .await?;
        Ok(stages)
    }

    async fn options_stage(
        &self,
        listing_id: i64,
        margin: Option<u32>,
    ) -> Result<Vec<StageReport>, PipelineError> {
        let margin = margin.unwrap_or(self.config.default_margin);
        let mut stages = Vec::new();
        let (listing, rows) = self
            .capture_stage(
                SyncStage::Load,
                &mut stages,
                stages::load(self.catalog.as_ref(), listing_id),
            )
            .await?;
        self.capture_stage(
            SyncStage::Options,
            &mut stages,
            stages::apply_options(self.market.as_ref(), &listing, &rows, margin),
        )
        .await?;
        Ok(stages)
    }

    async fn capture_stage<T, Fut>(
        &self,
        stage: SyncStage,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        info!(target = "sync.pipeline", stage = stage.as_str(), "stage entered");
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(stage.as_str(), elapsed_ms);
        info!(
            target = "sync.pipeline",
            stage = stage.as_str(),
            elapsed_ms = elapsed_ms as u64,
            "stage completed"
        );
        stages.push(StageReport::new(stage.as_str(), elapsed_ms, outcome.output));
        Ok(outcome.value)
    }

    async fn report_failure(&self, listing_id: i64, err: &PipelineError) {
        let failure = SyncFailure {
            stage: err.stage(),
            listing_id,
            detail: err.detail().to_string(),
            urgent: err.kind() == PipelineErrorKind::Persistence,
        };
        error!(
            target = "sync.pipeline",
            stage = err.stage().as_str(),
            listing_id,
            urgent = failure.urgent,
            "sync halted: {}",
            err.detail()
        );
        self.alerts.notify(&failure).await;
    }
}

pub mod stages {
    use super::*;
    use crate::carrier::{Carrier, contract_type_for, resolve_carrier};
    use crate::market::MarketOption;
    use crate::negotiation::{NegotiatedPrice, NegotiationError, negotiate};
    use crate::pricing::{self, PriceOptionRow, SelectedOption};
    use chrono::Utc;
    use serde_json::json;

    pub(super) async fn load_listing(
        catalog: &dyn Catalog,
        listing_id: i64,
    ) -> Result<StageOutcome<ListingSnapshot>, PipelineError> {
        let listing = catalog
            .fetch_listing(listing_id)
            .await
            .and_then(|listing| listing.check_rates().map(|_| listing))
            .map_err(|err| PipelineError::catalog(SyncStage::Load, err))?;
        let output = json!({
            "listing_id": listing.id,
            "external_id": listing.external_id,
            "seller_code": listing.seller_code,
            "registered_price": listing.registered_price,
        });
        Ok(StageOutcome::new(listing, output))
    }

    pub(super) async fn load(
        catalog: &dyn Catalog,
        listing_id: i64,
    ) -> Result<StageOutcome<(ListingSnapshot, Vec<PriceOptionRow>)>, PipelineError> {
        let listing = catalog
            .fetch_listing(listing_id)
            .await
            .and_then(|listing| listing.check_rates().map(|_| listing))
            .map_err(|err| PipelineError::catalog(SyncStage::Load, err))?;
        let rows = catalog
            .fetch_price_options(listing.device_variant_id)
            .await
            .map_err(|err| PipelineError::catalog(SyncStage::Load, err))?;
        let output = json!({
            "listing_id": listing.id,
            "external_id": listing.external_id,
            "seller_code": listing.seller_code,
            "registered_price": listing.registered_price,
            "candidate_rows": rows.len(),
        });
        Ok(StageOutcome::new((listing, rows), output))
    }

    /// Stage "clear": leave only a zero-priced default option on the listing
    /// so no stale discounted option is purchasable while the price is in
    /// flux. Harmless to re-run.
    pub(super) async fn clear_options(
        market: &dyn Marketplace,
        listing: &ListingSnapshot,
    ) -> Result<StageOutcome<Carrier>, PipelineError> {
        let carrier = resolve_carrier(&listing.seller_code)
            .map_err(|err| PipelineError::unresolved_carrier(SyncStage::Clear, err))?;
        let default_option = MarketOption {
            plan_name: carrier.default_plan_name().to_string(),
            price_delta: 0,
        };
        market
            .replace_options(&listing.external_id, &[default_option])
            .await
            .map_err(|err| PipelineError::market(SyncStage::Clear, err))?;
        Ok(StageOutcome::new(
            carrier,
            json!({
                "carrier": carrier.token(),
                "default_plan": carrier.default_plan_name(),
            }),
        ))
    }

    /// Stage "price": converge the marketplace sell price on the target,
    /// then persist price + sync timestamp in one write. The local record
    /// never claims a price the marketplace has not itself accepted.
    pub(super) async fn negotiate_price(
        market: &dyn Marketplace,
        catalog: &dyn Catalog,
        listing: &ListingSnapshot,
        target_price: u32,
        settings: &NegotiationSettings,
    ) -> Result<StageOutcome<NegotiatedPrice>, PipelineError> {
        let negotiated = negotiate(market, &listing.external_id, target_price, settings)
            .await
            .map_err(|err| match err {
                NegotiationError::DidNotConverge { .. } => {
                    PipelineError::no_convergence(err.to_string())
                }
                NegotiationError::Market(inner) => PipelineError::market(SyncStage::Price, inner),
            })?;

        let synced_at = Utc::now();
        catalog
            .update_registered_price(listing.id, negotiated.price, synced_at)
            .await
            .map_err(|err| {
                PipelineError::persistence(format!(
                    "marketplace accepted {} but the local write failed: {err}",
                    negotiated.price
                ))
            })?;

        Ok(StageOutcome::new(
            negotiated,
            json!({
                "accepted_price": negotiated.price,
                "rounds": negotiated.rounds,
                "synced_at": synced_at,
            }),
        ))
    }

    /// Stage "options": recompute the purchasable plan variants from the
    /// now-current registered price and push them, fully replacing whatever
    /// stage "clear" left behind. An empty selection is valid; the default
    /// option is always included.
    pub(super) async fn apply_options(
        market: &dyn Marketplace,
        listing: &ListingSnapshot,
        rows: &[PriceOptionRow],
        margin: u32,
    ) -> Result<StageOutcome<Vec<SelectedOption>>, PipelineError> {
        let carrier = resolve_carrier(&listing.seller_code)
            .map_err(|err| PipelineError::unresolved_carrier(SyncStage::Options, err))?;
        let contract = contract_type_for(&listing.seller_code);
        let selected = pricing::select_options(
            listing.registered_price,
            listing.ceiling_rate,
            listing.commission_rate,
            margin,
            carrier,
            contract,
            rows,
        );

        let mut payload = Vec::with_capacity(selected.len() + 1);
        payload.push(MarketOption {
            plan_name: carrier.default_plan_name().to_string(),
            price_delta: 0,
        });
        // the option endpoint takes prices relative to the registered price
        payload.extend(selected.iter().map(|opt| MarketOption {
            plan_name: opt.plan_name.clone(),
            price_delta: i64::from(listing.registered_price) - i64::from(opt.price),
        }));

        market
            .replace_options(&listing.external_id, &payload)
            .await
            .map_err(|err| PipelineError::market(SyncStage::Options, err))?;

        let ceiling = pricing::option_ceiling(listing.registered_price, listing.ceiling_rate);
        Ok(StageOutcome::new(
            selected.clone(),
            json!({
                "carrier": carrier.token(),
                "contract_type": contract,
                "option_ceiling": ceiling,
                "options": selected,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::Carrier;
    use crate::market::{MarketOption, PriceOutcome};
    use crate::pricing::{PriceOptionRow, STANDARD_SUBSIDY};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedMarket {
        /// Rejections to serve before accepting, each carrying the price
        /// still on file.
        rejections: Vec<u32>,
        price_calls: AtomicU32,
        option_pushes: Mutex<Vec<Vec<MarketOption>>>,
        fail_price_call: bool,
    }

    impl ScriptedMarket {
        fn accepting() -> Self {
            Self {
                rejections: Vec::new(),
                price_calls: AtomicU32::new(0),
                option_pushes: Mutex::new(Vec::new()),
                fail_price_call: false,
            }
        }

        fn rejecting_once(previous: u32) -> Self {
            Self {
                rejections: vec![previous],
                ..Self::accepting()
            }
        }

        fn broken_price_endpoint() -> Self {
            Self {
                fail_price_call: true,
                ..Self::accepting()
            }
        }

        fn pushes(&self) -> Vec<Vec<MarketOption>> {
            self.option_pushes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Marketplace for ScriptedMarket {
        async fn replace_options(
            &self,
            _external_id: &str,
            options: &[MarketOption],
        ) -> Result<(), MarketError> {
            self.option_pushes.lock().unwrap().push(options.to_vec());
            Ok(())
        }

        async fn propose_price(
            &self,
            _external_id: &str,
            price: u32,
        ) -> Result<PriceOutcome, MarketError> {
            if self.fail_price_call {
                return Err(MarketError::Request("connection refused".to_string()));
            }
            let call = self.price_calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.rejections.get(call) {
                Some(previous) => Ok(PriceOutcome::Rejected {
                    previous: *previous,
                }),
                None => Ok(PriceOutcome::Accepted(price)),
            }
        }
    }

    struct StubCatalog {
        listing: ListingSnapshot,
        rows: Vec<PriceOptionRow>,
        updates: Mutex<Vec<(i64, u32)>>,
        fail_update: bool,
    }

    impl StubCatalog {
        fn new(listing: ListingSnapshot, rows: Vec<PriceOptionRow>) -> Self {
            Self {
                listing,
                rows,
                updates: Mutex::new(Vec::new()),
                fail_update: false,
            }
        }

        fn updates(&self) -> Vec<(i64, u32)> {
            self.updates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Catalog for StubCatalog {
        async fn fetch_listing(&self, listing_id: i64) -> Result<ListingSnapshot, CatalogError> {
            if listing_id == self.listing.id {
                Ok(self.listing.clone())
            } else {
                Err(CatalogError::ListingNotFound(listing_id))
            }
        }

        async fn fetch_price_options(
            &self,
            _device_variant_id: i64,
        ) -> Result<Vec<PriceOptionRow>, CatalogError> {
            Ok(self.rows.clone())
        }

        async fn update_registered_price(
            &self,
            listing_id: i64,
            price: u32,
            _synced_at: DateTime<Utc>,
        ) -> Result<(), CatalogError> {
            if self.fail_update {
                return Err(CatalogError::Request("write refused".to_string()));
            }
            self.updates.lock().unwrap().push((listing_id, price));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingAlerts {
        failures: Mutex<Vec<(SyncStage, i64, bool)>>,
    }

    impl RecordingAlerts {
        fn recorded(&self) -> Vec<(SyncStage, i64, bool)> {
            self.failures.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingAlerts {
        async fn notify(&self, failure: &SyncFailure) {
            self.failures.lock().unwrap().push((
                failure.stage,
                failure.listing_id,
                failure.urgent,
            ));
        }
    }

    fn sample_listing() -> ListingSnapshot {
        ListingSnapshot {
            id: 7,
            external_id: "9105055842".to_string(),
            seller_code: "SK-MNP-S24U".to_string(),
            device_variant_id: 3,
            registered_price: 500_000,
            commission_rate: 0.1,
            ceiling_rate: 10.0,
            last_synced_at: None,
        }
    }

    fn sample_rows() -> Vec<PriceOptionRow> {
        vec![
            PriceOptionRow {
                plan_name: "5GX 프라임".to_string(),
                plan_monthly_price: 89_000,
                carrier: "SK".to_string(),
                contract_type: "번호이동".to_string(),
                discount_type: STANDARD_SUBSIDY.to_string(),
                final_price: 400_000,
            },
            PriceOptionRow {
                plan_name: "5GX 스탠다드".to_string(),
                plan_monthly_price: 75_000,
                carrier: "SK".to_string(),
                contract_type: "번호이동".to_string(),
                discount_type: STANDARD_SUBSIDY.to_string(),
                final_price: 420_000,
            },
            // priced out: far above any plausible ceiling
            PriceOptionRow {
                plan_name: "프리미엄 울트라".to_string(),
                plan_monthly_price: 125_000,
                carrier: "SK".to_string(),
                contract_type: "번호이동".to_string(),
                discount_type: STANDARD_SUBSIDY.to_string(),
                final_price: 2_000_000,
            },
        ]
    }

    fn pipeline_with(
        market: Arc<ScriptedMarket>,
        catalog: Arc<StubCatalog>,
        alerts: Arc<RecordingAlerts>,
    ) -> Pipeline {
        Pipeline::new(PipelineConfig::default(), market, catalog, alerts)
    }

    fn request(target_price: u32) -> SyncRequest {
        SyncRequest {
            listing_id: 7,
            target_price,
            margin: None,
        }
    }

    #[tokio::test]
    async fn run_covers_all_stages_in_order() {
        let market = Arc::new(ScriptedMarket::accepting());
        let catalog = Arc::new(StubCatalog::new(sample_listing(), sample_rows()));
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market.clone(), catalog.clone(), alerts.clone());

        let response = pipeline.run(request(480_000)).await.expect("pipeline run");
        let names: Vec<&str> = response.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["load", "clear", "price", "options"]);
        assert!(alerts.recorded().is_empty());
        // clear pushed the default alone, options pushed default + selection
        let pushes = market.pushes();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0].len(), 1);
        assert_eq!(pushes[0][0].plan_name, Carrier::Sk.default_plan_name());
        assert_eq!(pushes[0][0].price_delta, 0);
        assert!(pushes[1].len() > 1);
    }

    #[tokio::test]
    async fn accepted_price_is_persisted_and_bounds_the_options() {
        // registered 500_000, ceiling 10%, target 480_000 accepted on round
        // one -> persisted 480_000, option ceiling 528_000
        let market = Arc::new(ScriptedMarket::accepting());
        let catalog = Arc::new(StubCatalog::new(sample_listing(), sample_rows()));
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market.clone(), catalog.clone(), alerts.clone());

        let response = pipeline.run(request(480_000)).await.expect("pipeline run");
        assert_eq!(response.accepted_price, 480_000);
        assert_eq!(response.negotiation_rounds, 1);
        assert_eq!(catalog.updates(), vec![(7, 480_000)]);

        let options_report = response.stages.last().unwrap();
        assert_eq!(options_report.output["option_ceiling"], 528_000);
    }

    #[tokio::test]
    async fn counter_proposal_converges_on_the_second_round() {
        // marketplace rejects 480_000 with 600_000 on file; the retreat
        // formula floors at the target, so round two re-proposes 480_000
        let market = Arc::new(ScriptedMarket::rejecting_once(600_000));
        let catalog = Arc::new(StubCatalog::new(sample_listing(), sample_rows()));
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market, catalog.clone(), alerts);

        let response = pipeline.run(request(480_000)).await.expect("pipeline run");
        assert_eq!(response.accepted_price, 480_000);
        assert_eq!(response.negotiation_rounds, 2);
        assert_eq!(catalog.updates(), vec![(7, 480_000)]);
    }

    #[tokio::test]
    async fn empty_selection_still_completes_with_default_only() {
        let rows = vec![PriceOptionRow {
            plan_name: "프리미엄 울트라".to_string(),
            plan_monthly_price: 125_000,
            carrier: "SK".to_string(),
            contract_type: "번호이동".to_string(),
            discount_type: STANDARD_SUBSIDY.to_string(),
            final_price: 2_000_000,
        }];
        let market = Arc::new(ScriptedMarket::accepting());
        let catalog = Arc::new(StubCatalog::new(sample_listing(), rows));
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market.clone(), catalog, alerts.clone());

        let response = pipeline.run(request(480_000)).await.expect("pipeline run");
        assert_eq!(response.options_pushed, 0);
        let pushes = market.pushes();
        assert_eq!(pushes.last().unwrap().len(), 1);
        assert!(alerts.recorded().is_empty());
    }

    #[tokio::test]
    async fn price_stage_transport_error_halts_before_persisting() {
        let market = Arc::new(ScriptedMarket::broken_price_endpoint());
        let catalog = Arc::new(StubCatalog::new(sample_listing(), sample_rows()));
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market.clone(), catalog.clone(), alerts.clone());

        let err = pipeline.run(request(480_000)).await.unwrap_err();
        assert_eq!(err.stage(), SyncStage::Price);
        assert_eq!(err.kind(), PipelineErrorKind::MarketplaceCall);
        // no price persisted, no options stage push (clear's push only)
        assert!(catalog.updates().is_empty());
        assert_eq!(market.pushes().len(), 1);
        assert_eq!(alerts.recorded(), vec![(SyncStage::Price, 7, false)]);
    }

    #[tokio::test]
    async fn persistence_failure_is_alerted_as_urgent() {
        let market = Arc::new(ScriptedMarket::accepting());
        let mut catalog = StubCatalog::new(sample_listing(), sample_rows());
        catalog.fail_update = true;
        let catalog = Arc::new(catalog);
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market, catalog, alerts.clone());

        let err = pipeline.run(request(480_000)).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Persistence);
        assert_eq!(alerts.recorded(), vec![(SyncStage::Price, 7, true)]);
    }

    #[tokio::test]
    async fn ambiguous_seller_code_fails_the_clear_stage() {
        let mut listing = sample_listing();
        listing.seller_code = "SK-KT-S24U".to_string();
        let market = Arc::new(ScriptedMarket::accepting());
        let catalog = Arc::new(StubCatalog::new(listing, sample_rows()));
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market.clone(), catalog, alerts.clone());

        let err = pipeline.run(request(480_000)).await.unwrap_err();
        assert_eq!(err.stage(), SyncStage::Clear);
        assert_eq!(err.kind(), PipelineErrorKind::UnresolvedCarrier);
        assert!(market.pushes().is_empty());
        assert_eq!(alerts.recorded().len(), 1);
    }

    #[tokio::test]
    async fn option_deltas_are_relative_to_the_accepted_price() {
        let market = Arc::new(ScriptedMarket::accepting());
        let catalog = Arc::new(StubCatalog::new(sample_listing(), sample_rows()));
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market.clone(), catalog, alerts);

        pipeline.run(request(480_000)).await.expect("pipeline run");
        let pushes = market.pushes();
        let options_push = pushes.last().unwrap();
        // (400_000 + 30_000) / 0.9 rounded to 1_000 = 478_000
        let prime = options_push
            .iter()
            .find(|opt| opt.plan_name == "5GX 프라임")
            .expect("prime plan pushed");
        assert_eq!(prime.price_delta, 480_000 - 478_000);
    }

    #[tokio::test]
    async fn unknown_listing_fails_during_load() {
        let market = Arc::new(ScriptedMarket::accepting());
        let catalog = Arc::new(StubCatalog::new(sample_listing(), sample_rows()));
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market, catalog, alerts.clone());

        let err = pipeline
            .run(SyncRequest {
                listing_id: 999,
                target_price: 480_000,
                margin: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.stage(), SyncStage::Load);
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(alerts.recorded().len(), 1);
    }

    #[tokio::test]
    async fn single_stage_retrigger_replays_only_that_stage() {
        let market = Arc::new(ScriptedMarket::accepting());
        let catalog = Arc::new(StubCatalog::new(sample_listing(), sample_rows()));
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market.clone(), catalog.clone(), alerts);

        let reports = pipeline.run_clear_stage(7).await.expect("clear stage");
        let names: Vec<&str> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["load", "clear"]);
        assert_eq!(market.pushes().len(), 1);
        assert!(catalog.updates().is_empty());

        let reports = pipeline
            .run_price_stage(7, 470_000)
            .await
            .expect("price stage");
        assert_eq!(reports.last().unwrap().name, "price");
        assert_eq!(catalog.updates(), vec![(7, 470_000)]);

        let reports = pipeline
            .run_options_stage(7, None)
            .await
            .expect("options stage");
        assert_eq!(reports.last().unwrap().name, "options");
        // one push from the clear re-trigger, one from options; the price
        // re-trigger touches no options
        assert_eq!(market.pushes().len(), 2);
    }

    #[tokio::test]
    async fn manual_price_retrigger_alerts_on_persistence_failure() {
        let market = Arc::new(ScriptedMarket::accepting());
        let mut catalog = StubCatalog::new(sample_listing(), sample_rows());
        catalog.fail_update = true;
        let catalog = Arc::new(catalog);
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market, catalog, alerts.clone());

        let err = pipeline.run_price_stage(7, 480_000).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Persistence);
        assert_eq!(alerts.recorded(), vec![(SyncStage::Price, 7, true)]);
    }

    #[tokio::test]
    async fn manual_clear_retrigger_alerts_on_failure() {
        let mut listing = sample_listing();
        listing.seller_code = "SK-KT-S24U".to_string();
        let market = Arc::new(ScriptedMarket::accepting());
        let catalog = Arc::new(StubCatalog::new(listing, sample_rows()));
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market, catalog, alerts.clone());

        let err = pipeline.run_clear_stage(7).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::UnresolvedCarrier);
        assert_eq!(alerts.recorded(), vec![(SyncStage::Clear, 7, false)]);
    }

    #[tokio::test]
    async fn out_of_range_commission_rate_fails_during_load() {
        let mut listing = sample_listing();
        listing.commission_rate = 1.0;
        let market = Arc::new(ScriptedMarket::accepting());
        let catalog = Arc::new(StubCatalog::new(listing, sample_rows()));
        let alerts = Arc::new(RecordingAlerts::default());
        let pipeline = pipeline_with(market.clone(), catalog.clone(), alerts.clone());

        let err = pipeline.run(request(480_000)).await.unwrap_err();
        assert_eq!(err.stage(), SyncStage::Load);
        assert_eq!(err.kind(), PipelineErrorKind::Internal);
        assert!(market.pushes().is_empty());
        assert!(catalog.updates().is_empty());
        assert_eq!(alerts.recorded().len(), 1);
    }
}
