//! Plan catalog handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use tally_core::{Feature, Plan};

use crate::state::AppState;

/// Catalog response.
#[derive(Debug, Serialize)]
pub struct PlansResponse {
    /// Currency of all prices.
    pub currency: String,
    /// Plans ordered by rank.
    pub plans: Vec<Plan>,
    /// Credits charged per unit of each feature.
    pub feature_costs: Vec<FeatureCost>,
}

/// Cost of one feature.
#[derive(Debug, Serialize)]
pub struct FeatureCost {
    /// Feature.
    pub feature: Feature,
    /// Credits per unit.
    pub credits_per_unit: i64,
}

/// List the plan catalog.
pub async fn list_plans(State(state): State<Arc<AppState>>) -> Json<PlansResponse> {
    let engine = &state.engine;
    let mut plans: Vec<Plan> = engine.catalog().all().into_iter().cloned().collect();
    plans.sort_by_key(|p| p.rank);

    let feature_costs = Feature::ALL
        .iter()
        .map(|&feature| FeatureCost {
            feature,
            credits_per_unit: engine.costs().unit_cost(feature),
        })
        .collect();

    Json(PlansResponse {
        currency: engine.settings().currency.clone(),
        plans,
        feature_costs,
    })
}
