use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::json;
use service_core::error::AppError;

use crate::dtos::{LimitQuery, PlansQuery, PlansResponse};
use crate::services::provider_manager::{PlanListing, PlanQuery, SortBy, SortOrder};
use crate::startup::AppState;

const DEFAULT_POPULAR_LIMIT: usize = 10;

fn plan_query(params: &PlansQuery) -> Result<PlanQuery, AppError> {
    let sort_by = params
        .sort_by
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<SortBy>)
        .transpose()?;
    let order = match params.order.as_deref().filter(|s| !s.is_empty()) {
        Some(order) => order.parse::<SortOrder>()?,
        None => SortOrder::default(),
    };
    Ok(PlanQuery {
        sort_by,
        order,
        limit: params.limit,
    })
}

fn plans_response(listing: PlanListing) -> Json<PlansResponse> {
    Json(PlansResponse {
        success: true,
        count: listing.plans.len(),
        plans: listing.plans,
        failed_providers: listing.failed_providers,
    })
}

/// `GET /api/plans`
pub async fn list_plans(
    State(state): State<AppState>,
    Query(params): Query<PlansQuery>,
) -> Result<Json<PlansResponse>, AppError> {
    let query = plan_query(&params)?;
    let listing = match params.country.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(country) => state.providers.get_plans_by_country(country, &query).await?,
        None => state.providers.get_all_plans(&query).await?,
    };
    Ok(plans_response(listing))
}

/// `GET /api/plans/popular`
pub async fn popular_plans(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<PlansResponse>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_POPULAR_LIMIT);
    let listing = state.providers.get_popular_plans(limit).await?;
    Ok(plans_response(listing))
}

/// `GET /api/plans/:plan_id`
pub async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let plan = state.providers.find_plan(&plan_id).await?;
    Ok(Json(json!({ "success": true, "plan": plan })))
}

/// `GET /api/countries/:country/plans`
pub async fn country_plans(
    State(state): State<AppState>,
    Path(country): Path<String>,
    Query(params): Query<PlansQuery>,
) -> Result<Json<PlansResponse>, AppError> {
    let query = plan_query(&params)?;
    let listing = state
        .providers
        .get_plans_by_country(&country, &query)
        .await?;
    Ok(plans_response(listing))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_query_parsing() {
        let query = plan_query(&PlansQuery {
            sort_by: Some("Data".to_string()),
            order: Some("desc".to_string()),
            limit: Some(5),
            country: None,
        })
        .unwrap();
        assert_eq!(query.sort_by, Some(SortBy::Data));
        assert_eq!(query.order, SortOrder::Desc);
        assert_eq!(query.limit, Some(5));

        let default = plan_query(&PlansQuery::default()).unwrap();
        assert_eq!(default.sort_by, None);
        assert_eq!(default.order, SortOrder::Asc);

        let bad = plan_query(&PlansQuery {
            sort_by: Some("weight".to_string()),
            ..Default::default()
        });
        assert!(matches!(bad, Err(AppError::BadRequest(_))));
    }
}
