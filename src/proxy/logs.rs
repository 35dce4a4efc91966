//! Request log listing, detail and cleanup handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::extract::ApiQuery;
use super::server::AppState;
use super::stats::FilterParams;
use crate::error::Error;
use crate::storage::{Pagination, RequestDetail, RequestPage};

/// Page window for GET /requests.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub offset: Option<u32>,
    /// Defaults to 50, capped at 200.
    pub limit: Option<u32>,
}

/// Handle GET /requests
///
/// Summaries for one page plus totals over everything the filter matches.
pub async fn requests(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<FilterParams>,
    ApiQuery(page): ApiQuery<PageParams>,
) -> Result<Json<RequestPage>, Error> {
    let filter = params.to_filter(Utc::now())?;
    let page = Pagination::new(page.offset, page.limit);
    let result = state.store.query(&filter, page).await?;
    Ok(Json(result))
}

/// Handle GET /requests/:id/details
pub async fn request_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RequestDetail>, Error> {
    state
        .store
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("Request '{}' not found", id)))
}

#[derive(Debug, Serialize)]
pub struct DeleteErrorsResponse {
    pub deleted: u64,
}

/// Handle DELETE /errors
pub async fn delete_errors(
    State(state): State<AppState>,
) -> Result<Json<DeleteErrorsResponse>, Error> {
    let deleted = state.store.delete_errors().await?;
    Ok(Json(DeleteErrorsResponse { deleted }))
}
