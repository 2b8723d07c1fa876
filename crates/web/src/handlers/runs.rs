use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use apptest_core::AppError;
use apptest_db::HistoryEntry;

use crate::AppState;

/// Recorded history of a run.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    let entries = state.db.history(&run_id).await?;
    if entries.is_empty() {
        return Err(AppError::Status(StatusCode::NOT_FOUND));
    }
    Ok(Json(entries))
}
