use crate::context::AppCtx;
use crate::error::Result;
use crate::ingest;

use super::CoverRefreshPayload;

/// Recompute a series' best cover from its highest-trust binding.
#[tracing::instrument(
    name = "Refreshing a series cover.",
    err,
    level = "info",
    skip(ctx),
    fields(series = %payload.series_id)
)]
pub async fn run(ctx: &AppCtx, payload: CoverRefreshPayload) -> Result<()> {
    ingest::refresh_best_cover(&ctx.db, payload.series_id).await
}
