//! Lane execution span helpers.
//!
//! Provides span creation and disposition recording for items flowing
//! through a worker lane.

use tracing::Span;

use crate::model::LaneKey;

/// Start a span for one work item's processing.
///
/// The `item.disposition` field is declared empty and is recorded once
/// the item reaches a terminal outcome.
pub fn start_item_span(lane: &LaneKey, item_id: &str) -> Span {
    tracing::info_span!(
        "lane.process_item",
        "lane.key" = %lane,
        "item.id" = item_id,
        "item.disposition" = tracing::field::Empty,
    )
}

/// Record the item's terminal disposition on its span.
pub fn record_disposition(span: &Span, disposition: &str) {
    span.record("item.disposition", disposition);
}
