//! Span helpers for purchase attempts and captcha solves.

use tracing::Span;

/// Start a span covering one purchase attempt end to end.
///
/// `attempt.stage` is declared empty and filled by [`record_stage`].
pub fn start_attempt_span(target_id: &str, account_id: &str) -> Span {
    tracing::info_span!(
        "attempt",
        "attempt.target" = target_id,
        "attempt.account" = account_id,
        "attempt.stage" = tracing::field::Empty,
    )
}

/// Start a span covering one solve call on one page.
pub fn start_solve_span(page_id: &str) -> Span {
    tracing::info_span!(
        "captcha.solve",
        "captcha.page" = page_id,
        "captcha.round" = tracing::field::Empty,
        "attempt.stage" = tracing::field::Empty,
    )
}

/// Record the stage the span has reached.
pub fn record_stage(span: &Span, stage: &str) {
    span.record("attempt.stage", stage);
    span.in_scope(|| {
        tracing::debug!(stage, "stage");
    });
}
