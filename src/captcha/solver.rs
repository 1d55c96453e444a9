//! Slider challenge solving on a pooled page.
//!
//! One solve walks the stages below, looping back to a reload with fresh
//! images when verification rejects the drag:
//!
//! ```text
//! OpenChallengePage → ClickVerifyButton → WaitForSlider
//!   → RequestBreakingCoordinate → DragSlider → AwaitVerificationResult
//!   → Success | RetryWithFreshImages | Exhausted
//! ```
//!
//! An exhausted (or timed out) page is discarded; the manager rebuilds a
//! replacement in the background.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use super::TokenSource;
use super::breaker::{BreakingService, ChallengeImages};
use super::page::{CaptchaPage, CaptchaPageManager, InterceptedResponse, PageDriver};
use super::trajectory::{self, Correction, Point};
use crate::config::SolverConfig;
use crate::error::{Error, Result};
use crate::model::now_ms;
use crate::telemetry::attempt::{record_stage, start_solve_span};
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    OpenChallengePage,
    ClickVerifyButton,
    WaitForSlider,
    RequestBreakingCoordinate,
    DragSlider,
    AwaitVerificationResult,
    RetryWithFreshImages,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::OpenChallengePage => "open_challenge_page",
            Stage::ClickVerifyButton => "click_verify_button",
            Stage::WaitForSlider => "wait_for_slider",
            Stage::RequestBreakingCoordinate => "request_breaking_coordinate",
            Stage::DragSlider => "drag_slider",
            Stage::AwaitVerificationResult => "await_verification_result",
            Stage::RetryWithFreshImages => "retry_with_fresh_images",
        }
    }
}

pub struct CaptchaSolver {
    pages: Arc<CaptchaPageManager>,
    breaker: Arc<dyn BreakingService>,
    config: SolverConfig,
}

impl CaptchaSolver {
    pub fn new(pages: Arc<CaptchaPageManager>, breaker: Arc<dyn BreakingService>) -> Self {
        let config = pages.config().clone();
        Self {
            pages,
            breaker,
            config,
        }
    }

    pub fn pages(&self) -> &Arc<CaptchaPageManager> {
        &self.pages
    }

    /// Produce one verification token.
    ///
    /// Returns [`Error::Cancelled`] when `cancel` fires or the manager's
    /// solves are stopped; the page goes back to the pool in that case.
    pub async fn solve(&self, cancel: &CancellationToken) -> Result<String> {
        self.pages.ensure_ready().await?;
        let stop = self.pages.solve_token();
        let mut page = self.pages.acquire().await?;
        let span = start_solve_span(&page.id.to_string());

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = stop.cancelled() => Err(Error::Cancelled),
            r = tokio::time::timeout(
                self.config.solve_timeout,
                self.solve_on_page(&mut page, &span).instrument(span.clone()),
            ) => r.unwrap_or(Err(Error::Timeout("captcha solve"))),
        };

        match &outcome {
            Ok(_) => {
                metrics::captcha_solves().add(1, &[KeyValue::new("result", "ok")]);
                page.last_error = None;
                self.pages.release(page).await;
            }
            Err(Error::Cancelled) => {
                metrics::captcha_solves().add(1, &[KeyValue::new("result", "cancelled")]);
                self.pages.release(page).await;
            }
            Err(e) => {
                metrics::captcha_solves().add(1, &[KeyValue::new("result", "error")]);
                page.last_error = Some(e.to_string());
                self.pages.discard(page, &e.to_string());
            }
        }
        outcome
    }

    async fn solve_on_page(&self, page: &mut CaptchaPage, span: &Span) -> Result<String> {
        let rounds = self.config.max_solve_attempts.max(1);
        let mut last_failure = String::new();
        for round in 1..=rounds {
            span.record("captcha.round", round);
            match self.round(page, round, span).await {
                Ok(token) => {
                    info!(page = %page.id, round, "captcha solved");
                    return Ok(token);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(page = %page.id, round, error = %e, "captcha round failed");
                    last_failure = e.to_string();
                    page.last_error = Some(last_failure.clone());
                }
            }
        }
        Err(Error::Captcha(format!(
            "exhausted after {rounds} rounds: {last_failure}"
        )))
    }

    async fn round(&self, page: &mut CaptchaPage, round: u32, span: &Span) -> Result<String> {
        // Subscribe before touching the page so no image response is missed.
        let mut responses = page.driver().responses();

        if round == 1 {
            self.open_challenge_page(page, span).await?;
        } else {
            record_stage(span, Stage::RetryWithFreshImages.as_str());
            page.driver().reload().await?;
            page.mark_opened(now_ms());
        }
        let driver = page.driver();
        let selectors = &self.config.selectors;

        record_stage(span, Stage::ClickVerifyButton.as_str());
        if driver.element_exists(&selectors.trigger).await? {
            driver.click(&selectors.trigger).await?;
        }

        record_stage(span, Stage::WaitForSlider.as_str());
        let (visible, images) = tokio::time::timeout(self.config.slider_timeout, async {
            tokio::join!(
                driver.wait_visible(&selectors.slider),
                self.capture_images(&mut responses)
            )
        })
        .await
        .map_err(|_| Error::Timeout("slider"))?;
        visible?;
        let images = images?;

        record_stage(span, Stage::RequestBreakingCoordinate.as_str());
        let mut breaking = JoinSet::new();
        let breaker = Arc::clone(&self.breaker);
        breaking.spawn(async move { breaker.locate(&images).await });
        let handle = driver.bounding_box(&selectors.slider).await?;
        let start_offset = driver.css_offset(&selectors.piece).await?;
        let offset = tokio::time::timeout(self.config.breaker_timeout, breaking.join_next())
            .await
            .map_err(|_| Error::Timeout("breaking service"))?
            .ok_or_else(|| Error::Breaker("breaking task vanished".into()))?
            .map_err(|e| Error::Breaker(format!("breaking task failed: {e}")))??;
        debug!(offset, start_offset, "breaking service located gap");

        record_stage(span, Stage::DragSlider.as_str());
        let seed: u64 = rand::thread_rng().gen_range(0..u64::MAX);
        self.drag(driver, handle.center(), start_offset, offset, seed)
            .await?;

        record_stage(span, Stage::AwaitVerificationResult.as_str());
        let body = tokio::time::timeout(
            self.config.verify_timeout,
            self.await_response(&mut responses, &self.config.verify_pattern),
        )
        .await
        .map_err(|_| Error::Timeout("verification result"))??;
        page.last_used_at_ms = Some(now_ms());
        parse_verification(&body)
    }

    async fn open_challenge_page(&self, page: &mut CaptchaPage, span: &Span) -> Result<()> {
        record_stage(span, Stage::OpenChallengePage.as_str());
        let window_ms = self.config.page_fresh_window.as_millis() as i64;
        if page.opened_within(now_ms(), window_ms)
            && page
                .driver()
                .element_exists(&self.config.selectors.trigger)
                .await
                .unwrap_or(false)
        {
            debug!(page = %page.id, "reusing open challenge page");
            return Ok(());
        }
        if self.config.challenge_url.is_empty() {
            return Err(Error::Config("challenge URL is not configured".into()));
        }
        page.driver().goto(&self.config.challenge_url).await?;
        page.mark_opened(now_ms());
        Ok(())
    }

    async fn capture_images(
        &self,
        responses: &mut broadcast::Receiver<InterceptedResponse>,
    ) -> Result<ChallengeImages> {
        let mut background = None;
        let mut slider = None;
        loop {
            let response = next_response(responses).await?;
            if response.url.contains(&self.config.background_pattern) {
                background = Some(response.body);
            } else if response.url.contains(&self.config.slider_pattern) {
                slider = Some(response.body);
            }
            if let (Some(background), Some(slider)) = (&background, &slider) {
                return Ok(ChallengeImages {
                    background: background.clone(),
                    slider: slider.clone(),
                });
            }
        }
    }

    async fn await_response(
        &self,
        responses: &mut broadcast::Receiver<InterceptedResponse>,
        pattern: &str,
    ) -> Result<Vec<u8>> {
        loop {
            let response = next_response(responses).await?;
            if response.url.contains(pattern) {
                return Ok(response.body);
            }
        }
    }

    /// Press on the handle, sweep past the gap along a Bezier path, then
    /// walk the piece back until it sits within tolerance. The pointer is
    /// always released, even when a move fails.
    async fn drag(
        &self,
        driver: &dyn PageDriver,
        (x, y): (f64, f64),
        start_offset: f64,
        target_offset: f64,
        seed: u64,
    ) -> Result<()> {
        driver.mouse_move(x, y).await?;
        driver.mouse_down().await?;
        let moved = self
            .drag_pressed(driver, Point::new(x, y), start_offset, target_offset, seed)
            .await;
        let released = driver.mouse_up().await;
        moved?;
        released
    }

    async fn drag_pressed(
        &self,
        driver: &dyn PageDriver,
        origin: Point,
        start_offset: f64,
        target_offset: f64,
        seed: u64,
    ) -> Result<()> {
        let distance = target_offset - start_offset;
        let end = Point::new(
            origin.x + distance + trajectory::overshoot(distance, seed),
            origin.y,
        );
        let mut pointer = origin;
        for point in trajectory::bezier_path(origin, end, seed, trajectory::path_steps(distance)) {
            driver.mouse_move(point.x, point.y).await?;
            pointer = point;
            pause(self.config.drag_step_delay).await;
        }

        let correction = Correction {
            tolerance: self.config.drag_tolerance_px,
            ..Correction::default()
        };
        for _ in 0..self.config.drag_max_corrections {
            let current = driver.css_offset(&self.config.selectors.piece).await?;
            let step = trajectory::correction_step(target_offset - current, &correction);
            if step == 0.0 {
                return Ok(());
            }
            pointer.x += step;
            driver.mouse_move(pointer.x, origin.y).await?;
            pause(self.config.drag_step_delay).await;
        }
        let current = driver.css_offset(&self.config.selectors.piece).await?;
        debug!(remaining = target_offset - current, "correction budget spent");
        Ok(())
    }
}

#[async_trait]
impl TokenSource for CaptchaSolver {
    async fn acquire_token(&self, cancel: &CancellationToken) -> Result<String> {
        self.solve(cancel).await
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

async fn next_response(
    responses: &mut broadcast::Receiver<InterceptedResponse>,
) -> Result<InterceptedResponse> {
    loop {
        match responses.recv().await {
            Ok(response) => return Ok(response),
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "response stream lagged");
            }
            Err(RecvError::Closed) => return Err(Error::Captcha("page closed".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Verification payload
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct VerifyPayload {
    #[serde(default, alias = "result")]
    success: Option<bool>,
    #[serde(default, alias = "securityToken", alias = "security_token", alias = "validate")]
    token: Option<String>,
    #[serde(default, alias = "msg")]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Strip a `callback(...)` JSONP wrapper, if present.
pub fn strip_jsonp(text: &str) -> &str {
    let text = text.trim().trim_end_matches(';').trim_end();
    if text.starts_with('{') || text.starts_with('[') {
        return text;
    }
    match (text.find('('), text.rfind(')')) {
        (Some(open), Some(close)) if open < close => text[open + 1..close].trim(),
        _ => text,
    }
}

/// Extract the security token from a verification response. A payload
/// without a non-empty token, or one that says it failed, is a rejection.
pub fn parse_verification(body: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(body);
    let payload: VerifyPayload = serde_json::from_str(strip_jsonp(&text))
        .map_err(|e| Error::Captcha(format!("unreadable verification response: {e}")))?;

    let nested = match &payload.data {
        Value::Object(_) => serde_json::from_value::<VerifyPayload>(payload.data.clone()).ok(),
        _ => None,
    };
    let success = payload
        .success
        .or(nested.as_ref().and_then(|n| n.success));
    let token = payload
        .token
        .clone()
        .or_else(|| nested.as_ref().and_then(|n| n.token.clone()))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    match (success, token) {
        (Some(false), _) | (_, None) => {
            let reason = payload
                .message
                .or_else(|| nested.and_then(|n| n.message))
                .unwrap_or_else(|| "no security token".to_string());
            Err(Error::Captcha(format!("verification rejected: {reason}")))
        }
        (_, Some(token)) => Ok(token),
    }
}
