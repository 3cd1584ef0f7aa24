//! Applies oracle actions to a live page.
//!
//! Nothing in here returns an error: faults inside an uncontrolled page are
//! expected, so every branch reports an [`ExecutionOutcome`] instead.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ReplayError, Result};
use crate::page::{DomEvent, ElementInfo, Key, PageHandle};
use crate::types::{Action, Observation, Point, Viewport};

/// Whether the platform accepted the action. Not the same as the step's
/// goal being met.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub applied: bool,
    pub reason: Option<String>,
}

impl ExecutionOutcome {
    pub fn applied() -> Self {
        Self {
            applied: true,
            reason: None,
        }
    }

    pub fn not_applied(reason: impl Into<String>) -> Self {
        Self {
            applied: false,
            reason: Some(reason.into()),
        }
    }
}

/// Map a point from the oracle's image space into the live viewport.
///
/// Each axis is scaled independently by `viewport / image`, then the
/// scroll offset is subtracted.
pub fn scale_point(point: Point, image_width: u32, image_height: u32, viewport: &Viewport) -> Point {
    let sx = if image_width > 0 {
        viewport.width / image_width as f64
    } else {
        1.0
    };
    let sy = if image_height > 0 {
        viewport.height / image_height as f64
    } else {
        1.0
    };
    Point::new(
        point.x * sx - viewport.scroll_x,
        point.y * sy - viewport.scroll_y,
    )
}

fn pointer_click_sequence(p: Point) -> Vec<DomEvent> {
    vec![
        DomEvent::PointerDown { x: p.x, y: p.y },
        DomEvent::MouseDown { x: p.x, y: p.y },
        DomEvent::PointerUp { x: p.x, y: p.y },
        DomEvent::MouseUp { x: p.x, y: p.y },
        DomEvent::Click { x: p.x, y: p.y },
    ]
}

fn enter_key_sequence() -> Vec<DomEvent> {
    vec![
        DomEvent::KeyDown(Key::enter()),
        DomEvent::KeyPress(Key::enter()),
        DomEvent::KeyUp(Key::enter()),
    ]
}

pub struct ActionExecutor<'a, P: PageHandle + ?Sized> {
    page: &'a P,
    marker_duration: Duration,
}

impl<'a, P: PageHandle + ?Sized> ActionExecutor<'a, P> {
    pub fn new(page: &'a P, marker_duration: Duration) -> Self {
        Self {
            page,
            marker_duration,
        }
    }

    /// Execute an action proposed against `observation`.
    pub async fn execute(&self, action: &Action, observation: &Observation) -> ExecutionOutcome {
        let result = match action {
            Action::Click {
                coordinates: Some(point),
                ..
            } => self.click_at(*point, observation).await,
            Action::Click {
                selector: Some(selector),
                ..
            } => self.click_selector(selector).await,
            Action::Click { .. } => Ok(ExecutionOutcome::not_applied(
                "click has neither coordinates nor selector",
            )),
            Action::Navigate { url } => self.navigate(url).await,
            Action::TypeText {
                text,
                selector,
                submit,
            } => self.type_text(text, selector.as_deref(), *submit).await,
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::not_applied(e.to_string()),
        };
        match &outcome.reason {
            Some(reason) => warn!(action = %action, reason = %reason, "Action not applied"),
            None => info!(action = %action, "Action applied"),
        }
        outcome
    }

    async fn click_at(&self, point: Point, observation: &Observation) -> Result<ExecutionOutcome> {
        let viewport = self.page.viewport().await?;
        let target = scale_point(
            point,
            observation.image_width,
            observation.image_height,
            &viewport,
        );
        debug!(
            from_x = point.x,
            from_y = point.y,
            to_x = target.x,
            to_y = target.y,
            "Scaled click point"
        );

        let Some(element) = self.page.element_at(target).await? else {
            return Ok(ExecutionOutcome::not_applied(format!(
                "no element at ({:.0}, {:.0})",
                target.x, target.y
            )));
        };

        self.page
            .dispatch(&element.handle, &pointer_click_sequence(target))
            .await?;

        // Diagnostic only.
        if let Err(e) = self.page.show_click_marker(target, self.marker_duration).await {
            debug!(error = %e, "Click marker not shown");
        }

        Ok(ExecutionOutcome::applied())
    }

    async fn click_selector(&self, selector: &str) -> Result<ExecutionOutcome> {
        let Some(element) = self.page.query_selector(selector).await? else {
            return Ok(ExecutionOutcome::not_applied(format!(
                "no element matches '{}'",
                selector
            )));
        };
        self.page
            .dispatch(&element.handle, &[DomEvent::Click { x: 0.0, y: 0.0 }])
            .await?;
        Ok(ExecutionOutcome::applied())
    }

    async fn navigate(&self, url: &str) -> Result<ExecutionOutcome> {
        self.page.navigate(url).await?;
        Ok(ExecutionOutcome::applied())
    }

    async fn type_text(
        &self,
        text: &str,
        selector: Option<&str>,
        submit: bool,
    ) -> Result<ExecutionOutcome> {
        let element = match self.resolve_text_target(selector).await {
            Ok(element) => element,
            Err(ReplayError::NoInputTarget) => {
                return Ok(ExecutionOutcome::not_applied(
                    ReplayError::NoInputTarget.to_string(),
                ));
            }
            Err(e) => return Err(e),
        };

        self.page.set_value(&element.handle, text).await?;
        self.page
            .dispatch(&element.handle, &[DomEvent::Input, DomEvent::Change])
            .await?;

        if submit {
            match self.page.enclosing_form(&element.handle).await? {
                Some(form) => {
                    debug!("Submitting enclosing form");
                    self.page.dispatch(&form, &[DomEvent::Submit]).await?;
                    self.page.submit_form(&form).await?;
                }
                None => {
                    debug!("No enclosing form, pressing Enter");
                    self.page
                        .dispatch(&element.handle, &enter_key_sequence())
                        .await?;
                }
            }
        }

        Ok(ExecutionOutcome::applied())
    }

    /// Selector target, else the focused element, else the first text input
    /// on the page. Whatever is chosen ends up focused.
    async fn resolve_text_target(&self, selector: Option<&str>) -> Result<ElementInfo> {
        let candidate = match selector {
            Some(selector) => {
                let found = self.page.query_selector(selector).await?;
                if let Some(element) = &found {
                    self.page.focus(&element.handle).await?;
                }
                found
            }
            None => self.page.focused_element().await?,
        };

        if let Some(element) = candidate.filter(ElementInfo::accepts_text) {
            return Ok(element);
        }

        let fallback = self
            .page
            .find_text_input()
            .await?
            .ok_or(ReplayError::NoInputTarget)?;
        debug!(tag = %fallback.tag, "Falling back to first text input");
        self.page.focus(&fallback.handle).await?;
        Ok(fallback)
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
