//! In-memory page and oracle doubles for driving the runner without a
//! browser or a model.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ReplayError, Result};
use crate::oracle::{Oracle, OracleReply};
use crate::page::{DomEvent, ElementHandle, ElementInfo, PageHandle};
use crate::types::{Observation, Point, StepContext, Viewport};

/// Everything a [`FakePage`] was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum PageCall {
    Capture,
    Focus(ElementHandle),
    Dispatch {
        element: ElementHandle,
        event: DomEvent,
    },
    SetValue {
        element: ElementHandle,
        text: String,
    },
    SubmitForm(ElementHandle),
    Navigate(String),
    Marker(Point),
}

#[derive(Debug, Clone)]
pub struct FakeElement {
    info: ElementInfo,
    selector: Option<String>,
    rect: Option<(f64, f64, f64, f64)>,
    form: Option<u64>,
    value: Option<String>,
}

impl FakeElement {
    pub fn new(id: u64, tag: &str) -> Self {
        Self {
            info: ElementInfo {
                handle: ElementHandle(id),
                tag: tag.to_string(),
                input_type: None,
                content_editable: false,
                disabled: false,
                visible: true,
            },
            selector: None,
            rect: None,
            form: None,
            value: None,
        }
    }

    pub fn selector(mut self, selector: &str) -> Self {
        self.selector = Some(selector.to_string());
        self
    }

    /// Bounding box in viewport coordinates.
    pub fn at(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.rect = Some((x, y, width, height));
        self
    }

    pub fn input_type(mut self, kind: &str) -> Self {
        self.info.input_type = Some(kind.to_string());
        self
    }

    pub fn in_form(mut self, form_id: u64) -> Self {
        self.form = Some(form_id);
        self
    }

    pub fn editable(mut self) -> Self {
        self.info.content_editable = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.info.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.info.disabled = true;
        self
    }

    fn contains(&self, p: Point) -> bool {
        match self.rect {
            Some((x, y, w, h)) => p.x >= x && p.x <= x + w && p.y >= y && p.y <= y + h,
            None => false,
        }
    }
}

struct FakeState {
    viewport: Viewport,
    image_size: (u32, u32),
    elements: Vec<FakeElement>,
    focused: Option<u64>,
    page_text: String,
    url: String,
    calls: Vec<PageCall>,
    capture_failures: u32,
    viewport_fails: bool,
}

/// A scriptable stand-in for a live page.
pub struct FakePage {
    state: Mutex<FakeState>,
}

impl FakePage {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            state: Mutex::new(FakeState {
                viewport: Viewport {
                    width,
                    height,
                    scroll_x: 0.0,
                    scroll_y: 0.0,
                },
                image_size: (width as u32, height as u32),
                elements: Vec::new(),
                focused: None,
                page_text: String::new(),
                url: "about:blank".to_string(),
                calls: Vec::new(),
                capture_failures: 0,
                viewport_fails: false,
            }),
        }
    }

    /// Later elements sit on top of earlier ones.
    pub fn add_element(&self, element: FakeElement) {
        self.state.lock().elements.push(element);
    }

    pub fn set_focus(&self, id: u64) {
        self.state.lock().focused = Some(id);
    }

    pub fn set_page_text(&self, text: &str) {
        self.state.lock().page_text = text.to_string();
    }

    pub fn set_scroll(&self, x: f64, y: f64) {
        let mut state = self.state.lock();
        state.viewport.scroll_x = x;
        state.viewport.scroll_y = y;
    }

    pub fn set_image_size(&self, width: u32, height: u32) {
        self.state.lock().image_size = (width, height);
    }

    /// The next `n` captures fail.
    pub fn fail_captures(&self, n: u32) {
        self.state.lock().capture_failures = n;
    }

    pub fn fail_viewport(&self, fail: bool) {
        self.state.lock().viewport_fails = fail;
    }

    pub fn calls(&self) -> Vec<PageCall> {
        self.state.lock().calls.clone()
    }

    pub fn capture_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, PageCall::Capture))
            .count()
    }

    pub fn events_for(&self, id: u64) -> Vec<DomEvent> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                PageCall::Dispatch { element, event } if element.0 == id => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn value_of(&self, id: u64) -> Option<String> {
        self.state
            .lock()
            .elements
            .iter()
            .find(|e| e.info.handle.0 == id)
            .and_then(|e| e.value.clone())
    }

    pub fn focused(&self) -> Option<u64> {
        self.state.lock().focused
    }

    pub fn url(&self) -> String {
        self.state.lock().url.clone()
    }

    fn info_of(state: &FakeState, id: u64) -> Option<ElementInfo> {
        state
            .elements
            .iter()
            .find(|e| e.info.handle.0 == id)
            .map(|e| e.info.clone())
    }
}

#[async_trait]
impl PageHandle for FakePage {
    async fn capture(&self, include_dom: bool) -> Result<Observation> {
        let mut state = self.state.lock();
        state.calls.push(PageCall::Capture);
        if state.capture_failures > 0 {
            state.capture_failures -= 1;
            return Err(ReplayError::Capture("screenshot refused".to_string()));
        }
        Ok(Observation {
            image: vec![0x89, b'P', b'N', b'G'],
            image_width: state.image_size.0,
            image_height: state.image_size.1,
            viewport_width: state.viewport.width as u32,
            viewport_height: state.viewport.height as u32,
            dom_summary: include_dom.then(|| format!("{} elements", state.elements.len())),
        })
    }

    async fn viewport(&self) -> Result<Viewport> {
        let state = self.state.lock();
        if state.viewport_fails {
            return Err(ReplayError::Execution("viewport unavailable".to_string()));
        }
        Ok(state.viewport)
    }

    async fn element_at(&self, point: Point) -> Result<Option<ElementInfo>> {
        let state = self.state.lock();
        Ok(state
            .elements
            .iter()
            .rev()
            .find(|e| e.contains(point))
            .map(|e| e.info.clone()))
    }

    async fn query_selector(&self, selector: &str) -> Result<Option<ElementInfo>> {
        let state = self.state.lock();
        Ok(state
            .elements
            .iter()
            .find(|e| e.selector.as_deref() == Some(selector))
            .map(|e| e.info.clone()))
    }

    async fn focused_element(&self) -> Result<Option<ElementInfo>> {
        let state = self.state.lock();
        Ok(state.focused.and_then(|id| Self::info_of(&state, id)))
    }

    async fn find_text_input(&self) -> Result<Option<ElementInfo>> {
        let state = self.state.lock();
        Ok(state
            .elements
            .iter()
            .map(|e| &e.info)
            .find(|info| info.visible && !info.disabled && info.accepts_text())
            .cloned())
    }

    async fn focus(&self, element: &ElementHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.focused = Some(element.0);
        state.calls.push(PageCall::Focus(element.clone()));
        Ok(())
    }

    async fn dispatch(&self, element: &ElementHandle, events: &[DomEvent]) -> Result<()> {
        let mut state = self.state.lock();
        for event in events {
            state.calls.push(PageCall::Dispatch {
                element: element.clone(),
                event: event.clone(),
            });
        }
        Ok(())
    }

    async fn set_value(&self, element: &ElementHandle, text: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(e) = state.elements.iter_mut().find(|e| e.info.handle == *element) {
            e.value = Some(text.to_string());
        }
        state.calls.push(PageCall::SetValue {
            element: element.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn enclosing_form(&self, element: &ElementHandle) -> Result<Option<ElementHandle>> {
        let state = self.state.lock();
        Ok(state
            .elements
            .iter()
            .find(|e| e.info.handle == *element)
            .and_then(|e| e.form)
            .map(ElementHandle))
    }

    async fn submit_form(&self, form: &ElementHandle) -> Result<()> {
        self.state.lock().calls.push(PageCall::SubmitForm(form.clone()));
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.url = url.to_string();
        state.calls.push(PageCall::Navigate(url.to_string()));
        Ok(())
    }

    async fn page_text(&self) -> Result<String> {
        Ok(self.state.lock().page_text.clone())
    }

    async fn show_click_marker(&self, point: Point, _duration: Duration) -> Result<()> {
        self.state.lock().calls.push(PageCall::Marker(point));
        Ok(())
    }
}

/// Replays a fixed list of replies, then repeats a fallback forever. With
/// no fallback the oracle reports itself unavailable once the list is used up.
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Result<OracleReply>>>,
    fallback: Option<OracleReply>,
    seen: Mutex<Vec<StepContext>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<Result<OracleReply>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(reply: OracleReply) -> Self {
        Self::new(Vec::new()).then_repeat(reply)
    }

    pub fn then_repeat(mut self, reply: OracleReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    pub fn call_count(&self) -> usize {
        self.seen.lock().len()
    }

    /// The contexts passed on each call.
    pub fn contexts(&self) -> Vec<StepContext> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn decide(&self, _observation: &Observation, context: &StepContext) -> Result<OracleReply> {
        self.seen.lock().push(context.clone());
        if let Some(reply) = self.replies.lock().pop_front() {
            return reply;
        }
        self.fallback
            .clone()
            .ok_or_else(|| ReplayError::OracleUnavailable("no scripted reply left".to_string()))
    }
}
