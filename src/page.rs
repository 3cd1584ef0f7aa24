//! The capability to observe and act on one live page.
//!
//! The runner and executor only ever talk to a page through [`PageHandle`],
//! so a real browser, a headless one, or an in-memory fake all plug in the
//! same way.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Observation, Point, Viewport};

/// Opaque reference to an element resolved inside the page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(pub u64);

/// What the executor needs to know about a resolved element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInfo {
    pub handle: ElementHandle,
    /// Lowercase tag name.
    pub tag: String,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub content_editable: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

/// Input types that do not accept free text.
const NON_TEXT_INPUT_TYPES: [&str; 10] = [
    "button", "checkbox", "color", "file", "hidden", "image", "radio", "range", "reset", "submit",
];

impl ElementInfo {
    /// Can text be typed into this element?
    pub fn accepts_text(&self) -> bool {
        if self.content_editable {
            return true;
        }
        match self.tag.as_str() {
            "textarea" => true,
            "input" => {
                let kind = self.input_type.as_deref().unwrap_or("text").to_lowercase();
                !NON_TEXT_INPUT_TYPES.contains(&kind.as_str())
            }
            _ => false,
        }
    }
}

/// Synthetic DOM events dispatched by the executor, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DomEvent {
    PointerDown { x: f64, y: f64 },
    MouseDown { x: f64, y: f64 },
    PointerUp { x: f64, y: f64 },
    MouseUp { x: f64, y: f64 },
    Click { x: f64, y: f64 },
    Input,
    Change,
    Submit,
    KeyDown(Key),
    KeyPress(Key),
    KeyUp(Key),
}

impl DomEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomEvent::PointerDown { .. } => "pointerdown",
            DomEvent::MouseDown { .. } => "mousedown",
            DomEvent::PointerUp { .. } => "pointerup",
            DomEvent::MouseUp { .. } => "mouseup",
            DomEvent::Click { .. } => "click",
            DomEvent::Input => "input",
            DomEvent::Change => "change",
            DomEvent::Submit => "submit",
            DomEvent::KeyDown(_) => "keydown",
            DomEvent::KeyPress(_) => "keypress",
            DomEvent::KeyUp(_) => "keyup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    pub key: String,
    pub code: String,
    pub key_code: u32,
}

impl Key {
    pub fn enter() -> Self {
        Self {
            key: "Enter".to_string(),
            code: "Enter".to_string(),
            key_code: 13,
        }
    }
}

#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Screenshot plus the viewport size at the same instant. Must not
    /// mutate the page.
    async fn capture(&self, include_dom: bool) -> Result<Observation>;

    async fn viewport(&self) -> Result<Viewport>;

    /// Topmost element at a point in viewport coordinates.
    async fn element_at(&self, point: Point) -> Result<Option<ElementInfo>>;

    async fn query_selector(&self, selector: &str) -> Result<Option<ElementInfo>>;

    async fn focused_element(&self) -> Result<Option<ElementInfo>>;

    /// First visible, enabled element that accepts text.
    async fn find_text_input(&self) -> Result<Option<ElementInfo>>;

    async fn focus(&self, element: &ElementHandle) -> Result<()>;

    /// Dispatch events on the element in the given order.
    async fn dispatch(&self, element: &ElementHandle, events: &[DomEvent]) -> Result<()>;

    async fn set_value(&self, element: &ElementHandle, text: &str) -> Result<()>;

    /// The `<form>` enclosing the element, if any.
    async fn enclosing_form(&self, element: &ElementHandle) -> Result<Option<ElementHandle>>;

    async fn submit_form(&self, form: &ElementHandle) -> Result<()>;

    /// Start loading a URL without waiting for it to finish.
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Visible text of the page, for success heuristics.
    async fn page_text(&self) -> Result<String>;

    /// Show a transient marker at a point. The page removes it itself.
    async fn show_click_marker(&self, point: Point, duration: Duration) -> Result<()>;
}
