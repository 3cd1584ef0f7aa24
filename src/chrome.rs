//! Chrome-backed [`PageHandle`] over the DevTools protocol.
//!
//! Every CDP call is blocking, so each one runs on `spawn_blocking`.
//! Resolved elements are kept in an in-page array (`window.__rpaReplayRefs`)
//! and addressed by index, which leaves element attributes untouched.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{ReplayError, Result};
use crate::page::{DomEvent, ElementHandle, ElementInfo, PageHandle};
use crate::types::{Observation, Point, Viewport};

pub const DOM_SNAPSHOT_MAX_CHARS: usize = 4000;

/// Shared helpers prepended to every element snippet.
const REGISTRY_JS: &str = r#"
  const __reg = (window.__rpaReplayRefs = window.__rpaReplayRefs || []);
  const __textTypes = ['text','search','email','url','tel','password','number','date','datetime-local','month','week','time'];
  function __visible(el) {
    const s = getComputedStyle(el);
    const r = el.getBoundingClientRect();
    return s.display !== 'none' && s.visibility !== 'hidden' && r.width > 0 && r.height > 0;
  }
  function __describe(el) {
    if (!el || el === document.body || el === document.documentElement) return null;
    let ref = __reg.indexOf(el);
    if (ref < 0) { __reg.push(el); ref = __reg.length - 1; }
    return {
      handle: ref,
      tag: el.tagName.toLowerCase(),
      inputType: el.tagName === 'INPUT' ? (el.type || 'text') : null,
      contentEditable: !!el.isContentEditable,
      disabled: !!el.disabled,
      visible: __visible(el),
    };
  }
  function __el(ref) {
    const el = __reg[ref];
    if (!el || !el.isConnected) throw new Error('stale element reference ' + ref);
    return el;
  }
"#;

/// Read-only summary of visible interactive elements and short text leaves.
const SNAPSHOT_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK']);
  let id = 0;
  const lines = [];
  const seen = new Set();

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && el.tagName !== 'HTML') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function walk(node, depth) {
    if (depth > 15) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName)) continue;
      if (!isVisible(child)) continue;
      const tag = child.tagName.toLowerCase();
      if (['a','button','input','textarea','select'].includes(tag)) {
        const r = child.getBoundingClientRect();
        const at = ' @(' + Math.round(r.x + r.width / 2) + ',' + Math.round(r.y + r.height / 2) + ')';
        let desc = '[e' + (id++) + '] ' + tag;
        if (tag === 'input' || tag === 'textarea') {
          desc += ' type=' + (child.type || 'text') + ' placeholder="' + (child.placeholder || '') + '"';
          if (child.name) desc += ' name=' + child.name;
        } else if (tag === 'select') {
          desc += ' [' + [...child.options].map(o => o.text.trim().slice(0, 20)).join('|') + ']';
        } else {
          desc += ' "' + (child.textContent || '').trim().slice(0, 60) + '"';
        }
        desc += at;
        if (!seen.has(desc)) { seen.add(desc); lines.push(desc); }
      } else {
        const text = child.textContent ? child.textContent.trim() : '';
        if (text && text.length > 2 && text.length < 200 && child.children.length === 0) {
          const t = text.slice(0, 100);
          if (!seen.has(t)) { seen.add(t); lines.push('  "' + t + '"'); }
        }
      }
      walk(child, depth + 1);
    }
  }

  if (document.body) walk(document.body, 0);
  return lines.join('\n');
})()
"#;

fn element_snippet(body: &str) -> String {
    format!("(() => {{ {} {} }})()", REGISTRY_JS, body)
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Largest screenshot handed to the oracle, in pixels.
pub const MAX_SCREENSHOT_WIDTH: u32 = 1280;
pub const MAX_SCREENSHOT_HEIGHT: u32 = 800;

/// Largest size within `max_width` x `max_height` that keeps the aspect
/// ratio. Never upscales.
pub(crate) fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let ratio = (max_width as f64 / width as f64).min(max_height as f64 / height as f64);
    (
        ((width as f64 * ratio).round() as u32).max(1),
        ((height as f64 * ratio).round() as u32).max(1),
    )
}

/// Shrink a PNG screenshot to fit the given bound and report its final size.
pub(crate) fn scale_screenshot(
    png: Vec<u8>,
    max_width: u32,
    max_height: u32,
) -> Result<(Vec<u8>, u32, u32)> {
    let img = image::load_from_memory_with_format(&png, ImageFormat::Png)
        .map_err(|e| ReplayError::Capture(format!("Failed to decode screenshot: {}", e)))?;
    let (width, height) = img.dimensions();
    let (new_width, new_height) = fit_within(width, height, max_width, max_height);
    if (new_width, new_height) == (width, height) {
        return Ok((png, width, height));
    }

    let resized = img.resize_exact(new_width, new_height, FilterType::Triangle);
    let mut buffer = Cursor::new(Vec::new());
    resized
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| ReplayError::Capture(format!("Failed to encode screenshot: {}", e)))?;

    debug!(
        "Scaled screenshot from {}x{} to {}x{}",
        width, height, new_width, new_height
    );
    Ok((buffer.into_inner(), new_width, new_height))
}

fn truncate_snapshot(raw: String) -> String {
    let total = raw.chars().count();
    if total > DOM_SNAPSHOT_MAX_CHARS {
        let head: String = raw.chars().take(DOM_SNAPSHOT_MAX_CHARS).collect();
        format!("{}\n... [truncated, {} total chars]", head, total)
    } else {
        raw
    }
}

#[derive(Deserialize)]
struct Handle {
    handle: u64,
}

/// One Chrome tab driven through CDP.
#[derive(Clone)]
pub struct ChromePage {
    tab: Arc<Tab>,
}

impl ChromePage {
    pub fn new(tab: Arc<Tab>) -> Self {
        Self { tab }
    }

    /// Evaluate a snippet that returns `JSON.stringify(...)` and decode it.
    async fn eval_json<T: DeserializeOwned + Send + 'static>(&self, js: String) -> Result<T> {
        let tab = self.tab.clone();
        let raw = tokio::task::spawn_blocking(move || -> Result<String> {
            let result = tab
                .evaluate(&js, false)
                .map_err(|e| ReplayError::Execution(format!("{:#}", e)))?;
            Ok(result
                .value
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "null".to_string()))
        })
        .await
        .map_err(|e| ReplayError::Execution(format!("page task panicked: {}", e)))??;

        serde_json::from_str(&raw)
            .map_err(|e| ReplayError::Execution(format!("unexpected page reply: {}", e)))
    }

    async fn eval_element(&self, body: &str) -> Result<Option<ElementInfo>> {
        self.eval_json(element_snippet(body)).await
    }

    async fn eval_unit(&self, body: &str) -> Result<()> {
        let _: bool = self
            .eval_json(element_snippet(&format!("{} return JSON.stringify(true);", body)))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PageHandle for ChromePage {
    async fn capture(&self, include_dom: bool) -> Result<Observation> {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || -> Result<Observation> {
            let viewport = tab
                .evaluate("JSON.stringify([window.innerWidth, window.innerHeight])", false)
                .map_err(|e| ReplayError::Capture(format!("{:#}", e)))?;
            let (viewport_width, viewport_height): (u32, u32) = viewport
                .value
                .and_then(|v| v.as_str().and_then(|s| serde_json::from_str(s).ok()))
                .ok_or_else(|| ReplayError::Capture("viewport size unavailable".to_string()))?;

            let raw = tab
                .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| ReplayError::Capture(format!("{:#}", e)))?;
            // Device pixels on HiDPI tabs; bring them down to CSS pixels at most.
            let (image, image_width, image_height) = scale_screenshot(
                raw,
                viewport_width.clamp(1, MAX_SCREENSHOT_WIDTH),
                viewport_height.clamp(1, MAX_SCREENSHOT_HEIGHT),
            )?;

            let dom_summary = if include_dom {
                match tab.evaluate(SNAPSHOT_JS, false) {
                    Ok(result) => result
                        .value
                        .and_then(|v| v.as_str().map(String::from))
                        .map(truncate_snapshot),
                    Err(e) => {
                        debug!(error = %e, "DOM snapshot unavailable");
                        None
                    }
                }
            } else {
                None
            };

            Ok(Observation {
                image,
                image_width,
                image_height,
                viewport_width,
                viewport_height,
                dom_summary,
            })
        })
        .await
        .map_err(|e| ReplayError::Capture(format!("capture task panicked: {}", e)))?
    }

    async fn viewport(&self) -> Result<Viewport> {
        self.eval_json(
            "JSON.stringify({width: window.innerWidth, height: window.innerHeight, \
             scroll_x: window.scrollX, scroll_y: window.scrollY})"
                .to_string(),
        )
        .await
    }

    async fn element_at(&self, point: Point) -> Result<Option<ElementInfo>> {
        self.eval_element(&format!(
            "return JSON.stringify(__describe(document.elementFromPoint({}, {})));",
            point.x, point.y
        ))
        .await
    }

    async fn query_selector(&self, selector: &str) -> Result<Option<ElementInfo>> {
        self.eval_element(&format!(
            "let el = null; try {{ el = document.querySelector({}); }} catch (e) {{}} \
             return JSON.stringify(__describe(el));",
            js_string(selector)
        ))
        .await
    }

    async fn focused_element(&self) -> Result<Option<ElementInfo>> {
        self.eval_element("return JSON.stringify(__describe(document.activeElement));")
            .await
    }

    async fn find_text_input(&self) -> Result<Option<ElementInfo>> {
        self.eval_element(
            "const all = document.querySelectorAll('input, textarea, [contenteditable]'); \
             for (const el of all) { \
               const d = __describe(el); \
               if (!d || !d.visible || d.disabled) continue; \
               if (d.contentEditable || d.tag === 'textarea' || __textTypes.includes(d.inputType)) \
                 return JSON.stringify(d); \
             } \
             return JSON.stringify(null);",
        )
        .await
    }

    async fn focus(&self, element: &ElementHandle) -> Result<()> {
        self.eval_unit(&format!("__el({}).focus();", element.0)).await
    }

    async fn dispatch(&self, element: &ElementHandle, events: &[DomEvent]) -> Result<()> {
        let events = serde_json::to_string(events)
            .map_err(|e| ReplayError::Execution(e.to_string()))?;
        self.eval_unit(&format!(
            "const el = __el({}); \
             for (const ev of {}) {{ \
               const xy = {{ bubbles: true, cancelable: true, view: window, clientX: ev.x || 0, clientY: ev.y || 0 }}; \
               let e; \
               switch (ev.type) {{ \
                 case 'pointerdown': case 'pointerup': \
                   e = new PointerEvent(ev.type, {{ ...xy, pointerType: 'mouse', isPrimary: true, button: 0 }}); break; \
                 case 'mousedown': case 'mouseup': case 'click': \
                   e = new MouseEvent(ev.type, {{ ...xy, button: 0 }}); break; \
                 case 'keydown': case 'keypress': case 'keyup': \
                   e = new KeyboardEvent(ev.type, {{ bubbles: true, cancelable: true, key: ev.key, code: ev.code, keyCode: ev.keyCode, which: ev.keyCode }}); break; \
                 case 'submit': \
                   e = new Event('submit', {{ bubbles: true, cancelable: true }}); break; \
                 default: \
                   e = new Event(ev.type, {{ bubbles: true }}); \
               }} \
               el.dispatchEvent(e); \
             }}",
            element.0, events
        ))
        .await
    }

    async fn set_value(&self, element: &ElementHandle, text: &str) -> Result<()> {
        // The prototype setter keeps framework-controlled inputs in sync.
        self.eval_unit(&format!(
            "const el = __el({}); const text = {}; \
             if (el.isContentEditable) {{ el.textContent = text; }} \
             else {{ \
               const desc = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value'); \
               if (desc && desc.set) desc.set.call(el, text); else el.value = text; \
             }}",
            element.0,
            js_string(text)
        ))
        .await
    }

    async fn enclosing_form(&self, element: &ElementHandle) -> Result<Option<ElementHandle>> {
        let form: Option<Handle> = self
            .eval_json(element_snippet(&format!(
                "const el = __el({}); return JSON.stringify(__describe(el.form || el.closest('form')));",
                element.0
            )))
            .await?;
        Ok(form.map(|f| ElementHandle(f.handle)))
    }

    async fn submit_form(&self, form: &ElementHandle) -> Result<()> {
        // submit() does not fire a submit event; the executor dispatches one first.
        self.eval_unit(&format!("HTMLFormElement.prototype.submit.call(__el({}));", form.0))
            .await
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        reqwest::Url::parse(url)
            .map_err(|e| ReplayError::Execution(format!("invalid url '{}': {}", url, e)))?;
        let tab = self.tab.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            tab.navigate_to(&url)
                .map(|_| ())
                .map_err(|e| ReplayError::Execution(format!("{:#}", e)))
        })
        .await
        .map_err(|e| ReplayError::Execution(format!("navigate task panicked: {}", e)))?
    }

    async fn page_text(&self) -> Result<String> {
        self.eval_json(
            "JSON.stringify(document.body ? document.body.innerText : '')".to_string(),
        )
        .await
    }

    async fn show_click_marker(&self, point: Point, duration: Duration) -> Result<()> {
        self.eval_unit(&format!(
            "const m = document.createElement('div'); \
             m.style.cssText = 'position:fixed;left:{x}px;top:{y}px;width:20px;height:20px;\
margin:-10px 0 0 -10px;border-radius:50%;background:rgba(255,0,0,0.5);border:2px solid red;\
pointer-events:none;z-index:2147483647'; \
             document.documentElement.appendChild(m); \
             setTimeout(() => m.remove(), {ms});",
            x = point.x,
            y = point.y,
            ms = duration.as_millis()
        ))
        .await
    }
}

/// Browser process plus the tab being driven.
pub struct BrowserSession {
    _browser: Browser,
    tab: Arc<Tab>,
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

impl BrowserSession {
    /// Attach to a Chrome started with `--remote-debugging-port`.
    pub async fn attach(debug_port: u16) -> Result<Self> {
        let endpoint = format!("http://127.0.0.1:{}/json/version", debug_port);
        info!(%endpoint, "Attempting to attach to existing Chrome");
        let version: VersionInfo = reqwest::get(&endpoint)
            .await
            .map_err(|e| ReplayError::NoActiveTarget(e.to_string()))?
            .json()
            .await
            .map_err(|e| ReplayError::NoActiveTarget(e.to_string()))?;

        tokio::task::spawn_blocking(move || -> Result<Self> {
            let browser = Browser::connect(version.web_socket_debugger_url)
                .map_err(|e| ReplayError::NoActiveTarget(format!("{:#}", e)))?;
            let existing = browser.get_tabs().lock().ok().and_then(|tabs| tabs.first().cloned());
            let tab = match existing {
                Some(tab) => {
                    info!("Using existing tab");
                    tab
                }
                None => {
                    info!("No tabs found, creating new one");
                    browser
                        .new_tab()
                        .map_err(|e| ReplayError::NoActiveTarget(format!("{:#}", e)))?
                }
            };
            Ok(Self {
                _browser: browser,
                tab,
            })
        })
        .await
        .map_err(|e| ReplayError::NoActiveTarget(format!("attach task panicked: {}", e)))?
    }

    /// Launch a fresh Chrome with a persistent profile. Blocking.
    pub fn launch(headless: bool) -> Result<Self> {
        let profile = profile_dir();
        if let Err(e) = std::fs::create_dir_all(&profile) {
            warn!(error = %e, ?profile, "Could not create profile directory");
        }

        let options = LaunchOptions {
            headless,
            user_data_dir: Some(profile),
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-infobars"),
                std::ffi::OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(headless, "Starting Chrome");
        let browser =
            Browser::new(options).map_err(|e| ReplayError::NoActiveTarget(format!("{:#}", e)))?;
        let tab = browser
            .new_tab()
            .map_err(|e| ReplayError::NoActiveTarget(format!("{:#}", e)))?;
        info!("Chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    pub fn page(&self) -> ChromePage {
        ChromePage::new(self.tab.clone())
    }
}

fn profile_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rpa-replay")
        .join("profile")
}

#[cfg(test)]
#[path = "chrome_tests.rs"]
mod tests;
