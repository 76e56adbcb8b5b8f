use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use headless_chrome::Tab;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use publish_agent::{Check, ObservedState};
use std::sync::Arc;

use crate::types::{DOM_SNAPSHOT_MAX_CHARS, SCREENSHOT_JPEG_QUALITY};

/// JavaScript injected into the page to produce a compact text view of it.
/// Reads the DOM without changing layout.
///
/// Every interactive element (links, buttons, form fields, contenteditable
/// editors, toolbar buttons carrying `data-name`) gets a line with a
/// selector. Stable selectors (`#id`, `[name=..]`, `[data-name=..]`) are
/// preferred because compiled routes replay them on later page loads;
/// otherwise a per-snapshot `[data-eid="eN"]` is assigned.
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

  function isInteractive(el, tag) {
    return ['a','button','input','textarea','select'].includes(tag)
      || el.isContentEditable && !el.parentElement?.isContentEditable
      || el.hasAttribute('data-name')
      || el.getAttribute('role') === 'button';
  }

  function selectorFor(el, tag) {
    if (el.id) return '#' + CSS.escape(el.id);
    if (el.name) return tag + '[name="' + el.name + '"]';
    const dn = el.getAttribute('data-name');
    if (dn) return '[data-name="' + dn + '"]';
    const eid = 'e' + (id++);
    el.setAttribute('data-eid', eid);
    return '[data-eid="' + eid + '"]';
  }

  function walk(node, depth) {
    if (depth > 18) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName)) continue;
      if (!isVisible(child)) continue;
      const tag = child.tagName.toLowerCase();

      if (isInteractive(child, tag)) {
        const sel = selectorFor(child, tag);
        const text = (child.innerText || child.textContent || '').trim().slice(0, 60);
        let desc = sel + ' ' + tag;
        if (tag === 'input' || tag === 'textarea') {
          desc += ' type=' + (child.type || 'text');
          if (child.placeholder) desc += ' placeholder="' + child.placeholder + '"';
          if (child.value) desc += ' value="' + child.value.slice(0, 60) + '"';
        } else if (tag === 'select') {
          desc += ' [' + [...child.options].map(o => o.text.trim().slice(0, 20)).join('|') + ']';
        } else if (child.isContentEditable) {
          desc += ' editable "' + text + '"';
        } else {
          desc += ' "' + text + '"';
        }
        if (!seen.has(desc)) {
          seen.add(desc);
          lines.push(desc);
        }
        if (child.isContentEditable) continue;
      } else {
        const text = child.textContent ? child.textContent.trim() : '';
        if (text && text.length > 2 && text.length < 200 && child.children.length === 0) {
          const t = text.slice(0, 100);
          if (!seen.has(t)) {
            seen.add(t);
            lines.push('  "' + t + '"');
          }
        }
      }
      walk(child, depth + 1);
    }
  }

  walk(document.body, 0);
  return lines.join('\n');
})()
"#;

/// Capture the structural state of the page, optionally with a screenshot.
pub fn observe(tab: &Arc<Tab>, screenshot: bool) -> Result<ObservedState> {
    let screenshot = if screenshot {
        match capture_screenshot(tab) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::debug!("[Dom] Screenshot failed: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    Ok(ObservedState {
        url: tab.get_url(),
        title: get_page_title(tab).unwrap_or_else(|_| "untitled".into()),
        dom_snapshot: capture_dom_snapshot(tab)?,
        screenshot,
    })
}

/// Evaluate a check against the live page.
pub fn check(tab: &Arc<Tab>, check: &Check) -> Result<bool> {
    Ok(match check {
        Check::UrlContains(s) => tab.get_url().contains(s.as_str()),
        Check::TitleContains(s) => get_page_title(tab)?.contains(s.as_str()),
        Check::ElementPresent(selector) => tab.find_element(selector).is_ok(),
        Check::TextPresent(text) => text_present(tab, text)?,
        Check::ActionSucceeded => true,
    })
}

/// Visible text or any form field value contains `text`. Field values are
/// checked in full, unlike the truncated snapshot.
fn text_present(tab: &Arc<Tab>, text: &str) -> Result<bool> {
    let needle = serde_json::to_string(text)?;
    let js = format!(
        r#"(() => {{
  const t = {needle};
  if ((document.body.innerText || '').includes(t)) return true;
  for (const f of document.querySelectorAll('input, textarea')) {{
    if ((f.value || '').includes(t)) return true;
  }}
  return false;
}})()"#
    );
    let result = tab.evaluate(&js, false)?;
    Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
}

/// Capture a simplified DOM snapshot from the current page.
pub fn capture_dom_snapshot(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate(SNAPSHOT_JS, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();

    if raw.len() > DOM_SNAPSHOT_MAX_CHARS {
        let cut = (0..=DOM_SNAPSHOT_MAX_CHARS)
            .rev()
            .find(|i| raw.is_char_boundary(*i))
            .unwrap_or(0);
        Ok(format!(
            "{}\n... [truncated, {} total chars]",
            &raw[..cut],
            raw.len()
        ))
    } else {
        Ok(raw)
    }
}

fn capture_screenshot(tab: &Arc<Tab>) -> Result<String> {
    let bytes = tab.capture_screenshot(
        CaptureScreenshotFormatOption::Jpeg,
        Some(SCREENSHOT_JPEG_QUALITY),
        None,
        true,
    )?;
    Ok(BASE64.encode(bytes))
}

/// Get the current page title.
pub fn get_page_title(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("document.title", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "untitled".to_string()))
}
