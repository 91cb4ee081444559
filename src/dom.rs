use anyhow::{Context, Result, anyhow};
use headless_chrome::Tab;
use serde::Deserialize;

use crate::types::{DOM_SNAPSHOT_MAX_CHARS, PAGE_TEXT_MAX_CHARS, PageDiagnostics};

/// JavaScript injected into the page to produce a simplified DOM representation.
/// NON-DESTRUCTIVE: reads the DOM without modifying styles or layout.
///
/// The script:
///   1. Skips script, style, noscript, svg elements (does NOT remove them).
///   2. Walks the visible DOM tree (max depth 15).
///   3. Assigns sequential IDs [e0], [e1], ... to interactive elements
///      (a, button, input, textarea, select, role=button/checkbox/link)
///      via data-eid attributes.
///   4. Emits a compact one-line-per-element text representation.
const SNAPSHOT_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK']);
  const ROLES = new Set(['button','checkbox','link','tab','menuitem','switch','radio','option']);
  let id = 0;
  const lines = [];
  const seen = new Set();

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && el.tagName !== 'HTML') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function labelFor(el) {
    if (el.id) {
      const l = document.querySelector('label[for="' + CSS.escape(el.id) + '"]');
      if (l) return l.textContent.trim().slice(0, 40);
    }
    return el.getAttribute('aria-label') || '';
  }

  function walk(node, depth) {
    if (depth > 15) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName)) continue;
      if (!isVisible(child)) continue;
      const tag = child.tagName.toLowerCase();
      const role = child.getAttribute('role');
      const interactive = ['a','button','input','textarea','select'].includes(tag) || ROLES.has(role);

      if (interactive) {
        const eid = '[e' + (id++) + ']';
        child.setAttribute('data-eid', eid);
        let desc = '';
        const text = (child.textContent||'').trim().slice(0,60);
        if (tag === 'a') {
          desc = eid + ' link "' + text + '"';
        } else if (tag === 'input' || tag === 'textarea') {
          desc = eid + ' ' + tag + ' type=' + (child.type||'text') + ' placeholder="' + (child.placeholder||'') + '"';
          const label = labelFor(child);
          if (label) desc += ' label="' + label + '"';
          if (child.name) desc += ' name=' + child.name;
          if (child.type === 'checkbox' || child.type === 'radio') desc += child.checked ? ' checked' : ' unchecked';
          else if (child.value && child.type !== 'password') desc += ' value="' + child.value.slice(0,30) + '"';
          if (child.disabled) desc += ' disabled';
        } else if (tag === 'button') {
          desc = eid + ' button "' + text + '"' + (child.disabled ? ' disabled' : '');
        } else if (tag === 'select') {
          const opts = [...child.options].map(o => o.text.trim().slice(0,20)).join('|');
          desc = eid + ' select [' + opts + ']';
        } else {
          desc = eid + ' ' + role + ' "' + text + '"';
        }
        if (desc && !seen.has(desc)) {
          seen.add(desc);
          lines.push(desc);
        }
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

/// Records console errors/warnings and failed requests into `window.__pilotDiag`.
/// Installing twice is a no-op.
const DIAGNOSTICS_HOOK_JS: &str = r#"
(() => {
  if (window.__pilotDiag) return 'present';
  const d = window.__pilotDiag = { console: [], network: [] };
  const cap = (arr, line) => { arr.push(String(line).slice(0, 300)); if (arr.length > 50) arr.shift(); };
  const fmt = (a) => { try { return typeof a === 'string' ? a : JSON.stringify(a); } catch (e) { return String(a); } };

  for (const level of ['error', 'warn']) {
    const orig = console[level];
    console[level] = function (...args) {
      cap(d.console, level + ': ' + args.map(fmt).join(' '));
      return orig.apply(this, args);
    };
  }
  window.addEventListener('error', (e) => {
    const t = e.target;
    if (t && t !== window && (t.src || t.href)) cap(d.network, 'failed to load ' + (t.src || t.href));
    else cap(d.console, 'error: ' + e.message);
  }, true);
  window.addEventListener('unhandledrejection', (e) => {
    cap(d.console, 'error: unhandled rejection ' + ((e.reason && e.reason.message) || e.reason));
  });

  if (window.fetch) {
    const f = window.fetch;
    window.fetch = function (...args) {
      const url = String((args[0] && args[0].url) || args[0]);
      return f.apply(this, args).then(
        (r) => { if (!r.ok) cap(d.network, 'fetch ' + url + ' -> ' + r.status); return r; },
        (err) => { cap(d.network, 'fetch ' + url + ' failed: ' + err); throw err; });
    };
  }
  const open = XMLHttpRequest.prototype.open;
  const send = XMLHttpRequest.prototype.send;
  XMLHttpRequest.prototype.open = function (m, u, ...rest) {
    this.__pilot = m + ' ' + u;
    return open.call(this, m, u, ...rest);
  };
  XMLHttpRequest.prototype.send = function (...a) {
    this.addEventListener('loadend', () => {
      if (this.status === 0 || this.status >= 400) cap(d.network, 'xhr ' + this.__pilot + ' -> ' + this.status);
    });
    return send.apply(this, a);
  };
  return 'installed';
})()
"#;

const DRAIN_DIAGNOSTICS_JS: &str = r#"
(() => {
  const d = window.__pilotDiag;
  if (!d) return JSON.stringify({ console: [], network: [] });
  return JSON.stringify({ console: d.console.splice(0), network: d.network.splice(0) });
})()
"#;

/// Evaluate a script that returns a string.
fn eval_string(tab: &Tab, js: &str) -> Result<String> {
    let result = tab.evaluate(js, false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}

/// A JS expression resolving `selector` (CSS, or `xpath=` prefixed) to an element or null.
fn element_expr(selector: &str) -> Result<String> {
    match selector.strip_prefix("xpath=") {
        Some(xpath) => Ok(format!(
            "document.evaluate({}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue",
            serde_json::to_string(xpath)?
        )),
        None => Ok(format!(
            "document.querySelector({})",
            serde_json::to_string(selector)?
        )),
    }
}

fn truncate(raw: String, max: usize) -> String {
    let total = raw.chars().count();
    if total > max {
        let head: String = raw.chars().take(max).collect();
        format!("{head}\n... [truncated, {total} total chars]")
    } else {
        raw
    }
}

/// Capture a simplified DOM snapshot from the current page.
pub fn capture_dom_snapshot(tab: &Tab) -> Result<String> {
    let raw = eval_string(tab, SNAPSHOT_JS)?;
    Ok(truncate(raw, DOM_SNAPSHOT_MAX_CHARS))
}

/// Visible text of the page body.
pub fn page_text(tab: &Tab) -> Result<String> {
    let raw = eval_string(tab, "document.body ? document.body.innerText : ''")?;
    Ok(truncate(raw, PAGE_TEXT_MAX_CHARS))
}

pub fn ready_state(tab: &Tab) -> Result<String> {
    eval_string(tab, "document.readyState")
}

pub fn install_diagnostics_hook(tab: &Tab) -> Result<()> {
    eval_string(tab, DIAGNOSTICS_HOOK_JS)?;
    Ok(())
}

pub fn drain_diagnostics(tab: &Tab) -> Result<PageDiagnostics> {
    let raw = eval_string(tab, DRAIN_DIAGNOSTICS_JS)?;
    if raw.is_empty() {
        return Ok(PageDiagnostics::default());
    }
    serde_json::from_str(&raw).context("parsing page diagnostics")
}

/// What the page reports about one element.
#[derive(Debug, Clone, Deserialize)]
pub struct ElementState {
    pub visible: bool,
    pub enabled: bool,
    pub checked: bool,
    pub value: String,
}

/// `None` when no element matches `selector`.
pub fn element_state(tab: &Tab, selector: &str) -> Result<Option<ElementState>> {
    let js = format!(
        r#"(() => {{
  const el = {};
  if (!el) return '';
  const s = getComputedStyle(el);
  const r = el.getBoundingClientRect();
  return JSON.stringify({{
    visible: s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0' && r.width > 0 && r.height > 0,
    enabled: !el.disabled && el.getAttribute('aria-disabled') !== 'true',
    checked: !!el.checked || el.getAttribute('aria-checked') === 'true',
    value: ('value' in el) ? String(el.value) : (el.textContent || '').trim(),
  }});
}})()"#,
        element_expr(selector)?
    );
    let raw = eval_string(tab, &js)?;
    if raw.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&raw)
        .map(Some)
        .with_context(|| format!("parsing element state for {selector}"))
}

/// Run `body` against the element bound to `el`; errors when it does not exist.
fn with_element(tab: &Tab, selector: &str, body: &str) -> Result<()> {
    let js = format!(
        "(() => {{ const el = {}; if (!el) return 'missing'; {body} return 'ok'; }})()",
        element_expr(selector)?
    );
    match eval_string(tab, &js)?.as_str() {
        "ok" => Ok(()),
        "missing" => Err(anyhow!("no element matches {selector}")),
        other => Err(anyhow!("unexpected script result for {selector}: {other}")),
    }
}

pub fn clear_value(tab: &Tab, selector: &str) -> Result<()> {
    with_element(
        tab,
        selector,
        "el.value = ''; el.dispatchEvent(new Event('input', { bubbles: true }));",
    )
}

pub fn double_click(tab: &Tab, selector: &str) -> Result<()> {
    with_element(
        tab,
        selector,
        "el.scrollIntoView({ block: 'center' }); el.dispatchEvent(new MouseEvent('dblclick', { bubbles: true, cancelable: true, view: window }));",
    )
}

/// Select an option by visible text or value.
pub fn select_option(tab: &Tab, selector: &str, choice: &str) -> Result<()> {
    let body = format!(
        "const want = {}; \
         const opt = [...(el.options || [])].find(o => o.text.trim() === want || o.value === want); \
         if (!opt) return 'missing'; \
         el.value = opt.value; \
         el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
         el.dispatchEvent(new Event('change', {{ bubbles: true }}));",
        serde_json::to_string(choice)?
    );
    with_element(tab, selector, &body)
        .with_context(|| format!("selecting '{choice}'"))
}

/// Drag `source` onto `target`, firing both mouse and HTML5 drag-and-drop events.
pub fn drag_to(tab: &Tab, source: &str, target: &str) -> Result<()> {
    let body = format!(
        "const dst = {}; \
         if (!dst) return 'no drop target'; \
         el.scrollIntoView({{ block: 'center' }}); \
         const at = (node) => {{ const r = node.getBoundingClientRect(); return {{ clientX: r.left + r.width / 2, clientY: r.top + r.height / 2 }}; }}; \
         const from = at(el), to = at(dst); \
         const mouse = (node, type, p) => node.dispatchEvent(new MouseEvent(type, {{ bubbles: true, cancelable: true, view: window, buttons: 1, ...p }})); \
         mouse(el, 'mousedown', from); \
         mouse(dst, 'mousemove', to); \
         const dt = new DataTransfer(); \
         const drag = (node, type, p) => node.dispatchEvent(new DragEvent(type, {{ bubbles: true, cancelable: true, dataTransfer: dt, ...p }})); \
         drag(el, 'dragstart', from); \
         drag(dst, 'dragenter', to); \
         drag(dst, 'dragover', to); \
         drag(dst, 'drop', to); \
         drag(el, 'dragend', to); \
         mouse(dst, 'mouseup', to);",
        element_expr(target)?
    );
    with_element(tab, source, &body).with_context(|| format!("dragging onto {target}"))
}

pub fn focus(tab: &Tab, selector: &str) -> Result<()> {
    with_element(tab, selector, "el.focus();")
}
