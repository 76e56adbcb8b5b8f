use anyhow::{Context, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::protocol::cdp::Page::DialogType;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::{Browser, LaunchOptions, Tab};
use publish_agent::{
    Action, ActionExecutor, ActionResult, AgentError, Check, ObservedState, Point, SessionFactory,
};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::dom;

/// Shared Chrome instance. Every run gets its own tab from it.
pub struct ChromeSessions {
    browser: Arc<Browser>,
    screenshots: bool,
}

impl ChromeSessions {
    /// Attach to a Chrome already listening on port 9222, or launch one with
    /// a persistent agent profile so site logins survive restarts.
    pub fn launch(headless: bool, screenshots: bool) -> Result<Self> {
        tracing::info!("[Hands] Attempting to attach to existing Chrome on port 9222...");
        if let Ok(browser) = Browser::connect("http://127.0.0.1:9222".to_string()) {
            tracing::info!("[Hands] Attached to existing Chrome");
            return Ok(Self {
                browser: Arc::new(browser),
                screenshots,
            });
        }

        let profile = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("publish-agent")
            .join("chrome-profile");
        std::fs::create_dir_all(&profile)
            .with_context(|| format!("creating profile dir {}", profile.display()))?;
        tracing::info!("[Hands] Launching Chrome with profile {}", profile.display());

        let options = LaunchOptions {
            headless,
            path: find_chrome(),
            user_data_dir: Some(profile),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(60 * 60),
            ..Default::default()
        };

        let browser =
            Browser::new(options).map_err(|e| anyhow::anyhow!("Browser launch failed: {}", e))?;
        tracing::info!("[Hands] Chrome ready");

        Ok(Self {
            browser: Arc::new(browser),
            screenshots,
        })
    }
}

#[async_trait]
impl SessionFactory for ChromeSessions {
    async fn open(&self, workflow_id: &str) -> Result<Arc<dyn ActionExecutor>, AgentError> {
        let browser = self.browser.clone();
        let tab = tokio::task::spawn_blocking(move || {
            let tab = browser.new_tab()?;
            answer_dialogs(&tab)?;
            Ok::<_, anyhow::Error>(tab)
        })
        .await
            .map_err(|e| AgentError::Session(e.to_string()))?
            .map_err(|e| AgentError::Session(format!("opening tab: {e}")))?;
        tracing::debug!("[Hands] New tab for '{}'", workflow_id);

        Ok(Arc::new(ChromeExecutor {
            tab,
            screenshots: self.screenshots,
        }))
    }
}

/// Drives one Chrome tab. Calls into headless_chrome block, so each one
/// runs on the blocking pool.
pub struct ChromeExecutor {
    tab: Arc<Tab>,
    screenshots: bool,
}

impl ChromeExecutor {
    async fn blocking<T, F>(&self, f: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Tab>) -> Result<T> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| AgentError::Session(e.to_string()))?
            .map_err(|e| AgentError::Session(format!("{e:#}")))
    }
}

#[async_trait]
impl ActionExecutor for ChromeExecutor {
    async fn perform(&self, action: &Action) -> ActionResult {
        let action = action.clone();
        let screenshots = self.screenshots;
        let outcome = self
            .blocking(move |tab| {
                let acted = execute_action(tab, &action);
                let state = dom::observe(tab, screenshots).unwrap_or_default();
                Ok((acted.err().map(|e| format!("{e:#}")), state))
            })
            .await;

        match outcome {
            Ok((None, state)) => ActionResult {
                success: true,
                state,
                error: None,
            },
            Ok((Some(error), state)) => ActionResult {
                success: false,
                state,
                error: Some(error),
            },
            Err(e) => ActionResult {
                success: false,
                state: ObservedState::default(),
                error: Some(e.to_string()),
            },
        }
    }

    async fn verify(&self, check: &Check) -> Result<bool, AgentError> {
        let check = check.clone();
        self.blocking(move |tab| dom::check(tab, &check)).await
    }

    async fn observe(&self) -> Result<ObservedState, AgentError> {
        let screenshots = self.screenshots;
        self.blocking(move |tab| dom::observe(tab, screenshots)).await
    }
}

/// Answer JavaScript dialogs as they open so they never block the tab.
fn answer_dialogs(tab: &Arc<Tab>) -> Result<()> {
    let weak = Arc::downgrade(tab);
    tab.add_event_listener(Arc::new(move |event: &Event| {
        let Event::PageJavascriptDialogOpening(opening) = event else {
            return;
        };
        let params = &opening.params;
        let (accept, prompt_text) = dialog_response(&params.Type, params.default_prompt.as_deref());
        tracing::info!(
            "[Hands] {:?} dialog '{}', {}",
            params.Type,
            params.message,
            if accept { "accepting" } else { "dismissing" }
        );
        // the listener thread must not wait on a protocol reply
        let weak = weak.clone();
        std::thread::spawn(move || {
            let Some(tab) = weak.upgrade() else { return };
            if let Err(e) = tab.call_method(Page::HandleJavaScriptDialog {
                accept,
                prompt_text,
            }) {
                tracing::warn!("[Hands] Could not answer dialog: {}", e);
            }
        });
    }))?;
    Ok(())
}

/// Leaving a page and plain notices go ahead; questions are declined.
fn dialog_response(kind: &DialogType, default_prompt: Option<&str>) -> (bool, Option<String>) {
    match kind {
        DialogType::Alert | DialogType::Beforeunload => (true, None),
        DialogType::Confirm => (false, None),
        DialogType::Prompt => (false, default_prompt.map(str::to_string)),
    }
}

fn execute_action(tab: &Arc<Tab>, action: &Action) -> Result<()> {
    tracing::debug!("[Hands] {}", action);
    match action {
        Action::Navigate { url } => {
            tab.navigate_to(url)?;
            tab.wait_until_navigated()?;
            tab.wait_for_element("body")?;
        }
        Action::Click {
            selector,
            coordinates,
        } => match (selector, coordinates) {
            (Some(sel), _) => {
                tab.wait_for_element(sel)?.click()?;
            }
            (None, Some(p)) => click_point(tab, *p)?,
            (None, None) => anyhow::bail!("click needs a selector or coordinates"),
        },
        Action::Type {
            selector,
            coordinates,
            text,
        } => {
            focus_target(tab, selector.as_deref(), *coordinates)?;
            type_text(tab, text)?;
        }
        Action::Upload { selector, path, .. } => {
            let sel = selector.as_deref().unwrap_or("input[type=file]");
            tab.wait_for_element(sel)?
                .set_input_files(&[path.as_str()])?;
        }
        Action::Wait { ms } => std::thread::sleep(Duration::from_millis(*ms)),
    }
    Ok(())
}

/// Focus the field to type into and clear any existing value.
fn focus_target(tab: &Arc<Tab>, selector: Option<&str>, coordinates: Option<Point>) -> Result<()> {
    match (selector, coordinates) {
        (Some(sel), _) => {
            let el = tab.wait_for_element(sel)?;
            el.click()?;
            el.call_js_fn(
                "function() { if ('value' in this) { this.value = ''; } this.focus(); }",
                vec![],
                false,
            )?;
        }
        (None, Some(p)) => {
            click_point(tab, p)?;
        }
        (None, None) => {}
    }
    Ok(())
}

/// Newlines become Enter presses so multi-paragraph editors get real breaks.
fn type_text(tab: &Arc<Tab>, text: &str) -> Result<()> {
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            tab.press_key("Enter")?;
        }
        if !line.is_empty() {
            tab.type_str(line)?;
        }
    }
    Ok(())
}

fn click_point(tab: &Arc<Tab>, p: Point) -> Result<()> {
    let js = format!(
        r#"(() => {{
  const el = document.elementFromPoint({x}, {y});
  if (!el) return false;
  el.click();
  if (el.focus) el.focus();
  return true;
}})()"#,
        x = p.x,
        y = p.y
    );
    let hit = tab
        .evaluate(&js, false)?
        .value
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !hit {
        anyhow::bail!("nothing clickable at ({}, {})", p.x, p.y);
    }
    Ok(())
}

/// Explicit `CHROME_PATH`, then the usual install locations. `None` lets
/// headless_chrome search on its own.
fn find_chrome() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHROME_PATH") {
        return Some(PathBuf::from(path));
    }
    [
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leave_page_and_alert_dialogs_are_accepted() {
        assert_eq!(dialog_response(&DialogType::Beforeunload, None), (true, None));
        assert_eq!(dialog_response(&DialogType::Alert, None), (true, None));
    }

    #[test]
    fn confirm_and_prompt_dialogs_are_dismissed() {
        assert_eq!(dialog_response(&DialogType::Confirm, None), (false, None));
        assert_eq!(
            dialog_response(&DialogType::Prompt, Some("draft 1")),
            (false, Some("draft 1".to_string()))
        );
    }
}
