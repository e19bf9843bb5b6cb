// Headless Chrome rendering. One browser per render worker; tabs are created
// per scan and closed afterwards. A browser/context failure ("page has been
// closed" and friends) recycles the browser once and retries the render.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use headless_chrome::{Browser, LaunchOptions};

use crate::error::AppError;

pub struct ChromeRenderer {
    browser: Mutex<Option<Browser>>,
    idle_timeout: Duration,
}

impl ChromeRenderer {
    pub fn new() -> Self {
        Self {
            browser: Mutex::new(None),
            idle_timeout: Duration::from_secs(300),
        }
    }

    /// Render a page to its final DOM HTML. Runs the blocking CDP protocol
    /// on the blocking pool; the enclosing task stays cancellable.
    pub async fn render_dom(
        self: Arc<Self>,
        url: &str,
        user_agent: Option<String>,
        timeout: Duration,
    ) -> Result<String, AppError> {
        let url = url.to_string();
        tokio::task::spawn_blocking(move || self.render_blocking(&url, user_agent, timeout))
            .await
            .map_err(|e| AppError::Render(format!("render task panicked: {}", e)))?
    }

    fn render_blocking(
        &self,
        url: &str,
        user_agent: Option<String>,
        timeout: Duration,
    ) -> Result<String, AppError> {
        match self.try_render(url, user_agent.clone(), timeout) {
            Ok(html) => Ok(html),
            Err(first) => {
                // Context failures are usually a dead browser; recycle once.
                tracing::warn!("Browser render failed, recycling browser: {}", first);
                self.drop_browser();
                self.try_render(url, user_agent, timeout)
            }
        }
    }

    fn try_render(
        &self,
        url: &str,
        user_agent: Option<String>,
        timeout: Duration,
    ) -> Result<String, AppError> {
        // The guard is held for the whole render: one browser, one render
        // at a time per worker, which matches the render pool sizing.
        let mut guard = self.browser.lock().expect("browser mutex");
        if guard.is_none() {
            *guard = Some(self.launch()?);
        }
        let browser = guard.as_ref().expect("browser just launched");

        let tab = browser
            .new_tab()
            .map_err(|e| AppError::Render(format!("failed to open tab: {}", e)))?;
        tab.set_default_timeout(timeout);

        if let Some(ua) = user_agent.as_deref() {
            tab.set_user_agent(ua, None, None)
                .map_err(|e| AppError::Render(format!("failed to set user agent: {}", e)))?;
        }

        let result = (|| {
            tab.navigate_to(url)
                .map_err(|e| AppError::Render(format!("navigation failed: {}", e)))?;
            tab.wait_until_navigated()
                .map_err(|e| AppError::Render(format!("page load failed: {}", e)))?;
            tab.get_content()
                .map_err(|e| AppError::Render(format!("failed to capture DOM: {}", e)))
        })();

        let _ = tab.close(true);
        result
    }

    fn launch(&self) -> Result<Browser, AppError> {
        let options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .idle_browser_timeout(self.idle_timeout)
            .build()
            .map_err(|e| AppError::Render(format!("invalid browser options: {}", e)))?;
        let browser = Browser::new(options)
            .map_err(|e| AppError::Render(format!("failed to launch browser: {}", e)))?;
        tracing::info!("Launched headless browser");
        Ok(browser)
    }

    fn drop_browser(&self) {
        let mut guard = self.browser.lock().expect("browser mutex");
        *guard = None;
    }
}

impl Default for ChromeRenderer {
    fn default() -> Self {
        Self::new()
    }
}
