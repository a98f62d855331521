//! Ownership of the single headless-browser process.
//!
//! The browser is a shared mutable resource whose death invalidates
//! every worker. The supervisor is the only component allowed to start
//! or stop it; workers never attempt their own restarts.

use std::collections::VecDeque;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chromiumoxide::browser::{Browser, BrowserConfig, HeadlessMode};
use chromiumoxide::page::Page;
use futures::StreamExt as _;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use export_core::{ExportError, ExportResult};

/// Restart attempts permitted inside [`RESTART_WINDOW`].
const RESTART_BUDGET: usize = 3;
/// Sliding window the restart budget applies to.
const RESTART_WINDOW: Duration = Duration::from_secs(30);

/// Flags passed to the browser besides chromiumoxide's defaults.
///
/// The set mirrors what reliable headless capture needs: no GPU, no
/// shared-memory surprises in containers, deterministic color and
/// scrollbar behavior.
const BROWSER_ARGS: &[&str] = &[
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-sync",
    "--force-color-profile=sRGB",
    "--force-device-scale-factor=1",
    "--hide-scrollbars",
    "--mute-audio",
    "--no-first-run",
    "--no-default-browser-check",
    "--metrics-recording-only",
];

/// Observable lifecycle of the browser process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Crashed = 4,
}

impl SupervisorStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Crashed,
            _ => Self::Stopped,
        }
    }
}

struct BrowserSlot {
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    alive: Option<Arc<AtomicBool>>,
}

/// Supervisor for the single long-running browser process.
pub struct Supervisor {
    slot: tokio::sync::Mutex<BrowserSlot>,
    /// Shared with the handler task so a dying event stream can flip
    /// `Running` to `Crashed` on its own.
    status: Arc<AtomicU8>,
    /// Bumped on every successful start; pages carry the generation
    /// they were opened under.
    generation: AtomicU64,
    restarts: std::sync::Mutex<VecDeque<Instant>>,
}

impl Supervisor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: tokio::sync::Mutex::new(BrowserSlot {
                browser: None,
                handler_task: None,
                alive: None,
            }),
            status: Arc::new(AtomicU8::new(SupervisorStatus::Stopped as u8)),
            generation: AtomicU64::new(0),
            restarts: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Generation of the currently running browser.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether the browser process is up as far as we know.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.status() == SupervisorStatus::Running
    }

    /// Launch the browser. A no-op when it is already running.
    pub async fn start(&self) -> ExportResult<()> {
        let mut slot = self.slot.lock().await;
        if self.is_slot_running(&slot) {
            return Ok(());
        }
        self.launch_into(&mut slot).await
    }

    /// Open a fresh, isolated page.
    ///
    /// If the browser crashed, one budgeted restart is attempted before
    /// the call surfaces `BrowserUnavailable`.
    pub async fn new_page(&self) -> ExportResult<Page> {
        let mut slot = self.slot.lock().await;
        if !self.is_slot_running(&slot) {
            self.consume_restart_budget()?;
            self.launch_into(&mut slot).await?;
        }
        let browser = slot.browser.as_ref().ok_or_else(|| {
            ExportError::BrowserUnavailable("browser process is not running".to_owned())
        })?;
        match browser.new_page("about:blank").await {
            Ok(page) => Ok(page),
            Err(err) => {
                warn!("page creation failed, marking browser as crashed: {err}");
                self.mark_crashed(&mut slot);
                Err(ExportError::BrowserUnavailable(err.to_string()))
            }
        }
    }

    /// Shut the browser down and stop its event handler.
    pub async fn stop(&self) {
        self.status
            .store(SupervisorStatus::Stopping as u8, Ordering::Release);
        let mut slot = self.slot.lock().await;
        if let Some(mut browser) = slot.browser.take() {
            if let Err(err) = browser.close().await {
                warn!("browser close failed: {err}");
            }
            if let Err(err) = browser.wait().await {
                debug!("browser wait failed: {err}");
            }
        }
        if let Some(task) = slot.handler_task.take() {
            task.abort();
        }
        slot.alive = None;
        self.status
            .store(SupervisorStatus::Stopped as u8, Ordering::Release);
        info!("browser stopped");
    }

    fn is_slot_running(&self, slot: &BrowserSlot) -> bool {
        let handler_alive = slot
            .alive
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire));
        if slot.browser.is_some() && !handler_alive {
            return false;
        }
        slot.browser.is_some() && self.status() == SupervisorStatus::Running
    }

    async fn launch_into(&self, slot: &mut BrowserSlot) -> ExportResult<()> {
        self.status
            .store(SupervisorStatus::Starting as u8, Ordering::Release);

        // Leftovers from a crashed browser are discarded first.
        if let Some(task) = slot.handler_task.take() {
            task.abort();
        }
        slot.browser = None;
        slot.alive = None;

        let config = build_browser_config()?;
        let (browser, mut handler) = Browser::launch(config).await.map_err(|err| {
            self.status
                .store(SupervisorStatus::Crashed as u8, Ordering::Release);
            ExportError::BrowserUnavailable(format!("browser launch failed: {err}"))
        })?;

        let alive = Arc::new(AtomicBool::new(true));
        let alive_in_task = Arc::clone(&alive);
        let status_in_task = Arc::clone(&self.status);
        // The handler drives every CDP message; when its stream ends the
        // process is gone.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!("browser handler event error: {err}");
                }
            }
            alive_in_task.store(false, Ordering::Release);
            let _was_running = status_in_task.compare_exchange(
                SupervisorStatus::Running as u8,
                SupervisorStatus::Crashed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            error!("browser event stream ended; process presumed dead");
        });

        slot.browser = Some(browser);
        slot.handler_task = Some(handler_task);
        slot.alive = Some(alive);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.status
            .store(SupervisorStatus::Running as u8, Ordering::Release);
        info!("browser started (generation {generation})");
        Ok(())
    }

    fn mark_crashed(&self, slot: &mut BrowserSlot) {
        if let Some(task) = slot.handler_task.take() {
            task.abort();
        }
        slot.browser = None;
        slot.alive = None;
        self.status
            .store(SupervisorStatus::Crashed as u8, Ordering::Release);
    }

    /// Record a restart attempt; errors once the budget inside the
    /// sliding window is exhausted.
    fn consume_restart_budget(&self) -> ExportResult<()> {
        let Ok(mut restarts) = self.restarts.lock() else {
            return Err(ExportError::BrowserUnavailable(
                "restart bookkeeping poisoned".to_owned(),
            ));
        };
        let now = Instant::now();
        while let Some(oldest) = restarts.front() {
            if now.duration_since(*oldest) > RESTART_WINDOW {
                restarts.pop_front();
            } else {
                break;
            }
        }
        if restarts.len() >= RESTART_BUDGET {
            return Err(ExportError::BrowserUnavailable(format!(
                "browser restarted {RESTART_BUDGET} times within {}s; giving up",
                RESTART_WINDOW.as_secs()
            )));
        }
        restarts.push_back(now);
        Ok(())
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn build_browser_config() -> ExportResult<BrowserConfig> {
    let mut builder = BrowserConfig::builder()
        .headless_mode(HeadlessMode::New)
        .no_sandbox()
        .window_size(1280, 800)
        .args(BROWSER_ARGS.iter().copied());

    // Mirror the conventional override for pinned browser binaries.
    if let Ok(chrome_bin) = env::var("CHROME_BIN") {
        let path = PathBuf::from(&chrome_bin);
        if path.exists() {
            builder = builder.chrome_executable(path);
        } else {
            warn!("CHROME_BIN points at {chrome_bin}, which does not exist; ignoring");
        }
    }

    builder
        .build()
        .map_err(|err| ExportError::BrowserUnavailable(format!("browser config rejected: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        assert_eq!(SupervisorStatus::from_u8(0), SupervisorStatus::Stopped);
        assert_eq!(SupervisorStatus::from_u8(2), SupervisorStatus::Running);
        assert_eq!(SupervisorStatus::from_u8(4), SupervisorStatus::Crashed);
        assert_eq!(SupervisorStatus::from_u8(77), SupervisorStatus::Stopped);
    }

    #[test]
    fn restart_budget_is_a_sliding_window() {
        let supervisor = Supervisor::new();
        assert!(supervisor.consume_restart_budget().is_ok());
        assert!(supervisor.consume_restart_budget().is_ok());
        assert!(supervisor.consume_restart_budget().is_ok());
        let exhausted = supervisor.consume_restart_budget();
        assert!(matches!(
            exhausted,
            Err(ExportError::BrowserUnavailable(_))
        ));
    }

    #[test]
    fn fresh_supervisor_is_stopped() {
        let supervisor = Supervisor::new();
        assert_eq!(supervisor.status(), SupervisorStatus::Stopped);
        assert!(!supervisor.is_alive());
        assert_eq!(supervisor.generation(), 0);
    }
}
