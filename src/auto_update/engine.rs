// Update Delivery Engine port
// The external engine fetches manifests, transfers bytes, verifies checksums
// and runs the installer. This module only describes how we talk to it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::auto_update::cancel::CancellationToken;
use crate::auto_update::types::{
    is_cancellation_message, is_network_message, is_terminal_message, UpdateInfo,
};

/// Error reported by the delivery engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineError {
    pub message: String,
    /// System error code when available (ENOTFOUND, ECONNREFUSED, ...)
    #[serde(default)]
    pub code: Option<String>,
}

impl EngineError {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn with_code(message: &str, code: &str) -> Self {
        Self {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }

    fn text(&self) -> String {
        match &self.code {
            Some(code) => format!("{} {}", code, self.message),
            None => self.message.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal_message(&self.text())
    }

    pub fn is_network(&self) -> bool {
        is_network_message(&self.text())
    }

    pub fn is_cancellation(&self) -> bool {
        is_cancellation_message(&self.text())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for EngineError {}

/// Artifact the engine should fetch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadRequest {
    pub version: String,
    pub url: String,
}

/// Events emitted by the delivery engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Available(UpdateInfo),
    NotAvailable,
    Progress {
        transferred: u64,
        total: u64,
        percent: f64,
    },
    Downloaded(UpdateInfo),
    Error(EngineError),
}

/// Commands issued to the delivery engine
#[async_trait]
pub trait UpdateDeliveryEngine: Send + Sync {
    /// Fetch the remote manifest. `Ok(None)` when nothing newer is published.
    async fn check_for_updates(&self) -> Result<Option<UpdateInfo>, EngineError>;

    /// Transfer the artifact, reporting progress through events.
    /// Must return (usually with an error) once `token` is cancelled.
    async fn download_update(
        &self,
        request: DownloadRequest,
        token: CancellationToken,
    ) -> Result<(), EngineError>;

    /// Quit the host app and run the installer
    fn quit_and_install(&self);

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// OS-level focus signal used to skip background work while idle
pub trait FocusMonitor: Send + Sync {
    /// Time since any application window last had focus
    fn idle_duration(&self) -> Duration;
}

/// Focus monitor for hosts without a window system; never idle
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysFocused;

impl FocusMonitor for AlwaysFocused {
    fn idle_duration(&self) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted engine and focus monitor shared by the component tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub enum CheckStep {
        Found(UpdateInfo),
        Nothing,
        Fail(EngineError),
        /// Never answers; exercises the timeout race
        Hang,
    }

    pub enum DownloadStep {
        Succeed,
        Fail(EngineError),
        /// Runs until the token is cancelled, then fails with "cancelled"
        UntilCancelled,
    }

    pub struct FakeEngine {
        events: broadcast::Sender<EngineEvent>,
        check_script: Mutex<VecDeque<CheckStep>>,
        download_script: Mutex<VecDeque<DownloadStep>>,
        check_delay: Mutex<Duration>,
        pub check_calls: AtomicUsize,
        /// When each check call reached the engine
        pub check_times: Mutex<Vec<tokio::time::Instant>>,
        pub install_calls: AtomicUsize,
        pub download_requests: Mutex<Vec<DownloadRequest>>,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            let (events, _) = broadcast::channel(64);
            Self {
                events,
                check_script: Mutex::new(VecDeque::new()),
                download_script: Mutex::new(VecDeque::new()),
                check_delay: Mutex::new(Duration::from_millis(50)),
                check_calls: AtomicUsize::new(0),
                check_times: Mutex::new(Vec::new()),
                install_calls: AtomicUsize::new(0),
                download_requests: Mutex::new(Vec::new()),
            }
        }

        pub fn push_check(&self, step: CheckStep) {
            self.check_script.lock().push_back(step);
        }

        pub fn push_download(&self, step: DownloadStep) {
            self.download_script.lock().push_back(step);
        }

        pub fn emit(&self, event: EngineEvent) {
            let _ = self.events.send(event);
        }

        pub fn checks(&self) -> usize {
            self.check_calls.load(Ordering::SeqCst)
        }

        /// Gaps between consecutive check calls
        pub fn check_gaps(&self) -> Vec<Duration> {
            self.check_times
                .lock()
                .windows(2)
                .map(|pair| pair[1] - pair[0])
                .collect()
        }

        pub fn downloads(&self) -> Vec<DownloadRequest> {
            self.download_requests.lock().clone()
        }
    }

    #[async_trait]
    impl UpdateDeliveryEngine for FakeEngine {
        async fn check_for_updates(&self) -> Result<Option<UpdateInfo>, EngineError> {
            self.check_calls.fetch_add(1, Ordering::SeqCst);
            self.check_times.lock().push(tokio::time::Instant::now());
            let step = self.check_script.lock().pop_front();
            let delay = *self.check_delay.lock();
            tokio::time::sleep(delay).await;
            match step {
                Some(CheckStep::Found(info)) => Ok(Some(info)),
                Some(CheckStep::Nothing) | None => Ok(None),
                Some(CheckStep::Fail(error)) => Err(error),
                Some(CheckStep::Hang) => {
                    std::future::pending::<()>().await;
                    Ok(None)
                }
            }
        }

        async fn download_update(
            &self,
            request: DownloadRequest,
            token: CancellationToken,
        ) -> Result<(), EngineError> {
            self.download_requests.lock().push(request);
            let step = self.download_script.lock().pop_front();
            match step {
                Some(DownloadStep::Succeed) | None => Ok(()),
                Some(DownloadStep::Fail(error)) => Err(error),
                Some(DownloadStep::UntilCancelled) => {
                    token.cancelled().await;
                    Err(EngineError::new("download cancelled"))
                }
            }
        }

        fn quit_and_install(&self) {
            self.install_calls.fetch_add(1, Ordering::SeqCst);
        }

        fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
            self.events.subscribe()
        }
    }

    pub struct FakeFocus {
        idle: Mutex<Duration>,
    }

    impl FakeFocus {
        pub fn new(idle: Duration) -> Self {
            Self {
                idle: Mutex::new(idle),
            }
        }

        pub fn set_idle(&self, idle: Duration) {
            *self.idle.lock() = idle;
        }
    }

    impl FocusMonitor for FakeFocus {
        fn idle_duration(&self) -> Duration {
            *self.idle.lock()
        }
    }
}
