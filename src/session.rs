//! Device session: discovery, connection lifecycle and serialized dispatch
//! of device actions.
//!
//! ```text
//! Disconnected -> Discovering -> Connected -> Executing -> Connected -> ... -> Disconnected
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::commands::{self, open_app, ActionOutput, DeviceAction};
use crate::error::{DeviceFailure, LedgerError, TransportError};
use crate::transport::Transport;
use crate::types::{DeviceFilter, DiscoveredDevice};

pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Discovering,
    Connected,
    Executing,
}

/// Terminal state of one device action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceActionResult {
    Completed(ActionOutput),
    Failed(DeviceFailure),
}

/// Identity of an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    pub device: DiscoveredDevice,
}

impl SessionHandle {
    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }

    pub fn model_id(&self) -> String {
        self.device.model_id()
    }
}

/// One connected device, driven by exactly one owner.
///
/// `connect` and `disconnect` take `&mut self`; actions take `&self` and
/// queue on an internal mutex, so at most one action is in flight.
///
/// Every exchange runs on its own task that holds the dispatch lock until
/// the device answers. A caller that times out leaves the task running, so
/// a late answer is consumed by the request it belongs to and the next
/// action starts on a clean link.
pub struct DeviceSession {
    transport: Arc<dyn Transport>,
    action_timeout: Duration,
    dispatch: Arc<Mutex<()>>,
    in_flight: StdMutex<Option<AbortHandle>>,
    handle: Option<SessionHandle>,
    phase: SessionState,
}

impl DeviceSession {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Arc::from(transport),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            dispatch: Arc::new(Mutex::new(())),
            in_flight: StdMutex::new(None),
            handle: None,
            phase: SessionState::Disconnected,
        }
    }

    #[must_use]
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn action_timeout(&self) -> Duration {
        self.action_timeout
    }

    /// Discover devices and connect to the one selected by `filter`.
    ///
    /// Discovery must finish within `timeout`. With several devices the
    /// first one matching the filter wins, falling back to the first one
    /// discovered.
    pub async fn connect(
        &mut self,
        filter: &DeviceFilter,
        timeout: Duration,
    ) -> Result<SessionHandle, LedgerError> {
        if self.is_connected() {
            self.disconnect().await;
        }

        self.phase = SessionState::Discovering;
        let result = self.establish(filter, timeout).await;
        match &result {
            Ok(handle) => {
                log::info!(
                    "connected to Ledger {} ({}), session {}",
                    handle.device.model,
                    handle.device_id(),
                    handle.session_id
                );
                self.handle = Some(handle.clone());
                self.phase = SessionState::Connected;
            }
            Err(e) => {
                log::debug!("connect failed: {e}");
                self.phase = SessionState::Disconnected;
            }
        }
        result
    }

    async fn establish(
        &self,
        filter: &DeviceFilter,
        timeout: Duration,
    ) -> Result<SessionHandle, LedgerError> {
        let devices = tokio::time::timeout(timeout, self.transport.discover())
            .await
            .map_err(|_| LedgerError::DeviceNotConnected("discovery timeout".into()))?
            .map_err(|e| LedgerError::DeviceNotConnected(e.to_string()))?;

        log::debug!("discovered {} Ledger device(s)", devices.len());
        let device = filter
            .select(&devices)
            .cloned()
            .ok_or_else(|| LedgerError::DeviceNotConnected("no Ledger devices found".into()))?;

        self.transport
            .connect(&device)
            .await
            .map_err(|e| LedgerError::DeviceNotConnected(e.to_string()))?;

        Ok(SessionHandle {
            session_id: Uuid::new_v4().to_string(),
            device,
        })
    }

    /// Make `name` the running application on the connected device.
    pub async fn open_application(&self, name: &str) -> Result<(), LedgerError> {
        self.require_session()?;
        let name = name.to_owned();

        let failure = match self
            .run_exchange(move |transport| async move {
                open_app::ensure(transport.as_ref(), &name).await
            })
            .await
        {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(failure)) => failure,
            Err(e) => DeviceFailure::from_message(e.to_string()),
        };

        if failure.is_locked() {
            Err(LedgerError::AppNotOpen("device is locked".into()))
        } else {
            Err(LedgerError::AppNotOpen(failure.message))
        }
    }

    /// Run one action to its terminal state.
    ///
    /// Waits behind any action already in flight, including one whose
    /// caller gave up. On timeout the device is not interrupted; the
    /// abandoned exchange keeps the link until its answer arrives.
    pub async fn execute(&self, action: DeviceAction) -> Result<DeviceActionResult, LedgerError> {
        let handle = self.require_session()?;
        let name = action.name();
        log::debug!("{name} on session {}", handle.session_id);

        let result = self
            .run_exchange(move |transport| async move {
                commands::run(transport.as_ref(), &action).await
            })
            .await?;
        match result {
            Ok(output) => Ok(DeviceActionResult::Completed(output)),
            Err(failure) => {
                log::debug!("{name} failed: {failure}");
                Ok(DeviceActionResult::Failed(failure))
            }
        }
    }

    /// Queue for the link, then run `exchange` on a task that owns it.
    ///
    /// Both the wait and the exchange are bounded by the action timeout.
    async fn run_exchange<T, F, Fut>(
        &self,
        exchange: F,
    ) -> Result<Result<T, DeviceFailure>, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T, DeviceFailure>> + Send + 'static,
    {
        let timeout = self.action_timeout;
        let guard = tokio::time::timeout(timeout, Arc::clone(&self.dispatch).lock_owned())
            .await
            .map_err(|_| LedgerError::Timeout(timeout))?;

        let exchange = exchange(Arc::clone(&self.transport));
        let task = tokio::spawn(async move {
            let result = exchange.await;
            drop(guard);
            result
        });
        if let Ok(mut slot) = self.in_flight.lock() {
            *slot = Some(task.abort_handle());
        }

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Ok(Err(DeviceFailure::from(TransportError::Comm(format!(
                "device exchange ended abnormally: {e}"
            ))))),
            Err(_) => {
                log::debug!(
                    "no answer within {}ms, leaving the exchange to finish",
                    timeout.as_millis()
                );
                Err(LedgerError::Timeout(timeout))
            }
        }
    }

    /// Tear the session down. Never fails; transport errors are logged.
    ///
    /// An exchange still waiting for the device is abandoned.
    pub async fn disconnect(&mut self) {
        if let Ok(slot) = self.in_flight.get_mut() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        let Some(handle) = self.handle.take() else {
            self.phase = SessionState::Disconnected;
            return;
        };
        if let Err(e) = self.transport.disconnect().await {
            log::debug!("ignoring disconnect error: {e}");
        }
        self.phase = SessionState::Disconnected;
        log::info!("disconnected session {}", handle.session_id);
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            SessionState::Connected if self.dispatch.try_lock().is_err() => {
                SessionState::Executing
            }
            phase => phase,
        }
    }

    pub fn handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.session_id.as_str())
    }

    pub fn device(&self) -> Option<&DiscoveredDevice> {
        self.handle.as_ref().map(|h| &h.device)
    }

    fn require_session(&self) -> Result<&SessionHandle, LedgerError> {
        self.handle
            .as_ref()
            .ok_or_else(|| LedgerError::DeviceNotConnected("no active device session".into()))
    }
}
