//! Ceremony state machines: registration, login, account recovery, device linking.
//!
//! Each ceremony owns one `CeremonyState` for its lifetime. The state enforces
//! the declared phase order, emits at most one terminal event, guards against a
//! second in-flight request, and goes silent once cancelled.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::errors::{scrub_error_message, CeremonyError, CeremonyErrorKind};

pub mod collaborators;
pub mod device_linking;
pub mod login;
pub mod orchestrator;
pub mod phases;
pub mod recovery;
pub mod registration;
pub mod session;


pub use collaborators::{DeviceRegistration, MemoryWalletStore, NearChainClient, WalletStore};
pub use device_linking::{DeviceLinkQrData, LinkDeviceOutcome};
pub use login::{LoginOutcome, UnlockMethod};
pub use orchestrator::{WalletContext, WalletRequest};
pub use phases::{DeviceLinkingPhase, LoginPhase, RecoveryPhase, RegistrationPhase};
pub use recovery::RecoveryOutcome;
pub use registration::RegistrationOutcome;
pub use session::LoginSession;

/// A closed, ordered set of phases for one ceremony type.
pub trait CeremonyPhase: Copy + Eq + fmt::Debug + Serialize {
    const CEREMONY: &'static str;
    /// Successful terminal phase.
    const COMPLETE: Self;

    /// Position in the declared order; error phases sort last.
    fn ordinal(self) -> u8;
    fn name(self) -> &'static str;
    fn is_error(self) -> bool;
    /// Error phase for a failure raised while `during` was the latest phase.
    fn error_phase(during: Option<Self>) -> Self;
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Progress,
    Success,
    Error,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CeremonyEvent<P> {
    pub phase: P,
    pub status: EventStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-checkable kind of `error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub type EventSink<P> = Box<dyn Fn(&CeremonyEvent<P>)>;

// === CANCELLATION ===

/// Shared cancel handle; clone it to keep a way to cancel a running ceremony.
#[derive(Clone, Default)]
pub struct CeremonyCancel {
    cancelled: Rc<Cell<bool>>,
    notify: Rc<Notify>,
}

impl CeremonyCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.replace(true) {
            debug!("Ceremony cancellation requested");
        }
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Run `fut` unless cancelled first; a result that lands after
    /// cancellation is discarded.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, CeremonyErrorKind>
    where
        F: Future<Output = Result<T, CeremonyErrorKind>>,
    {
        if self.is_cancelled() {
            return Err(CeremonyErrorKind::Cancelled);
        }
        let result = tokio::select! {
            biased;
            _ = self.cancelled() => return Err(CeremonyErrorKind::Cancelled),
            result = fut => result,
        };
        if self.is_cancelled() {
            return Err(CeremonyErrorKind::Cancelled);
        }
        result
    }
}

// === CEREMONY STATE ===

/// One ceremony instance.
pub struct CeremonyState<P: CeremonyPhase> {
    account_id: String,
    final_phase: P,
    current: Cell<Option<(P, EventStatus)>>,
    terminal: Cell<bool>,
    in_flight: Cell<bool>,
    error: RefCell<Option<CeremonyError>>,
    cancel: CeremonyCancel,
    sink: Option<EventSink<P>>,
}

impl<P: CeremonyPhase> CeremonyState<P> {
    pub fn new(account_id: &str, cancel: CeremonyCancel, sink: Option<EventSink<P>>) -> Self {
        Self::with_final_phase(account_id, P::COMPLETE, cancel, sink)
    }

    pub fn with_final_phase(
        account_id: &str,
        final_phase: P,
        cancel: CeremonyCancel,
        sink: Option<EventSink<P>>,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            final_phase,
            current: Cell::new(None),
            terminal: Cell::new(false),
            in_flight: Cell::new(false),
            error: RefCell::new(None),
            cancel,
            sink,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn phase(&self) -> Option<P> {
        self.current.get().map(|(phase, _)| phase)
    }

    pub fn status(&self) -> Option<EventStatus> {
        self.current.get().map(|(_, status)| status)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.get()
    }

    pub fn error(&self) -> Option<CeremonyError> {
        self.error.borrow().clone()
    }

    pub fn cancel_handle(&self) -> &CeremonyCancel {
        &self.cancel
    }

    pub fn progress(&self, phase: P, message: &str) -> Result<(), CeremonyErrorKind> {
        self.emit(phase, EventStatus::Progress, message, None)
    }

    pub fn success(&self, phase: P, message: &str) -> Result<(), CeremonyErrorKind> {
        self.emit(phase, EventStatus::Success, message, None)
    }

    pub fn success_with(
        &self,
        phase: P,
        message: &str,
        data: serde_json::Value,
    ) -> Result<(), CeremonyErrorKind> {
        self.emit(phase, EventStatus::Success, message, Some(data))
    }

    fn emit(
        &self,
        phase: P,
        status: EventStatus,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), CeremonyErrorKind> {
        if self.cancel.is_cancelled() {
            return Err(CeremonyErrorKind::Cancelled);
        }
        if self.terminal.get() || phase.is_error() || status == EventStatus::Error {
            return Err(self.order_error(phase));
        }
        if let Some((current, current_status)) = self.current.get() {
            let ok = if phase == current {
                current_status == EventStatus::Progress
            } else {
                phase.ordinal() > current.ordinal() && current_status == EventStatus::Success
            };
            if !ok {
                return Err(self.order_error(phase));
            }
        }

        self.current.set(Some((phase, status)));
        if phase == self.final_phase && status == EventStatus::Success {
            self.terminal.set(true);
        }
        self.deliver(CeremonyEvent {
            phase,
            status,
            message: message.to_string(),
            error: None,
            error_kind: None,
            data,
        });
        Ok(())
    }

    fn order_error(&self, next: P) -> CeremonyErrorKind {
        let current = self
            .phase()
            .map(|p| p.name().to_string())
            .unwrap_or_else(|| "start".to_string());
        warn!(
            "{}: refusing {} after {}",
            P::CEREMONY,
            next.name(),
            current
        );
        CeremonyErrorKind::PhaseOrder {
            current,
            next: next.name().to_string(),
        }
    }

    /// Terminate with an error. Emits the error phase unless the ceremony is
    /// already terminal or was cancelled.
    pub fn fail(&self, kind: CeremonyErrorKind) -> CeremonyError {
        let during = self.phase();
        let phase_name = during
            .map(|p| p.name())
            .unwrap_or_else(|| P::error_phase(None).name());
        let cancelled = self.cancel.is_cancelled() || kind == CeremonyErrorKind::Cancelled;
        let kind = if cancelled {
            CeremonyErrorKind::Cancelled
        } else {
            kind
        };
        let err = CeremonyError {
            ceremony: P::CEREMONY.to_string(),
            phase: phase_name.to_string(),
            kind,
        };

        if self.terminal.replace(true) || cancelled {
            debug!("{} ended without error event: {}", P::CEREMONY, err);
            return err;
        }

        let message = scrub_error_message(&err.kind.to_string());
        error!("{} failed during {}: {}", P::CEREMONY, phase_name, message);
        let error_phase = P::error_phase(during);
        self.current.set(Some((error_phase, EventStatus::Error)));
        *self.error.borrow_mut() = Some(err.clone());
        self.deliver(CeremonyEvent {
            phase: error_phase,
            status: EventStatus::Error,
            message: message.clone(),
            error: Some(message),
            error_kind: Some(err.kind.tag().to_string()),
            data: None,
        });
        err
    }

    fn deliver(&self, event: CeremonyEvent<P>) {
        debug!(
            "{} [{}] {:?}: {}",
            P::CEREMONY,
            event.phase.name(),
            event.status,
            event.message
        );
        if let Some(sink) = &self.sink {
            sink(&event);
        }
    }

    /// Mark a request in flight for this ceremony; a second concurrent
    /// request fails with `Reentrant`.
    pub fn begin_request(&self) -> Result<InFlightGuard<'_>, CeremonyErrorKind> {
        if self.in_flight.replace(true) {
            return Err(CeremonyErrorKind::Reentrant);
        }
        Ok(InFlightGuard {
            flag: &self.in_flight,
        })
    }

    /// PROGRESS, run `work` as this ceremony's single in-flight request, SUCCESS.
    pub async fn step<T, F>(&self, phase: P, message: &str, work: F) -> Result<T, CeremonyErrorKind>
    where
        F: Future<Output = Result<T, CeremonyErrorKind>>,
    {
        self.progress(phase, message)?;
        let result = {
            let _guard = self.begin_request()?;
            self.cancel.guard(work).await?
        };
        self.success(phase, &format!("{} completed", phase.name()))?;
        Ok(result)
    }
}

pub struct InFlightGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}
