//! Call Engine Module - Lebenszyklus eines Anrufs
//!
//! Dieses Modul verwaltet:
//! - Call State Machine (genau eine Session pro Client)
//! - Eingehende Anrufe über Record-Änderungen
//! - Call UI Lock gegen Lifecycle-Rauschen des Hosts

mod engine;
mod lock;
mod watcher;

pub use engine::{CallDeps, CallEngine, CallError, CallState, EndReason, EngineEvent};
pub use lock::{HostSignal, HostSignalChannel, SuspendSignalSource, UiLock};
pub use watcher::{
    CallAvailability, CallerProfile, IncomingCall, IncomingCallWatcher, ProfileResolver,
    WatcherEvent,
};
