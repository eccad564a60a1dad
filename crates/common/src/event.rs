//! Event catalogue emitted by the orchestrator and its plugin adapters.

use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use derive_more::Display;
use error_stack::Report;
use serde::{Deserialize, Serialize};

use crate::ad_config::AdConfig;
use crate::error::{ListenerError, OrchestratorError};
use crate::settings::SettingKey;

/// Discriminant used to subscribe to events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum EventKind {
    #[display("eventListenerError")]
    EventListenerError,
    #[display("error")]
    Error,
    #[display("warning")]
    Warning,
    #[display("updateSetting")]
    UpdateSetting,
    #[display("defineAds")]
    DefineAds,
    #[display("requestAds")]
    RequestAds,
    #[display("destroyAds")]
    DestroyAds,
    #[display("loadNewPage")]
    LoadNewPage,
    #[display("usePlugin")]
    UsePlugin,
    #[display("start")]
    Start,
    #[display("noUnitDefined")]
    NoUnitDefined,
    #[display("requestUndefinedAdWarning")]
    RequestUndefinedAdWarning,
    #[display("requestBidsTimeout")]
    RequestBidsTimeout,
}

impl EventKind {
    /// Every event kind, in catalogue order.
    pub const ALL: [EventKind; 13] = [
        EventKind::EventListenerError,
        EventKind::Error,
        EventKind::Warning,
        EventKind::UpdateSetting,
        EventKind::DefineAds,
        EventKind::RequestAds,
        EventKind::DestroyAds,
        EventKind::LoadNewPage,
        EventKind::UsePlugin,
        EventKind::Start,
        EventKind::NoUnitDefined,
        EventKind::RequestUndefinedAdWarning,
        EventKind::RequestBidsTimeout,
    ];
}

/// The two plugin roles an orchestrator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginType {
    #[display("adServer")]
    AdServer,
    #[display("headerBidding")]
    HeaderBidding,
}

impl FromStr for PluginType {
    type Err = Report<OrchestratorError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adServer" => Ok(Self::AdServer),
            "headerBidding" => Ok(Self::HeaderBidding),
            other => Err(Report::new(OrchestratorError::UnsupportedPlugin {
                message: format!("unknown plugin type '{other}'"),
            })),
        }
    }
}

/// Identifies a plugin in events and log lines.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{plugin_type} ({name})")]
pub struct PluginInfo {
    pub name: String,
    pub plugin_type: PluginType,
}

impl PluginInfo {
    pub fn new(name: impl Into<String>, plugin_type: PluginType) -> Self {
        Self {
            name: name.into(),
            plugin_type,
        }
    }
}

/// An event delivered through [`crate::event_bus::EventBus`].
#[derive(Debug)]
pub enum Event {
    /// A listener returned an error while handling an event of `event_type`.
    EventListenerError {
        error: Report<ListenerError>,
        listener: EventListener,
        event_type: EventKind,
    },
    /// A public operation or a plugin callback failed.
    Error {
        error: Report<OrchestratorError>,
        message: String,
    },
    /// A non-fatal policy violation.
    Warning { message: String },
    UpdateSetting {
        name: SettingKey,
        previous_value: u64,
        updated_value: u64,
    },
    DefineAds { ad_configs: Vec<AdConfig> },
    RequestAds { element_ids: Vec<String> },
    DestroyAds { element_ids: Vec<String> },
    LoadNewPage,
    UsePlugin { plugin: PluginInfo },
    Start,
    /// A plugin's `define_unit` returned no unit for this ad config.
    NoUnitDefined {
        ad_config: AdConfig,
        plugin: PluginInfo,
    },
    /// An element id was requested without a matching ad definition.
    RequestUndefinedAdWarning { element_id: String },
    /// A header bidder had not completed when the round rendered.
    RequestBidsTimeout { init_ready: bool, plugin: PluginInfo },
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::EventListenerError { .. } => EventKind::EventListenerError,
            Event::Error { .. } => EventKind::Error,
            Event::Warning { .. } => EventKind::Warning,
            Event::UpdateSetting { .. } => EventKind::UpdateSetting,
            Event::DefineAds { .. } => EventKind::DefineAds,
            Event::RequestAds { .. } => EventKind::RequestAds,
            Event::DestroyAds { .. } => EventKind::DestroyAds,
            Event::LoadNewPage => EventKind::LoadNewPage,
            Event::UsePlugin { .. } => EventKind::UsePlugin,
            Event::Start => EventKind::Start,
            Event::NoUnitDefined { .. } => EventKind::NoUnitDefined,
            Event::RequestUndefinedAdWarning { .. } => EventKind::RequestUndefinedAdWarning,
            Event::RequestBidsTimeout { .. } => EventKind::RequestBidsTimeout,
        }
    }
}

type ListenerFn = dyn Fn(&Event) -> Result<(), Report<ListenerError>>;

/// A shared event listener.
///
/// Listeners are compared by identity: two clones of the same listener are
/// equal, two listeners built from identical closures are not. This is what
/// [`crate::event_bus::EventBus::remove_event_listener`] matches on.
#[derive(Clone)]
pub struct EventListener(Rc<ListenerFn>);

impl EventListener {
    pub fn new(f: impl Fn(&Event) -> Result<(), Report<ListenerError>> + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub(crate) fn invoke(&self, event: &Event) -> Result<(), Report<ListenerError>> {
        (self.0)(event)
    }
}

impl PartialEq for EventListener {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EventListener {}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventListener({:p})", Rc::as_ptr(&self.0).cast::<()>())
    }
}
