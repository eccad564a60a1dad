//! Contracts implemented by ad server and header bidding plugins.
//!
//! A plugin is a thin adapter around a third-party library (GPT, Prebid, a
//! custom bidder). The orchestrator never calls a plugin directly; it goes
//! through a [`crate::service::PluginAdapter`], which tracks readiness, caches
//! units and turns plugin errors into events.

use std::rc::Rc;
use std::time::Duration;

use error_stack::Report;

use crate::ad_config::AdConfig;
use crate::callback::Callback;
use crate::error::PluginError;
use crate::event::{PluginInfo, PluginType};
use crate::event_bus::EventBus;
use crate::service::{AdServerService, HeaderBiddingService, PluginAdapter};

/// Behaviour shared by both plugin roles.
pub trait PluginBase {
    /// Plugin-specific representation of one ad slot.
    type Unit: Clone + 'static;

    /// Name used in events and log lines (e.g. `"gpt"`, `"prebid"`).
    fn name(&self) -> &str;

    /// Start asynchronous initialization and call `ready` when done.
    ///
    /// `ready` may be called from any later point on the same thread. Calls
    /// after the first are ignored. If `ready` is never called the plugin is
    /// never asked for units.
    fn init_async(&self, ready: Callback);

    /// Build the unit for `ad_config`, or `None` when this plugin does not
    /// serve that placement.
    ///
    /// # Errors
    ///
    /// Any error is reported as an `error` event and treated as `None`.
    fn define_unit(&self, ad_config: &AdConfig) -> Result<Option<Self::Unit>, Report<PluginError>>;

    /// Release units whose elements were destroyed.
    ///
    /// Called on every destroy once the plugin is ready, so `units` may be
    /// empty.
    ///
    /// # Errors
    ///
    /// Any error is reported as an `error` event.
    fn destroy_units(&self, _units: &[Self::Unit]) -> Result<(), Report<PluginError>> {
        Ok(())
    }

    /// Reset per-page state, e.g. after a single page application navigates.
    ///
    /// # Errors
    ///
    /// Any error is reported as an `error` event.
    fn load_new_page(&self) -> Result<(), Report<PluginError>> {
        Ok(())
    }
}

/// The plugin that renders winning creatives.
pub trait AdServerPlugin: PluginBase {
    /// Render (or refresh) the given units.
    ///
    /// # Errors
    ///
    /// Any error is reported as an `error` event.
    fn request_ad_server(&self, units: &[Self::Unit]) -> Result<(), Report<PluginError>>;
}

/// A plugin that collects bids before the ad server renders.
pub trait HeaderBiddingPlugin: PluginBase {
    /// Request bids for `units`, calling `done` once bids are in.
    ///
    /// `timeout` is what remains of the round's bidder budget. Calling `done`
    /// more than once is harmless. An error return does not call `done`; the
    /// round timeout covers that case.
    ///
    /// # Errors
    ///
    /// Any error is reported as an `error` event.
    fn request_bids(
        &self,
        units: &[Self::Unit],
        timeout: Duration,
        done: Callback,
    ) -> Result<(), Report<PluginError>>;

    /// Last chance to set targeting before the ad server is called.
    ///
    /// # Errors
    ///
    /// Any error is reported as an `error` event.
    fn before_request_ad_server(&self, units: &[Self::Unit]) -> Result<(), Report<PluginError>>;
}

type Attach<S> = Box<dyn FnOnce(EventBus) -> Rc<S>>;

pub(crate) enum PluginRole {
    AdServer(Attach<dyn AdServerService>),
    HeaderBidding(Attach<dyn HeaderBiddingService>),
}

/// A plugin ready to be handed to [`crate::orchestrator::Orchestrator::use_plugin`].
///
/// Building a `Plugin` does not initialize it. Initialization starts when the
/// orchestrator accepts it and wraps it in an adapter; a rejected plugin is
/// dropped without ever being initialized.
pub struct Plugin {
    info: PluginInfo,
    role: PluginRole,
}

impl Plugin {
    /// Wrap an ad server plugin.
    pub fn ad_server<P>(plugin: P) -> Self
    where
        P: AdServerPlugin + 'static,
    {
        let info = PluginInfo::new(plugin.name(), PluginType::AdServer);
        let adapter_info = info.clone();
        Self {
            info,
            role: PluginRole::AdServer(Box::new(move |bus| {
                let adapter: Rc<dyn AdServerService> =
                    PluginAdapter::new(plugin, adapter_info, bus);
                adapter
            })),
        }
    }

    /// Wrap a header bidding plugin.
    pub fn header_bidding<P>(plugin: P) -> Self
    where
        P: HeaderBiddingPlugin + 'static,
    {
        let info = PluginInfo::new(plugin.name(), PluginType::HeaderBidding);
        let adapter_info = info.clone();
        Self {
            info,
            role: PluginRole::HeaderBidding(Box::new(move |bus| {
                let adapter: Rc<dyn HeaderBiddingService> =
                    PluginAdapter::new(plugin, adapter_info, bus);
                adapter
            })),
        }
    }

    #[must_use]
    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    #[must_use]
    pub fn plugin_type(&self) -> PluginType {
        self.info.plugin_type
    }

    pub(crate) fn into_role(self) -> PluginRole {
        self.role
    }
}
