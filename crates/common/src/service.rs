//! Plugin adapters.
//!
//! A [`PluginAdapter`] wraps exactly one plugin. It owns the plugin's
//! readiness state, memoizes the unit defined for each element id and makes
//! sure no plugin error ever reaches the orchestrator: every failure becomes
//! an [`Event::Error`] on the shared bus.
//!
//! The orchestrator holds adapters behind the object-safe [`AdServerService`]
//! and [`HeaderBiddingService`] traits so that plugins with different unit
//! types can sit in the same registry.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use error_stack::Report;

use crate::ad_config::AdConfig;
use crate::callback::Callback;
use crate::error::{OrchestratorError, PluginError};
use crate::event::{Event, PluginInfo};
use crate::event_bus::EventBus;
use crate::plugin::{AdServerPlugin, HeaderBiddingPlugin, PluginBase};

/// Work deferred until an adapter becomes ready.
pub type ReadyCallback = Box<dyn FnOnce() -> Result<(), Report<OrchestratorError>>>;

/// What an adapter knows about the unit for one element id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedUnit<U> {
    /// `define_unit` has not been called for this id.
    NotAttempted,
    /// `define_unit` returned nothing or failed.
    Absent,
    Present(U),
}

/// Operations shared by every adapter regardless of plugin role.
pub trait Service {
    fn info(&self) -> &PluginInfo;

    fn is_ready(&self) -> bool;

    /// Run `cb` now if ready, otherwise once the plugin finishes init.
    fn wait_ready(&self, cb: ReadyCallback);

    /// Drop cached units for `element_ids` and let the plugin release them.
    fn destroy(&self, element_ids: &[String]);

    fn load_new_page(&self);
}

/// Type-erased view of an ad server adapter.
pub trait AdServerService: Service {
    /// Define (or look up) units for `ad_configs`, run `before_request`, then
    /// ask the ad server to render those units.
    fn request_ad_server_for(&self, ad_configs: &[AdConfig], before_request: &mut dyn FnMut());
}

/// Type-erased view of a header bidding adapter.
pub trait HeaderBiddingService: Service {
    /// Define units for `ad_configs` and request bids for them.
    fn request_bids_for(&self, ad_configs: &[AdConfig], timeout: Duration, done: Callback);

    /// Give the bidder its own units for `ad_configs` before the ad server call.
    fn before_request_ad_server_for(&self, ad_configs: &[AdConfig]);
}

struct AdapterState<U> {
    ready: bool,
    queue: VecDeque<ReadyCallback>,
    units: HashMap<String, CachedUnit<U>>,
}

/// Wraps a single plugin and proxies the orchestrator's calls to it.
pub struct PluginAdapter<P: PluginBase> {
    plugin: P,
    info: PluginInfo,
    bus: EventBus,
    state: RefCell<AdapterState<P::Unit>>,
}

impl<P> PluginAdapter<P>
where
    P: PluginBase + 'static,
{
    /// Wrap `plugin` and immediately start its initialization.
    pub fn new(plugin: P, info: PluginInfo, bus: EventBus) -> Rc<Self> {
        let adapter = Rc::new(Self {
            plugin,
            info,
            bus,
            state: RefCell::new(AdapterState {
                ready: false,
                queue: VecDeque::new(),
                units: HashMap::new(),
            }),
        });

        log::info!("Initializing plugin {}", adapter.info);
        let weak = Rc::downgrade(&adapter);
        adapter.plugin.init_async(Callback::new(move || {
            if let Some(adapter) = weak.upgrade() {
                adapter.mark_ready();
            }
        }));

        adapter
    }

    fn mark_ready(&self) {
        let queued = {
            let mut state = self.state.borrow_mut();
            state.ready = true;
            std::mem::take(&mut state.queue)
        };

        log::debug!(
            "Plugin {} is ready, running {} deferred callbacks",
            self.info,
            queued.len()
        );
        for cb in queued {
            self.run_ready_callback(cb);
        }
    }

    fn run_ready_callback(&self, cb: ReadyCallback) {
        if let Err(report) = cb() {
            self.emit_error(
                report.change_context(self.plugin_error("waitReady")),
                format!("exception with waitReady for {}", self.info),
            );
        }
    }

    /// Current cache entry for `element_id`.
    pub fn cached_unit(&self, element_id: &str) -> CachedUnit<P::Unit> {
        self.state
            .borrow()
            .units
            .get(element_id)
            .cloned()
            .unwrap_or(CachedUnit::NotAttempted)
    }

    /// Units for `ad_configs`, defining any that have not been attempted yet.
    ///
    /// Returns an empty list while the plugin is not ready. Ad configs whose
    /// unit is absent are skipped, so the result may be shorter than the input.
    pub fn get_units(&self, ad_configs: &[AdConfig]) -> Vec<P::Unit> {
        if !self.is_ready() {
            return Vec::new();
        }

        let mut units = Vec::with_capacity(ad_configs.len());
        for ad_config in ad_configs {
            match self.cached_unit(&ad_config.element_id) {
                CachedUnit::Present(unit) => units.push(unit),
                CachedUnit::Absent => {}
                CachedUnit::NotAttempted => {
                    if let Some(unit) = self.define_unit(ad_config) {
                        units.push(unit);
                    }
                }
            }
        }
        units
    }

    fn define_unit(&self, ad_config: &AdConfig) -> Option<P::Unit> {
        let element_id = ad_config.element_id.clone();
        match self.plugin.define_unit(ad_config) {
            Ok(Some(unit)) => {
                self.cache(element_id, CachedUnit::Present(unit.clone()));
                Some(unit)
            }
            Ok(None) => {
                self.cache(element_id, CachedUnit::Absent);
                log::debug!(
                    "Plugin {} defined no unit for '{}'",
                    self.info,
                    ad_config.element_id
                );
                self.bus.emit(Event::NoUnitDefined {
                    ad_config: ad_config.clone(),
                    plugin: self.info.clone(),
                });
                None
            }
            Err(report) => {
                self.cache(element_id, CachedUnit::Absent);
                self.report_plugin_error("defineUnit", report);
                None
            }
        }
    }

    fn cache(&self, element_id: String, unit: CachedUnit<P::Unit>) {
        self.state.borrow_mut().units.insert(element_id, unit);
    }

    fn plugin_error(&self, operation: &str) -> OrchestratorError {
        OrchestratorError::Plugin {
            plugin: self.info.to_string(),
            operation: operation.to_string(),
        }
    }

    fn report_plugin_error(&self, operation: &str, report: Report<PluginError>) {
        let report = report.change_context(self.plugin_error(operation));
        let message = report.current_context().to_string();
        self.emit_error(report, message);
    }

    fn emit_error(&self, error: Report<OrchestratorError>, message: String) {
        log::error!("{message}: {error:?}");
        self.bus.emit(Event::Error { error, message });
    }
}

impl<P> PluginAdapter<P>
where
    P: AdServerPlugin + 'static,
{
    /// Forward `units` to the ad server. No-op until ready.
    pub fn request_ad_server(&self, units: &[P::Unit]) {
        if !self.is_ready() {
            return;
        }
        if let Err(report) = self.plugin.request_ad_server(units) {
            self.report_plugin_error("requestAdServer", report);
        }
    }
}

impl<P> PluginAdapter<P>
where
    P: HeaderBiddingPlugin + 'static,
{
    /// Forward a bid request. No-op until ready.
    ///
    /// A failing plugin does not get `done` called on its behalf.
    pub fn request_bids(&self, units: &[P::Unit], timeout: Duration, done: Callback) {
        if !self.is_ready() {
            return;
        }
        if let Err(report) = self.plugin.request_bids(units, timeout, done) {
            self.report_plugin_error("requestBids", report);
        }
    }

    /// Forward the pre-render hook. No-op until ready.
    pub fn before_request_ad_server(&self, units: &[P::Unit]) {
        if !self.is_ready() {
            return;
        }
        if let Err(report) = self.plugin.before_request_ad_server(units) {
            self.report_plugin_error("beforeRequestAdServer", report);
        }
    }
}

impl<P> Service for PluginAdapter<P>
where
    P: PluginBase + 'static,
{
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn is_ready(&self) -> bool {
        self.state.borrow().ready
    }

    fn wait_ready(&self, cb: ReadyCallback) {
        if self.is_ready() {
            self.run_ready_callback(cb);
        } else {
            self.state.borrow_mut().queue.push_back(cb);
        }
    }

    fn destroy(&self, element_ids: &[String]) {
        if !self.is_ready() {
            return;
        }

        let units: Vec<P::Unit> = {
            let mut state = self.state.borrow_mut();
            element_ids
                .iter()
                .filter_map(|id| match state.units.remove(id) {
                    Some(CachedUnit::Present(unit)) => Some(unit),
                    _ => None,
                })
                .collect()
        };

        log::debug!("Destroying {} units of {}", units.len(), self.info);
        if let Err(report) = self.plugin.destroy_units(&units) {
            self.report_plugin_error("destroyUnits", report);
        }
    }

    fn load_new_page(&self) {
        if !self.is_ready() {
            return;
        }
        if let Err(report) = self.plugin.load_new_page() {
            self.report_plugin_error("loadNewPage", report);
        }
    }
}

impl<P> AdServerService for PluginAdapter<P>
where
    P: AdServerPlugin + 'static,
{
    fn request_ad_server_for(&self, ad_configs: &[AdConfig], before_request: &mut dyn FnMut()) {
        let units = self.get_units(ad_configs);
        log::debug!(
            "Rendering {} ads with {} units of {}",
            ad_configs.len(),
            units.len(),
            self.info
        );
        before_request();
        self.request_ad_server(&units);
    }
}

impl<P> HeaderBiddingService for PluginAdapter<P>
where
    P: HeaderBiddingPlugin + 'static,
{
    fn request_bids_for(&self, ad_configs: &[AdConfig], timeout: Duration, done: Callback) {
        let units = self.get_units(ad_configs);
        self.request_bids(&units, timeout, done);
    }

    fn before_request_ad_server_for(&self, ad_configs: &[AdConfig]) {
        let units = self.get_units(ad_configs);
        self.before_request_ad_server(&units);
    }
}
