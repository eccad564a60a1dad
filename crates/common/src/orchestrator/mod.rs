//! The public orchestrator API.
//!
//! An [`Orchestrator`] owns the ad definitions, the set of live element ids,
//! the pending request queue and the registered plugins. Requests are batched
//! by a throttle timer; when it fires and the ad server is ready, a round runs
//! (see `round.rs`): header bidders are asked for bids under a shared budget,
//! then the ad server renders whatever is still live.
//!
//! Everything runs on one thread. Timers are spawned with
//! [`tokio::task::spawn_local`], so the orchestrator must be driven from
//! inside a [`tokio::task::LocalSet`].
//!
//! No public operation returns an error. Failures surface as
//! [`Event::Error`] with a message of the form `exception with bidflow.<op>`.

mod element_ids;
mod round;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use error_stack::Report;

use crate::ad_config::AdConfig;
use crate::debug::DebugSink;
use crate::error::OrchestratorError;
use crate::event::{Event, EventKind, EventListener};
use crate::event_bus::EventBus;
use crate::plugin::{Plugin, PluginRole};
use crate::service::{AdServerService, HeaderBiddingService};
use crate::settings::{SettingKey, Settings};

use element_ids::ElementIds;

struct State {
    settings: Settings,
    ad_configs: HashMap<String, AdConfig>,
    /// Requested and not yet destroyed.
    requested: ElementIds,
    /// Requested since the last round started.
    pending: ElementIds,
    ad_server: Option<Rc<dyn AdServerService>>,
    bidders: Vec<Rc<dyn HeaderBiddingService>>,
    throttle_armed: bool,
    started: bool,
}

struct Inner {
    bus: EventBus,
    state: RefCell<State>,
    debug: RefCell<DebugSink>,
}

/// Handle to one orchestrator. Clones share the same state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Rc<Inner>,
}

#[derive(Clone)]
struct WeakOrchestrator(Weak<Inner>);

impl WeakOrchestrator {
    fn upgrade(&self) -> Option<Orchestrator> {
        self.0.upgrade().map(|inner| Orchestrator { inner })
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl Orchestrator {
    /// Create an orchestrator. Debug logging starts enabled if
    /// `settings.debug` is set.
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        let debug = settings.debug;
        let orchestrator = Self {
            inner: Rc::new(Inner {
                bus: EventBus::new(),
                state: RefCell::new(State {
                    settings,
                    ad_configs: HashMap::new(),
                    requested: ElementIds::default(),
                    pending: ElementIds::default(),
                    ad_server: None,
                    bidders: Vec::new(),
                    throttle_armed: false,
                    started: false,
                }),
                debug: RefCell::new(DebugSink::default()),
            }),
        };
        if debug {
            orchestrator.set_debug(true);
        }
        orchestrator
    }

    fn downgrade(&self) -> WeakOrchestrator {
        WeakOrchestrator(Rc::downgrade(&self.inner))
    }

    /// The bus every event of this orchestrator goes through.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    fn emit(&self, event: Event) {
        self.inner.bus.emit(event);
    }

    /// Run `f`, turning an error into an `error` event named after `operation`.
    fn guarded(&self, operation: &str, f: impl FnOnce() -> Result<(), Report<OrchestratorError>>) {
        if let Err(error) = f() {
            let message = format!("exception with bidflow.{operation}");
            log::error!("{message}: {error:?}");
            self.emit(Event::Error { error, message });
        }
    }

    /// Current value of a setting, in milliseconds.
    #[must_use]
    pub fn get(&self, key: SettingKey) -> u64 {
        self.inner.state.borrow().settings.get(key)
    }

    /// Update a setting and emit `updateSetting`.
    ///
    /// Out-of-range values are rejected with an `error` event and the
    /// previous value is kept.
    pub fn set(&self, key: SettingKey, value: u64) {
        self.guarded("set", || {
            let previous_value = self.inner.state.borrow_mut().settings.set(key, value)?;
            log::debug!("Setting {key} changed from {previous_value} to {value}");
            self.emit(Event::UpdateSetting {
                name: key,
                previous_value,
                updated_value: value,
            });
            Ok(())
        });
    }

    #[must_use]
    pub fn debug(&self) -> bool {
        self.inner.debug.borrow().is_enabled()
    }

    /// Start or stop forwarding every event to the `log` facade.
    pub fn set_debug(&self, enabled: bool) {
        {
            let mut sink = self.inner.debug.borrow_mut();
            if enabled {
                sink.enable(&self.inner.bus);
            } else {
                sink.disable(&self.inner.bus);
            }
        }
        self.inner.state.borrow_mut().settings.debug = enabled;
    }

    /// Merge ad definitions into the registry, replacing any with the same
    /// element id.
    pub fn define_ads(&self, ad_configs: Vec<AdConfig>) {
        self.guarded("defineAds", || {
            if ad_configs.iter().any(|config| config.element_id.is_empty()) {
                return Err(Report::new(OrchestratorError::Configuration {
                    message: "every ad config needs a non-empty elementId".to_string(),
                }));
            }

            {
                let mut state = self.inner.state.borrow_mut();
                for config in &ad_configs {
                    state
                        .ad_configs
                        .insert(config.element_id.clone(), config.clone());
                }
            }
            log::debug!("Defined {} ads", ad_configs.len());
            self.emit(Event::DefineAds { ad_configs });
            Ok(())
        });
    }

    /// Register a plugin and start its initialization.
    ///
    /// Only one ad server is accepted; a second one is dropped with a
    /// `warning` and never initialized.
    pub fn use_plugin(&self, plugin: Plugin) {
        self.guarded("use", || {
            let info = plugin.info().clone();
            self.emit(Event::UsePlugin {
                plugin: info.clone(),
            });

            match plugin.into_role() {
                PluginRole::AdServer(attach) => {
                    if self.inner.state.borrow().ad_server.is_some() {
                        let message =
                            format!("should only register one ad server, ignoring {info}");
                        log::warn!("{message}");
                        self.emit(Event::Warning { message });
                        return Ok(());
                    }
                    log::info!("Registering {info}");
                    let adapter = attach(self.inner.bus.clone());
                    self.inner.state.borrow_mut().ad_server = Some(adapter);
                }
                PluginRole::HeaderBidding(attach) => {
                    log::info!("Registering {info}");
                    let adapter = attach(self.inner.bus.clone());
                    self.inner.state.borrow_mut().bidders.push(adapter);
                }
            }
            Ok(())
        });
    }

    /// Begin serving requests. Calling it again has no effect.
    ///
    /// Fails with an `error` event if no ad server has been registered.
    ///
    /// # Panics
    ///
    /// Panics if called outside a [`tokio::task::LocalSet`] while requests
    /// are pending, since the throttle timer is spawned with
    /// [`tokio::task::spawn_local`].
    pub fn start(&self) {
        self.guarded("start", || {
            {
                let mut state = self.inner.state.borrow_mut();
                if state.started {
                    return Ok(());
                }
                if state.ad_server.is_none() {
                    return Err(Report::new(OrchestratorError::Configuration {
                        message: "an ad server plugin must be registered before start"
                            .to_string(),
                    }));
                }
                state.started = true;
            }
            log::info!("Orchestrator started");
            self.emit(Event::Start);
            self.arm_throttle();
            Ok(())
        });
    }

    /// Request (or refresh) ads for `element_ids`.
    ///
    /// Returns immediately; the ids are batched until the throttle timer
    /// fires.
    ///
    /// # Panics
    ///
    /// Panics if called outside a [`tokio::task::LocalSet`] after
    /// [`Orchestrator::start`], since the throttle timer is spawned with
    /// [`tokio::task::spawn_local`].
    pub fn request_ads<I, S>(&self, element_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let element_ids: Vec<String> = element_ids.into_iter().map(Into::into).collect();
        self.guarded("requestAds", || {
            self.emit(Event::RequestAds {
                element_ids: element_ids.clone(),
            });
            {
                let mut state = self.inner.state.borrow_mut();
                state.requested.insert_all(&element_ids);
                state.pending.insert_all(&element_ids);
            }
            self.arm_throttle();
            Ok(())
        });
    }

    /// Requested element ids that have not been destroyed, in first-request
    /// order.
    #[must_use]
    pub fn get_requested_element_ids(&self) -> Vec<String> {
        self.inner.state.borrow().requested.to_vec()
    }

    /// Forget `element_ids` and let every plugin release their units.
    ///
    /// A round already in flight will not render destroyed ids.
    pub fn destroy_ads<I, S>(&self, element_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let element_ids: Vec<String> = element_ids.into_iter().map(Into::into).collect();
        self.guarded("destroyAds", || {
            self.emit(Event::DestroyAds {
                element_ids: element_ids.clone(),
            });
            let (bidders, ad_server) = {
                let mut state = self.inner.state.borrow_mut();
                state.requested.remove_all(&element_ids);
                state.pending.remove_all(&element_ids);
                (state.bidders.clone(), state.ad_server.clone())
            };
            for bidder in &bidders {
                bidder.destroy(&element_ids);
            }
            if let Some(ad_server) = ad_server {
                ad_server.destroy(&element_ids);
            }
            Ok(())
        });
    }

    /// Tell every plugin that a new page view started.
    pub fn load_new_page(&self) {
        self.guarded("loadNewPage", || {
            self.emit(Event::LoadNewPage);
            let (bidders, ad_server) = {
                let state = self.inner.state.borrow();
                (state.bidders.clone(), state.ad_server.clone())
            };
            for bidder in &bidders {
                bidder.load_new_page();
            }
            if let Some(ad_server) = ad_server {
                ad_server.load_new_page();
            }
            Ok(())
        });
    }

    pub fn add_event_listener(&self, kind: EventKind, listener: EventListener) {
        self.inner.bus.add_event_listener(kind, listener);
    }

    pub fn remove_event_listener(&self, kind: EventKind, listener: &EventListener) {
        self.inner.bus.remove_event_listener(kind, listener);
    }

    /// Schedule a round unless one is already scheduled, the orchestrator has
    /// not started, or there is nothing to request.
    fn arm_throttle(&self) {
        let throttle = {
            let mut state = self.inner.state.borrow_mut();
            if !state.started || state.throttle_armed || state.pending.is_empty() {
                return;
            }
            state.throttle_armed = true;
            state.settings.throttle_timeout()
        };

        log::debug!("Throttle armed for {}ms", throttle.as_millis());
        let weak = self.downgrade();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(throttle).await;
            let Some(orchestrator) = weak.upgrade() else {
                return;
            };
            let ad_server = orchestrator.inner.state.borrow().ad_server.clone();
            if let Some(ad_server) = ad_server {
                let weak = orchestrator.downgrade();
                ad_server.wait_ready(Box::new(move || match weak.upgrade() {
                    Some(orchestrator) => orchestrator.send_request(),
                    None => Ok(()),
                }));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use serde_json::json;
    use tokio::task::LocalSet;

    use super::*;
    use crate::error::ListenerError;
    use crate::test_support::tests::{
        ad_configs, BidBehavior, Call, CallLog, DefineBehavior, EventRecorder, InitBehavior,
        RecordingPlugin,
    };

    async fn local<F: Future>(f: F) -> F::Output {
        LocalSet::new().run_until(f).await
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    struct Fixture {
        orchestrator: Orchestrator,
        events: EventRecorder,
        gpt: CallLog,
    }

    /// An orchestrator with ads `ids` defined and a started ad server.
    fn started_with(ids: &[&str], bidders: Vec<RecordingPlugin>) -> Fixture {
        let orchestrator = Orchestrator::default();
        let events = EventRecorder::attach(orchestrator.event_bus());
        let gpt = RecordingPlugin::new("gpt");
        let calls = gpt.calls();

        orchestrator.define_ads(ad_configs(ids));
        orchestrator.use_plugin(Plugin::ad_server(gpt));
        for bidder in bidders {
            orchestrator.use_plugin(Plugin::header_bidding(bidder));
        }
        orchestrator.start();

        Fixture {
            orchestrator,
            events,
            gpt: calls,
        }
    }

    fn units(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn requested_ids_are_deduplicated_in_first_request_order() {
        let orchestrator = Orchestrator::default();
        orchestrator.request_ads(["a", "b"]);
        orchestrator.request_ads(["b", "c", "c"]);
        orchestrator.request_ads(["a"]);
        orchestrator.request_ads(Vec::<String>::new());

        assert_eq!(orchestrator.get_requested_element_ids(), units(&["a", "b", "c"]));
    }

    #[test]
    fn destroy_removes_ids_synchronously() {
        let orchestrator = Orchestrator::default();
        let events = EventRecorder::attach(orchestrator.event_bus());
        orchestrator.request_ads(["a", "b", "c"]);

        orchestrator.destroy_ads(["b", "unknown"]);

        assert_eq!(orchestrator.get_requested_element_ids(), units(&["a", "c"]));
        assert_eq!(events.details(EventKind::DestroyAds), vec!["b,unknown"]);
    }

    #[test]
    fn start_without_ad_server_emits_error() {
        let orchestrator = Orchestrator::default();
        let events = EventRecorder::attach(orchestrator.event_bus());

        orchestrator.start();

        assert_eq!(
            events.details(EventKind::Error),
            vec!["exception with bidflow.start"]
        );
        assert_eq!(events.count(EventKind::Start), 0);
    }

    #[test]
    fn second_ad_server_is_never_initialized() {
        let orchestrator = Orchestrator::default();
        let events = EventRecorder::attach(orchestrator.event_bus());
        let first = RecordingPlugin::new("gpt");
        let second = RecordingPlugin::new("other");
        let first_calls = first.calls();
        let second_calls = second.calls();

        orchestrator.use_plugin(Plugin::ad_server(first));
        orchestrator.use_plugin(Plugin::ad_server(second));

        assert!(first_calls.was_initialized());
        assert!(!second_calls.was_initialized());
        assert_eq!(events.count(EventKind::Warning), 1);
        assert_eq!(events.details(EventKind::UsePlugin), vec!["gpt", "other"]);
    }

    #[test]
    fn define_ads_rejects_empty_element_id() {
        let orchestrator = Orchestrator::default();
        let events = EventRecorder::attach(orchestrator.event_bus());

        orchestrator.define_ads(vec![AdConfig::new("ok"), AdConfig::new("")]);

        assert_eq!(
            events.details(EventKind::Error),
            vec!["exception with bidflow.defineAds"]
        );
        assert_eq!(events.count(EventKind::DefineAds), 0);
    }

    #[test]
    fn set_emits_update_setting_and_rejects_out_of_range_values() {
        let orchestrator = Orchestrator::default();
        let events = EventRecorder::attach(orchestrator.event_bus());

        orchestrator.set(SettingKey::BidderTimeout, 800);
        orchestrator.set(SettingKey::ThrottleTimeout, 1_000_000);

        assert_eq!(orchestrator.get(SettingKey::BidderTimeout), 800);
        assert_eq!(orchestrator.get(SettingKey::ThrottleTimeout), 50);
        assert_eq!(
            events.details(EventKind::UpdateSetting),
            vec!["bidderTimeout 1500->800"]
        );
        assert_eq!(
            events.details(EventKind::Error),
            vec!["exception with bidflow.set"]
        );
    }

    #[test]
    fn set_debug_toggles_log_forwarding() {
        let orchestrator = Orchestrator::default();
        assert!(!orchestrator.debug());

        orchestrator.set_debug(true);
        assert!(orchestrator.debug());
        assert_eq!(orchestrator.event_bus().listener_count(EventKind::Error), 1);

        orchestrator.set_debug(false);
        assert!(!orchestrator.debug());
        assert_eq!(orchestrator.event_bus().listener_count(EventKind::Error), 0);
    }

    #[test]
    fn debug_setting_enables_forwarding_at_construction() {
        let settings = Settings {
            debug: true,
            ..Settings::default()
        };
        let orchestrator = Orchestrator::new(settings);
        assert!(orchestrator.debug());
    }

    #[test]
    fn load_new_page_is_forwarded_to_every_plugin() {
        let orchestrator = Orchestrator::default();
        let gpt = RecordingPlugin::new("gpt");
        let prebid = RecordingPlugin::new("prebid");
        let gpt_calls = gpt.calls();
        let prebid_calls = prebid.calls();
        orchestrator.use_plugin(Plugin::ad_server(gpt));
        orchestrator.use_plugin(Plugin::header_bidding(prebid));

        orchestrator.load_new_page();

        assert!(gpt_calls.contains(&Call::LoadNewPage));
        assert!(prebid_calls.contains(&Call::LoadNewPage));
    }

    #[tokio::test]
    #[should_panic(expected = "spawn_local")]
    async fn request_after_start_needs_a_local_set() {
        let fixture = started_with(&["a"], Vec::new());
        fixture.orchestrator.request_ads(["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_the_same_as_once() {
        local(async {
            let fixture = started_with(&["a"], Vec::new());
            fixture.orchestrator.start();
            fixture.orchestrator.request_ads(["a"]);
            advance(60).await;

            assert_eq!(fixture.events.count(EventKind::Start), 1);
            assert_eq!(fixture.gpt.request_ad_server_calls().len(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn renders_requested_ad_after_throttle_window() {
        local(async {
            let fixture = started_with(&["a"], Vec::new());
            fixture.orchestrator.request_ads(["a"]);

            advance(49).await;
            assert!(fixture.gpt.request_ad_server_calls().is_empty());

            advance(2).await;
            assert_eq!(fixture.gpt.define_count(), 1);
            assert_eq!(fixture.gpt.request_ad_server_calls(), vec![units(&["gpt/a"])]);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn requests_in_one_window_share_a_round() {
        local(async {
            let fixture = started_with(&["a", "b"], Vec::new());
            fixture.orchestrator.request_ads(["a"]);
            advance(20).await;
            fixture.orchestrator.request_ads(["b", "a"]);
            advance(40).await;

            assert_eq!(
                fixture.gpt.request_ad_server_calls(),
                vec![units(&["gpt/a", "gpt/b"])]
            );
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn requests_queued_before_start_are_flushed_by_start() {
        local(async {
            let orchestrator = Orchestrator::default();
            let gpt = RecordingPlugin::new("gpt");
            let calls = gpt.calls();
            orchestrator.define_ads(ad_configs(&["a"]));
            orchestrator.request_ads(["a"]);
            orchestrator.use_plugin(Plugin::ad_server(gpt));

            advance(100).await;
            assert!(calls.request_ad_server_calls().is_empty());

            orchestrator.start();
            advance(60).await;
            assert_eq!(calls.request_ad_server_calls(), vec![units(&["gpt/a"])]);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn round_waits_for_ad_server_init() {
        local(async {
            let orchestrator = Orchestrator::default();
            let gpt = RecordingPlugin::new("gpt").init(InitBehavior::Delayed(Duration::from_millis(300)));
            let calls = gpt.calls();
            orchestrator.define_ads(ad_configs(&["a"]));
            orchestrator.use_plugin(Plugin::ad_server(gpt));
            orchestrator.start();
            orchestrator.request_ads(["a"]);

            advance(200).await;
            assert!(calls.request_ad_server_calls().is_empty());
            advance(110).await;
            assert_eq!(calls.request_ad_server_calls(), vec![units(&["gpt/a"])]);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_reuses_defined_units() {
        local(async {
            let fixture = started_with(&["a"], Vec::new());
            fixture.orchestrator.request_ads(["a"]);
            advance(60).await;
            fixture.orchestrator.request_ads(["a"]);
            advance(60).await;

            assert_eq!(fixture.gpt.define_count(), 1);
            assert_eq!(fixture.gpt.request_ad_server_calls().len(), 2);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn re_request_after_destroy_defines_units_again() {
        local(async {
            let fixture = started_with(&["a"], Vec::new());
            fixture.orchestrator.request_ads(["a"]);
            advance(60).await;
            fixture.orchestrator.destroy_ads(["a"]);
            fixture.orchestrator.request_ads(["a"]);
            advance(60).await;

            assert!(fixture.gpt.contains(&Call::DestroyUnits(units(&["gpt/a"]))));
            assert_eq!(fixture.gpt.define_count(), 2);
            assert_eq!(fixture.gpt.request_ad_server_calls().len(), 2);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_during_throttle_window_skips_the_ad() {
        local(async {
            let fixture = started_with(&["a"], Vec::new());
            fixture.orchestrator.request_ads(["a"]);
            fixture.orchestrator.destroy_ads(["a"]);
            advance(200).await;

            assert_eq!(fixture.gpt.define_count(), 0);
            assert!(fixture.gpt.request_ad_server_calls().is_empty());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn undefined_ids_warn_and_stay_live() {
        local(async {
            let fixture = started_with(&["a"], Vec::new());
            fixture.orchestrator.request_ads(["a", "ghost"]);
            advance(60).await;

            assert_eq!(
                fixture.events.details(EventKind::RequestUndefinedAdWarning),
                vec!["ghost"]
            );
            assert_eq!(fixture.gpt.request_ad_server_calls(), vec![units(&["gpt/a"])]);
            assert_eq!(
                fixture.orchestrator.get_requested_element_ids(),
                units(&["a", "ghost"])
            );
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn round_with_only_undefined_ids_does_nothing() {
        local(async {
            let fixture = started_with(&[], vec![RecordingPlugin::new("prebid")]);
            fixture.orchestrator.request_ads(["ghost"]);
            advance(300).await;

            assert_eq!(fixture.events.count(EventKind::RequestUndefinedAdWarning), 1);
            assert_eq!(fixture.gpt.define_count(), 0);
            assert!(fixture.gpt.request_ad_server_calls().is_empty());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn ad_server_defining_nothing_still_gets_request_call() {
        local(async {
            let orchestrator = Orchestrator::default();
            let events = EventRecorder::attach(orchestrator.event_bus());
            let gpt = RecordingPlugin::new("gpt").define(DefineBehavior::Nothing);
            let calls = gpt.calls();
            orchestrator.define_ads(ad_configs(&["a"]));
            orchestrator.use_plugin(Plugin::ad_server(gpt));
            orchestrator.start();
            orchestrator.request_ads(["a"]);
            advance(60).await;

            assert_eq!(events.details(EventKind::NoUnitDefined), vec!["a"]);
            assert_eq!(calls.request_ad_server_calls(), vec![Vec::<String>::new()]);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn bidders_run_before_ad_server_in_registration_order() {
        local(async {
            let shared = CallLog::default();
            let orchestrator = Orchestrator::default();
            orchestrator.define_ads(ad_configs(&["a"]));
            orchestrator.use_plugin(Plugin::ad_server(
                RecordingPlugin::new("gpt").with_calls(shared.clone()),
            ));
            orchestrator.use_plugin(Plugin::header_bidding(
                RecordingPlugin::new("p1").with_calls(shared.clone()),
            ));
            orchestrator.use_plugin(Plugin::header_bidding(
                RecordingPlugin::new("p2").with_calls(shared.clone()),
            ));
            orchestrator.start();
            orchestrator.request_ads(["a"]);
            advance(60).await;

            let sequence: Vec<String> = shared
                .all()
                .into_iter()
                .filter_map(|call| match call {
                    Call::RequestBids { units, .. } => Some(format!("bids {}", units.join(","))),
                    Call::BeforeRequestAdServer(units) => {
                        Some(format!("before {}", units.join(",")))
                    }
                    Call::RequestAdServer(units) => Some(format!("render {}", units.join(","))),
                    _ => None,
                })
                .collect();
            assert_eq!(
                sequence,
                vec![
                    "bids p1/a",
                    "bids p2/a",
                    "before p1/a",
                    "before p2/a",
                    "render gpt/a",
                ]
            );
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn bidder_that_never_calls_done_times_out() {
        local(async {
            let prebid = RecordingPlugin::new("prebid").bids(BidBehavior::Never);
            let fixture = started_with(&["a"], vec![prebid]);
            fixture.orchestrator.set(SettingKey::BidderTimeout, 50);
            fixture.orchestrator.request_ads(["a"]);

            advance(50 + 149).await;
            assert!(fixture.gpt.request_ad_server_calls().is_empty());

            advance(2).await;
            assert_eq!(fixture.gpt.request_ad_server_calls(), vec![units(&["gpt/a"])]);
            assert_eq!(
                fixture.events.details(EventKind::RequestBidsTimeout),
                vec!["prebid init_ready=true"]
            );
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn bidder_that_never_inits_is_never_asked_for_bids() {
        local(async {
            let prebid = RecordingPlugin::new("prebid").init(InitBehavior::Never);
            let prebid_calls = prebid.calls();
            let fixture = started_with(&["a"], vec![prebid]);
            fixture.orchestrator.request_ads(["a"]);

            advance(50 + 1500 + 101).await;

            assert_eq!(prebid_calls.all(), vec![Call::Init]);
            assert_eq!(fixture.gpt.request_ad_server_calls(), vec![units(&["gpt/a"])]);
            assert_eq!(
                fixture.events.details(EventKind::RequestBidsTimeout),
                vec!["prebid init_ready=false"]
            );
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn bidder_ready_after_budget_is_skipped() {
        local(async {
            let prebid = RecordingPlugin::new("prebid")
                .init(InitBehavior::Delayed(Duration::from_millis(120)));
            let prebid_calls = prebid.calls();
            let fixture = started_with(&["a"], vec![prebid]);
            fixture.orchestrator.set(SettingKey::BidderTimeout, 50);
            fixture.orchestrator.request_ads(["a"]);

            advance(125).await;

            assert!(prebid_calls.request_bids_calls().is_empty());
            assert_eq!(fixture.gpt.request_ad_server_calls(), vec![units(&["gpt/a"])]);
            assert_eq!(fixture.events.count(EventKind::RequestBidsTimeout), 0);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_bidder_gets_remaining_budget() {
        local(async {
            let prebid = RecordingPlugin::new("prebid")
                .init(InitBehavior::Delayed(Duration::from_millis(70)));
            let prebid_calls = prebid.calls();
            let fixture = started_with(&["a"], vec![prebid]);
            fixture.orchestrator.request_ads(["a"]);

            advance(80).await;

            let requests = prebid_calls.request_bids_calls();
            assert_eq!(requests.len(), 1);
            let (bid_units, timeout) = &requests[0];
            assert_eq!(bid_units, &units(&["prebid/a"]));
            assert!(
                *timeout <= Duration::from_millis(1480) && *timeout >= Duration::from_millis(1470),
                "timeout should be the budget minus init wait, got {timeout:?}"
            );
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn ids_destroyed_while_bidding_are_not_rendered() {
        local(async {
            let prebid =
                RecordingPlugin::new("prebid").bids(BidBehavior::Delayed(Duration::from_millis(100)));
            let fixture = started_with(&["a", "b"], vec![prebid]);
            fixture.orchestrator.request_ads(["a", "b"]);

            advance(60).await;
            fixture.orchestrator.destroy_ads(["a"]);
            advance(100).await;

            assert_eq!(fixture.gpt.request_ad_server_calls(), vec![units(&["gpt/b"])]);
            assert_eq!(fixture.gpt.define_count(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_bidder_only_bids_on_ids_still_requested() {
        local(async {
            let prebid = RecordingPlugin::new("prebid")
                .init(InitBehavior::Delayed(Duration::from_millis(100)));
            let prebid_calls = prebid.calls();
            let fixture = started_with(&["a", "b"], vec![prebid]);
            fixture.orchestrator.request_ads(["a", "b"]);

            advance(60).await;
            fixture.orchestrator.destroy_ads(["a"]);
            advance(50).await;

            assert_eq!(
                prebid_calls.request_bids_calls(),
                vec![(units(&["prebid/b"]), Duration::from_millis(1450))]
            );
            assert_eq!(fixture.gpt.request_ad_server_calls(), vec![units(&["gpt/b"])]);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_bidder_is_not_asked_when_every_id_was_destroyed() {
        local(async {
            let prebid = RecordingPlugin::new("prebid")
                .init(InitBehavior::Delayed(Duration::from_millis(100)));
            let prebid_calls = prebid.calls();
            let fixture = started_with(&["a", "b"], vec![prebid]);
            fixture.orchestrator.request_ads(["a", "b"]);

            advance(60).await;
            fixture.orchestrator.destroy_ads(["a", "b"]);
            advance(2000).await;

            assert!(prebid_calls.was_initialized());
            assert!(prebid_calls.request_bids_calls().is_empty());
            assert!(fixture.gpt.request_ad_server_calls().is_empty());
            assert_eq!(fixture.events.count(EventKind::RequestBidsTimeout), 0);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn round_is_skipped_when_everything_was_destroyed() {
        local(async {
            let prebid =
                RecordingPlugin::new("prebid").bids(BidBehavior::Delayed(Duration::from_millis(100)));
            let prebid_calls = prebid.calls();
            let fixture = started_with(&["a"], vec![prebid]);
            fixture.orchestrator.request_ads(["a"]);

            advance(60).await;
            fixture.orchestrator.destroy_ads(["a"]);
            advance(2000).await;

            assert_eq!(prebid_calls.request_bids_calls().len(), 1);
            assert_eq!(fixture.gpt.define_count(), 0);
            assert!(fixture.gpt.request_ad_server_calls().is_empty());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_bidder_reports_error_and_round_still_renders() {
        local(async {
            let prebid = RecordingPlugin::new("prebid").bids(BidBehavior::Fail);
            let fixture = started_with(&["a"], vec![prebid]);
            fixture.orchestrator.request_ads(["a"]);

            advance(50 + 1500 + 101).await;

            assert_eq!(
                fixture.events.details(EventKind::Error),
                vec!["headerBidding (prebid) has exception when call requestBids"]
            );
            assert_eq!(fixture.gpt.request_ad_server_calls(), vec![units(&["gpt/a"])]);
            assert_eq!(fixture.events.count(EventKind::RequestBidsTimeout), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_listener_does_not_stop_the_round() {
        local(async {
            let fixture = started_with(&["a"], Vec::new());
            fixture.orchestrator.add_event_listener(
                EventKind::RequestAds,
                EventListener::new(|_| Err(Report::new(ListenerError::new("listener broke")))),
            );
            fixture.orchestrator.request_ads(["a"]);
            advance(60).await;

            assert_eq!(fixture.events.count(EventKind::EventListenerError), 1);
            assert_eq!(fixture.gpt.request_ad_server_calls().len(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn bidder_timeout_is_fixed_when_round_starts() {
        local(async {
            let prebid = RecordingPlugin::new("prebid").bids(BidBehavior::Never);
            let fixture = started_with(&["a"], vec![prebid]);
            fixture.orchestrator.set(SettingKey::BidderTimeout, 100);
            fixture.orchestrator.request_ads(["a"]);

            advance(60).await;
            fixture.orchestrator.set(SettingKey::BidderTimeout, 5000);
            advance(200).await;

            assert_eq!(fixture.gpt.request_ad_server_calls().len(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn ads_the_ad_server_does_not_serve_are_left_out() {
        local(async {
            let orchestrator = Orchestrator::default();
            let gpt = RecordingPlugin::new("gpt")
                .define(DefineBehavior::Only(vec!["top".to_string()]));
            let calls = gpt.calls();
            orchestrator.define_ads(vec![
                AdConfig::new("top").with_payload("gpt", json!({ "adUnitPath": "/1/top" })),
                AdConfig::new("side"),
            ]);
            orchestrator.use_plugin(Plugin::ad_server(gpt));
            orchestrator.start();
            orchestrator.request_ads(["top", "side"]);
            advance(60).await;

            assert_eq!(calls.request_ad_server_calls(), vec![units(&["gpt/top"])]);
        })
        .await;
    }
}
