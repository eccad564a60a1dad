//! Plugins driven by a [`PluginSpec`] instead of a real ad library.
//!
//! Every call that reaches a simulated plugin is written to a shared
//! [`Journal`], which becomes the run report.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bidflow_common::ad_config::AdConfig;
use bidflow_common::callback::Callback;
use bidflow_common::error::PluginError;
use bidflow_common::plugin::{AdServerPlugin, HeaderBiddingPlugin, PluginBase};
use error_stack::Report;
use serde::Serialize;
use tokio::time::Instant;

use crate::scenario::{FailurePoint, PluginSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    Ready,
    Render,
    BidRequest,
    BidResponse,
    Targeting,
    Destroy,
    NewPage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub at_ms: u64,
    pub plugin: String,
    pub kind: EntryKind,
    pub units: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Chronological record of plugin activity, shared by every simulated plugin.
#[derive(Clone)]
pub struct Journal {
    started: Instant,
    entries: Rc<RefCell<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            entries: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn record(&self, plugin: &str, kind: EntryKind, units: &[String], timeout: Option<Duration>) {
        let at_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.entries.borrow_mut().push(JournalEntry {
            at_ms,
            plugin: plugin.to_string(),
            kind,
            units: units.to_vec(),
            timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        });
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.borrow().clone()
    }
}

pub struct SimulatedPlugin {
    spec: PluginSpec,
    journal: Journal,
}

impl SimulatedPlugin {
    pub fn new(spec: PluginSpec, journal: Journal) -> Self {
        Self { spec, journal }
    }

    fn check(&self, point: FailurePoint) -> Result<(), Report<PluginError>> {
        if self.spec.fails(point) {
            return Err(Report::new(PluginError::new(format!(
                "simulated {point:?} failure in {}",
                self.spec.name
            ))));
        }
        Ok(())
    }
}

impl PluginBase for SimulatedPlugin {
    type Unit = String;

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn init_async(&self, ready: Callback) {
        let Some(delay) = self.spec.init_delay else {
            log::debug!("{} will never become ready", self.spec.name);
            return;
        };

        let journal = self.journal.clone();
        let name = self.spec.name.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            journal.record(&name, EntryKind::Ready, &[], None);
            ready.call();
        });
    }

    fn define_unit(&self, ad_config: &AdConfig) -> Result<Option<String>, Report<PluginError>> {
        self.check(FailurePoint::DefineUnit)?;
        if !self.spec.serves(ad_config) {
            return Ok(None);
        }
        Ok(Some(format!("{}:{}", self.spec.name, ad_config.element_id)))
    }

    fn destroy_units(&self, units: &[String]) -> Result<(), Report<PluginError>> {
        self.check(FailurePoint::DestroyUnits)?;
        if !units.is_empty() {
            self.journal
                .record(&self.spec.name, EntryKind::Destroy, units, None);
        }
        Ok(())
    }

    fn load_new_page(&self) -> Result<(), Report<PluginError>> {
        self.check(FailurePoint::LoadNewPage)?;
        self.journal
            .record(&self.spec.name, EntryKind::NewPage, &[], None);
        Ok(())
    }
}

impl AdServerPlugin for SimulatedPlugin {
    fn request_ad_server(&self, units: &[String]) -> Result<(), Report<PluginError>> {
        self.check(FailurePoint::RequestAdServer)?;
        self.journal
            .record(&self.spec.name, EntryKind::Render, units, None);
        Ok(())
    }
}

impl HeaderBiddingPlugin for SimulatedPlugin {
    fn request_bids(
        &self,
        units: &[String],
        timeout: Duration,
        done: Callback,
    ) -> Result<(), Report<PluginError>> {
        self.check(FailurePoint::RequestBids)?;
        self.journal
            .record(&self.spec.name, EntryKind::BidRequest, units, Some(timeout));

        let Some(response) = self.spec.response else {
            return Ok(());
        };
        let journal = self.journal.clone();
        let name = self.spec.name.clone();
        let units = units.to_vec();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(response).await;
            journal.record(&name, EntryKind::BidResponse, &units, None);
            done.call();
        });
        Ok(())
    }

    fn before_request_ad_server(&self, units: &[String]) -> Result<(), Report<PluginError>> {
        self.check(FailurePoint::BeforeRequestAdServer)?;
        if !units.is_empty() {
            self.journal
                .record(&self.spec.name, EntryKind::Targeting, units, None);
        }
        Ok(())
    }
}
