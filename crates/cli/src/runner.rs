//! Drives an orchestrator through a scenario timeline.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::rc::Rc;

use bidflow_common::event::{Event, EventKind, EventListener, PluginType};
use bidflow_common::{Orchestrator, Plugin};
use serde::Serialize;
use tokio::task::LocalSet;
use tokio::time::Instant;

use crate::error::CliError;
use crate::scenario::{Action, Scenario};
use crate::simulated::{EntryKind, Journal, JournalEntry, SimulatedPlugin};

/// Outcome of one scenario run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub duration_ms: u64,
    pub requested_element_ids: Vec<String>,
    pub journal: Vec<JournalEntry>,
    pub events: BTreeMap<String, usize>,
    pub errors: Vec<String>,
}

impl RunReport {
    /// Ad server render calls, in order.
    pub fn renders(&self) -> impl Iterator<Item = &JournalEntry> {
        self.journal
            .iter()
            .filter(|entry| entry.kind == EntryKind::Render)
    }

    pub fn event_count(&self, kind: EventKind) -> usize {
        self.events.get(&kind.to_string()).copied().unwrap_or(0)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Scenario ran for {}ms", self.duration_ms);
        let _ = writeln!(out, "Rounds rendered: {}", self.renders().count());
        for entry in &self.journal {
            let _ = write!(out, "  [{:>6}ms] {:<12} {:?}", entry.at_ms, entry.plugin, entry.kind);
            if !entry.units.is_empty() {
                let _ = write!(out, " {}", entry.units.join(", "));
            }
            if let Some(timeout) = entry.timeout_ms {
                let _ = write!(out, " (timeout {timeout}ms)");
            }
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "Live element ids: {}",
            self.requested_element_ids.join(", ")
        );
        let _ = writeln!(out, "Events:");
        for (kind, count) in &self.events {
            let _ = writeln!(out, "  {kind}: {count}");
        }
        for error in &self.errors {
            let _ = writeln!(out, "  ! {error}");
        }
        out
    }
}

/// Run `scenario` to completion on a single-threaded runtime.
///
/// Unless `realtime` is set the runtime clock is paused, so timers fire as
/// soon as nothing else is runnable and the run finishes instantly with the
/// same timings it would have had in real time.
pub fn run(scenario: &Scenario, realtime: bool) -> Result<RunReport, CliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(!realtime)
        .build()?;

    let local = LocalSet::new();
    Ok(local.block_on(&runtime, drive(scenario)))
}

async fn drive(scenario: &Scenario) -> RunReport {
    let started = Instant::now();
    let journal = Journal::new(started);
    let orchestrator = Orchestrator::new(scenario.settings.clone());
    let (events, errors) = count_events(&orchestrator);

    orchestrator.define_ads(scenario.ads.clone());
    for spec in &scenario.plugins {
        let plugin = SimulatedPlugin::new(spec.clone(), journal.clone());
        match spec.plugin_type {
            PluginType::AdServer => orchestrator.use_plugin(Plugin::ad_server(plugin)),
            PluginType::HeaderBidding => orchestrator.use_plugin(Plugin::header_bidding(plugin)),
        }
    }
    orchestrator.start();

    for step in &scenario.steps {
        tokio::time::sleep_until(started + step.at).await;
        log::debug!("Step at {}ms: {:?}", step.at.as_millis(), step.action);
        match &step.action {
            Action::Request(ids) => orchestrator.request_ads(ids.iter().cloned()),
            Action::Destroy(ids) => orchestrator.destroy_ads(ids.iter().cloned()),
            Action::LoadNewPage => orchestrator.load_new_page(),
            Action::Set(key, value) => orchestrator.set(*key, *value),
        }
    }
    tokio::time::sleep_until(started + scenario.run_for).await;

    let events = events.borrow().clone();
    let errors = errors.borrow().clone();
    RunReport {
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        requested_element_ids: orchestrator.get_requested_element_ids(),
        journal: journal.entries(),
        events,
        errors,
    }
}

type Shared<T> = Rc<RefCell<T>>;

fn count_events(orchestrator: &Orchestrator) -> (Shared<BTreeMap<String, usize>>, Shared<Vec<String>>) {
    let counts: Shared<BTreeMap<String, usize>> = Rc::default();
    let errors: Shared<Vec<String>> = Rc::default();

    let counter = {
        let counts = Rc::clone(&counts);
        let errors = Rc::clone(&errors);
        EventListener::new(move |event| {
            *counts
                .borrow_mut()
                .entry(event.kind().to_string())
                .or_default() += 1;
            if let Event::Error { error, message } = event {
                let context = error.current_context().to_string();
                let line = if *message == context {
                    context
                } else {
                    format!("{message}: {context}")
                };
                errors.borrow_mut().push(line);
            }
            Ok(())
        })
    };
    for kind in EventKind::ALL {
        orchestrator.add_event_listener(kind, counter.clone());
    }

    (counts, errors)
}
