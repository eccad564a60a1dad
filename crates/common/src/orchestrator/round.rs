//! One request round: bid collection under a shared budget, then render.
//!
//! ```text
//! throttle fires ─► ad server ready ─► send_request
//!                                         │
//!          ┌──────────────────────────────┤ for each bidder (once ready)
//!          ▼                              │
//!   remaining = budget - elapsed          │ round timer: budget + buffer
//!   request_bids(active, remaining, done) │
//!          │                              │
//!          └──── all done ──► bids_ready ◄┘ (whichever comes first)
//!                                 │
//!                       define ad server units
//!                       before_request_ad_server (each bidder)
//!                       request_ad_server
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use error_stack::Report;
use tokio::time::Instant;

use crate::ad_config::AdConfig;
use crate::callback::Callback;
use crate::constants::ROUND_TIMEOUT_BUFFER;
use crate::error::OrchestratorError;
use crate::event::Event;
use crate::service::HeaderBiddingService;

use super::Orchestrator;

struct Round {
    started_at: Instant,
    bidder_timeout: Duration,
    ad_configs: Vec<AdConfig>,
    /// One flag per bidder registered when the round started; `true` until
    /// that bidder is done.
    outstanding: RefCell<Vec<bool>>,
}

impl Round {
    fn remaining(&self) -> Duration {
        self.bidder_timeout.saturating_sub(self.started_at.elapsed())
    }

    /// Mark bidder `index` done and report whether every bidder is.
    fn mark_done(&self, index: usize) -> bool {
        let mut outstanding = self.outstanding.borrow_mut();
        if let Some(flag) = outstanding.get_mut(index) {
            *flag = false;
        }
        outstanding.iter().all(|waiting| !waiting)
    }

    fn is_outstanding(&self, index: usize) -> bool {
        self.outstanding.borrow().get(index).copied().unwrap_or(false)
    }
}

impl Orchestrator {
    /// Start a round for everything queued since the last one.
    pub(super) fn send_request(&self) -> Result<(), Report<OrchestratorError>> {
        let (element_ids, resolved, bidders, bidder_timeout) = {
            let mut state = self.inner.state.borrow_mut();
            state.throttle_armed = false;
            let element_ids = state.pending.take();
            let resolved: Vec<Option<AdConfig>> = element_ids
                .iter()
                .map(|id| state.ad_configs.get(id).cloned())
                .collect();
            (
                element_ids,
                resolved,
                state.bidders.clone(),
                state.settings.bidder_timeout(),
            )
        };

        if element_ids.is_empty() {
            log::debug!("Throttle fired with nothing pending");
            return Ok(());
        }

        let mut ad_configs = Vec::with_capacity(element_ids.len());
        for (element_id, config) in element_ids.into_iter().zip(resolved) {
            match config {
                Some(config) => ad_configs.push(config),
                None => {
                    log::warn!("Requested ad '{element_id}' has no definition");
                    self.emit(Event::RequestUndefinedAdWarning { element_id });
                }
            }
        }

        if ad_configs.is_empty() {
            log::debug!("No defined ads in this round");
            return Ok(());
        }

        log::debug!(
            "Starting round for {} ads with {} bidders, budget {}ms",
            ad_configs.len(),
            bidders.len(),
            bidder_timeout.as_millis()
        );

        let round = Rc::new(Round {
            started_at: Instant::now(),
            bidder_timeout,
            ad_configs,
            outstanding: RefCell::new(vec![true; bidders.len()]),
        });

        let bids_ready = {
            let weak = self.downgrade();
            let round = Rc::clone(&round);
            Callback::new(move || {
                if let Some(orchestrator) = weak.upgrade() {
                    orchestrator.render(&round);
                }
            })
        };

        if bidders.is_empty() {
            bids_ready.call();
            return Ok(());
        }

        for (index, bidder) in bidders.iter().enumerate() {
            let done = {
                let round = Rc::clone(&round);
                let bids_ready = bids_ready.clone();
                Callback::new(move || {
                    if round.mark_done(index) {
                        bids_ready.call();
                    }
                })
            };

            let weak = self.downgrade();
            let round = Rc::clone(&round);
            let target = Rc::downgrade(bidder);
            bidder.wait_ready(Box::new(move || {
                match (weak.upgrade(), target.upgrade()) {
                    (Some(orchestrator), Some(bidder)) => {
                        orchestrator.request_bids(&round, &*bidder, done);
                    }
                    _ => done.call(),
                }
                Ok(())
            }));
        }

        if !bids_ready.is_called() {
            let timeout = bidder_timeout + ROUND_TIMEOUT_BUFFER;
            tokio::task::spawn_local(async move {
                tokio::time::sleep(timeout).await;
                bids_ready.call();
            });
        }

        Ok(())
    }

    fn request_bids(&self, round: &Round, bidder: &dyn HeaderBiddingService, done: Callback) {
        let remaining = round.remaining();
        if remaining.is_zero() {
            log::debug!("{} became ready after the bidder budget", bidder.info());
            done.call();
            return;
        }

        let active = self.active_ad_configs(&round.ad_configs);
        if active.is_empty() {
            done.call();
            return;
        }

        bidder.request_bids_for(&active, remaining, done);
    }

    /// Ad configs whose element is still requested.
    fn active_ad_configs(&self, ad_configs: &[AdConfig]) -> Vec<AdConfig> {
        let state = self.inner.state.borrow();
        ad_configs
            .iter()
            .filter(|config| state.requested.contains(&config.element_id))
            .cloned()
            .collect()
    }

    fn render(&self, round: &Round) {
        let active = self.active_ad_configs(&round.ad_configs);
        if active.is_empty() {
            log::debug!("Every ad in the round was destroyed, skipping render");
            return;
        }

        let (ad_server, bidders) = {
            let state = self.inner.state.borrow();
            (state.ad_server.clone(), state.bidders.clone())
        };
        let Some(ad_server) = ad_server else {
            return;
        };

        for (index, bidder) in bidders.iter().enumerate() {
            if round.is_outstanding(index) {
                log::warn!("{} did not finish bidding in time", bidder.info());
                self.emit(Event::RequestBidsTimeout {
                    init_ready: bidder.is_ready(),
                    plugin: bidder.info().clone(),
                });
            }
        }

        ad_server.request_ad_server_for(&active, &mut || {
            for bidder in &bidders {
                bidder.before_request_ad_server_for(&active);
            }
        });
    }
}
