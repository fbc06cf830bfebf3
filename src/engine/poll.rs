// engine/poll.rs

use futures::future::join_all;
use tracing::{debug, warn};

use super::timer::InFlight;
use super::SyncEngine;
use crate::constants::UNIX_MS_SUFFIX;
use crate::error::Result;
use crate::point::{interval_in_flight, PointHandle};
use crate::protocol::{self, Action, PointSlot};
use crate::types::{EngineEvent, TimeRepresentation};

impl SyncEngine {
    /// One round trip for everything queued.
    ///
    /// Only one `points` request may be outstanding per engine. A cycle that finds
    /// one in flight leaves the queue untouched for the next cycle.
    pub(crate) async fn poll_cycle(&self) -> Result<()> {
        if self.inner.config.auto_descriptions {
            // Reported through the error handler; the poll goes ahead regardless.
            let _ = self.get_descriptions(None).await;
        }

        let _guard = match InFlight::acquire(&self.inner.points_in_flight) {
            Some(guard) => guard,
            None => {
                debug!("Points request still in flight; skipping poll cycle");
                self.inner.metrics.record_skipped_point_cycle();
                return Ok(());
            }
        };

        let pending = std::mem::take(&mut self.state().pending);
        if pending.is_empty() {
            return Ok(());
        }

        let (series, arrivals): (Vec<PointHandle>, Vec<PointHandle>) = pending
            .into_iter()
            .filter(|handle| !handle.is_removed())
            .partition(|handle| handle.is_time_series() && !handle.time_series_initialised());

        let intervals = join_all(series.iter().map(|handle| self.fetch_interval(handle)));
        // Interval failures were reported individually by `send`.
        let (_, points_result) = tokio::join!(intervals, self.fetch_points(arrivals));
        points_result
    }

    async fn fetch_interval(&self, handle: &PointHandle) -> Result<()> {
        let _guard = match InFlight::acquire(interval_in_flight(handle)) {
            Some(guard) => guard,
            None => {
                debug!("Interval request for '{}' already in flight", handle.name());
                self.inner.metrics.record_skipped_interval_request();
                // Left for a later cycle, once the outstanding request settles.
                self.request_update(std::slice::from_ref(handle));
                return Ok(());
            }
        };

        let (options, generation) = handle.interval_request();
        let form = protocol::intervals_form(self.server_name(), handle.name(), &options);
        let data = self.send(Action::Intervals, form).await?;
        let rows = protocol::parse_interval_batch(&data)?;

        if !handle.apply_interval_batch(&rows, generation) {
            debug!("Options of '{}' changed in flight; discarding interval batch", handle.name());
            handle.request_update(true);
            return Ok(());
        }
        debug!("Loaded {} values into time-series '{}'", rows.len(), handle.name());
        self.server_event(|server| EngineEvent::TimeSeries { server });
        Ok(())
    }

    /// `arrivals` is the exact order the names go out in; the reply is matched against it.
    async fn fetch_points(&self, arrivals: Vec<PointHandle>) -> Result<()> {
        if arrivals.is_empty() {
            return Ok(());
        }

        let names: Vec<String> = arrivals
            .iter()
            .map(|handle| match handle.time_representation() {
                TimeRepresentation::UnixMs => format!("{}{}", handle.name(), UNIX_MS_SUFFIX),
                TimeRepresentation::String => handle.name().to_string(),
            })
            .collect();

        let data = self
            .send(Action::Points, protocol::points_form(self.server_name(), &names))
            .await?;
        let slots = protocol::parse_point_slots(&data)?;
        if slots.len() != arrivals.len() {
            warn!(
                "Sent {} points to {} but received {} slots",
                arrivals.len(),
                self.server_name(),
                slots.len()
            );
        }

        for (index, slot) in slots.into_iter().enumerate() {
            let Some(slot) = slot else {
                continue;
            };
            match self.route_slot(&arrivals, index, &slot) {
                Some(handle) => handle.update_value(&slot.update),
                None => {
                    debug!("No live handle for slot {} ('{}')", index, slot.point_name);
                    self.inner.metrics.record_ignored_delivery();
                }
            }
        }

        self.server_event(|server| EngineEvent::Values { server });
        Ok(())
    }

    /// The server echoes names in request order, so slot `index` belongs to the
    /// handle sent at `index` when the names agree. Otherwise the slot goes to the
    /// only live handle with that name, if there is exactly one.
    fn route_slot(&self, arrivals: &[PointHandle], index: usize, slot: &PointSlot) -> Option<PointHandle> {
        if let Some(handle) = arrivals.get(index) {
            if handle.name() == slot.point_name {
                return (!handle.is_removed()).then(|| handle.clone());
            }
        }

        let mut candidates = self.get_point(&slot.point_name);
        if candidates.len() == 1 {
            candidates.pop()
        } else {
            None
        }
    }
}
