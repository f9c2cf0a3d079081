//! Flow-Control Gate
//!
//! Admission throttles bounding how many children a context has in flight,
//! and the scheduling-activation gate. Every type here is state guarded by the
//! context lock: methods decide under the lock and hand back the event the
//! caller must wait on once the lock is released.

use crate::config::FlowControlConfig;
use crate::event::{Event, UserEvent};
use crate::types::OpId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Result of one admission attempt.
#[derive(Debug)]
pub enum Admission {
    Admitted { outstanding: usize },
    /// Wait on the event. With `holds_slot` the registrant is already counted
    /// and is admitted once the event triggers; otherwise it tries again.
    Blocked { event: Event, holds_slot: bool },
}

/// Window discipline.
///
/// The outstanding count covers admitted children that have not completed,
/// plus the registrant that found the window full: it keeps its increment and
/// waits on the shared event, which triggers once completions drain the count
/// (itself included) to the low-water mark. While that wait is pending,
/// newcomers queue behind it uncounted and retry after the release.
#[derive(Debug, Default)]
pub struct WindowGate {
    wait: Option<UserEvent>,
}

impl WindowGate {
    pub fn try_admit(
        &mut self,
        outstanding: &AtomicUsize,
        config: &FlowControlConfig,
    ) -> Admission {
        if !config.window_enabled() {
            let count = outstanding.fetch_add(1, Ordering::AcqRel) + 1;
            return Admission::Admitted { outstanding: count };
        }
        if let Some(wait) = &self.wait {
            return Admission::Blocked {
                event: wait.event(),
                holds_slot: false,
            };
        }
        let count = outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        if count <= config.max_window_size {
            return Admission::Admitted { outstanding: count };
        }
        let wait = UserEvent::new();
        let event = wait.event();
        self.wait = Some(wait);
        Admission::Blocked {
            event,
            holds_slot: true,
        }
    }

    /// Retire one counted child. Returns the wait event to trigger when the
    /// count has reached the release threshold.
    pub fn retire(
        &mut self,
        outstanding: &AtomicUsize,
        config: &FlowControlConfig,
    ) -> Option<UserEvent> {
        let previous = outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        let count = previous.saturating_sub(1);
        if self.wait.is_some() && count <= Self::release_threshold(config) {
            self.wait.take()
        } else {
            None
        }
    }

    /// The waiting registrant is part of the count, so the threshold never
    /// drops below one: a zero low-water mark releases once every admitted
    /// child has completed.
    fn release_threshold(config: &FlowControlConfig) -> usize {
        config.low_water_mark().max(1)
    }

    pub fn is_blocking(&self) -> bool {
        self.wait.is_some()
    }
}

/// Frame discipline: markers in issue order.
#[derive(Debug, Default)]
pub struct FrameQueue {
    markers: VecDeque<(OpId, UserEvent)>,
}

impl FrameQueue {
    /// Append `frame`. Returns the marker to wait on when more than
    /// `max_outstanding_frames` frames were already pending. A zero limit
    /// turns frame throttling off and nothing is queued.
    pub fn issue(&mut self, frame: OpId, config: &FlowControlConfig) -> Option<Event> {
        if config.max_outstanding_frames == 0 {
            return None;
        }
        let current = self.markers.len();
        let wait_on = (current > config.max_outstanding_frames)
            .then(|| self.markers[current - config.max_outstanding_frames].1.event());
        self.markers.push_back((frame, UserEvent::new()));
        wait_on
    }

    /// Pop the head, which must be `frame`.
    pub fn finish(&mut self, frame: OpId) -> Option<UserEvent> {
        match self.markers.front() {
            Some((head, _)) if *head == frame => self.markers.pop_front().map(|(_, ev)| ev),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// A pending activate/deactivate call, ordered after the previous one.
#[derive(Debug)]
pub struct GateTransition {
    pub activate: bool,
    pub wait_on: Event,
    pub done: UserEvent,
}

/// Scheduling-activation gate.
#[derive(Debug)]
pub struct ActivationGate {
    outstanding_subtasks: usize,
    pending_subtasks: usize,
    pending_frames: usize,
    currently_active: bool,
    order_event: Event,
}

impl Default for ActivationGate {
    fn default() -> Self {
        Self {
            outstanding_subtasks: 0,
            pending_subtasks: 0,
            pending_frames: 0,
            currently_active: false,
            order_event: Event::no_event(),
        }
    }
}

impl ActivationGate {
    fn below_minimum(&self, config: &FlowControlConfig) -> bool {
        (config.min_tasks_to_schedule > 0 && self.pending_subtasks < config.min_tasks_to_schedule)
            || (config.min_frames_to_schedule > 0
                && self.pending_frames < config.min_frames_to_schedule)
    }

    fn transition(&mut self, activate: bool) -> GateTransition {
        let done = UserEvent::new();
        let wait_on = std::mem::replace(&mut self.order_event, done.event());
        self.currently_active = activate;
        GateTransition {
            activate,
            wait_on,
            done,
        }
    }

    pub fn increment_outstanding(&mut self, config: &FlowControlConfig) -> Option<GateTransition> {
        let activate = !self.currently_active
            && self.outstanding_subtasks == 0
            && self.below_minimum(config);
        self.outstanding_subtasks += 1;
        activate.then(|| self.transition(true))
    }

    pub fn decrement_outstanding(&mut self, config: &FlowControlConfig) -> Option<GateTransition> {
        self.outstanding_subtasks = self.outstanding_subtasks.saturating_sub(1);
        let deactivate = self.currently_active
            && self.outstanding_subtasks == 0
            && self.below_minimum(config);
        deactivate.then(|| self.transition(false))
    }

    pub fn increment_pending(&mut self, config: &FlowControlConfig) -> Option<GateTransition> {
        self.pending_subtasks += 1;
        let deactivate = !config.frames_mode()
            && self.currently_active
            && self.outstanding_subtasks > 0
            && self.pending_subtasks == config.min_tasks_to_schedule;
        deactivate.then(|| self.transition(false))
    }

    pub fn decrement_pending(&mut self, config: &FlowControlConfig) -> Option<GateTransition> {
        let activate = !config.frames_mode()
            && !self.currently_active
            && self.outstanding_subtasks > 0
            && self.pending_subtasks == config.min_tasks_to_schedule;
        self.pending_subtasks = self.pending_subtasks.saturating_sub(1);
        activate.then(|| self.transition(true))
    }

    pub fn increment_frames(&mut self, config: &FlowControlConfig) -> Option<GateTransition> {
        self.pending_frames += 1;
        let deactivate = config.frames_mode()
            && self.currently_active
            && self.outstanding_subtasks > 0
            && self.pending_frames == config.min_frames_to_schedule;
        deactivate.then(|| self.transition(false))
    }

    pub fn decrement_frames(&mut self, config: &FlowControlConfig) -> Option<GateTransition> {
        let activate = config.frames_mode()
            && !self.currently_active
            && self.outstanding_subtasks > 0
            && self.pending_frames == config.min_frames_to_schedule;
        self.pending_frames = self.pending_frames.saturating_sub(1);
        activate.then(|| self.transition(true))
    }

    pub fn is_active(&self) -> bool {
        self.currently_active
    }

    pub fn counters(&self) -> (usize, usize, usize) {
        (
            self.outstanding_subtasks,
            self.pending_subtasks,
            self.pending_frames,
        )
    }
}
