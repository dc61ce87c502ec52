//! Per-batch phase progress tracking.
//!
//! The cluster coordinator keeps one [`BatchState`] per incomplete batch,
//! advancing it as phase-completion markers drain from the store. A phase
//! is complete when every node the batch was dispatched to has reported;
//! the quorum is the live-node count snapshotted at dispatch, so a node
//! joining mid-batch cannot stall or skew the count.

use std::time::Instant;

use themis_store::PhaseName;

/// Progress of one dispatched batch through the four phases.
#[derive(Debug, Clone)]
pub struct BatchState {
    batch_id: u64,
    current_phase: Option<PhaseName>,
    completed_nodes: usize,
    node_count: usize,
    phase_started_at: Instant,
    phase_started_unix: f64,
}

impl BatchState {
    /// A freshly dispatched batch, starting in phase zero.
    pub fn new(batch_id: u64, node_count: usize, now_unix: f64) -> Self {
        Self {
            batch_id,
            current_phase: Some(PhaseName::Zero),
            completed_nodes: 0,
            node_count,
            phase_started_at: Instant::now(),
            phase_started_unix: now_unix,
        }
    }

    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn current_phase(&self) -> Option<PhaseName> {
        self.current_phase
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn completed_nodes(&self) -> usize {
        self.completed_nodes
    }

    pub fn phase_started_unix(&self) -> f64 {
        self.phase_started_unix
    }

    pub fn phase_elapsed_secs(&self) -> f64 {
        self.phase_started_at.elapsed().as_secs_f64()
    }

    /// All phases have completed.
    pub fn is_done(&self) -> bool {
        self.current_phase.is_none()
    }

    /// Record one node's completion of the current phase. Returns true
    /// when that completion filled the quorum.
    pub fn record_completion(&mut self) -> bool {
        self.completed_nodes += 1;
        self.completed_nodes == self.node_count
    }

    /// Move to the next phase, resetting the completion count and the
    /// phase clock. Returns the new phase, or `None` past phase three.
    pub fn advance(&mut self, now_unix: f64) -> Option<PhaseName> {
        self.current_phase = self.current_phase.and_then(|phase| phase.next());
        self.completed_nodes = 0;
        self.phase_started_at = Instant::now();
        self.phase_started_unix = now_unix;
        self.current_phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_the_dispatch_node_count() {
        let mut state = BatchState::new(1, 3, 0.0);

        assert!(!state.record_completion());
        assert!(!state.record_completion());
        assert!(state.record_completion());
    }

    #[test]
    fn advances_through_all_four_phases_then_finishes() {
        let mut state = BatchState::new(1, 1, 0.0);
        assert_eq!(state.current_phase(), Some(PhaseName::Zero));

        assert_eq!(state.advance(1.0), Some(PhaseName::One));
        assert_eq!(state.advance(2.0), Some(PhaseName::Two));
        assert_eq!(state.advance(3.0), Some(PhaseName::Three));
        assert_eq!(state.advance(4.0), None);
        assert!(state.is_done());
    }

    #[test]
    fn advance_resets_completion_count() {
        let mut state = BatchState::new(1, 2, 0.0);

        assert!(!state.record_completion());
        assert!(state.record_completion());

        state.advance(1.0);
        assert_eq!(state.completed_nodes(), 0);
        assert!(!state.record_completion());
    }
}
