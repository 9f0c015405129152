//! Firmware upgrade driver: per-device finite-state machine (spec §4.12).

use std::time::Duration;

use tracing::{debug, warn};

/// Chunk size for firmware transfer (spec §4.12).
pub const CHUNK_LEN: usize = 1024;
/// Pacing between chunks (spec §4.12).
pub const INTER_CHUNK_DELAY: Duration = Duration::from_millis(5);
/// Retry cap for every step except progress polling (spec §4.12).
pub const MAX_RETRIES: u8 = 10;
/// Retry cap specific to progress polling (spec §4.12).
pub const MAX_PROGRESS_RETRIES: u8 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Idle,
    Requesting,
    Transferring,
    Completing,
    Polling,
    Done,
    Err,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeEvent {
    RequestUpgrade,
    XferFirmware,
    CompleteXfer,
    GetProgress { progress: u8 },
    Complete,
    Reinit,
    Err,
}

/// Device-side ack codes this runtime interprets (spec §4.12: "Ack ret_code
/// values map"). The ordinal values are this runtime's own convention —
/// see [`crate::command_ids::KEY_FW_TYPE`]'s note on filtered headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeAckCode {
    Ok,
    SystemIsNotReady,
    EraseFirmware,
    Other,
}

/// Maps the FSM state to the 10/20/40/50/50+p/2/100 progress scale used by
/// the user progress callback (spec §4.12).
#[must_use]
pub fn progress_percent(state: UpgradeState, polling_progress: u8) -> u8 {
    match state {
        UpgradeState::Idle => 0,
        UpgradeState::Requesting => 10,
        UpgradeState::Transferring => 20,
        UpgradeState::Completing => 40,
        UpgradeState::Polling => 50 + polling_progress / 2,
        UpgradeState::Done => 100,
        UpgradeState::Err => 0,
    }
}

/// Firmware blob and transfer cursor for one device's upgrade (spec §3).
pub struct UpgradeSession {
    pub firmware: Vec<u8>,
    pub read_offset: usize,
    pub chunk_len: usize,
    pub state: UpgradeState,
    pub retry_count: u8,
    pub progress: u8,
}

impl UpgradeSession {
    #[must_use]
    pub fn new(firmware: Vec<u8>) -> Self {
        Self {
            firmware,
            read_offset: 0,
            chunk_len: CHUNK_LEN,
            state: UpgradeState::Idle,
            retry_count: 0,
            progress: 0,
        }
    }

    #[must_use]
    pub fn next_chunk(&self) -> Option<&[u8]> {
        if self.read_offset >= self.firmware.len() {
            return None;
        }
        let end = (self.read_offset + self.chunk_len).min(self.firmware.len());
        Some(&self.firmware[self.read_offset..end])
    }

    pub fn advance_chunk(&mut self) {
        if let Some(chunk) = self.next_chunk() {
            self.read_offset += chunk.len();
        }
    }

    #[must_use]
    pub fn is_transfer_complete(&self) -> bool {
        self.read_offset >= self.firmware.len()
    }

    fn retry_cap(&self) -> u8 {
        if self.state == UpgradeState::Polling { MAX_PROGRESS_RETRIES } else { MAX_RETRIES }
    }

    /// Applies one FSM transition per spec §4.12's table. Returns `false`
    /// if the event was rejected (e.g. a retry past the cap).
    pub fn apply(&mut self, event: UpgradeEvent) -> bool {
        use UpgradeEvent as E;
        use UpgradeState as S;

        if matches!(event, E::Err) {
            self.state = S::Err;
            return true;
        }

        let next = match (self.state, event) {
            (S::Idle, E::RequestUpgrade) => Some(S::Requesting),
            (S::Requesting, E::RequestUpgrade) => Some(S::Requesting),
            (S::Requesting, E::XferFirmware) => Some(S::Transferring),
            (S::Transferring, E::XferFirmware) => Some(S::Transferring),
            (S::Transferring, E::CompleteXfer) => Some(S::Completing),
            (S::Completing, E::CompleteXfer) => Some(S::Completing),
            (S::Completing, E::GetProgress { .. }) => Some(S::Polling),
            (S::Polling, E::GetProgress { progress }) if progress < 100 => Some(S::Polling),
            (S::Polling, E::Complete) => Some(S::Done),
            (S::Done, E::Reinit) => Some(S::Idle),
            _ => None,
        };

        let Some(next) = next else {
            let state = self.state;
            debug!(?state, ?event, "rejected upgrade event for current state");
            return false;
        };

        let is_retry = next == self.state;
        if is_retry {
            self.retry_count += 1;
            if self.retry_count > self.retry_cap() {
                warn!(state = ?self.state, "upgrade retry cap exceeded");
                self.state = S::Err;
                return false;
            }
        } else {
            self.retry_count = 0;
        }

        if let E::GetProgress { progress } = event {
            self.progress = progress;
        }
        self.state = next;
        true
    }

    /// Decides the next event for an ack code received mid-transfer (spec
    /// §4.12: `SystemIsNotReady`/`EraseFirmware` retry the request, other
    /// codes are fatal).
    #[must_use]
    pub fn event_for_ack(ack: UpgradeAckCode) -> UpgradeEvent {
        match ack {
            UpgradeAckCode::Ok => UpgradeEvent::XferFirmware,
            UpgradeAckCode::SystemIsNotReady | UpgradeAckCode::EraseFirmware => UpgradeEvent::RequestUpgrade,
            UpgradeAckCode::Other => UpgradeEvent::Err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_done() {
        let mut session = UpgradeSession::new(vec![0xAB; 10]);
        assert!(session.apply(UpgradeEvent::RequestUpgrade));
        assert!(session.apply(UpgradeEvent::XferFirmware));
        assert!(session.apply(UpgradeEvent::CompleteXfer));
        assert!(session.apply(UpgradeEvent::GetProgress { progress: 50 }));
        assert!(session.apply(UpgradeEvent::GetProgress { progress: 99 }));
        assert!(session.apply(UpgradeEvent::Complete));
        assert_eq!(session.state, UpgradeState::Done);
    }

    #[test]
    fn retry_cap_trips_to_err() {
        let mut session = UpgradeSession::new(vec![]);
        session.apply(UpgradeEvent::RequestUpgrade);
        for _ in 0..MAX_RETRIES {
            assert!(session.apply(UpgradeEvent::RequestUpgrade));
        }
        assert!(!session.apply(UpgradeEvent::RequestUpgrade));
        assert_eq!(session.state, UpgradeState::Err);
    }

    #[test]
    fn err_event_is_terminal_from_any_state() {
        let mut session = UpgradeSession::new(vec![]);
        session.apply(UpgradeEvent::RequestUpgrade);
        session.apply(UpgradeEvent::XferFirmware);
        assert!(session.apply(UpgradeEvent::Err));
        assert_eq!(session.state, UpgradeState::Err);
    }

    #[test]
    fn progress_percent_matches_scale() {
        assert_eq!(progress_percent(UpgradeState::Requesting, 0), 10);
        assert_eq!(progress_percent(UpgradeState::Transferring, 0), 20);
        assert_eq!(progress_percent(UpgradeState::Completing, 0), 40);
        assert_eq!(progress_percent(UpgradeState::Polling, 0), 50);
        assert_eq!(progress_percent(UpgradeState::Polling, 40), 70);
        assert_eq!(progress_percent(UpgradeState::Done, 100), 100);
    }

    #[test]
    fn chunking_advances_through_whole_firmware() {
        let mut session = UpgradeSession::new(vec![1u8; 2500]);
        session.chunk_len = 1024;
        let mut total = 0;
        while let Some(chunk) = session.next_chunk() {
            total += chunk.len();
            session.advance_chunk();
        }
        assert_eq!(total, 2500);
        assert!(session.is_transfer_complete());
    }

    #[test]
    fn ack_code_mapping_matches_spec() {
        assert_eq!(UpgradeSession::event_for_ack(UpgradeAckCode::Ok), UpgradeEvent::XferFirmware);
        assert_eq!(UpgradeSession::event_for_ack(UpgradeAckCode::SystemIsNotReady), UpgradeEvent::RequestUpgrade);
        assert_eq!(UpgradeSession::event_for_ack(UpgradeAckCode::Other), UpgradeEvent::Err);
    }
}
