//! Per-session stream table and stream state machine.
//!
//! Stream ids are 62-bit; client-initiated bidirectional streams are
//! allocated as `4·n`. States follow
//! IDLE → OPEN → HALF_CLOSED_{LOCAL,REMOTE} → CLOSED: a local FIN half
//! closes the write side, a remote FIN the read side, both together (or a
//! reset in either direction) close the stream. CLOSED is terminal; the
//! reset error, if any, surfaces on the next read or write.
//!
//! Events for ids the table has never seen are tolerated: a fresh entry is
//! created so out-of-order observers can still collect them.

use std::collections::HashMap;

use crate::error::{TransportError, TransportErrorKind, TransportResult};

/// Cancellation direction for `cancel_stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Read,
    Write,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug)]
pub(crate) struct StreamState {
    pub id: u64,
    pub phase: StreamPhase,
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Remote FIN observed; the buffered response is complete.
    pub read_finished: bool,
    pub fin_sent: bool,
    pub error: Option<TransportError>,
}

impl StreamState {
    fn new(id: u64) -> Self {
        Self {
            id,
            phase: StreamPhase::Open,
            status: None,
            headers: Vec::new(),
            body: Vec::new(),
            read_finished: false,
            fin_sent: false,
            error: None,
        }
    }

    pub fn note_local_fin(&mut self) -> TransportResult<()> {
        if self.fin_sent {
            return Err(TransportError::new(
                TransportErrorKind::InvalidFinState,
                format!("stream {}: write after local FIN", self.id),
            ));
        }
        self.fin_sent = true;
        self.phase = match self.phase {
            StreamPhase::Open | StreamPhase::Idle => StreamPhase::HalfClosedLocal,
            StreamPhase::HalfClosedRemote => StreamPhase::Closed,
            terminal => terminal,
        };
        Ok(())
    }

    pub fn note_remote_fin(&mut self) {
        self.read_finished = true;
        self.phase = match self.phase {
            StreamPhase::Open | StreamPhase::Idle => StreamPhase::HalfClosedRemote,
            StreamPhase::HalfClosedLocal => StreamPhase::Closed,
            terminal => terminal,
        };
    }

    pub fn note_reset(&mut self, error: TransportError) {
        self.phase = StreamPhase::Closed;
        self.error = Some(error);
    }

    pub fn is_closed(&self) -> bool {
        self.phase == StreamPhase::Closed
    }

    pub fn writable(&self) -> bool {
        !self.fin_sent && !self.is_closed()
    }
}

#[derive(Debug, Default)]
pub(crate) struct StreamTable {
    next_index: u64,
    entries: HashMap<u64, StreamState>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next client-initiated bidirectional stream id.
    pub fn allocate(&mut self) -> u64 {
        let id = self.next_index * 4;
        self.next_index += 1;
        self.entries.insert(id, StreamState::new(id));
        id
    }

    pub fn get(&self, id: u64) -> Option<&StreamState> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut StreamState> {
        self.entries.get_mut(&id)
    }

    /// Entry for an id seen in an event. Unknown ids get a fresh entry so
    /// their events queue for later observers.
    pub fn entry_for_event(&mut self, id: u64) -> &mut StreamState {
        self.entries.entry(id).or_insert_with(|| StreamState::new(id))
    }

    pub fn require_mut(&mut self, id: u64) -> TransportResult<&mut StreamState> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| TransportError::unknown_stream(id))
    }

    pub fn remove(&mut self, id: u64) -> Option<StreamState> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
