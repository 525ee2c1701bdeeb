use std::collections::VecDeque;
use std::sync::Mutex;

use runner_common::{Result, RunnerError};
use tracing::warn;

/// Hands out host ports from `[start, start + size)`. Ports returned by
/// torn-down instances are reused before fresh ones. Exhaustion is an
/// immediate error; callers never block waiting for a port. A range that
/// would run past port 65535 is truncated to fit.
pub struct PortAllocator {
    start: u16,
    size: u16,
    state: Mutex<PortState>,
}

struct PortState {
    next_fresh: u16,
    recycled: VecDeque<u16>,
}

impl PortAllocator {
    pub fn new(start: u16, size: u16) -> Self {
        let usable = (65536u32 - u32::from(start)).min(u32::from(size)) as u16;
        if usable < size {
            warn!(start, size, usable, "port range truncated at port 65535");
        }
        Self {
            start,
            size: usable,
            state: Mutex::new(PortState {
                next_fresh: 0,
                recycled: VecDeque::new(),
            }),
        }
    }

    pub fn allocate(&self) -> Result<u16> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(port) = state.recycled.pop_front() {
            return Ok(port);
        }
        if state.next_fresh < self.size {
            let port = self.start + state.next_fresh;
            state.next_fresh += 1;
            return Ok(port);
        }
        Err(RunnerError::PortPoolExhausted(format!(
            "all {} ports from {} in use",
            self.size, self.start
        )))
    }

    pub fn release(&self, port: u16) {
        let in_range = port
            .checked_sub(self.start)
            .map_or(false, |offset| offset < self.size);
        if !in_range {
            warn!(port, "ignoring release of port outside the pool range");
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.recycled.contains(&port) {
            state.recycled.push_back(port);
        }
    }

    /// Ports currently available for allocation.
    pub fn available(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (self.size - state.next_fresh) as usize + state.recycled.len()
    }
}
