/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use std::cell::Cell;
use std::rc::Rc;

/// Whether a parse request currently owns the decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseState {
    #[default]
    Idle,
    Busy,
}

/// Single-slot admission control for the decoder.
///
/// Clones share the slot, so a callback holding a clone can observe or be
/// refused while a parse is running.
#[derive(Debug, Clone, Default)]
pub struct ParseGuard {
    state: Rc<Cell<ParseState>>,
}

impl ParseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot. Returns `None` if a parse is already in flight.
    pub fn try_acquire(&self) -> Option<InFlight> {
        match self.state.get() {
            ParseState::Busy => None,
            ParseState::Idle => {
                self.state.set(ParseState::Busy);
                Some(InFlight {
                    state: Rc::clone(&self.state),
                })
            }
        }
    }

    pub fn state(&self) -> ParseState {
        self.state.get()
    }

    pub fn is_busy(&self) -> bool {
        self.state() == ParseState::Busy
    }
}

/// Proof of an in-flight parse. Releases the slot when dropped.
#[derive(Debug)]
pub struct InFlight {
    state: Rc<Cell<ParseState>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.set(ParseState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_parse_at_a_time() {
        let guard = ParseGuard::new();
        let observer = guard.clone();

        let token = guard.try_acquire().unwrap();
        assert!(observer.is_busy());
        assert!(observer.try_acquire().is_none());

        drop(token);
        assert_eq!(observer.state(), ParseState::Idle);
        assert!(observer.try_acquire().is_some());
        assert!(!guard.is_busy());
    }
}
