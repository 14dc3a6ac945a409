//! Per-side game clocks.
//!
//! Clocks accumulate elapsed time per side and are read from a monotonic
//! [`Instant`] supplied by the caller, so nothing here ticks on its own.
//! At most one side runs at a time. Every start or stop bumps a generation
//! counter; a scheduled timeout carries the generation it was armed with and
//! is ignored once the clock has moved on.

use serde::Serialize;
use std::time::{Duration, Instant};
use utoipa::ToSchema;

use crate::types::Color;

/// Number of committed moves after which the clocks start running.
pub const UNTIMED_OPENING_MOVES: usize = 2;

/// Per-side allotment and increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeControl {
    /// Total time each side may use. `None` is unlimited.
    pub limit: Option<Duration>,
    /// Bonus credited to a side after each of its timed moves.
    pub increment: Duration,
}

impl TimeControl {
    /// Builds a time control from whole seconds; a limit of 0 is unlimited.
    pub fn from_secs(limit: u64, increment: u64) -> Self {
        Self {
            limit: (limit > 0).then(|| Duration::from_secs(limit)),
            increment: Duration::from_secs(increment),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// Clock readings sent to clients, in whole seconds of elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct ClockSnapshot {
    pub white: u64,
    pub black: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    pub increment: u64,
}

/// A scheduled flag-fall: `side` runs out of time at `at` unless the clock
/// generation has changed by then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub side: Color,
    pub at: Instant,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct GameClock {
    control: TimeControl,
    white_elapsed: Duration,
    black_elapsed: Duration,
    /// The running side and when its current turn started.
    running: Option<(Color, Instant)>,
    generation: u64,
}

impl GameClock {
    pub fn new(control: TimeControl) -> Self {
        Self {
            control,
            white_elapsed: Duration::ZERO,
            black_elapsed: Duration::ZERO,
            running: None,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn running_side(&self) -> Option<Color> {
        self.running.map(|(side, _)| side)
    }

    fn banked(&self, side: Color) -> Duration {
        match side {
            Color::White => self.white_elapsed,
            Color::Black => self.black_elapsed,
        }
    }

    fn banked_mut(&mut self, side: Color) -> &mut Duration {
        match side {
            Color::White => &mut self.white_elapsed,
            Color::Black => &mut self.black_elapsed,
        }
    }

    /// Time used by `side` as of `now`, including a turn in progress.
    pub fn elapsed(&self, side: Color, now: Instant) -> Duration {
        let mut total = self.banked(side);
        if let Some((running, since)) = self.running
            && running == side
        {
            total += now.saturating_duration_since(since);
        }
        total
    }

    /// Time left for `side`; `None` with an unlimited control.
    pub fn remaining(&self, side: Color, now: Instant) -> Option<Duration> {
        self.control
            .limit
            .map(|limit| limit.saturating_sub(self.elapsed(side, now)))
    }

    /// `true` once `side` has used its whole allotment.
    pub fn is_flagged(&self, side: Color, now: Instant) -> bool {
        self.remaining(side, now).is_some_and(|left| left.is_zero())
    }

    /// Starts `side`'s clock, stopping whichever was running.
    pub fn start(&mut self, side: Color, now: Instant) {
        self.stop(now);
        self.running = Some((side, now));
        self.generation += 1;
    }

    /// Stops the running clock, banking its time. Returns the side that was running.
    pub fn stop(&mut self, now: Instant) -> Option<Color> {
        let (side, since) = self.running.take()?;
        *self.banked_mut(side) += now.saturating_duration_since(since);
        self.generation += 1;
        Some(side)
    }

    /// Accounts for a committed move by `mover`, the `moves_played`-th of the game.
    ///
    /// The mover's clock stops and, if it was running, the increment is
    /// credited back. The opponent's clock starts once the untimed opening
    /// is over.
    pub fn on_move(&mut self, mover: Color, moves_played: usize, now: Instant) {
        if self.stop(now) == Some(mover) {
            let increment = self.control.increment;
            let banked = self.banked_mut(mover);
            *banked = banked.saturating_sub(increment);
        }
        if moves_played >= UNTIMED_OPENING_MOVES {
            self.start(mover.opponent(), now);
        }
    }

    /// Restarts timing for `to_move` after history was rewound (undo).
    /// No increment is credited.
    pub fn resume(&mut self, to_move: Color, moves_played: usize, now: Instant) {
        self.stop(now);
        if moves_played >= UNTIMED_OPENING_MOVES {
            self.start(to_move, now);
        }
    }

    /// When the running side flags, if it can. A limit too far out to
    /// represent as an `Instant` never flags.
    pub fn deadline(&self, now: Instant) -> Option<Deadline> {
        let (side, _) = self.running?;
        let left = self.remaining(side, now)?;
        Some(Deadline {
            side,
            at: now.checked_add(left)?,
            generation: self.generation,
        })
    }

    pub fn snapshot(&self, now: Instant) -> ClockSnapshot {
        ClockSnapshot {
            white: self.elapsed(Color::White, now).as_secs(),
            black: self.elapsed(Color::Black, now).as_secs(),
            limit: self.control.limit.map(|l| l.as_secs()),
            increment: self.control.increment.as_secs(),
        }
    }
}
