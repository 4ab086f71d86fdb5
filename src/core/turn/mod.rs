//! Push-to-talk turn protocol.

mod controller;

pub use controller::{
    DEFAULT_HOLD_THRESHOLD, TurnController, TurnError, TurnOptions, TurnResult, TurnSignal,
    TurnState,
};
