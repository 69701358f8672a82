//! Intentionally empty: this crate exists only to host the end-to-end
//! scenario tests under `tests/` (spec §8). See `tests/scenarios.rs`.
