//! Small internal helpers.

pub(crate) mod size;
