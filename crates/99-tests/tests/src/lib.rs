//! Cross-member scenarios for Fusion worlds.
//!
//! Every test enters the same world several times from one process. Each
//! [`fusion::World`] handle maps the segment on its own, gets its own fusion
//! id and runs its own dispatcher and watch threads, which is what separate
//! processes would do.

pub mod support;

#[cfg(test)]
mod properties;

#[cfg(test)]
mod scenarios;
