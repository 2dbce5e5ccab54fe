//! Update coordination engine for the POS desktop terminal.
//!
//! Build one [`auto_update::UpdateCoordinator`] at startup from a delivery
//! engine, a persistence adapter and a focus monitor, call `start()`, and
//! forward its [`auto_update::UiEvent`]s to the UI layer.

pub mod auto_update;
