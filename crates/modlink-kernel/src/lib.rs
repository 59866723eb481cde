//! modlink capability registry.
//!
//! Modules announce the actions they implement and the events they emit;
//! other modules discover them, trigger actions and subscribe to events.
//! Everything travels over a [`modlink_wire::Bus`].
//!
//! - [`Controller`]: generic registry over an [`Activity`] kind
//! - [`ActionController`] / [`EventController`]: named facades
//! - [`System`]: bus, module registry and both controllers in one place
//! - [`config::load_config`]: bus settings from TOML

pub mod actions;
pub mod activity;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod metadata;
pub mod system;

pub use actions::ActionController;
pub use activity::{Action, Activity, ActivityHandler, Event, HandlerToken};
pub use controller::Controller;
pub use error::{KernelError, KernelResult};
pub use events::EventController;
pub use system::System;
