// ABOUTME: Client side: connection, settings and the orchestrating controller
// ABOUTME: Controller::run is the whole client lifecycle

pub mod connection;
pub mod controller;
pub mod settings;

pub use controller::Controller;
pub use settings::ClientSettings;
