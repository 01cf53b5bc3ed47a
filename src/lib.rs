pub mod call_and_response;
pub mod config;
pub mod console_display;
pub mod event_logger;
pub mod generator;
pub mod hub;
pub mod interaction;
pub mod midi;
pub mod params;
pub mod signals;
pub mod simulator;
pub mod types;
