/*!
 * Core daemon machinery
 */

pub mod cancel;
pub mod channel;
pub mod log_sink;
pub mod orchestrator;
pub mod preflight;
pub mod sentinel;
pub mod single_flight;
pub mod singleton;
pub mod supervisor;
pub mod volume;
