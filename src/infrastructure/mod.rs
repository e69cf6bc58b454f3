pub mod events;
pub mod logging;
