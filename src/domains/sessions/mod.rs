pub mod discovery;
pub mod entity;
pub mod service;
pub mod storage;

pub use entity::{SavedSession, Session, SessionMetadata, SessionStatus};
pub use service::{CreateSessionParams, SessionEvent, SessionSupervisor};
