//! Vigil daemon - local adapter and service composition.

pub mod service;
pub mod source;

pub use service::VigilService;
pub use source::LocalSource;
