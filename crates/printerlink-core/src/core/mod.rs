//! Event and listener plumbing shared by the engine and its consumers

pub mod event;
pub mod listener;

pub use event::{EventDispatcher, PrinterEvent};
pub use listener::{PrinterListener, PrinterListenerHandle};
