//! Backend emission: the ninja manifest and its companion files.

mod ninja;

pub use ninja::{BackendError, emit, write_outputs};
