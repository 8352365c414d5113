pub mod file;
pub mod preferences;

pub use file::FilePreferences;
pub use preferences::{MemoryPreferences, Preferences};
