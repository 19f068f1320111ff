pub mod calls;
pub mod config;
pub mod personas;
pub mod voicemail;

pub use self::calls::*;
pub use self::config::*;
pub use self::personas::*;
pub use self::voicemail::*;
