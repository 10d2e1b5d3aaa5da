//! Script-order monitor for the W3 Total Cache JavaScript minifier.
//!
//! In manual mode a render's script emission is recorded per template and
//! turned into the host's grouping configuration. In auto mode the host's
//! batch algorithm is driven through its extension points so inline and
//! conditional scripts stay in order inside one combined file.

mod atomic;
pub mod autojs;
pub mod builder;
pub mod conditional;
pub mod embed;
pub mod extension;
mod hash;
pub mod notices;
pub mod recorder;
pub mod recovery;
pub mod session;
pub mod shadow;
pub mod store;
pub mod types;

pub use atomic::{write_atomic, AtomicFile};
pub use autojs::{purge_inline_scripts, DirSink, MemorySink, ScriptSink};
pub use builder::{ConfigBuilder, CONF_FILE_NAME};
pub use hash::content_hash;
pub use recovery::{combine_minify, recover_failed_request, CommandMinifier, Minifier};
pub use session::{replay_trace, HostEvent, HostResponse, RequestTrace, Session, SessionOptions};
pub use store::{unix_now, Database, Store};
pub use types::{Diagnostic, DiagnosticCode, TemplateEntry, TemplateKey};
