use std::path::PathBuf;

use thiserror::Error;

/// Errors that cross a module boundary: configuration, disc I/O, CLI
/// parsing, and codegen failures the caller chooses to report rather than
/// panic on. Invariant violations inside the hot interpreter/JIT path still
/// `panic!`, matching the teacher's own treatment of "this should never
/// happen" states.
#[derive(Debug, Error)]
pub enum DcError {
    #[error("configuration file {path:?} line {line}: {message}")]
    ConfigParse { path: PathBuf, line: usize, message: String },

    #[error("could not read configuration file {path:?}: {source}")]
    ConfigIo { path: PathBuf, #[source] source: std::io::Error },

    #[error("disc read failed at FAD {fad}: {reason}")]
    DiscRead { fad: u32, reason: String },

    #[error("unrecognized command-line option {0:?}")]
    UnknownOption(String),

    #[error("missing required positional argument: a disc image, .bin, or .trace path")]
    MissingImage,

    #[error("unsupported image extension for {0:?}")]
    UnsupportedImage(PathBuf),

    #[error("could not read image {path:?}: {source}")]
    ImageIo { path: PathBuf, #[source] source: std::io::Error },

    #[error("backend codegen error at guest pc {pc:#010x}: {message}")]
    Codegen { pc: u32, message: String },
}
