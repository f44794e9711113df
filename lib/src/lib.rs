#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

//! Debloats container images down to the files a traced workload actually
//! touches.
//!
//! The pipeline runs leaves-first and strictly in order:
//!
//! 1. [`trace`] reconstructs per-process file and socket access from a
//!    syscall trace log, one [`trace::ExecutionRecord`] per exec generation.
//! 2. [`oracle`] is a read-only view over the original container's exported
//!    root tree; it resolves links inside the export, never on the host.
//! 3. [`closure`] merges the generations into an [`closure::AccessSet`] and
//!    computes every path the new image must carry: ancestors, symlink
//!    targets, script interpreters, and the dynamic linkers.
//! 4. [`reduce`] intersects the container's declared environment and mounts
//!    with what was actually read.
//! 5. [`image`] packages the selected paths into a legacy single-layer image
//!    tar the runtime can load.
//!
//! [`slim::Slim`] wires these together for one debloat run; [`daemon`] holds
//! the three read-only runtime operations the pipeline consumes.

pub mod closure;
pub mod daemon;
pub mod ext;
pub mod image;
pub mod oracle;
pub mod reduce;
pub mod slim;
pub mod syscall;
pub mod trace;

pub use closure::{AccessSet, DYNAMIC_LINKERS};
pub use oracle::Oracle;
pub use slim::{Slim, SlimReport};
pub use syscall::SockAddr;
pub use trace::ExecutionRecord;
