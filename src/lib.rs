//! In-process loader and runner for Beacon Object Files.
//!
//! A BOF is a bare COFF object whose entry function talks to its host
//! through the small Beacon API instead of linking a C runtime. This
//! crate packs caller arguments into the wire format BOFs expect, maps
//! the object into executable memory, resolves its imports, runs the
//! requested entry and returns the text the BOF printed.
//!
//! ```no_run
//! use bofrunner::{run, BofArg};
//!
//! let data = std::fs::read("whoami.x64.o")?;
//! let out = run(&data, "go", None, &[BofArg::Str("verbose".into())], false)?;
//! println!("{out}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Execution requires Windows; on other platforms [`run`] returns
//! [`BofError::UnsupportedPlatform`], while parsing and argument packing
//! work everywhere.

#![cfg_attr(target_os = "windows", feature(c_variadic))]

pub mod args;
pub mod error;
pub mod output;
pub mod parser;
pub mod reloc;

mod beacon;
mod loader;

pub use args::{pack_arguments, BeaconPack, BofArg};
pub use error::{BofError, Result};
pub use parser::CoffObject;

use log::debug;

/// Loads `data` as a COFF object and executes `function` from it.
///
/// Arguments are delivered to the BOF packed per `format` (one character
/// per argument from the alphabet `Z` (wide string), `z` (string), `i`
/// (int), `s` (short), `b` (binary)), or per each argument's own type
/// when `format` is `None` or empty. With `raw` set the arguments are
/// joined into one plain text buffer instead; `raw` cannot be combined
/// with a non-empty `format`.
///
/// Argument problems surface before any loading happens, so a bad call
/// never allocates executable memory.
pub fn run(
    data: &[u8],
    function: &str,
    format: Option<&str>,
    args: &[BofArg],
    raw: bool,
) -> Result<String> {
    let packed = args::pack(args, format, raw)?;
    debug!("packed {} arguments into {} bytes", args.len(), packed.len());

    cfg_if::cfg_if! {
        if #[cfg(target_os = "windows")] {
            loader::CoffLoader::new(data)?.run(function, &packed)
        } else {
            let _ = (data, function);
            Err(BofError::UnsupportedPlatform)
        }
    }
}
