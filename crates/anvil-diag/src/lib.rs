// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Scoped diagnostics: error/warn/info/text records, a thread-safe stream
//! lock, a per-thread diagnostic frame stack, and a terminal `fail` that
//! reports a record and returns the distinguished failure sentinel.
//!
//! Every fallible engine operation returns `Result<T, BuildFailure>` (or a
//! module-local error convertible into one): we don't unwind across
//! recipe/rule recursion the way libbuild2 throws a C++ exception, we thread
//! the result the way spec rework notes call for in languages without cheap
//! unwinding.

mod frame;
mod level;
mod location;

use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

pub use frame::{push_frame, FrameGuard};
pub use level::Level;
pub use location::Location;

/// The distinguished failure sentinel. Once issued, a `fail` has already been
/// reported to the user; callers just need to unwind to the nearest
/// meta-operation boundary without printing anything further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("build failed")]
pub struct BuildFailure;

/// Global record stream lock: serializes emission so concurrent match/execute
/// threads never interleave a record's lines.
static STREAM_LOCK: Mutex<()> = Mutex::new(());

/// Process-wide verbosity, 0-6. Gates `trace`.
static VERBOSITY: AtomicU8 = AtomicU8::new(1);

/// Set the verbosity level (0-6).
pub fn set_verbosity(level: u8) {
    VERBOSITY.store(level.min(6), Ordering::Relaxed);
}

pub fn verbosity() -> u8 {
    VERBOSITY.load(Ordering::Relaxed)
}

fn emit(level: Level, location: &Location, message: &str) {
    let _guard = STREAM_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let stderr = io::stderr();
    let mut out = stderr.lock();

    if location.is_known() {
        let _ = writeln!(out, "{}: {}: {}", location, level, message);
    } else if level.as_str().is_empty() {
        let _ = writeln!(out, "{message}");
    } else {
        let _ = writeln!(out, "{}: {}", level, message);
    }

    for (describe, loc) in frame::trail() {
        if loc.is_known() {
            let _ = writeln!(out, "{loc}: info: {describe}");
        } else {
            let _ = writeln!(out, "  info: {describe}");
        }
    }

    log::log!(level.to_log_level(), "{message}");
}

/// Emit a plain text record (no severity prefix).
pub fn text(message: impl AsRef<str>) {
    emit(Level::Text, &Location::unknown(), message.as_ref());
}

/// Emit an `info` record at the given location.
pub fn info_at(location: &Location, message: impl AsRef<str>) {
    emit(Level::Info, location, message.as_ref());
}

pub fn info(message: impl AsRef<str>) {
    info_at(&Location::unknown(), message);
}

/// Emit a `warning` record. Warnings never abort (spec §7).
pub fn warn_at(location: &Location, message: impl AsRef<str>) {
    emit(Level::Warn, location, message.as_ref());
}

pub fn warn(message: impl AsRef<str>) {
    warn_at(&Location::unknown(), message);
}

/// Emit an `error` record without failing the operation outright (used when
/// a meta-operation collects several target failures before giving up).
pub fn error_at(location: &Location, message: impl AsRef<str>) {
    emit(Level::Error, location, message.as_ref());
}

pub fn error(message: impl AsRef<str>) {
    error_at(&Location::unknown(), message);
}

/// Emit a `trace` record, gated by verbosity. `level` follows libbuild2's
/// convention of numbered trace levels (1 = coarse, 6 = everything).
pub fn trace_at(level: u8, location: &Location, message: impl AsRef<str>) {
    if verbosity() >= level {
        emit(Level::Text, location, &format!("trace: {}", message.as_ref()));
    }
}

pub fn trace(level: u8, message: impl AsRef<str>) {
    trace_at(level, &Location::unknown(), message);
}

/// Report a fatal record and return the failure sentinel.
///
/// ```ignore
/// if missing {
///     return Err(fail_at(&loc, "target not found"));
/// }
/// ```
#[must_use]
pub fn fail_at(location: &Location, message: impl AsRef<str>) -> BuildFailure {
    emit(Level::Fail, location, message.as_ref());
    BuildFailure
}

#[must_use]
pub fn fail(message: impl AsRef<str>) -> BuildFailure {
    fail_at(&Location::unknown(), message)
}

/// Shorthand: `fail!("no rule to build {}", name)` instead of formatting by
/// hand at every call site, mirroring libbuild2's `fail << ... << endf`.
#[macro_export]
macro_rules! fail {
    ($($arg:tt)*) => {
        $crate::fail(format!($($arg)*))
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_trail_pops_on_drop() {
        assert_eq!(frame::depth(), 0);
        {
            let _f1 = push_frame("loading buildfile", Location::unknown());
            assert_eq!(frame::depth(), 1);
            {
                let _f2 = push_frame("evaluating rule", Location::unknown());
                assert_eq!(frame::depth(), 2);
            }
            assert_eq!(frame::depth(), 1);
        }
        assert_eq!(frame::depth(), 0);
    }

    #[test]
    fn verbosity_clamped_to_six() {
        set_verbosity(9);
        assert_eq!(verbosity(), 6);
        set_verbosity(2);
        assert_eq!(verbosity(), 2);
    }

    #[test]
    fn fail_returns_sentinel() {
        let f = fail("boom");
        assert_eq!(f, BuildFailure);
    }
}
