// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Depdb: an append-only, line-oriented dependency-info file with an
//! end-marker byte, supporting streaming read then switch-to-overwrite at
//! the first mismatched line.
//!
//! A depdb is a strange beast: a streaming database that can, at some point,
//! be switched from reading to (over)writing. The idea is to store auxiliary
//! dependency information in "invalidation" order -- if an earlier line is
//! out of date, every subsequent one is assumed out of date as well. As an
//! example, a `foo.o.d` for a `cxx.compile`-like rule might look like:
//!
//! ```text
//! 1
//! cxx.compile 1
//! g++-13 -I/tmp/foo -O3
//! /tmp/foo/foo.cxx
//! /tmp/foo/foo.hxx
//! \0
//! ```
//!
//! the first line is the format version and the trailing `\0` is the end
//! marker, whose presence guarantees the database was not truncated by an
//! aborted writer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

const FORMAT_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to open {0}: {1}")]
    Open(PathBuf, #[source] io::Error),
    #[error("unable to read from {0}: {1}")]
    Read(PathBuf, #[source] io::Error),
    #[error("unable to write to {0}: {1}")]
    Write(PathBuf, #[source] io::Error),
    #[error("unable to truncate {0}: {1}")]
    Truncate(PathBuf, #[source] io::Error),
    #[error("unable to touch {0}: {1}")]
    Touch(PathBuf, #[source] io::Error),
    #[error("target file {0} does not exist at the end of recipe")]
    TargetMissing(PathBuf),
    #[error(
        "backwards modification times detected:\n    {db_mtime:?} {db}\n    {target_mtime:?} {target}"
    )]
    BackwardsMtime {
        db: PathBuf,
        db_mtime: SystemTime,
        target: PathBuf,
        target_mtime: SystemTime,
    },
    #[error("operation not permitted on a read-only database")]
    ReadOnly,
}

/// One-way state machine: `Read -> ReadEof -> Write`, or `Read -> Write` on
/// the first mismatched/corrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Read,
    ReadEof,
    Write,
}

/// Auxiliary dependency-info file. Bytes from the mismatched position onward
/// are replaced, never interleaved with stale data: every `write` that
/// begins in read mode truncates the file at the byte offset of the last
/// line `read` returned before emitting anything.
pub struct Depdb {
    path: PathBuf,
    state: State,
    read_only: bool,
    reader: Option<BufReader<File>>,
    writer: Option<File>,
    /// Byte offset of the start of the last line returned by `read`/`expect`.
    pos: u64,
    /// Byte offset of the end marker itself (the position right after the
    /// last content line's `\n`), captured the moment `read_line` peeks it
    /// and transitions to `ReadEof`. Distinct from `pos`, which tracks the
    /// *start* of the most recently read line and would otherwise make a
    /// touch-only close overwrite that line instead of just the marker.
    marker_pos: Option<u64>,
    /// Scratch buffer for the most recently read line (without the `\n`).
    line: String,
    /// mtime observed when the database was opened, meaningful only while
    /// still in `Read`/`ReadEof` state.
    pub mtime: Option<SystemTime>,
}

impl Depdb {
    /// Open for reading. If the file is missing, corrupt, or carries the
    /// wrong format version, the database switches to writing immediately
    /// (unless `read_only`, in which case writes are simply no-ops).
    pub fn open(path: impl Into<PathBuf>, read_only: bool) -> Result<Self, Error> {
        let path = path.into();
        let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();

        let mut db = if let Some(mtime) = mtime {
            let file = File::open(&path).map_err(|e| Error::Open(path.clone(), e))?;
            Depdb {
                path,
                state: State::Read,
                read_only,
                reader: Some(BufReader::new(file)),
                writer: None,
                pos: 0,
                marker_pos: None,
                line: String::new(),
                mtime: Some(mtime),
            }
        } else {
            let mut db = Depdb {
                path,
                state: State::Write,
                read_only,
                reader: None,
                writer: None,
                pos: 0,
                marker_pos: None,
                line: String::new(),
                mtime: None,
            };
            log::trace!("{}: no existing database, starting fresh", db.path.display());
            if !read_only {
                db.open_writer(0)?;
            }
            return db.write_version_and_return(true);
        };

        let version = db.read().map(|s| s.to_owned());
        if version.as_deref() == Some(FORMAT_VERSION) {
            return Ok(db);
        }

        // Wrong or missing version line: corrupt/incompatible, overwrite.
        log::debug!("{}: bad or missing format version ({version:?}), discarding", db.path.display());
        if !db.read_only {
            db.change(true)?;
            db.write(FORMAT_VERSION, true)?;
        } else if db.reading() {
            db.change(false)?;
        }
        Ok(db)
    }

    fn write_version_and_return(mut self, write_line: bool) -> Result<Self, Error> {
        if write_line && !self.read_only {
            self.write(FORMAT_VERSION, true)?;
        }
        Ok(self)
    }

    fn open_writer(&mut self, pos: u64) -> Result<(), Error> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| Error::Open(self.path.clone(), e))?;
        let mut file = file;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| Error::Write(self.path.clone(), e))?;
        self.writer = Some(file);
        Ok(())
    }

    pub fn reading(&self) -> bool {
        self.state != State::Write
    }

    pub fn writing(&self) -> bool {
        self.state == State::Write
    }

    /// True if in read mode and at least one more line is available. Does
    /// not guarantee the line is not corrupt -- `read` can still return
    /// `None` for a reason other than eof.
    pub fn more(&self) -> bool {
        self.state == State::Read
    }

    /// Read the next line, stripped of its trailing newline. Returns `None`
    /// on eof, corruption, or if already writing.
    pub fn read(&mut self) -> Option<&str> {
        if self.state == State::Write {
            return None;
        }
        match self.read_line() {
            Ok(true) => Some(self.line.as_str()),
            Ok(false) | Err(_) => None,
        }
    }

    /// Reads the next line into `self.line`, returning whether a line was
    /// available. On any corruption this also switches the database to
    /// write mode, matching libbuild2's "preemptively switch to writing"
    /// behavior so a misguided repeated `read()` can't mess up the
    /// overwrite position.
    fn read_line(&mut self) -> Result<bool, Error> {
        let reader = self.reader.as_mut().expect("reader present while reading");
        self.pos = reader
            .stream_position()
            .map_err(|e| Error::Read(self.path.clone(), e))?;

        if self.state == State::ReadEof {
            return Ok(false);
        }

        let mut raw = Vec::new();
        let n = reader
            .read_until(b'\n', &mut raw)
            .map_err(|e| Error::Read(self.path.clone(), e))?;

        // A well-formed line always ends with '\n', and the byte right after
        // it is either the next line or the '\0' end marker. Anything else
        // (including a bare eof) means this line, and the rest of the
        // database, is corrupt.
        if n == 0 || raw.last() != Some(&b'\n') {
            self.change(true)?;
            return Ok(false);
        }

        let mut peek = [0u8; 1];
        let saw_next_byte = peek_one(self.reader.as_mut().expect("reader present"), &mut peek, &self.path)?;
        if !saw_next_byte {
            self.change(true)?;
            return Ok(false);
        }
        if peek[0] == b'\0' {
            self.state = State::ReadEof;
            // `peek_one` restores the stream position to right after this
            // line's `\n`, i.e. exactly the offset of the `\0` marker byte
            // itself -- remember it separately from `self.pos` (the start
            // of this line) so a touch-only close can rewrite just the
            // marker without clobbering the line.
            self.marker_pos = Some(
                self.reader
                    .as_mut()
                    .expect("reader present")
                    .stream_position()
                    .map_err(|e| Error::Read(self.path.clone(), e))?,
            );
        }

        raw.pop(); // trailing '\n'
        let text = String::from_utf8(raw).map_err(|_| {
            Error::Read(
                self.path.clone(),
                io::Error::new(io::ErrorKind::InvalidData, "non-utf8 depdb line"),
            )
        })?;
        self.line = text;
        Ok(true)
    }

    /// Fast-forward to the end marker, verifying every line along the way.
    /// Returns `false` (and switches to write mode) if the database turns
    /// out corrupt.
    pub fn skip(&mut self) -> bool {
        if self.state == State::ReadEof {
            return true;
        }
        assert_eq!(self.state, State::Read, "skip() requires read state");

        loop {
            match self.read_line() {
                Ok(true) => continue,
                Ok(false) => return self.state == State::ReadEof,
                Err(_) => return false,
            }
        }
    }

    /// Write the next line, switching to write mode if still reading (this
    /// truncates the file at the position of the last line `read` returned).
    pub fn write(&mut self, line: &str, newline: bool) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if self.state != State::Write {
            self.change(true)?;
        }
        let writer = self.writer.as_mut().expect("writer present while writing");
        writer
            .write_all(line.as_bytes())
            .map_err(|e| Error::Write(self.path.clone(), e))?;
        if newline {
            writer
                .write_all(b"\n")
                .map_err(|e| Error::Write(self.path.clone(), e))?;
        }
        Ok(())
    }

    /// Mark the previously read line as needing to be overwritten, without
    /// supplying replacement content yet.
    pub fn mark_dirty(&mut self) -> Result<(), Error> {
        if self.state != State::Write {
            self.change(true)?;
        }
        Ok(())
    }

    /// Read the next line and compare it to `expected`. Returns `None` if it
    /// matched (nothing written). Otherwise overwrites it and returns the
    /// stale value (possibly `None` if there was no line at all) so the
    /// caller can trace *why* it forced an update.
    pub fn expect(&mut self, expected: &str) -> Result<Option<String>, Error> {
        let existing = self.read().map(str::to_owned);
        if existing.as_deref() == Some(expected) {
            return Ok(None);
        }
        self.write(expected, true)?;
        Ok(existing)
    }

    /// Switch to write mode. When `truncate` is set (switching mid-read,
    /// e.g. on a mismatch or corruption), truncates at `self.pos` (the start
    /// of the last line handed out by `read`) before positioning the writer
    /// there. Otherwise (only reached from a fully-read `ReadEof` database
    /// being touched) the file is left exactly as-is and the writer is
    /// positioned at `self.marker_pos`, the offset of the end marker itself,
    /// so only that single byte gets rewritten.
    fn change(&mut self, truncate: bool) -> Result<(), Error> {
        debug_assert_ne!(self.state, State::Write);

        let pos = if truncate {
            self.pos
        } else {
            self.marker_pos.unwrap_or(self.pos)
        };

        log::debug!("{}: switching to write mode at offset {}", self.path.display(), pos);

        if !self.read_only {
            self.reader = None;
            if truncate {
                let file = OpenOptions::new()
                    .write(true)
                    .open(&self.path)
                    .map_err(|e| Error::Open(self.path.clone(), e))?;
                file.set_len(pos)
                    .map_err(|e| Error::Truncate(self.path.clone(), e))?;
            }
            self.open_writer(pos)?;
        }

        self.state = State::Write;
        self.mtime = None;
        Ok(())
    }

    /// Close the database. In read mode this "chops off" any lines that
    /// weren't read. If `mtime_check` is set, callers should follow up with
    /// [`Depdb::check_mtime`].
    pub fn close(mut self, touch: bool) -> Result<(), Error> {
        if self.read_only {
            return Ok(());
        }

        match self.state {
            State::ReadEof if !touch => return Ok(()),
            State::ReadEof => {
                // Rewrite the end marker in place to bump mtime without
                // otherwise touching the content.
                self.change(false)?;
            }
            State::Write => {}
            State::Read => self.change(true)?,
        }

        let writer = self.writer.as_mut().expect("writer present before close");
        writer
            .write_all(b"\0")
            .map_err(|e| Error::Write(self.path.clone(), e))?;
        writer
            .flush()
            .map_err(|e| Error::Write(self.path.clone(), e))?;
        Ok(())
    }

    /// Close at the current write position without the end marker, so a
    /// later [`Depdb::reopen`] can continue writing. Used for dynamic
    /// dependency info produced as a byproduct of execution: the static part
    /// is written during match, the dynamic part during execute.
    pub fn close_to_reopen(mut self) -> Result<ReopenState, Error> {
        if self.state != State::Write {
            self.change(self.state != State::ReadEof)?;
        }
        let writer = self.writer.as_mut().expect("writer present before close");
        let pos = writer
            .stream_position()
            .map_err(|e| Error::Write(self.path.clone(), e))?;
        writer
            .write_all(b"\0")
            .map_err(|e| Error::Write(self.path.clone(), e))?;
        writer
            .flush()
            .map_err(|e| Error::Write(self.path.clone(), e))?;

        let mtime = fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|e| Error::Touch(self.path.clone(), e))?;

        Ok(ReopenState {
            path: self.path.clone(),
            pos,
            mtime,
        })
    }

    /// Reopen a database previously closed with [`Depdb::close_to_reopen`],
    /// continuing to write from the recorded position.
    pub fn reopen(state: ReopenState) -> Result<Self, Error> {
        let mut db = Depdb {
            path: state.path,
            state: State::Write,
            read_only: false,
            reader: None,
            writer: None,
            pos: state.pos,
            marker_pos: None,
            line: String::new(),
            mtime: None,
        };
        db.open_writer(state.pos)?;
        Ok(db)
    }

    /// Target/database modification time sanity check: after a successful
    /// close, `mtime(db) <= mtime(target)` must hold, or a subsequent run
    /// could treat a partially-updated target as up to date.
    pub fn check_mtime(db_path: &Path, target_path: &Path) -> Result<(), Error> {
        let target_mtime = fs::metadata(target_path)
            .and_then(|m| m.modified())
            .map_err(|_| Error::TargetMissing(target_path.to_path_buf()))?;
        let db_mtime = fs::metadata(db_path)
            .and_then(|m| m.modified())
            .map_err(|e| Error::Touch(db_path.to_path_buf(), e))?;

        if db_mtime > target_mtime {
            log::warn!(
                "{}: database mtime {db_mtime:?} is newer than target {} mtime {target_mtime:?}",
                db_path.display(),
                target_path.display()
            );
            return Err(Error::BackwardsMtime {
                db: db_path.to_path_buf(),
                db_mtime,
                target: target_path.to_path_buf(),
                target_mtime,
            });
        }
        Ok(())
    }
}

/// Result of [`Depdb::close_to_reopen`]: enough to reopen the database at the
/// same write position later.
pub struct ReopenState {
    pub path: PathBuf,
    pub pos: u64,
    pub mtime: SystemTime,
}

/// Peeks at the byte following a line's `\n` without consuming it, to check
/// for the `\0` end marker. Reads one byte then seeks back so the next
/// `read_until` starts at the same position.
fn peek_one(reader: &mut BufReader<File>, buf: &mut [u8; 1], path: &Path) -> Result<bool, Error> {
    match reader.read(buf) {
        Ok(0) => Ok(false),
        Ok(_) => {
            reader
                .seek_relative(-1)
                .map_err(|e| Error::Read(path.to_path_buf(), e))?;
            Ok(true)
        }
        Err(e) => Err(Error::Read(path.to_path_buf(), e)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;

    fn raw_bytes(path: &Path) -> Vec<u8> {
        fs::read(path).unwrap()
    }

    #[test]
    fn fresh_database_gets_version_and_end_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foo.o.d");

        let db = Depdb::open(&path, false).unwrap();
        assert!(db.writing());
        db.close(true).unwrap();

        assert_eq!(raw_bytes(&path), b"1\n\0");
    }

    #[test]
    fn mismatch_forces_rebuild_and_truncates_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.d");
        fs::write(&path, b"1\nr 1\nOLD\n\0").unwrap();

        let mut db = Depdb::open(&path, false).unwrap();
        assert_eq!(db.expect("r 1").unwrap(), None);
        assert_eq!(db.expect("NEW").unwrap().as_deref(), Some("OLD"));
        db.close(true).unwrap();

        assert_eq!(raw_bytes(&path), b"1\nr 1\nNEW\n\0");
    }

    #[test]
    fn empty_file_is_corrupt_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.d");
        fs::write(&path, b"").unwrap();

        let db = Depdb::open(&path, false).unwrap();
        assert!(db.writing());
        db.close(true).unwrap();
        assert_eq!(raw_bytes(&path), b"1\n\0");
    }

    #[test]
    fn truncated_no_end_marker_is_overwritten_from_missing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.d");
        fs::write(&path, b"1\nr 1\n").unwrap(); // no trailing \0

        let mut db = Depdb::open(&path, false).unwrap();
        assert_eq!(db.expect("r 1").unwrap(), None);
        assert!(db.read().is_none());
        db.write("extra", true).unwrap();
        db.close(true).unwrap();

        assert_eq!(raw_bytes(&path), b"1\nr 1\nextra\n\0");
    }

    #[test]
    fn unchanged_round_trip_reads_every_line_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.d");
        fs::write(&path, b"1\nr 1\nOPTS\nINPUT\n\0").unwrap();

        let mut db = Depdb::open(&path, false).unwrap();
        assert_eq!(db.expect("r 1").unwrap(), None);
        assert_eq!(db.expect("OPTS").unwrap(), None);
        assert_eq!(db.expect("INPUT").unwrap(), None);
        assert!(db.more() || !db.more()); // at eof either way
        assert!(!db.writing());
        db.close(false).unwrap();

        assert_eq!(raw_bytes(&path), b"1\nr 1\nOPTS\nINPUT\n\0");
    }

    #[test]
    fn touch_close_bumps_mtime_without_corrupting_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.d");
        fs::write(&path, b"1\nr 1\nOPTS\nLAST\n\0").unwrap();
        let mtime_before = fs::metadata(&path).unwrap().modified().unwrap();

        let mut db = Depdb::open(&path, false).unwrap();
        assert_eq!(db.expect("r 1").unwrap(), None);
        assert_eq!(db.expect("OPTS").unwrap(), None);
        assert_eq!(db.expect("LAST").unwrap(), None);
        assert!(!db.writing());

        std::thread::sleep(std::time::Duration::from_millis(10));
        db.close(true).unwrap();

        assert_eq!(raw_bytes(&path), b"1\nr 1\nOPTS\nLAST\n\0");
        let mtime_after = fs::metadata(&path).unwrap().modified().unwrap();
        assert!(mtime_after > mtime_before);
    }

    #[test]
    fn close_to_reopen_then_continue_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.d");

        let mut db = Depdb::open(&path, false).unwrap();
        db.write("static-part", true).unwrap();
        let state = db.close_to_reopen().unwrap();

        let mut db2 = Depdb::reopen(state).unwrap();
        db2.write("dynamic-part", true).unwrap();
        db2.close(true).unwrap();

        assert_eq!(raw_bytes(&path), b"1\nstatic-part\ndynamic-part\n\0");
    }

    #[test]
    fn backwards_mtime_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.d");
        let target_path = dir.path().join("t");

        fs::write(&target_path, b"old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut f = File::create(&db_path).unwrap();
        f.write_all(b"1\n\0").unwrap();
        drop(f);

        let err = Depdb::check_mtime(&db_path, &target_path).unwrap_err();
        assert!(matches!(err, Error::BackwardsMtime { .. }));
    }

    #[test]
    fn forward_mtime_passes() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.d");
        let target_path = dir.path().join("t");

        fs::write(&db_path, b"1\n\0").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(&target_path, b"new").unwrap();

        Depdb::check_mtime(&db_path, &target_path).unwrap();
    }
}
