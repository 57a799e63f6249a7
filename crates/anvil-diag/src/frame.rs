use std::cell::RefCell;

use crate::location::Location;

/// One entry of the per-thread diagnostic frame stack: describes the call
/// site that is "in progress" for as long as the frame is alive. Any record
/// emitted while a frame is live gets the frame's description appended as an
/// extra `info` line, the way a stack trace would.
struct Frame {
    describe: String,
    location: Location,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// RAII handle for a pushed frame. Popped on drop regardless of unwinding
/// path, including the `?`-propagated [`crate::BuildFailure`] path.
#[must_use = "the frame is popped when this guard is dropped"]
pub struct FrameGuard {
    _private: (),
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|f| {
            f.borrow_mut().pop();
        });
    }
}

/// Push a new diagnostic frame describing the operation about to be
/// attempted. Returns a guard that pops it again on drop.
///
/// ```ignore
/// let _f = push_frame("while loading buildfile", loc);
/// load_buildfile(path)?;
/// ```
pub fn push_frame(describe: impl Into<String>, location: Location) -> FrameGuard {
    FRAMES.with(|f| {
        f.borrow_mut().push(Frame {
            describe: describe.into(),
            location,
        });
    });
    FrameGuard { _private: () }
}

/// Render the current frame stack, innermost first, as `info` trail lines.
pub(crate) fn trail() -> Vec<(String, Location)> {
    FRAMES.with(|f| {
        f.borrow()
            .iter()
            .rev()
            .map(|frame| (frame.describe.clone(), frame.location.clone()))
            .collect()
    })
}

pub(crate) fn depth() -> usize {
    FRAMES.with(|f| f.borrow().len())
}
