use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A project-relative source position: `(path, line, column)`.
///
/// Cheap to pass around (the path is reference counted) and cheap to copy
/// into a location-less context via [`Location::unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    file: Option<Arc<PathBuf>>,
    line: u32,
    column: u32,
}

impl Location {
    pub fn new(file: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        Self {
            file: Some(Arc::new(file.into())),
            line,
            column,
        }
    }

    pub const fn unknown() -> Self {
        Self {
            file: None,
            line: 0,
            column: 0,
        }
    }

    pub fn is_known(&self) -> bool {
        self.file.is_some()
    }

    pub fn file(&self) -> Option<&PathBuf> {
        self.file.as_deref()
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(path) if self.line > 0 => {
                write!(f, "{}:{}:{}", path.display(), self.line, self.column)
            }
            Some(path) => write!(f, "{}", path.display()),
            None => Ok(()),
        }
    }
}
