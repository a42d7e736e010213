//! Open-mode string interpretation
//!
//! Mode tokens follow the familiar `fopen`-style grammar: one primary marker
//! (`r` read, `w` write-truncate, `a` append, `x` exclusive-create), an
//! optional `+` for read-and-write update, and an optional content marker
//! (`b` binary or `t` text). Characters may appear in any order, so `"rb"`,
//! `"br"`, `"r+b"`, and `"rb+"` are all accepted spellings.

use std::str::FromStr;

use crate::error::{Error, Result};

/// Behavior flags derived from an open-mode token
///
/// `is_text()` and `binary` are always opposites; the remaining flags
/// describe how a session treats a present or missing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    /// Stream is readable
    pub read: bool,
    /// Stream is writable
    pub write: bool,
    /// Writes always land at the end of the file
    pub append: bool,
    /// Existing content is discarded on open
    pub truncate: bool,
    /// A missing target is created
    pub create: bool,
    /// A missing target is an error
    pub must_exist: bool,
    /// Content is raw bytes; text options are rejected
    pub binary: bool,
    /// An existing target is an error
    pub exclusive: bool,
}

/// All flags off; primary markers build on top of this.
const NONE: OpenMode = OpenMode {
    read: false,
    write: false,
    append: false,
    truncate: false,
    create: false,
    must_exist: false,
    binary: false,
    exclusive: false,
};

impl OpenMode {
    /// Parse a mode token such as `"r"`, `"w+"`, `"ab"`, or `"x+"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMode`] for an empty token, an unknown or
    /// repeated character, more than one primary marker, or a `b`/`t` mix
    /// (e.g. `"rtb"`).
    pub fn parse(mode: &str) -> Result<OpenMode> {
        let invalid = |reason: &str| Error::InvalidMode {
            mode: mode.to_string(),
            reason: reason.to_string(),
        };

        let mut primary: Option<char> = None;
        let mut update = false;
        let mut binary = false;
        let mut text = false;
        for ch in mode.chars() {
            match ch {
                'r' | 'w' | 'a' | 'x' => {
                    if primary.replace(ch).is_some() {
                        return Err(invalid("more than one of r/w/a/x"));
                    }
                }
                '+' => {
                    if update {
                        return Err(invalid("repeated +"));
                    }
                    update = true;
                }
                'b' => {
                    if binary {
                        return Err(invalid("repeated b"));
                    }
                    binary = true;
                }
                't' => {
                    if text {
                        return Err(invalid("repeated t"));
                    }
                    text = true;
                }
                _ => return Err(invalid("unrecognized character")),
            }
        }
        if binary && text {
            return Err(invalid("b and t are mutually exclusive"));
        }

        let parsed = match primary {
            Some('r') => OpenMode {
                read: true,
                write: update,
                must_exist: true,
                ..NONE
            },
            Some('w') => OpenMode {
                read: update,
                write: true,
                truncate: true,
                create: true,
                ..NONE
            },
            Some('a') => OpenMode {
                read: update,
                write: true,
                append: true,
                create: true,
                ..NONE
            },
            Some('x') => OpenMode {
                read: update,
                write: true,
                create: true,
                exclusive: true,
                ..NONE
            },
            _ => return Err(invalid("missing r/w/a/x marker")),
        };
        Ok(OpenMode { binary, ..parsed })
    }

    /// True when the token selected text content (no `b` marker)
    pub fn is_text(&self) -> bool {
        !self.binary
    }

    /// True when a session must copy the target's existing bytes into the
    /// staging file before the caller writes (append, or update-in-place).
    pub(crate) fn seeds_from_target(&self) -> bool {
        self.append || (self.read && self.write && !self.truncate && !self.exclusive)
    }
}

impl FromStr for OpenMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<OpenMode> {
        OpenMode::parse(s)
    }
}
