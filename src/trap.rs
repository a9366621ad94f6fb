// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::error::Error;
use std::fmt::{Display, Formatter};

/// A host-defined tag distinguishing user exceptions from one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag(pub u32);

/// Why an execution trapped: one of the builtin reasons the numeric core can
/// raise, a free-form message from a host function, or a user exception with
/// a tag and opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TrapKind {
    IntegerDivideByZero,
    IntegerOverflow,
    InvalidConversionToInteger,
    Message(String),
    User { tag: Tag, payload: Vec<u8> },
}

/// A trap abandons every activation between its raise point and the host
/// boundary. While it propagates, each unwound activation appends its
/// (function index, program counter) for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Trap {
    kind: TrapKind,
    frames: Vec<(u32, usize)>,
}

impl Trap {
    pub fn new(kind: TrapKind) -> Self {
        Trap {
            kind,
            frames: vec![],
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Trap::new(TrapKind::Message(message.into()))
    }

    pub fn user(tag: Tag, payload: Vec<u8>) -> Self {
        Trap::new(TrapKind::User { tag, payload })
    }

    pub fn kind(&self) -> &TrapKind {
        &self.kind
    }

    pub fn is_user(&self) -> bool {
        matches!(self.kind, TrapKind::User { .. })
    }

    /// The unwound (function index, pc) pairs, innermost activation first.
    pub fn frames(&self) -> &[(u32, usize)] {
        &self.frames
    }

    pub(crate) fn with_frame(mut self, function: u32, pc: usize) -> Self {
        self.frames.push((function, pc));
        self
    }
}

impl Display for Trap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TrapKind::IntegerDivideByZero => write!(f, "integer divide by zero"),
            TrapKind::IntegerOverflow => write!(f, "integer overflow"),
            TrapKind::InvalidConversionToInteger => write!(f, "invalid conversion to integer"),
            TrapKind::Message(message) => write!(f, "{message}"),
            TrapKind::User { tag, payload } => {
                write!(f, "user exception (tag {}, {} bytes)", tag.0, payload.len())
            }
        }
    }
}

impl Error for Trap {}

impl From<TrapKind> for Trap {
    fn from(kind: TrapKind) -> Self {
        Trap::new(kind)
    }
}
