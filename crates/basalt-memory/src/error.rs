//! Tagged error codes, runtime allocation errors, and the invariant hook.
//!
//! Failures are split into two disjoint classes:
//!
//! - **Runtime errors** ([`AllocError`]): environmental failures the caller
//!   can recover from: the OS refused a mapping, a protection change
//!   failed, the checkpoint stack is full. Every operation that can hit one
//!   returns [`AllocResult`], and state is only mutated after the fallible
//!   step succeeds.
//! - **Invariant violations**: programmer errors. Zero sizes, alignments
//!   that are not a power of two, unwinding an empty checkpoint stack.
//!   These never return; they abort the process through [`abort_invariant`]
//!   with a diagnostic naming the failing expression, source location, and
//!   tagged code.
//!
//! Both classes share a 16-bit raw code, packed `[domain:4 | code:8 |
//! severity:4]`, so external tooling can classify a failure without parsing
//! message text.

use core::fmt;
use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Result type for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;

// ============================================================================
// Raw 16-bit code taxonomy
// ============================================================================

/// Failure domain, stored in the top 4 bits of a [`RawCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Domain {
    /// No domain (success).
    None = 0,
    /// Memory mapping, commitment, and release.
    Memory = 1,
    /// Allocator state machines.
    State = 2,
    /// Caller-supplied values.
    Value = 3,
}

/// Failure severity, stored in the low 4 bits of a [`RawCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Severity {
    /// The operation succeeded.
    Success = 0,
    /// Advisory only.
    Warning = 1,
    /// Recoverable runtime failure, surfaced as an [`AllocError`].
    Failure = 2,
    /// Invariant violation; never returned, always aborts.
    Fatal = 3,
}

const DOMAIN_MASK: u16 = 0x0F;
const SEVERITY_MASK: u16 = 0x0F;
const CODE_MASK: u16 = 0xFF;
const DOMAIN_SHIFT: u16 = 12;
const CODE_SHIFT: u16 = 4;

/// Packed `[domain:4 | code:8 | severity:4]` error tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawCode(
    /// The packed bits.
    pub u16,
);

impl RawCode {
    /// Packs a domain, severity, and per-domain code into one tag.
    pub const fn new(domain: Domain, severity: Severity, code: u8) -> Self {
        RawCode(
            ((domain as u16) << DOMAIN_SHIFT)
                | ((code as u16) << CODE_SHIFT)
                | severity as u16,
        )
    }

    /// The failure domain stored in the top 4 bits.
    pub const fn domain(self) -> Domain {
        match (self.0 >> DOMAIN_SHIFT) & DOMAIN_MASK {
            1 => Domain::Memory,
            2 => Domain::State,
            3 => Domain::Value,
            _ => Domain::None,
        }
    }

    /// The severity stored in the low 4 bits.
    pub const fn severity(self) -> Severity {
        match self.0 & SEVERITY_MASK {
            1 => Severity::Warning,
            2 => Severity::Failure,
            3 => Severity::Fatal,
            _ => Severity::Success,
        }
    }

    /// The per-domain code stored in the middle 8 bits.
    pub const fn code(self) -> u8 {
        ((self.0 >> CODE_SHIFT) & CODE_MASK) as u8
    }

    /// Static message for this code, or a severity-keyed fallback for codes
    /// outside the descriptor table.
    pub fn message(self) -> &'static str {
        if let Some(descriptor) = DESCRIPTORS.iter().find(|d| d.value == self) {
            return descriptor.message;
        }
        match self.severity() {
            Severity::Fatal => "unknown invariant error",
            Severity::Failure => "unknown runtime error",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for RawCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{:02X}] {}",
            self.domain() as u8,
            self.code(),
            self.message()
        )
    }
}

pub const ERR_SUCCESS: RawCode = RawCode(0);
pub const INV_NULL_POINTER: RawCode = RawCode::new(Domain::Memory, Severity::Fatal, 0x01);
pub const INV_ZERO_SIZE: RawCode = RawCode::new(Domain::Memory, Severity::Fatal, 0x02);
pub const INV_BAD_ALIGNMENT: RawCode = RawCode::new(Domain::Memory, Severity::Fatal, 0x03);
pub const INV_INVALID_STATE: RawCode = RawCode::new(Domain::State, Severity::Fatal, 0x01);
pub const INV_PRECONDITION: RawCode = RawCode::new(Domain::State, Severity::Fatal, 0x02);
pub const INV_OUT_OF_RANGE: RawCode = RawCode::new(Domain::Value, Severity::Fatal, 0x01);
pub const ERR_OUT_OF_MEMORY: RawCode = RawCode::new(Domain::Memory, Severity::Failure, 0x10);
pub const ERR_MEMORY_PERMISSION_CHANGE: RawCode =
    RawCode::new(Domain::Memory, Severity::Failure, 0x20);
pub const ERR_MEMORY_DEALLOCATION: RawCode =
    RawCode::new(Domain::Memory, Severity::Failure, 0x30);
pub const ERR_STACK_OVERFLOW: RawCode = RawCode::new(Domain::Memory, Severity::Failure, 0x40);

struct Descriptor {
    value: RawCode,
    message: &'static str,
}

static DESCRIPTORS: &[Descriptor] = &[
    Descriptor { value: ERR_SUCCESS, message: "success" },
    Descriptor { value: INV_NULL_POINTER, message: "null pointer violation" },
    Descriptor { value: INV_ZERO_SIZE, message: "size must be positive" },
    Descriptor { value: INV_BAD_ALIGNMENT, message: "alignment not a power of two" },
    Descriptor { value: INV_INVALID_STATE, message: "invalid state transition" },
    Descriptor { value: INV_PRECONDITION, message: "precondition violation" },
    Descriptor { value: INV_OUT_OF_RANGE, message: "value out of valid range" },
    Descriptor { value: ERR_OUT_OF_MEMORY, message: "memory allocation failed" },
    Descriptor {
        value: ERR_MEMORY_PERMISSION_CHANGE,
        message: "failed to change page protection",
    },
    Descriptor {
        value: ERR_MEMORY_DEALLOCATION,
        message: "failed to release a memory reservation",
    },
    Descriptor {
        value: ERR_STACK_OVERFLOW,
        message: "checkpoint stack exceeded its maximum depth",
    },
];

// ============================================================================
// Runtime errors
// ============================================================================

/// Recoverable allocation error.
///
/// Each variant maps to a tagged [`RawCode`] with `Failure` severity. The
/// allocator that returned it is left unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The OS refused a mapping, or a commit would exceed the reservation.
    #[error("memory reservation failed: {requested} bytes requested")]
    OutOfMemory {
        /// Bytes requested from the reservation layer.
        requested: usize,
    },

    /// A page-protection change was rejected by the OS.
    #[error("page protection change failed for {len} bytes")]
    PermissionChange {
        /// Length of the range whose protection could not be changed.
        len: usize,
    },

    /// The OS failed to unmap a reservation.
    #[error("failed to unmap a reservation of {len} bytes")]
    Deallocation {
        /// Length of the reservation that could not be released.
        len: usize,
    },

    /// The checkpoint stack is full.
    #[error("checkpoint stack full: depth {depth} reached")]
    StackOverflow {
        /// Depth at which the record was rejected.
        depth: usize,
    },
}

impl AllocError {
    /// The packed 16-bit code for this error.
    pub const fn code(&self) -> RawCode {
        match self {
            AllocError::OutOfMemory { .. } => ERR_OUT_OF_MEMORY,
            AllocError::PermissionChange { .. } => ERR_MEMORY_PERMISSION_CHANGE,
            AllocError::Deallocation { .. } => ERR_MEMORY_DEALLOCATION,
            AllocError::StackOverflow { .. } => ERR_STACK_OVERFLOW,
        }
    }

    /// Whether this is a reservation or commit exhaustion failure.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, AllocError::OutOfMemory { .. })
    }

    /// Whether this is a checkpoint-stack depth failure.
    #[must_use]
    pub const fn is_stack_overflow(&self) -> bool {
        matches!(self, AllocError::StackOverflow { .. })
    }
}

// ============================================================================
// Invariant hook
// ============================================================================

thread_local! {
    static DIAGNOSTIC: Cell<Option<&'static str>> = const { Cell::new(None) };
}

/// Sets a thread-local label included in invariant diagnostics until the
/// returned guard is dropped.
pub fn diagnostic_scope(label: &'static str) -> DiagnosticScope {
    let previous = DIAGNOSTIC.with(|slot| slot.replace(Some(label)));
    DiagnosticScope { previous }
}

/// Restores the previous diagnostic label on drop.
pub struct DiagnosticScope {
    previous: Option<&'static str>,
}

impl Drop for DiagnosticScope {
    fn drop(&mut self) {
        DIAGNOSTIC.with(|slot| slot.set(self.previous));
    }
}

/// Aborts the process with an invariant-violation diagnostic.
///
/// This is the terminal hook behind the `invariant!` macro family. It never
/// returns; there is no recovery path for a violated invariant.
#[cold]
#[inline(never)]
pub fn abort_invariant(
    expr: &str,
    file: &str,
    line: u32,
    code: RawCode,
    details: fmt::Arguments<'_>,
) -> ! {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let label = DIAGNOSTIC.with(|slot| slot.get());

    #[cfg(feature = "logging")]
    tracing::error!(expression = expr, file, line, code = %code, "invariant violation");

    eprintln!("\n*** INVARIANT VIOLATION *** [{timestamp}]");
    eprintln!("Expression: {expr}");
    eprintln!("Location: {file}:{line}");
    eprintln!("Error: {code}");
    if let Some(label) = label {
        eprintln!("Context: {label}");
    }
    if details.as_str() != Some("") {
        eprintln!("Details: {details}");
    }

    std::process::abort();
}

/// Aborts unless `$cond` holds.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $code:expr) => {
        if !$cond {
            $crate::error::abort_invariant(
                stringify!($cond),
                file!(),
                line!(),
                $code,
                format_args!(""),
            );
        }
    };
    ($cond:expr, $code:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::abort_invariant(
                stringify!($cond),
                file!(),
                line!(),
                $code,
                format_args!($($arg)+),
            );
        }
    };
}

/// Aborts unless `$val` is strictly positive.
#[macro_export]
macro_rules! invariant_positive {
    ($val:expr) => {
        $crate::invariant!(
            $val > 0,
            $crate::error::INV_ZERO_SIZE,
            "{} = {}",
            stringify!($val),
            $val
        );
    };
}

/// Aborts unless `$val` lies in `[$min, $max]`.
#[macro_export]
macro_rules! invariant_range {
    ($val:expr, $min:expr, $max:expr) => {
        $crate::invariant!(
            $val >= $min && $val <= $max,
            $crate::error::INV_OUT_OF_RANGE,
            "{} = {} not in [{}, {}]",
            stringify!($val),
            $val,
            $min,
            $max
        );
    };
}
