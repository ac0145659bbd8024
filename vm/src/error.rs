//! Error codes, message templates and the interpreter's fault channel.

use std::fmt;

use ahash::AHashMap;
use bytecode::DecodeError;
use heap::HeapError;
use object::Value;

/// Broad category of an error. Decides whether a running program can
/// catch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed or incompatible image input.
    Image,
    /// Memory, id namespace or page I/O exhaustion.
    Resource,
    /// Ordinary runtime errors, raised as exceptions.
    Program,
    /// Saved-state problems, raised as exceptions.
    SaveRestore,
    /// Broken VM invariants.
    Internal,
}

impl ErrorClass {
    /// Fatal errors terminate the run and are never seen by handlers.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorClass::Image | ErrorClass::Resource | ErrorClass::Internal
        )
    }
}

/// Stable numeric error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // ── Image ──
    BadSignature = 101,
    UnsupportedVersion = 102,
    ImageTruncated = 103,
    UnknownMandatoryBlock = 104,
    DuplicateBlock = 105,
    BlockOrder = 106,
    DataAfterEof = 107,
    NoMetaclassTable = 108,
    NoFunctionSetTable = 109,
    NoEntrypoint = 110,
    NoCodePool = 111,
    NoPoolPages = 112,
    NoObjects = 113,
    BadMetaclassIndex = 114,
    UnknownMetaclass = 115,
    UnknownFunctionSet = 116,
    VersionTooOld = 117,
    BadPoolPage = 118,
    BadObjectData = 119,
    DuplicateObject = 120,
    BadSuperclass = 121,
    MaskedImageNotSupported = 122,
    BadBlockData = 123,
    BadBytecode = 124,
    PoolOutOfRange = 125,

    // ── Resource ──
    OutOfMemory = 201,
    PageIo = 202,

    // ── Program ──
    StackOverflow = 1001,
    WrongArgCount = 1002,
    UndefinedProperty = 1003,
    BadType = 1004,
    DivideByZero = 1005,
    NumericOverflow = 1006,
    IndexOutOfRange = 1007,
    InvalidComparison = 1008,
    FunctionNotAvailable = 1009,
    InvalidObject = 1010,
    BadArgument = 1011,
    UnhandledException = 1012,
    NoSuchFunction = 1013,
    Interrupted = 1014,

    // ── Save/restore ──
    NotSavedState = 1101,
    IncompatibleSavedState = 1102,
    WrongSavedState = 1103,
    CorruptSavedState = 1104,
    SaveFileIo = 1105,

    // ── Internal ──
    StackUnderflow = 9001,
    Internal = 9002,
}

struct ErrorInfo {
    code: ErrorCode,
    name: &'static str,
    template: &'static str,
}

const fn info(code: ErrorCode, name: &'static str, template: &'static str) -> ErrorInfo {
    ErrorInfo { code, name, template }
}

/// Default English templates. `%1`, `%2`, ... are replaced by the error's
/// arguments.
static ERROR_TABLE: &[ErrorInfo] = &[
    info(ErrorCode::BadSignature, "bad-signature", "not an image file (bad signature)"),
    info(ErrorCode::UnsupportedVersion, "unsupported-version", "image format version %1 is not supported"),
    info(ErrorCode::ImageTruncated, "image-truncated", "image file is truncated"),
    info(ErrorCode::UnknownMandatoryBlock, "unknown-block", "unknown mandatory block \"%1\""),
    info(ErrorCode::DuplicateBlock, "duplicate-block", "block \"%1\" appears more than once"),
    info(ErrorCode::BlockOrder, "block-order", "block \"%1\" is out of order: %2"),
    info(ErrorCode::DataAfterEof, "data-after-eof", "data found after the EOF block"),
    info(ErrorCode::NoMetaclassTable, "no-metaclass-table", "image has no metaclass dependency table"),
    info(ErrorCode::NoFunctionSetTable, "no-function-set-table", "image has no function set dependency table"),
    info(ErrorCode::NoEntrypoint, "no-entrypoint", "image has no entrypoint"),
    info(ErrorCode::NoCodePool, "no-code-pool", "image has no code pool"),
    info(ErrorCode::NoPoolPages, "no-pool-pages", "pool %1 has no pages"),
    info(ErrorCode::NoObjects, "no-objects", "image defines no objects"),
    info(ErrorCode::BadMetaclassIndex, "bad-metaclass-index", "object block refers to metaclass index %1, which is not in the dependency table"),
    info(ErrorCode::UnknownMetaclass, "unknown-metaclass", "metaclass \"%1\" is not available"),
    info(ErrorCode::UnknownFunctionSet, "unknown-function-set", "function set \"%1\" is not available"),
    info(ErrorCode::VersionTooOld, "version-too-old", "%1 version %2 required, but only %3 is available"),
    info(ErrorCode::BadPoolPage, "bad-pool-page", "invalid page %2 for pool %1: %3"),
    info(ErrorCode::BadObjectData, "bad-object-data", "invalid data for object %1: %2"),
    info(ErrorCode::DuplicateObject, "duplicate-object", "object %1 is defined more than once"),
    info(ErrorCode::BadSuperclass, "bad-superclass", "object %1 names undefined superclass %2"),
    info(ErrorCode::MaskedImageNotSupported, "masked-image", "masked images cannot be loaded in paged mode"),
    info(ErrorCode::BadBlockData, "bad-block-data", "invalid \"%1\" block: %2"),
    info(ErrorCode::BadBytecode, "bad-bytecode", "invalid bytecode: %1"),
    info(ErrorCode::PoolOutOfRange, "pool-out-of-range", "offset %2 is outside pool %1"),
    info(ErrorCode::OutOfMemory, "out-of-memory", "out of memory: %1"),
    info(ErrorCode::PageIo, "page-io", "error reading pool page: %1"),
    info(ErrorCode::StackOverflow, "stack-overflow", "stack overflow"),
    info(ErrorCode::WrongArgCount, "wrong-arg-count", "wrong number of arguments"),
    info(ErrorCode::UndefinedProperty, "undefined-property", "property %1 is not defined"),
    info(ErrorCode::BadType, "bad-type", "%1 value required"),
    info(ErrorCode::DivideByZero, "divide-by-zero", "division by zero"),
    info(ErrorCode::NumericOverflow, "numeric-overflow", "numeric overflow"),
    info(ErrorCode::IndexOutOfRange, "index-out-of-range", "index %1 out of range"),
    info(ErrorCode::InvalidComparison, "invalid-comparison", "values cannot be compared"),
    info(ErrorCode::FunctionNotAvailable, "function-not-available", "function %2 of set \"%1\" is not available"),
    info(ErrorCode::InvalidObject, "invalid-object", "invalid object reference %1"),
    info(ErrorCode::BadArgument, "bad-argument", "invalid argument: %1"),
    info(ErrorCode::UnhandledException, "unhandled-exception", "unhandled exception: %1"),
    info(ErrorCode::NoSuchFunction, "no-such-function", "no exported function \"%1\""),
    info(ErrorCode::Interrupted, "interrupted", "execution interrupted by %1"),
    info(ErrorCode::NotSavedState, "not-saved-state", "not a saved state file"),
    info(ErrorCode::IncompatibleSavedState, "incompatible-saved-state", "saved state is incompatible: %1"),
    info(ErrorCode::WrongSavedState, "wrong-saved-state", "saved state belongs to a different image"),
    info(ErrorCode::CorruptSavedState, "corrupt-saved-state", "saved state is corrupted: %1"),
    info(ErrorCode::SaveFileIo, "save-file-io", "cannot access saved state file: %1"),
    info(ErrorCode::StackUnderflow, "stack-underflow", "operand stack underflow"),
    info(ErrorCode::Internal, "internal", "internal error: %1"),
];

impl ErrorCode {
    pub fn number(self) -> u16 {
        self as u16
    }

    pub fn class(self) -> ErrorClass {
        match self.number() {
            100..=199 => ErrorClass::Image,
            200..=299 => ErrorClass::Resource,
            1000..=1099 => ErrorClass::Program,
            1100..=1199 => ErrorClass::SaveRestore,
            _ => ErrorClass::Internal,
        }
    }

    pub fn is_fatal(self) -> bool {
        self.class().is_fatal()
    }

    fn info(self) -> Option<&'static ErrorInfo> {
        ERROR_TABLE.iter().find(|i| i.code == self)
    }

    /// Short identifier, e.g. `no-entrypoint`.
    pub fn name(self) -> &'static str {
        self.info().map_or("unknown", |i| i.name)
    }

    pub fn template(self) -> &'static str {
        self.info().map_or("error", |i| i.template)
    }

    pub fn from_number(n: u16) -> Option<Self> {
        ERROR_TABLE.iter().find(|i| i.code.number() == n).map(|i| i.code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Substitute `%1`..`%9` in `template`. Missing arguments expand to
/// nothing and `%%` is a literal percent sign.
pub fn format_template(template: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(d @ '1'..='9') => {
                chars.next();
                let idx = d as usize - '1' as usize;
                if let Some(arg) = args.get(idx) {
                    out.push_str(arg);
                }
            }
            _ => out.push('%'),
        }
    }
    out
}

fn render(code: &ErrorCode, args: &[String]) -> String {
    format_template(code.template(), args)
}

/// An error code with its format arguments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {}", render(.code, .args))]
pub struct VmError {
    pub code: ErrorCode,
    pub args: Vec<String>,
}

pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            args: Vec::new(),
        }
    }

    /// Append a format argument.
    pub fn arg(mut self, arg: impl fmt::Display) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }

    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }

    /// The message without the code prefix.
    pub fn message(&self) -> String {
        render(&self.code, &self.args)
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Internal).arg(msg)
    }

    pub fn bad_type(expected: &str) -> Self {
        Self::new(ErrorCode::BadType).arg(expected)
    }
}

impl From<HeapError> for VmError {
    fn from(e: HeapError) -> Self {
        match e {
            HeapError::OutOfMemory { limit } => {
                VmError::new(ErrorCode::OutOfMemory).arg(format!("all {limit} object ids in use"))
            }
            HeapError::InvalidObject(id) => {
                VmError::new(ErrorCode::InvalidObject).arg(format!("{id:?}"))
            }
            HeapError::DuplicateObject(id) => VmError::new(ErrorCode::DuplicateObject).arg(id),
            HeapError::WrongKind { expected, .. } => VmError::bad_type(expected),
            HeapError::IndexOutOfRange { index, .. } => {
                VmError::new(ErrorCode::IndexOutOfRange).arg(index + 1)
            }
        }
    }
}

impl From<DecodeError> for VmError {
    fn from(e: DecodeError) -> Self {
        VmError::new(ErrorCode::BadBytecode).arg(e)
    }
}

// ── Localised messages ────────────────────────────────────────────────

/// Host-supplied message templates replacing the built-in ones.
#[derive(Debug, Clone, Default)]
pub struct ErrorMessages {
    overrides: AHashMap<ErrorCode, String>,
}

impl ErrorMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, code: ErrorCode, template: impl Into<String>) {
        self.overrides.insert(code, template.into());
    }

    /// Load overrides from `number=template` lines. Blank lines and lines
    /// starting with `#` are ignored, as are unknown codes.
    pub fn parse(text: &str) -> Self {
        let mut messages = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((num, template)) = line.split_once('=') else {
                continue;
            };
            if let Some(code) = num.trim().parse().ok().and_then(ErrorCode::from_number) {
                messages.set(code, template.trim());
            }
        }
        messages
    }

    /// The message text alone, as stored in exception objects.
    pub fn message(&self, err: &VmError) -> String {
        let template = self
            .overrides
            .get(&err.code)
            .map_or(err.code.template(), String::as_str);
        format_template(template, &err.args)
    }

    pub fn format(&self, err: &VmError) -> String {
        format!("[{}] {}", err.code, self.message(err))
    }
}

// ── Interpreter fault channel ─────────────────────────────────────────

/// Why an instruction did not complete normally.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// A VM-detected error. Fatal classes end the run; the rest are turned
    /// into exception objects.
    Error(VmError),
    /// An exception object in flight. The fault owns one count on it.
    Thrown(Value),
}

impl From<VmError> for Fault {
    fn from(e: VmError) -> Self {
        Fault::Error(e)
    }
}

impl From<HeapError> for Fault {
    fn from(e: HeapError) -> Self {
        Fault::Error(e.into())
    }
}

impl From<ErrorCode> for Fault {
    fn from(code: ErrorCode) -> Self {
        Fault::Error(VmError::new(code))
    }
}

impl From<ErrorCode> for VmError {
    fn from(code: ErrorCode) -> Self {
        VmError::new(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_has_a_table_entry() {
        for entry in ERROR_TABLE {
            assert_eq!(ErrorCode::from_number(entry.code.number()), Some(entry.code));
            assert_ne!(entry.code.name(), "unknown");
        }
    }

    #[test]
    fn classes_follow_number_ranges() {
        assert_eq!(ErrorCode::NoEntrypoint.class(), ErrorClass::Image);
        assert_eq!(ErrorCode::OutOfMemory.class(), ErrorClass::Resource);
        assert_eq!(ErrorCode::DivideByZero.class(), ErrorClass::Program);
        assert_eq!(ErrorCode::WrongSavedState.class(), ErrorClass::SaveRestore);
        assert_eq!(ErrorCode::Internal.class(), ErrorClass::Internal);
        assert!(ErrorCode::BadMetaclassIndex.is_fatal());
        assert!(!ErrorCode::UndefinedProperty.is_fatal());
        assert!(!ErrorCode::CorruptSavedState.is_fatal());
    }

    #[test]
    fn templates_substitute_positional_args() {
        let args = vec!["list".to_string(), "030009".to_string(), "030008".to_string()];
        assert_eq!(
            format_template("%1 version %2 required, but only %3 is available", &args),
            "list version 030009 required, but only 030008 is available"
        );
        assert_eq!(format_template("100%% of %4", &args), "100% of ");
    }

    #[test]
    fn display_includes_code() {
        let err = VmError::new(ErrorCode::BadMetaclassIndex).arg(7);
        assert_eq!(
            err.to_string(),
            "[114] object block refers to metaclass index 7, which is not in the dependency table"
        );
    }

    #[test]
    fn overrides_replace_templates() {
        let messages = ErrorMessages::parse("# localised\n1005 = Division durch Null\nbogus\n77=x\n");
        assert_eq!(
            messages.format(&VmError::new(ErrorCode::DivideByZero)),
            "[1005] Division durch Null"
        );
        assert_eq!(
            messages.format(&VmError::new(ErrorCode::StackOverflow)),
            "[1001] stack overflow"
        );
    }
}
