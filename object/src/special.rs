use crate::{ObjectId, PropId};

/// Well-known objects and properties the VM needs to know about.
///
/// Filled from the image's symbolic export table. Every entry is optional:
/// an image that exports no `RuntimeError` still runs, its VM faults simply
/// surface as plain exception objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialObjects {
    /// Base class for exceptions created by the VM itself.
    pub runtime_error: Option<ObjectId>,

    /// Property that receives the message of a VM-created exception.
    pub exception_message: Option<PropId>,

    /// Property that receives the numeric error code of a VM-created
    /// exception.
    pub errno: Option<PropId>,
}

impl SpecialObjects {
    pub const RUNTIME_ERROR: &'static str = "RuntimeError";
    pub const EXCEPTION_MESSAGE: &'static str = "exceptionMessage";
    pub const ERRNO: &'static str = "errno_";

    pub fn null() -> Self {
        Self::default()
    }
}
