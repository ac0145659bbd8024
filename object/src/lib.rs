mod value;
mod objects;
mod special;
pub mod lookup;

pub use value::{DataType, ObjectId, PropId, Value, PORTABLE_SIZE};
pub use objects::{
    Body, MetaclassId, Object, PropTable, TadsObject, Visitable, Visitor,
};
pub use lookup::{LookupResult, ObjectSource};
pub use special::SpecialObjects;
