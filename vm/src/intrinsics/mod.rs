//! Intrinsic function sets called by the `Builtin` instruction.
//!
//! The image lists the sets it uses (`FNSD`); `Builtin argc func set`
//! addresses a function by set index and position. An older version of a
//! set exposes only a prefix of its functions.

use object::Value;

use crate::VM;
use crate::dependency::{Version, negotiate, parse_dependency};
use crate::error::{ErrorCode, Fault, VmError, VmResult};

pub mod t3vm;
pub mod tads_gen;
pub mod tads_io;

pub type IntrinsicFn = fn(&mut VM, &[Value]) -> Result<Value, Fault>;

/// Marks an unbounded argument list.
pub const VARARGS: u8 = u8::MAX;

#[derive(Clone, Copy)]
pub struct IntrinsicDesc {
    pub name: &'static str,
    pub min_args: u8,
    pub max_args: u8,
    pub func: IntrinsicFn,
}

impl IntrinsicDesc {
    pub const fn new(name: &'static str, min_args: u8, max_args: u8, func: IntrinsicFn) -> Self {
        Self {
            name,
            min_args,
            max_args,
            func,
        }
    }

    pub fn check_args(&self, argc: usize) -> Result<(), Fault> {
        let max_ok = self.max_args == VARARGS || argc <= self.max_args as usize;
        if argc >= self.min_args as usize && max_ok {
            Ok(())
        } else {
            Err(ErrorCode::WrongArgCount.into())
        }
    }
}

pub struct FunctionSetDesc {
    pub name: &'static str,
    /// Known versions with the number of functions each exposes, ascending.
    pub versions: &'static [(Version, usize)],
    pub functions: &'static [IntrinsicDesc],
}

impl FunctionSetDesc {
    /// Function count visible to an image compiled against `requested`.
    fn exposed(&self, requested: Version) -> usize {
        self.versions
            .iter()
            .take_while(|(v, _)| *v <= requested)
            .last()
            .or(self.versions.first())
            .map_or(0, |&(_, count)| count)
            .min(self.functions.len())
    }
}

pub static BUILTIN_FUNCTION_SETS: &[&FunctionSetDesc] =
    &[&t3vm::FUNCTION_SET, &tads_gen::FUNCTION_SET, &tads_io::FUNCTION_SET];

pub struct LoadedFunctionSet {
    pub desc: &'static FunctionSetDesc,
    pub requested: Version,
    pub selected: Version,
    pub exposed: usize,
}

/// The image's function set dependency table, indexed by set number.
#[derive(Default)]
pub struct FunctionSetTable {
    sets: Vec<LoadedFunctionSet>,
}

impl FunctionSetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dependency(&mut self, dep: &str) -> VmResult<u8> {
        let (name, requested) = parse_dependency(dep, "FNSD")?;
        let desc = BUILTIN_FUNCTION_SETS
            .iter()
            .copied()
            .find(|d| d.name == name)
            .ok_or_else(|| VmError::new(ErrorCode::UnknownFunctionSet).arg(&name))?;
        let available: Vec<Version> = desc.versions.iter().map(|&(v, _)| v).collect();
        let selected = negotiate(&name, requested, &available)?;
        let index = u8::try_from(self.sets.len()).map_err(|_| {
            VmError::new(ErrorCode::BadBlockData)
                .arg("FNSD")
                .arg("more than 256 function sets")
        })?;
        self.sets.push(LoadedFunctionSet {
            desc,
            requested,
            selected,
            exposed: desc.exposed(requested),
        });
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedFunctionSet> {
        self.sets.iter()
    }

    /// Find the function `Builtin _ func set` refers to.
    pub fn resolve(&self, set: u8, func: u16) -> Result<&'static IntrinsicDesc, Fault> {
        let Some(loaded) = self.sets.get(set as usize) else {
            return Err(VmError::new(ErrorCode::FunctionNotAvailable)
                .arg(format!("#{set}"))
                .arg(func)
                .into());
        };
        let desc = loaded.desc;
        if (func as usize) < loaded.exposed {
            Ok(&desc.functions[func as usize])
        } else {
            Err(VmError::new(ErrorCode::FunctionNotAvailable)
                .arg(desc.name)
                .arg(func)
                .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_versions_expose_a_prefix() {
        let mut table = FunctionSetTable::new();
        let old = table.add_dependency("tads-gen/030006").unwrap();
        let new = table.add_dependency("tads-gen/030008").unwrap();
        assert_eq!(table.iter().next().map(|s| s.selected), Some(Version(30008)));

        assert_eq!(table.resolve(old, 9).map(|d| d.name).ok(), Some("sum"));
        let err = table.resolve(old, 10).err();
        assert!(matches!(
            err,
            Some(Fault::Error(VmError { code: ErrorCode::FunctionNotAvailable, .. }))
        ));
        assert_eq!(table.resolve(new, 16).map(|d| d.name).ok(), Some("restoreState"));
        assert!(table.resolve(new, 17).is_err());
        assert!(table.resolve(7, 0).is_err());
    }

    #[test]
    fn t3vm_prefix_and_unknown_sets() {
        let mut table = FunctionSetTable::new();
        let set = table.add_dependency("t3vm/010004").unwrap();
        assert!(table.resolve(set, 3).is_ok());
        assert!(table.resolve(set, 4).is_err());

        let err = table.add_dependency("tads-net/030000").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownFunctionSet);
        let err = table.add_dependency("tads-io/040000").unwrap_err();
        assert_eq!(err.code, ErrorCode::VersionTooOld);
    }

    #[test]
    fn arity_checks() {
        let desc = IntrinsicDesc::new("max", 1, VARARGS, |_, _| Ok(Value::Nil));
        assert!(desc.check_args(0).is_err());
        assert!(desc.check_args(200).is_ok());
        let desc = IntrinsicDesc::new("say", 1, 1, |_, _| Ok(Value::Nil));
        assert!(desc.check_args(2).is_err());
    }
}
