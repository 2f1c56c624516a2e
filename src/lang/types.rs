//! Type tags and the complex-type table.
//!
//! A [`TypeTag`] is a 64-bit bitset. The low bits are one flag per object
//! type; three high bits are reserved for the `listify` and `glob` binding
//! modifiers and for the complex marker. A complex tag carries an index
//! into the workspace [`TypeRegistry`] instead of simple flags.

use crate::lang::object::{Heap, Obj, ObjType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag(pub u64);

impl TypeTag {
    pub const LISTIFY: u64 = 1 << 61;
    pub const GLOB: u64 = 1 << 62;
    pub const COMPLEX: u64 = 1 << 63;

    #[must_use]
    pub const fn of(t: ObjType) -> Self {
        Self(1 << (t as u64))
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn listify(self) -> Self {
        Self(self.0 | Self::LISTIFY)
    }

    #[must_use]
    pub const fn glob(self) -> Self {
        Self(self.0 | Self::GLOB)
    }

    #[must_use]
    pub const fn is_listify(self) -> bool {
        self.0 & Self::LISTIFY != 0
    }

    #[must_use]
    pub const fn is_glob(self) -> bool {
        self.0 & Self::GLOB != 0
    }

    #[must_use]
    pub const fn is_complex(self) -> bool {
        self.0 & Self::COMPLEX != 0
    }

    #[must_use]
    pub const fn complex_index(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    #[must_use]
    pub const fn contains(self, t: ObjType) -> bool {
        self.0 & (1 << (t as u64)) != 0
    }

    /// Strip binding modifiers, leaving the acceptance set.
    #[must_use]
    pub const fn base(self) -> Self {
        Self(self.0 & !(Self::LISTIFY | Self::GLOB))
    }
}

/// Commonly used tags.
pub mod tag {
    use super::TypeTag;
    use crate::lang::object::ObjType;

    pub const NULL: TypeTag = TypeTag::of(ObjType::Null);
    pub const BOOL: TypeTag = TypeTag::of(ObjType::Bool);
    pub const NUMBER: TypeTag = TypeTag::of(ObjType::Number);
    pub const STR: TypeTag = TypeTag::of(ObjType::Str);
    pub const ARRAY: TypeTag = TypeTag::of(ObjType::Array);
    pub const DICT: TypeTag = TypeTag::of(ObjType::Dict);
    pub const FILE: TypeTag = TypeTag::of(ObjType::File);
    pub const COMPILER: TypeTag = TypeTag::of(ObjType::Compiler);
    pub const BUILD_TARGET: TypeTag = TypeTag::of(ObjType::BuildTarget);
    pub const CUSTOM_TARGET: TypeTag = TypeTag::of(ObjType::CustomTarget);
    pub const DEPENDENCY: TypeTag = TypeTag::of(ObjType::Dependency);
    pub const EXTERNAL_PROGRAM: TypeTag = TypeTag::of(ObjType::ExternalProgram);
    pub const RUN_RESULT: TypeTag = TypeTag::of(ObjType::RunResult);
    pub const CONFIGURATION_DATA: TypeTag = TypeTag::of(ObjType::ConfigurationData);
    pub const ENVIRONMENT: TypeTag = TypeTag::of(ObjType::Environment);
    pub const INCLUDE_DIRECTORY: TypeTag = TypeTag::of(ObjType::IncludeDirectory);
    pub const FEATURE_OPT: TypeTag = TypeTag::of(ObjType::FeatureOpt);
    pub const FUNC: TypeTag = TypeTag::of(ObjType::Func);
    pub const CAPTURE: TypeTag = TypeTag::of(ObjType::Capture);
    pub const DISABLER: TypeTag = TypeTag::of(ObjType::Disabler);
    pub const MACHINE: TypeTag = TypeTag::of(ObjType::Machine);
    pub const BOTH_LIBS: TypeTag = TypeTag::of(ObjType::BothLibs);
    pub const ALIAS_TARGET: TypeTag = TypeTag::of(ObjType::AliasTarget);
    pub const GENERATED_LIST: TypeTag = TypeTag::of(ObjType::GeneratedList);

    /// Every concrete value type (not a binding modifier).
    pub const ANY: TypeTag = TypeTag((1 << (ObjType::COUNT as u64)) - 1);

    /// Anything usable as a compilation input.
    pub const SOURCE: TypeTag =
        TypeTag(STR.0 | FILE.0 | CUSTOM_TARGET.0 | GENERATED_LIST.0 | BUILD_TARGET.0);

    /// A callable value.
    pub const CALLABLE: TypeTag = TypeTag(FUNC.0 | CAPTURE.0);
}

/// A structured type referenced from a complex [`TypeTag`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplexType {
    /// `container[inner]`, e.g. `array[string]` or `dict[number]`.
    Nested { container: TypeTag, inner: TypeTag },
    /// `a | b`.
    Or(TypeTag, TypeTag),
    /// A string restricted to a fixed set of values.
    Enum(Vec<Vec<u8>>),
}

/// Workspace-owned table of complex types. Tags index into it; entries are
/// deduplicated so repeated signatures share slots.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    entries: Vec<ComplexType>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, ty: ComplexType) -> TypeTag {
        let idx = self.entries.iter().position(|e| *e == ty).unwrap_or_else(|| {
            self.entries.push(ty);
            self.entries.len() - 1
        });
        TypeTag(TypeTag::COMPLEX | idx as u64)
    }

    pub fn nested(&mut self, container: TypeTag, inner: TypeTag) -> TypeTag {
        self.intern(ComplexType::Nested { container, inner })
    }

    pub fn or(&mut self, a: TypeTag, b: TypeTag) -> TypeTag {
        self.intern(ComplexType::Or(a, b))
    }

    pub fn enumeration(&mut self, values: Vec<Vec<u8>>) -> TypeTag {
        self.intern(ComplexType::Enum(values))
    }

    #[must_use]
    pub fn get(&self, tag: TypeTag) -> Option<&ComplexType> {
        self.entries.get(tag.complex_index())
    }

    /// Check `obj` against `tag`, recursing into complex types. The
    /// disabler singleton satisfies every type; it short-circuits before
    /// most checks are reached anyway.
    #[must_use]
    pub fn typecheck(&self, heap: &Heap, obj: Obj, tag: TypeTag) -> bool {
        if obj == Obj::DISABLER {
            return true;
        }
        let tag = tag.base();
        if !tag.is_complex() {
            return tag.contains(heap.typ(obj));
        }
        match self.get(tag) {
            Some(ComplexType::Nested { container, inner }) => {
                if container.contains(ObjType::Array) && heap.typ(obj) == ObjType::Array {
                    heap.arr_iter(obj).all(|v| self.typecheck(heap, v, *inner))
                } else if container.contains(ObjType::Dict) && heap.typ(obj) == ObjType::Dict {
                    heap.dict_iter(obj).all(|(_, v)| self.typecheck(heap, v, *inner))
                } else {
                    false
                }
            }
            Some(ComplexType::Or(a, b)) => {
                self.typecheck(heap, obj, *a) || self.typecheck(heap, obj, *b)
            }
            Some(ComplexType::Enum(values)) => {
                heap.typ(obj) == ObjType::Str && values.iter().any(|v| v == heap.str_bytes(obj))
            }
            None => false,
        }
    }

    /// Human-readable form of a tag for diagnostics.
    #[must_use]
    pub fn display(&self, tag: TypeTag) -> String {
        let base = tag.base();
        if base.is_complex() {
            match self.get(base) {
                Some(ComplexType::Nested { container, inner }) => {
                    let c = if container.contains(ObjType::Dict) { "dict" } else { "array" };
                    return format!("{c}[{}]", self.display(*inner));
                }
                Some(ComplexType::Or(a, b)) => {
                    return format!("{}|{}", self.display(*a), self.display(*b));
                }
                Some(ComplexType::Enum(values)) => {
                    let vals: Vec<String> =
                        values.iter().map(|v| String::from_utf8_lossy(v).into_owned()).collect();
                    return format!("enum[{}]", vals.join("|"));
                }
                None => return "<bad type>".into(),
            }
        }
        let mut names = Vec::new();
        for t in ObjType::ALL.iter().copied() {
            if base.contains(t) {
                names.push(t.name());
            }
        }
        if names.len() == ObjType::ALL.len() { "any".into() } else { names.join("|") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::object::Heap;
    use rstest::rstest;

    #[rstest]
    fn simple_tags_accept_matching_values() {
        let mut heap = Heap::new();
        let reg = TypeRegistry::new();
        let s = heap.str_intern(b"x");
        let n = heap.make_number(3);
        assert!(reg.typecheck(&heap, s, tag::STR));
        assert!(!reg.typecheck(&heap, s, tag::NUMBER));
        assert!(reg.typecheck(&heap, n, tag::NUMBER.union(tag::STR)));
    }

    #[rstest]
    fn disabler_satisfies_every_tag() {
        let heap = Heap::new();
        let reg = TypeRegistry::new();
        assert!(reg.typecheck(&heap, Obj::DISABLER, tag::NUMBER));
    }

    #[rstest]
    fn nested_dict_of_number_rejects_string_values() {
        let mut heap = Heap::new();
        let mut reg = TypeRegistry::new();
        let dict_num = reg.nested(tag::DICT, tag::NUMBER);

        let d = heap.dict_new();
        let key = heap.str_intern(b"k");
        let one = heap.make_number(1);
        heap.dict_set_str(d, key, one);
        assert!(reg.typecheck(&heap, d, dict_num));

        let sval = heap.str_intern(b"oops");
        heap.dict_set_str(d, key, sval);
        assert!(!reg.typecheck(&heap, d, dict_num));
    }

    #[rstest]
    fn or_type_accepts_either_branch() {
        let mut heap = Heap::new();
        let mut reg = TypeRegistry::new();
        let t = reg.or(tag::STR, tag::NUMBER);
        let s = heap.str_intern(b"a");
        let n = heap.make_number(1);
        let b = heap.make_bool(true);
        assert!(reg.typecheck(&heap, s, t));
        assert!(reg.typecheck(&heap, n, t));
        assert!(!reg.typecheck(&heap, b, t));
    }

    #[rstest]
    fn enum_type_matches_exact_strings() {
        let mut heap = Heap::new();
        let mut reg = TypeRegistry::new();
        let t = reg.enumeration(vec![b"on".to_vec(), b"off".to_vec()]);
        let on = heap.str_intern(b"on");
        let maybe = heap.str_intern(b"maybe");
        assert!(reg.typecheck(&heap, on, t));
        assert!(!reg.typecheck(&heap, maybe, t));
    }
}
