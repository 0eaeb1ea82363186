//! Type system: sizes, offsets, and target ABI modeling.
//!
//! Types are arena-allocated (`fixc_core::arena::Arena`, a bump allocator)
//! so a struct member can reference its own enclosing type before the body
//! is fully parsed: a `TypeId` handle, not an owned pointer, survives that
//! forward reference without unsafe code. `TypeId` stands in for a
//! by-name indirection, generalized to every aggregate kind.

use fixc_core::{Arena, ArenaId, Target};

pub type TypeId = ArenaId<Type>;

#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub ty: TypeId,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct Aggregate {
    pub tag: Option<String>,
    pub members: Vec<Member>,
    pub size: u32,
    /// Only meaningful for structs; alignment the struct itself requires
    /// (max of member alignments, clamped by the active `#pragma pack`).
    pub align: u32,
    /// Set once the body has been parsed; forward-declared tags start
    /// `false`).
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Void,
    Char,
    Short,
    Int,
    Long,
    LongLong,
    Float,
    Double,
    Ptr(TypeId),
    Array(TypeId, u32),
    Struct(Aggregate),
    Union(Aggregate),
    /// 4-byte integer; named constants live in the parser-wide
    /// enum-constant table, not here.
    Enum,
    Function {
        ret: TypeId,
        params: Vec<TypeId>,
        variadic: bool,
    },
}

/// A type is a tagged record with a `size` computed at construction time
/// from the active target. Immutable once struct-body parsing
/// completes (invariant (a)); forward declarations are mutated in place via
/// `Arena::get_mut` until then.
#[derive(Debug, Clone)]
pub struct Type {
    pub kind: TypeKind,
    pub size: u32,
    pub align: u32,
}

/// Owns every `Type` for one translation unit, plus the `#pragma pack`
/// stack that governs struct layout while parsing.
pub struct TypeTable {
    arena: Arena<Type>,
    target: Target,
    pack_stack: Vec<u32>,
    pack_current: Option<u32>,
    // Cached ids for the primitive types, allocated once.
    void: TypeId,
    char_: TypeId,
    short: TypeId,
    int: TypeId,
    long: TypeId,
    long_long: TypeId,
    float: TypeId,
    double: TypeId,
    enum_: TypeId,
}

impl TypeTable {
    pub fn new(target: Target) -> Self {
        let mut arena = Arena::new();
        let void = arena.alloc(Type { kind: TypeKind::Void, size: 0, align: 1 });
        let char_ = arena.alloc(Type { kind: TypeKind::Char, size: target.char_size(), align: 1 });
        let short = arena.alloc(Type {
            kind: TypeKind::Short,
            size: target.short_size(),
            align: target.short_size(),
        });
        let int = arena.alloc(Type {
            kind: TypeKind::Int,
            size: target.int_size(),
            align: target.int_size(),
        });
        let long = arena.alloc(Type {
            kind: TypeKind::Long,
            size: target.long_size(),
            align: target.long_size(),
        });
        let long_long = arena.alloc(Type {
            kind: TypeKind::LongLong,
            size: target.long_long_size(),
            align: target.long_long_size(),
        });
        let float = arena.alloc(Type {
            kind: TypeKind::Float,
            size: target.float_size(),
            align: target.float_size(),
        });
        let double = arena.alloc(Type {
            kind: TypeKind::Double,
            size: target.double_size(),
            align: target.double_size(),
        });
        let enum_ = arena.alloc(Type { kind: TypeKind::Enum, size: 4, align: 4 });

        TypeTable {
            arena,
            target,
            pack_stack: Vec::new(),
            pack_current: None,
            void,
            char_,
            short,
            int,
            long,
            long_long,
            float,
            double,
            enum_,
        }
    }

    pub fn get(&self, id: TypeId) -> &Type {
        self.arena.get(id)
    }

    pub fn void(&self) -> TypeId {
        self.void
    }
    pub fn char_ty(&self) -> TypeId {
        self.char_
    }
    pub fn short(&self) -> TypeId {
        self.short
    }
    pub fn int(&self) -> TypeId {
        self.int
    }
    pub fn long(&self) -> TypeId {
        self.long
    }
    pub fn long_long(&self) -> TypeId {
        self.long_long
    }
    pub fn float(&self) -> TypeId {
        self.float
    }
    pub fn double(&self) -> TypeId {
        self.double
    }
    pub fn enum_ty(&self) -> TypeId {
        self.enum_
    }

    pub fn size_of(&self, id: TypeId) -> u32 {
        self.get(id).size
    }

    pub fn align_of(&self, id: TypeId) -> u32 {
        self.get(id).align
    }

    pub fn pointer(&mut self, pointee: TypeId) -> TypeId {
        let size = self.target.pointer_size();
        self.arena.alloc(Type {
            kind: TypeKind::Ptr(pointee),
            size,
            align: size,
        })
    }

    pub fn array(&mut self, element: TypeId, length: u32) -> TypeId {
        let elem_size = self.size_of(element);
        let align = self.align_of(element);
        self.arena.alloc(Type {
            kind: TypeKind::Array(element, length),
            size: elem_size * length,
            align,
        })
    }

    pub fn function(&mut self, ret: TypeId, params: Vec<TypeId>, variadic: bool) -> TypeId {
        self.arena.alloc(Type {
            kind: TypeKind::Function { ret, params, variadic },
            size: 0,
            align: 1,
        })
    }

    /// Register a forward-declared struct/union tag: an incomplete
    /// aggregate that later body-parsing fills in by identity).
    pub fn declare_struct(&mut self, tag: Option<String>) -> TypeId {
        self.arena.alloc(Type {
            kind: TypeKind::Struct(Aggregate {
                tag,
                members: Vec::new(),
                size: 0,
                align: 1,
                complete: false,
            }),
            size: 0,
            align: 1,
        })
    }

    pub fn declare_union(&mut self, tag: Option<String>) -> TypeId {
        self.arena.alloc(Type {
            kind: TypeKind::Union(Aggregate {
                tag,
                members: Vec::new(),
                size: 0,
                align: 1,
                complete: false,
            }),
            size: 0,
            align: 1,
        })
    }

    /// Fill in a previously-declared struct's body, assigning offsets under
    /// the active packing alignment.
    pub fn complete_struct(&mut self, id: TypeId, fields: Vec<(String, TypeId)>) {
        let pack = self.pack_current;
        let mut members = Vec::with_capacity(fields.len());
        let mut offset: u32 = 0;
        let mut max_align: u32 = 1;
        for (name, ty) in fields {
            let natural_align = self.align_of(ty);
            let align = pack.map(|p| natural_align.min(p)).unwrap_or(natural_align).max(1);
            offset = align_up(offset, align);
            members.push(Member { name, ty, offset });
            offset += self.size_of(ty);
            max_align = max_align.max(align);
        }
        let size = align_up(offset, max_align);
        let slot = self.arena.get_mut(id);
        slot.size = size;
        slot.align = max_align;
        if let TypeKind::Struct(agg) = &mut slot.kind {
            agg.members = members;
            agg.size = size;
            agg.align = max_align;
            agg.complete = true;
        }
    }

    /// Fill in a previously-declared union's body: all offsets are zero,
    /// size is the max member size.
    pub fn complete_union(&mut self, id: TypeId, fields: Vec<(String, TypeId)>) {
        let mut members = Vec::with_capacity(fields.len());
        let mut size: u32 = 0;
        let mut align: u32 = 1;
        for (name, ty) in fields {
            members.push(Member { name, ty, offset: 0 });
            size = size.max(self.size_of(ty));
            align = align.max(self.align_of(ty));
        }
        let slot = self.arena.get_mut(id);
        slot.size = size;
        slot.align = align;
        if let TypeKind::Union(agg) = &mut slot.kind {
            agg.members = members;
            agg.size = size;
            agg.align = align;
            agg.complete = true;
        }
    }

    pub fn member(&self, id: TypeId, name: &str) -> Option<&Member> {
        match &self.get(id).kind {
            TypeKind::Struct(agg) | TypeKind::Union(agg) => {
                agg.members.iter().find(|m| m.name == name)
            }
            _ => None,
        }
    }

    pub fn is_complete(&self, id: TypeId) -> bool {
        match &self.get(id).kind {
            TypeKind::Struct(agg) | TypeKind::Union(agg) => agg.complete,
            _ => true,
        }
    }

    /// `#pragma pack(n)`.
    pub fn pragma_pack(&mut self, n: u32) {
        self.pack_current = Some(n);
    }

    /// `#pragma pack(push, n)`.
    pub fn pragma_pack_push(&mut self, n: Option<u32>) {
        self.pack_stack.push(self.pack_current.unwrap_or(0));
        if let Some(n) = n {
            self.pack_current = Some(n);
        }
    }

    /// `#pragma pack(pop)`: restores the prior value exactly.
    pub fn pragma_pack_pop(&mut self) {
        if let Some(prev) = self.pack_stack.pop() {
            self.pack_current = if prev == 0 { None } else { Some(prev) };
        } else {
            self.pack_current = None;
        }
    }

    pub fn is_integer(&self, id: TypeId) -> bool {
        matches!(
            self.get(id).kind,
            TypeKind::Char | TypeKind::Short | TypeKind::Int | TypeKind::Long
                | TypeKind::LongLong | TypeKind::Enum
        )
    }

    pub fn is_float(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Float | TypeKind::Double)
    }

    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Ptr(_))
    }

    /// The type an array decays to, or the pointee of a pointer. Used by
    /// codegen for `p + n` scaling.
    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id).kind {
            TypeKind::Ptr(t) => Some(t),
            TypeKind::Array(t, _) => Some(t),
            _ => None,
        }
    }
}

fn align_up(offset: u32, align: u32) -> u32 {
    if align == 0 {
        return offset;
    }
    offset.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixc_core::Target;

    #[test]
    fn struct_offsets_sum_prior_member_sizes_with_padding() {
        let mut types = TypeTable::new(Target::linux64());
        let c = types.char_ty();
        let i = types.int();
        let s = types.declare_struct(Some("P".into()));
        types.complete_struct(s, vec![("a".into(), c), ("b".into(), i)]);
        let m_a = types.member(s, "a").unwrap();
        let m_b = types.member(s, "b").unwrap();
        assert_eq!(m_a.offset, 0);
        assert_eq!(m_b.offset, 4); // padded up to int's alignment
        assert_eq!(types.size_of(s), 8);
    }

    #[test]
    fn pragma_pack_1_forces_byte_packing() {
        let mut types = TypeTable::new(Target::linux64());
        let c = types.char_ty();
        let i = types.int();
        types.pragma_pack(1);
        let s = types.declare_struct(None);
        types.complete_struct(s, vec![("a".into(), c), ("b".into(), i)]);
        let m_b = types.member(s, "b").unwrap();
        assert_eq!(m_b.offset, 1);
        assert_eq!(types.size_of(s), 5);
    }

    #[test]
    fn pragma_pack_push_pop_restores_prior_value() {
        let mut types = TypeTable::new(Target::linux64());
        types.pragma_pack(4);
        types.pragma_pack_push(Some(1));
        assert_eq!(types.pack_current, Some(1));
        types.pragma_pack_pop();
        assert_eq!(types.pack_current, Some(4));
    }

    #[test]
    fn union_size_is_max_member_all_offsets_zero() {
        let mut types = TypeTable::new(Target::linux64());
        let c = types.char_ty();
        let i = types.int();
        let u = types.declare_union(None);
        types.complete_union(u, vec![("a".into(), c), ("b".into(), i)]);
        assert_eq!(types.size_of(u), 4);
        assert_eq!(types.member(u, "a").unwrap().offset, 0);
        assert_eq!(types.member(u, "b").unwrap().offset, 0);
    }

    #[test]
    fn array_size_is_element_size_times_length() {
        let mut types = TypeTable::new(Target::linux64());
        let i = types.int();
        let arr = types.array(i, 5);
        assert_eq!(types.size_of(arr), 20);
    }

    #[test]
    fn pointer_width_follows_target() {
        let mut t64 = TypeTable::new(Target::linux64());
        let i = t64.int();
        let p = t64.pointer(i);
        assert_eq!(t64.size_of(p), 8);

        let mut t16 = TypeTable::new(Target::dos16());
        let i16 = t16.int();
        let p16 = t16.pointer(i16);
        assert_eq!(t16.size_of(p16), 2);
    }

    #[test]
    fn windows_long_is_4_linux_long_is_8() {
        let win = TypeTable::new(Target::win64());
        assert_eq!(win.size_of(win.long()), 4);
        let linux = TypeTable::new(Target::linux64());
        assert_eq!(linux.size_of(linux.long()), 8);
    }

    #[test]
    fn forward_declared_struct_is_incomplete_until_body_parsed() {
        let mut types = TypeTable::new(Target::linux64());
        let s = types.declare_struct(Some("Node".into()));
        assert!(!types.is_complete(s));
        let p = types.pointer(s);
        types.complete_struct(s, vec![("next".into(), p)]);
        assert!(types.is_complete(s));
        assert_eq!(types.size_of(s), types.size_of(p));
    }
}
